//! Connection Options (§3) and their normalization into a frozen
//! `ClientConfig`.
//!
//! The original accepts a number, a string URL, or an options object for the
//! same logical parameter, sniffed at runtime. Per §9 REDESIGN FLAGS this is
//! replaced by a single typed builder: each logical input gets its own
//! method (`server` vs `servers`, `jwt_literal` vs `jwt_callback`) instead of
//! one method that inspects what it was handed.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::auth::{self, AuthConfig, AuthContext, JwtSource, NonceSigner, SeedSigner};
use crate::error::ClientError;
use crate::events::EventHandler;

const DEFAULT_PORT: u16 = 4222;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Off,
    On,
    OnWithCertConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    Binary,
    Utf8,
}

/// Builder. Every setter takes `self` and returns `self` (teacher-style
/// config building: a plain struct with one writer per field, defaults
/// applied once at `build()` rather than scattered `unwrap_or` calls at use
/// sites).
pub struct ConnectOptions {
    servers: Vec<String>,
    url: Option<String>,
    randomize: bool,
    reconnect: bool,
    max_reconnect_attempts: Option<u32>,
    reconnect_wait: Duration,
    ping_interval: Duration,
    max_ping_out: u32,
    verbose: bool,
    pedantic: bool,
    tls: TlsMode,
    has_client_cert: bool,
    encoding: PayloadEncoding,
    preserve_buffers: bool,
    json: bool,
    use_old_request_style: bool,
    no_echo: bool,
    wait_on_first_connect: bool,
    yield_time: Option<Duration>,
    auth: AuthConfig,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            servers: Vec::new(),
            url: None,
            randomize: true,
            reconnect: true,
            max_reconnect_attempts: None,
            reconnect_wait: Duration::from_millis(2_000),
            ping_interval: Duration::from_millis(120_000),
            max_ping_out: 2,
            verbose: false,
            pedantic: false,
            tls: TlsMode::Off,
            has_client_cert: false,
            encoding: PayloadEncoding::Binary,
            preserve_buffers: false,
            json: false,
            use_old_request_style: false,
            no_echo: false,
            wait_on_first_connect: false,
            yield_time: None,
            auth: AuthConfig::default(),
            event_handler: None,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        ConnectOptions::default()
    }

    pub fn server(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn servers(mut self, urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.servers = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn randomize(mut self, on: bool) -> Self {
        self.randomize = on;
        self
    }

    pub fn reconnect(mut self, on: bool) -> Self {
        self.reconnect = on;
        self
    }

    /// `-1` maps to unbounded, matching the distilled spec's convention.
    pub fn max_reconnect_attempts(mut self, n: i64) -> Self {
        self.max_reconnect_attempts = if n < 0 { None } else { Some(n as u32) };
        self
    }

    pub fn reconnect_wait_ms(mut self, ms: u64) -> Self {
        self.reconnect_wait = Duration::from_millis(ms);
        self
    }

    pub fn ping_interval_ms(mut self, ms: u64) -> Self {
        self.ping_interval = Duration::from_millis(ms);
        self
    }

    pub fn max_ping_out(mut self, n: u32) -> Self {
        self.max_ping_out = n;
        self
    }

    pub fn verbose(mut self, on: bool) -> Self {
        self.verbose = on;
        self
    }

    pub fn pedantic(mut self, on: bool) -> Self {
        self.pedantic = on;
        self
    }

    pub fn tls_off(mut self) -> Self {
        self.tls = TlsMode::Off;
        self
    }

    pub fn tls_on(mut self) -> Self {
        self.tls = TlsMode::On;
        self
    }

    pub fn tls_on_with_cert(mut self) -> Self {
        self.tls = TlsMode::OnWithCertConfig;
        self.has_client_cert = true;
        self
    }

    pub fn json(mut self, on: bool) -> Self {
        self.json = on;
        self
    }

    pub fn preserve_buffers(mut self, on: bool) -> Self {
        self.preserve_buffers = on;
        self
    }

    pub fn utf8_encoding(mut self) -> Self {
        self.encoding = PayloadEncoding::Utf8;
        self
    }

    pub fn use_old_request_style(mut self, on: bool) -> Self {
        self.use_old_request_style = on;
        self
    }

    pub fn no_echo(mut self, on: bool) -> Self {
        self.no_echo = on;
        self
    }

    pub fn wait_on_first_connect(mut self, on: bool) -> Self {
        self.wait_on_first_connect = on;
        self
    }

    pub fn yield_time_ms(mut self, ms: u64) -> Self {
        self.yield_time = Some(Duration::from_millis(ms));
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.auth.name = Some(name.into());
        self
    }

    pub fn user_pass(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.auth.user = Some(user.into());
        self.auth.pass = Some(pass.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.auth.token = Some(token.into());
        self
    }

    pub fn nkey(mut self, public_key: impl Into<String>, signer: NonceSigner) -> Self {
        self.auth.nkey_public = Some(public_key.into());
        self.auth.signer = Some(signer);
        self
    }

    pub fn jwt_literal(mut self, jwt: impl Into<String>) -> Self {
        self.auth.jwt = Some(JwtSource::Literal(jwt.into()));
        self
    }

    pub fn jwt_callback(mut self, cb: Arc<dyn Fn() -> String + Send + Sync>) -> Self {
        self.auth.jwt = Some(JwtSource::Callback(cb));
        self
    }

    pub fn creds_path(mut self, path: impl Into<String>, seed_signer: SeedSigner) -> Self {
        self.auth.creds_path = Some(path.into());
        self.auth.seed_signer = Some(seed_signer);
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Normalize and validate, producing the frozen config the FSM runs
    /// against. Resolves the credentials file (if any) exactly once here.
    /// Not exposed outside the crate: `Client::connect` is the only
    /// sanctioned consumer, so `ClientConfig` itself never needs to be
    /// public.
    pub(crate) fn build(self) -> Result<ClientConfig, ClientError> {
        if self.servers.is_empty() && self.url.is_none() {
            return Err(ClientError::BadOptions("no servers configured".to_owned()));
        }
        if self.preserve_buffers && self.encoding != PayloadEncoding::Binary {
            return Err(ClientError::InvalidEncoding(
                "preserve_buffers skips decoding, so it cannot be combined with utf8_encoding".to_owned(),
            ));
        }

        let mut urls = Vec::with_capacity(self.servers.len());
        for raw in &self.servers {
            urls.push(parse_server_url(raw)?);
        }
        let primary = match &self.url {
            Some(raw) => Some(parse_server_url(raw)?),
            None => None,
        };

        let mut auth = self.auth.clone();
        for candidate in primary.iter().chain(urls.iter()) {
            if let Some(embedded) = embedded_credentials(candidate) {
                auth.apply_url_credentials(embedded.0.as_deref(), embedded.1.as_deref());
                break;
            }
        }

        let creds_contents = match &auth.creds_path {
            Some(path) => Some(auth::read_creds_file(path)?),
            None => None,
        };
        let auth_ctx = AuthContext::resolve(&auth, creds_contents.as_deref())?;

        Ok(ClientConfig {
            urls,
            primary,
            randomize: self.randomize,
            reconnect: self.reconnect,
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_wait: self.reconnect_wait,
            ping_interval: self.ping_interval,
            max_ping_out: self.max_ping_out,
            verbose: self.verbose,
            pedantic: self.pedantic,
            tls: self.tls,
            has_client_cert: self.has_client_cert,
            encoding: self.encoding,
            preserve_buffers: self.preserve_buffers,
            json: self.json,
            use_old_request_style: self.use_old_request_style,
            no_echo: self.no_echo,
            wait_on_first_connect: self.wait_on_first_connect,
            yield_time: self.yield_time,
            auth: auth_ctx,
            event_handler: self
                .event_handler
                .unwrap_or_else(|| Arc::new(crate::events::NoopEventHandler)),
        })
    }
}

/// Frozen, validated configuration the FSM is built from.
pub struct ClientConfig {
    pub urls: Vec<Url>,
    pub primary: Option<Url>,
    pub randomize: bool,
    pub reconnect: bool,
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_wait: Duration,
    pub ping_interval: Duration,
    pub max_ping_out: u32,
    pub verbose: bool,
    pub pedantic: bool,
    pub tls: TlsMode,
    pub has_client_cert: bool,
    pub encoding: PayloadEncoding,
    pub preserve_buffers: bool,
    pub json: bool,
    pub use_old_request_style: bool,
    pub no_echo: bool,
    pub wait_on_first_connect: bool,
    pub yield_time: Option<Duration>,
    pub auth: AuthContext,
    pub event_handler: Arc<dyn EventHandler>,
}

/// `nats://host:port` or `tls://host:port`; missing scheme defaults to
/// `nats://`, missing port defaults to 4222 (§6).
fn parse_server_url(raw: &str) -> Result<Url, ClientError> {
    let with_scheme = if raw.contains("://") {
        raw.to_owned()
    } else {
        format!("nats://{raw}")
    };
    let mut url = Url::parse(&with_scheme)
        .map_err(|e| ClientError::BadOptions(format!("invalid server url '{raw}': {e}")))?;
    if url.port().is_none() {
        url.set_port(Some(DEFAULT_PORT)).ok();
    }
    Ok(url)
}

/// Extract `user:pass` or `token` from a URL's authority, per §6.
fn embedded_credentials(url: &Url) -> Option<(Option<String>, Option<String>)> {
    if url.username().is_empty() && url.password().is_none() {
        return None;
    }
    if url.password().is_some() {
        Some((
            Some(url.username().to_owned()),
            url.password().map(str::to_owned),
        ))
    } else {
        Some((Some(url.username().to_owned()), None))
    }
}
