//! §4.G Auth Handshake.
//!
//! NKEY cryptographic primitives (deriving a public key from a seed, signing
//! a nonce) are external collaborators per §1 -- callers supply them as
//! plain functions. What lives here is the plumbing the spec actually
//! specifies: field precedence, the mutual-exclusivity checks, parsing the
//! chained credentials file, and assembling the CONNECT payload. Per
//! REDESIGN FLAGS the credentials file is read once, here, rather than on
//! every nonce.

use std::path::Path;
use std::sync::Arc;

use base64::Engine;

use crate::error::ClientError;
use crate::protocol::{ConnectPayload, ServerInfo, CLIENT_VERSION, LANG};

/// Signs a server nonce using a caller-held private key, returning raw
/// signature bytes (base64-encoded by this module before going on the wire).
pub type NonceSigner = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Signs a nonce given the NKEY seed extracted from a credentials file.
/// Required whenever `creds_path` is configured, since this crate does not
/// implement NKEY cryptography itself.
pub type SeedSigner = Arc<dyn Fn(&str, &[u8]) -> Vec<u8> + Send + Sync>;

#[derive(Clone)]
pub enum JwtSource {
    Literal(String),
    Callback(Arc<dyn Fn() -> String + Send + Sync>),
}

/// Caller-facing auth configuration, part of `ConnectOptions`.
#[derive(Clone, Default)]
pub struct AuthConfig {
    pub user: Option<String>,
    pub pass: Option<String>,
    pub token: Option<String>,
    pub nkey_public: Option<String>,
    pub jwt: Option<JwtSource>,
    pub signer: Option<NonceSigner>,
    pub creds_path: Option<String>,
    pub seed_signer: Option<SeedSigner>,
    pub name: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("user", &self.user)
            .field("pass_set", &self.pass.is_some())
            .field("token_set", &self.token.is_some())
            .field("nkey_public", &self.nkey_public)
            .field("jwt_set", &self.jwt.is_some())
            .field("signer_set", &self.signer.is_some())
            .field("creds_path", &self.creds_path)
            .field("name", &self.name)
            .finish()
    }
}

impl AuthConfig {
    /// URL userinfo fills in only fields the caller did not explicitly set
    /// (§4.A). `token` wins when the authority is `token@host` with no colon.
    pub fn apply_url_credentials(&mut self, user: Option<&str>, pass_or_token: Option<&str>) {
        match (user, pass_or_token) {
            (Some(u), Some(p)) => {
                if self.user.is_none() {
                    self.user = Some(u.to_owned());
                }
                if self.pass.is_none() {
                    self.pass = Some(p.to_owned());
                }
            }
            (Some(tok), None) => {
                if self.token.is_none() {
                    self.token = Some(tok.to_owned());
                }
            }
            _ => {}
        }
    }
}

/// Resolved, ready-to-use auth state: credentials file already read and
/// cached (§9 REDESIGN FLAGS), mutual-exclusivity already validated.
pub struct AuthContext {
    user: Option<String>,
    pass: Option<String>,
    token: Option<String>,
    nkey_public: Option<String>,
    jwt: Option<JwtSource>,
    signer: Option<NonceSigner>,
    seed: Option<String>,
    seed_signer: Option<SeedSigner>,
    name: Option<String>,
}

/// The two PEM-like blocks in a chained credentials file (§6).
fn parse_credentials_text(text: &str) -> Result<(String, String), ClientError> {
    let blocks = extract_pem_blocks(text);
    if blocks.len() < 2 {
        return Err(if blocks.is_empty() {
            ClientError::NoUserJwtInCreds
        } else {
            ClientError::NoSeedInCreds
        });
    }
    Ok((blocks[0].clone(), blocks[1].clone()))
}

/// `-----BEGIN ... -----` / `-----END ... -----` fenced blocks, in order.
fn extract_pem_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut in_block = false;
    let mut current = String::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("-----BEGIN") {
            in_block = true;
            current.clear();
            continue;
        }
        if trimmed.starts_with("-----END") {
            if in_block {
                blocks.push(current.trim().to_owned());
            }
            in_block = false;
            continue;
        }
        if in_block {
            current.push_str(trimmed);
            current.push('\n');
        }
    }
    blocks
}

impl AuthContext {
    pub fn resolve(config: &AuthConfig, creds_file_contents: Option<&str>) -> Result<Self, ClientError> {
        if config.user.is_some() && config.token.is_some() {
            return Err(ClientError::BadAuthentication(
                "user and token are mutually exclusive".to_owned(),
            ));
        }

        let (jwt, seed) = match creds_file_contents {
            Some(text) => {
                let (jwt, seed) = parse_credentials_text(text)?;
                (Some(JwtSource::Literal(jwt)), Some(seed))
            }
            None => (config.jwt.clone(), None),
        };

        Ok(AuthContext {
            user: config.user.clone(),
            pass: config.pass.clone(),
            token: config.token.clone(),
            nkey_public: config.nkey_public.clone(),
            jwt,
            signer: config.signer.clone(),
            seed,
            seed_signer: config.seed_signer.clone(),
            name: config.name.clone(),
        })
    }

    fn resolve_jwt(&self) -> Option<String> {
        match &self.jwt {
            Some(JwtSource::Literal(s)) => Some(s.clone()),
            Some(JwtSource::Callback(cb)) => Some(cb()),
            None => None,
        }
    }

    fn sign_nonce(&self, nonce: &[u8]) -> Result<Vec<u8>, ClientError> {
        if let Some(seed) = &self.seed {
            let signer = self
                .seed_signer
                .as_ref()
                .ok_or_else(|| ClientError::SigNotFunc("no seed signer configured for credentials file".to_owned()))?;
            return Ok(signer(seed, nonce));
        }
        let signer = self.signer.as_ref().ok_or(ClientError::SigReq)?;
        Ok(signer(nonce))
    }

    /// §4.G field selection, run against the first INFO's nonce/tls fields.
    pub fn build_connect_payload(
        &self,
        info: &ServerInfo,
        verbose: bool,
        pedantic: bool,
        no_echo: bool,
    ) -> Result<ConnectPayload, ClientError> {
        let jwt = self.resolve_jwt();

        let sig = match &info.nonce {
            Some(nonce_b64) => {
                if self.nkey_public.is_none() && jwt.is_none() {
                    return Err(ClientError::NkeyOrJwtReq);
                }
                let nonce = base64::engine::general_purpose::STANDARD
                    .decode(nonce_b64)
                    .map_err(|e| ClientError::NatsProtocolErr(format!("bad nonce: {e}")))?;
                let raw_sig = self.sign_nonce(&nonce)?;
                Some(base64::engine::general_purpose::STANDARD.encode(raw_sig))
            }
            None => None,
        };

        Ok(ConnectPayload {
            lang: LANG,
            version: CLIENT_VERSION,
            verbose,
            pedantic,
            protocol: 1,
            no_echo: Some(no_echo),
            sig,
            jwt,
            nkey: self.nkey_public.clone(),
            user: self.user.clone(),
            pass: self.pass.clone(),
            auth_token: self.token.clone(),
            name: self.name.clone(),
        })
    }
}

#[cfg(test)]
pub fn peek_user(ctx: &AuthContext) -> Option<String> {
    ctx.user.clone()
}

pub fn read_creds_file(path: &str) -> Result<String, ClientError> {
    std::fs::read_to_string(Path::new(path))
        .map_err(|e| ClientError::ConnErr(format!("reading credentials file '{path}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREDS: &str = "\
-----BEGIN NATS USER JWT-----
eyJhbGciOiJ...
-----END NATS USER JWT-----

-----BEGIN USER NKEY SEED-----
SUAEZ...
-----END USER NKEY SEED-----
";

    #[test]
    fn parses_jwt_and_seed_blocks() {
        let (jwt, seed) = parse_credentials_text(CREDS).unwrap();
        assert_eq!(jwt, "eyJhbGciOiJ...");
        assert_eq!(seed, "SUAEZ...");
    }

    #[test]
    fn fewer_than_two_blocks_is_fatal() {
        let text = "-----BEGIN NATS USER JWT-----\nabc\n-----END NATS USER JWT-----\n";
        let err = parse_credentials_text(text).unwrap_err();
        assert_eq!(err, ClientError::NoSeedInCreds);
    }

    #[test]
    fn user_and_token_together_is_bad_authentication() {
        let config = AuthConfig {
            user: Some("u".to_owned()),
            token: Some("t".to_owned()),
            ..Default::default()
        };
        let err = AuthContext::resolve(&config, None).unwrap_err();
        assert!(matches!(err, ClientError::BadAuthentication(_)));
    }

    #[test]
    fn nonce_without_signer_or_creds_is_sig_req() {
        let config = AuthConfig::default();
        let ctx = AuthContext::resolve(&config, None).unwrap();
        let info = ServerInfo {
            nonce: Some(base64::engine::general_purpose::STANDARD.encode(b"abc")),
            ..Default::default()
        };
        let err = ctx.build_connect_payload(&info, false, false, false).unwrap_err();
        assert_eq!(err, ClientError::SigReq);
    }

    #[test]
    fn nonce_with_signer_but_no_nkey_or_jwt_is_fatal() {
        let config = AuthConfig {
            signer: Some(Arc::new(|nonce: &[u8]| nonce.to_vec())),
            ..Default::default()
        };
        let ctx = AuthContext::resolve(&config, None).unwrap();
        let info = ServerInfo {
            nonce: Some(base64::engine::general_purpose::STANDARD.encode(b"abc")),
            ..Default::default()
        };
        let err = ctx.build_connect_payload(&info, false, false, false).unwrap_err();
        assert_eq!(err, ClientError::NkeyOrJwtReq);
    }

    #[test]
    fn creds_file_path_signs_via_seed_signer() {
        let config = AuthConfig {
            seed_signer: Some(Arc::new(|seed: &str, nonce: &[u8]| {
                let mut out = seed.as_bytes().to_vec();
                out.extend_from_slice(nonce);
                out
            })),
            ..Default::default()
        };
        let ctx = AuthContext::resolve(&config, Some(CREDS)).unwrap();
        let info = ServerInfo {
            nonce: Some(base64::engine::general_purpose::STANDARD.encode(b"xyz")),
            ..Default::default()
        };
        let payload = ctx.build_connect_payload(&info, false, false, false).unwrap();
        assert!(payload.sig.is_some());
        assert!(payload.jwt.is_some());
    }

    #[test]
    fn url_credentials_only_fill_unset_fields() {
        let mut config = AuthConfig {
            user: Some("configured".to_owned()),
            ..Default::default()
        };
        config.apply_url_credentials(Some("fromurl"), Some("pw"));
        assert_eq!(config.user.as_deref(), Some("configured"));
        assert_eq!(config.pass.as_deref(), Some("pw"));
    }
}
