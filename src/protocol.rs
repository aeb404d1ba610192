//! INFO/CONNECT JSON payloads (§6). Field names follow the wire contract
//! exactly (snake_case, matching the server's own JSON), the same way the
//! teacher's wire message types are named 1:1 after their `kind` tags.

use serde::{Deserialize, Serialize};

/// Server handshake banner, the payload of `INFO <json>\r\n`.
///
/// Only the fields the client acts on are modeled; unknown fields are
/// ignored rather than rejected, since the server may add fields over time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub tls_verify: bool,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub connect_urls: Vec<String>,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

/// The client's handshake reply, the payload of `CONNECT <json>\r\n`.
///
/// Field presence follows §4.G: `sig`/`jwt`/`nkey` are only populated when
/// the auth handshake determined they applied.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectPayload {
    pub lang: &'static str,
    pub version: &'static str,
    pub verbose: bool,
    pub pedantic: bool,
    pub protocol: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_echo: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

pub const LANG: &str = "rust";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
