//! Stable error codes for the client.
//!
//! Mirrors the error taxonomy a caller needs to branch on: configuration
//! mistakes are distinguished from connectivity problems, which are
//! distinguished from auth negotiation failures. Connectivity/protocol
//! errors are usually surfaced through `EventHandler::on_error`, not
//! returned from a call -- see `events::EventHandler` for the async half
//! of error reporting.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Caller passed an invalid `ConnectOptions` (e.g. empty server list).
    BadOptions(String),
    /// Subject failed validation (empty, contains whitespace, etc).
    BadSubject(String),
    /// Message payload failed validation (too large, wrong encoding).
    BadMsg(String),
    /// Reply subject failed validation.
    BadReply(String),
    /// JSON mode was requested but payload is not valid/round-trippable JSON.
    BadJson(String),
    /// Conflicting or insufficient authentication fields.
    BadAuthentication(String),
    /// `preserveBuffers` requested alongside an encoding that requires decode.
    InvalidEncoding(String),
    /// A signer callback was configured but is not callable.
    SigNotFunc(String),

    /// The TCP/TLS dial failed, or the connection dropped before handshake.
    ConnErr(String),
    /// An operation was attempted on a client that is already closed.
    ConnClosed,
    /// Server sent a byte sequence that cannot be reconciled with the grammar.
    NatsProtocolErr(String),

    /// Server requires TLS but the client was configured without it.
    SecureConnReq,
    /// Client was configured for TLS but the server does not require it.
    NonSecureConnReq,
    /// Server requires a verified client certificate the client lacks.
    ClientCertReq,

    /// Server presented a nonce but no signer callback/credentials were configured.
    SigReq,
    /// Neither an NKEY public key nor a JWT were supplied alongside a signer.
    NkeyOrJwtReq,
    /// Server rejected the credentials (bad signature, unknown user, etc).
    BadCredentials(String),
    /// Credentials file had a seed block missing or malformed.
    NoSeedInCreds,
    /// Credentials file had a JWT block missing or malformed.
    NoUserJwtInCreds,

    /// A request timed out waiting for a reply.
    ReqTimeout,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::BadOptions(s) => write!(f, "bad options: {s}"),
            ClientError::BadSubject(s) => write!(f, "bad subject: {s}"),
            ClientError::BadMsg(s) => write!(f, "bad message: {s}"),
            ClientError::BadReply(s) => write!(f, "bad reply subject: {s}"),
            ClientError::BadJson(s) => write!(f, "bad json: {s}"),
            ClientError::BadAuthentication(s) => write!(f, "bad authentication: {s}"),
            ClientError::InvalidEncoding(s) => write!(f, "invalid encoding: {s}"),
            ClientError::SigNotFunc(s) => write!(f, "signer is not callable: {s}"),
            ClientError::ConnErr(s) => write!(f, "connection error: {s}"),
            ClientError::ConnClosed => write!(f, "connection closed"),
            ClientError::NatsProtocolErr(s) => write!(f, "protocol error: {s}"),
            ClientError::SecureConnReq => write!(f, "server requires a secure connection"),
            ClientError::NonSecureConnReq => write!(f, "server does not support a secure connection"),
            ClientError::ClientCertReq => write!(f, "server requires a verified client certificate"),
            ClientError::SigReq => write!(f, "server sent a nonce but no signer was configured"),
            ClientError::NkeyOrJwtReq => write!(f, "an nkey or jwt is required alongside a signer"),
            ClientError::BadCredentials(s) => write!(f, "authorization failed: {s}"),
            ClientError::NoSeedInCreds => write!(f, "credentials file has no seed block"),
            ClientError::NoUserJwtInCreds => write!(f, "credentials file has no user jwt block"),
            ClientError::ReqTimeout => write!(f, "request timed out"),
        }
    }
}

impl std::error::Error for ClientError {}
