//! The raw transport the FSM drives. TLS upgrade (§4.H) swaps a plain
//! `TcpStream` for a `tokio_rustls` stream mid-handshake; wrapping both in
//! one enum lets `fsm.rs` treat them identically afterwards.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::ClientError;

pub enum Socket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Socket {
    pub fn set_nodelay(&self) -> io::Result<()> {
        match self {
            Socket::Plain(s) => s.set_nodelay(true),
            Socket::Tls(s) => s.get_ref().0.set_nodelay(true),
        }
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_flush(cx),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Dial a plain TCP connection with `TCP_NODELAY` set (§4.H).
pub async fn dial(host: &str, port: u16) -> Result<TcpStream, ClientError> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| ClientError::ConnErr(format!("dialing {host}:{port}: {e}")))?;
    stream
        .set_nodelay(true)
        .map_err(|e| ClientError::ConnErr(format!("setting TCP_NODELAY: {e}")))?;
    Ok(stream)
}

/// Upgrade a plain connection to TLS once INFO has told us to (§4.H
/// TLS_UPGRADE transient state). Uses the platform's webpki roots; a
/// configured client certificate is named but not implemented here --
/// mutual TLS setup is an external collaborator the same way NKEY signing
/// is (the spec only requires that we refuse to proceed without one when
/// `tls_verify` demands it, see `error::ClientError::ClientCertReq`).
pub async fn upgrade_to_tls(stream: TcpStream, domain: &str) -> Result<Socket, ClientError> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(domain.to_owned())
        .map_err(|e| ClientError::ConnErr(format!("invalid TLS server name '{domain}': {e}")))?;

    let tls_stream = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ClientError::ConnErr(format!("TLS handshake failed: {e}")))?;

    Ok(Socket::Tls(Box::new(tls_stream)))
}
