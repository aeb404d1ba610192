//! A minimal in-process mock server, standing in for the `rt-test-utils`
//! crate the teacher splits into its own package -- kept as a test-only
//! module here since this crate is a single package.
//!
//! Speaks just enough of the wire protocol (INFO/CONNECT/PING/PONG/SUB/
//! UNSUB/PUB/MSG) to drive the client through a real TCP socket.

use std::net::SocketAddr;
use std::sync::Once;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

static TRACING_INIT: Once = Once::new();

/// Install a `tracing` subscriber once per test binary, same
/// `EnvFilter`-from-`RUST_LOG`-or-"info" shape the teacher's service
/// binaries use at startup (`services/forwarder/src/main.rs`), so
/// `RUST_LOG=flotilla=debug cargo test` surfaces the FSM's own logging.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub struct MockServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server local_addr");
        MockServer { listener, addr }
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    /// Accept the next inbound connection. Safe to call repeatedly on the
    /// same server to observe a client's reconnect dial to the same address.
    pub async fn accept(&self) -> MockConn {
        let (stream, _) = self.listener.accept().await.expect("accept mock client");
        MockConn {
            stream,
            buf: BytesMut::new(),
        }
    }
}

pub struct MockConn {
    stream: TcpStream,
    buf: BytesMut,
}

impl MockConn {
    pub async fn send_raw(&mut self, s: &str) {
        self.stream
            .write_all(s.as_bytes())
            .await
            .expect("write to mock client");
    }

    pub async fn send_info(&mut self, json: &str) {
        self.send_raw(&format!("INFO {json}\r\n")).await;
    }

    pub async fn send_ping(&mut self) {
        self.send_raw("PING\r\n").await;
    }

    pub async fn send_pong(&mut self) {
        self.send_raw("PONG\r\n").await;
    }

    pub async fn send_msg(&mut self, subject: &str, sid: u64, reply: Option<&str>, payload: &[u8]) {
        let header = match reply {
            Some(r) => format!("MSG {subject} {sid} {r} {}\r\n", payload.len()),
            None => format!("MSG {subject} {sid} {}\r\n", payload.len()),
        };
        self.send_raw(&header).await;
        self.stream.write_all(payload).await.expect("write mock MSG payload");
        self.stream.write_all(b"\r\n").await.expect("write mock MSG trailer");
    }

    async fn fill(&mut self) {
        let mut chunk = [0u8; 4096];
        let n = self
            .stream
            .read(&mut chunk)
            .await
            .expect("read from mock client");
        assert!(n > 0, "mock client closed the connection unexpectedly");
        self.buf.extend_from_slice(&chunk[..n]);
    }

    /// Read one CRLF-terminated control line, without the trailing CRLF.
    pub async fn read_line(&mut self) -> String {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                let line = self.buf.split_to(pos);
                self.buf.advance(2);
                return String::from_utf8(line.to_vec()).expect("mock server read non-utf8 line");
            }
            self.fill().await;
        }
    }

    /// Read exactly `len` payload bytes followed by the trailing CRLF that a
    /// PUB's byte-count header promises.
    pub async fn read_payload(&mut self, len: usize) -> Vec<u8> {
        while self.buf.len() < len + 2 {
            self.fill().await;
        }
        let payload = self.buf.split_to(len).to_vec();
        self.buf.advance(2);
        payload
    }

    /// Read lines, skipping any that don't start with `prefix`, until one
    /// does; returns that line. Tolerant of interleaved SUB/UNSUB/PING chatter
    /// arriving in an order the test doesn't care about.
    pub async fn expect_line(&mut self, prefix: &str) -> String {
        loop {
            let line = self.read_line().await;
            if line.starts_with(prefix) {
                return line;
            }
        }
    }

    /// Drive the INFO -> CONNECT -> PING/PONG handshake every dial performs
    /// (the FSM's AWAITING_INFO/CONNECTING transition), with a minimal INFO
    /// banner that requires no auth.
    pub async fn handshake(&mut self) {
        self.handshake_with_info(r#"{"server_id":"mock","version":"2.0.0"}"#)
            .await;
    }

    pub async fn handshake_with_info(&mut self, info_json: &str) {
        self.send_info(info_json).await;
        self.expect_line("CONNECT").await;
        self.expect_line("PING").await;
        self.send_pong().await;
    }
}

fn find_crlf(buf: &BytesMut) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
