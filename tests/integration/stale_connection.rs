//! §4.F / §7: a connection that stops answering PINGs is declared stale and
//! silently redialed -- never surfaced through `on_error`.

#[path = "support/mod.rs"]
mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flotilla::{Client, ClientError, ConnectOptions, EventHandler};

#[derive(Default)]
struct CountingHandler {
    errors: AtomicUsize,
    reconnecting: AtomicUsize,
}

impl EventHandler for CountingHandler {
    fn on_error(&self, _err: &ClientError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn on_reconnecting(&self) {
        self.reconnecting.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn stale_connection_reconnects_without_an_error_event() {
    support::init_tracing();
    let server = support::MockServer::start().await;
    let url = server.url();

    let server_task = tokio::spawn(async move {
        let mut first = server.accept().await;
        first.handshake().await;
        // Never answer a second PING on this connection: with
        // max_ping_out(0) the very first periodic ping timer fire should
        // declare it stale and redial rather than hang.
        let mut second = server.accept().await;
        second.handshake().await;
    });

    let handler = Arc::new(CountingHandler::default());
    let opts = ConnectOptions::new()
        .server(&url)
        .ping_interval_ms(30)
        .max_ping_out(0)
        .reconnect_wait_ms(10)
        .event_handler(handler.clone());

    let _client = Client::connect(opts).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("timed out waiting for the stale reconnect")
        .unwrap();

    assert_eq!(
        handler.errors.load(Ordering::SeqCst),
        0,
        "a stale connection must not surface as on_error"
    );
    assert!(handler.reconnecting.load(Ordering::SeqCst) >= 1);
}
