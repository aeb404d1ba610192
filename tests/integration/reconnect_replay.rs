//! §4.H reconnect: every live subscription is replayed with SUB immediately
//! after the post-reconnect CONNECT/PING handshake, with no action required
//! from the caller.

#[path = "support/mod.rs"]
mod support;

use std::time::Duration;

use flotilla::{Client, ConnectOptions};

#[tokio::test]
async fn resubscribes_after_the_server_drops_the_connection() {
    support::init_tracing();
    let server = support::MockServer::start().await;
    let url = server.url();

    let server_task = tokio::spawn(async move {
        let mut first = server.accept().await;
        first.handshake().await;
        first.expect_line("SUB foo").await;
        drop(first);

        // On reconnect the SUB replay is flushed together with CONNECT,
        // ahead of the handshake PING -- unlike the very first connect,
        // where "foo" isn't subscribed yet until after the handshake.
        let mut second = server.accept().await;
        second.send_info(r#"{"server_id":"mock","version":"2.0.0"}"#).await;
        second.expect_line("CONNECT").await;
        second.expect_line("SUB foo").await;
        second.expect_line("PING").await;
        second.send_pong().await;
    });

    let opts = ConnectOptions::new()
        .server(&url)
        .reconnect(true)
        .reconnect_wait_ms(20);

    let client = Client::connect(opts).await.unwrap();
    let _sub = client.subscribe("foo").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), server_task)
        .await
        .expect("timed out waiting for reconnect handshake")
        .unwrap();

    assert!(client.is_connected());
}
