//! §4.D auto-unsubscribe: `unsubscribe_after(max)` stops delivery exactly at
//! `max`, and the subscription's channel closes once the server's matching
//! UNSUB takes effect.

#[path = "support/mod.rs"]
mod support;

use std::time::Duration;

use flotilla::{Client, ConnectOptions, SubEvent};

#[tokio::test]
async fn auto_unsubscribe_stops_after_max_deliveries() {
    support::init_tracing();
    let server = support::MockServer::start().await;
    let url = server.url();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.expect_line("SUB orders").await;
        conn.expect_line("UNSUB").await;
        conn.send_msg("orders", 1, None, b"one").await;
        conn.send_msg("orders", 1, None, b"two").await;
        conn.send_msg("orders", 1, None, b"three").await;
    });

    let client = Client::connect(ConnectOptions::new().server(&url))
        .await
        .unwrap();
    let mut sub = client.subscribe("orders").await.unwrap();
    sub.unsubscribe_after(2);

    let first = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("timed out on first delivery")
        .expect("first delivery");
    assert!(matches!(first, SubEvent::Msg(_)));

    let second = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("timed out on second delivery")
        .expect("second delivery");
    assert!(matches!(second, SubEvent::Msg(_)));

    let third = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("timed out waiting for channel to close");
    assert!(
        third.is_none(),
        "channel should close once max deliveries are reached, got {third:?}"
    );

    tokio::time::timeout(Duration::from_secs(2), server_task)
        .await
        .unwrap()
        .unwrap();
}
