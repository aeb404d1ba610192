//! A subscriber receives what a publisher sends, and a publish produces the
//! exact wire frame the server expects (§4.B/§4.D).

#[path = "support/mod.rs"]
mod support;

use std::time::Duration;

use flotilla::{Client, ConnectOptions, SubEvent};

#[tokio::test]
async fn subscribe_receives_a_delivered_message() {
    support::init_tracing();
    let server = support::MockServer::start().await;
    let url = server.url();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.expect_line("SUB foo").await;
        conn.send_msg("foo", 1, None, b"hello").await;
    });

    let client = Client::connect(ConnectOptions::new().server(&url))
        .await
        .unwrap();
    let mut sub = client.subscribe("foo").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("timed out waiting for delivery")
        .expect("subscription channel closed early");

    match event {
        SubEvent::Msg(msg) => {
            assert_eq!(msg.subject, "foo");
            assert_eq!(&msg.payload[..], b"hello");
        }
        other => panic!("expected Msg, got {other:?}"),
    }

    tokio::time::timeout(Duration::from_secs(2), server_task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn publish_writes_the_expected_pub_frame() {
    support::init_tracing();
    let server = support::MockServer::start().await;
    let url = server.url();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        let line = conn.expect_line("PUB").await;
        let parts: Vec<&str> = line.split(' ').collect();
        assert_eq!(parts[0], "PUB");
        assert_eq!(parts[1], "greet.bob");
        let len: usize = parts[2].parse().expect("byte count");
        let payload = conn.read_payload(len).await;
        assert_eq!(payload, b"hi bob".to_vec());
    });

    let client = Client::connect(ConnectOptions::new().server(&url))
        .await
        .unwrap();
    client.publish("greet.bob", &b"hi bob"[..]).unwrap();

    tokio::time::timeout(Duration::from_secs(2), server_task)
        .await
        .expect("timed out waiting for publish")
        .unwrap();
}

#[tokio::test]
async fn publish_with_reply_includes_reply_subject() {
    support::init_tracing();
    let server = support::MockServer::start().await;
    let url = server.url();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        let line = conn.expect_line("PUB").await;
        let parts: Vec<&str> = line.split(' ').collect();
        assert_eq!(parts[1], "orders.new");
        assert_eq!(parts[2], "orders.reply.1");
        let len: usize = parts[3].parse().expect("byte count");
        let _ = conn.read_payload(len).await;
    });

    let client = Client::connect(ConnectOptions::new().server(&url))
        .await
        .unwrap();
    client
        .publish_with_reply("orders.new", "orders.reply.1", &b"payload"[..])
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), server_task)
        .await
        .expect("timed out waiting for publish")
        .unwrap();
}
