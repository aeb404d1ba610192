//! §4.E request/reply: a single `request()` rides the shared mux wildcard
//! inbox, and `request_multi()` collects more than one reply until `expected`
//! is reached or the caller stops polling.

#[path = "support/mod.rs"]
mod support;

use std::time::Duration;

use flotilla::{Client, ConnectOptions};

#[tokio::test]
async fn request_delivers_single_reply_via_mux() {
    support::init_tracing();
    let server = support::MockServer::start().await;
    let url = server.url();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.expect_line("SUB _INBOX.").await;

        let pub_line = conn.expect_line("PUB time.now").await;
        let parts: Vec<&str> = pub_line.split(' ').collect();
        assert_eq!(parts[0], "PUB");
        assert_eq!(parts[1], "time.now");
        let reply_inbox = parts[2].to_owned();
        let len: usize = parts[3].parse().expect("byte count");
        let _ = conn.read_payload(len).await;

        conn.send_msg(&reply_inbox, 999, None, b"12:00").await;
    });

    let client = Client::connect(ConnectOptions::new().server(&url))
        .await
        .unwrap();
    let reply = tokio::time::timeout(
        Duration::from_secs(2),
        client.request("time.now", &b""[..], Duration::from_secs(2)),
    )
    .await
    .expect("request timed out at the test level")
    .unwrap();
    assert_eq!(&reply.payload[..], b"12:00");

    tokio::time::timeout(Duration::from_secs(2), server_task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn request_multi_collects_every_reply_up_to_expected() {
    support::init_tracing();
    let server = support::MockServer::start().await;
    let url = server.url();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        conn.handshake().await;
        conn.expect_line("SUB _INBOX.").await;

        let pub_line = conn.expect_line("PUB survey").await;
        let parts: Vec<&str> = pub_line.split(' ').collect();
        let reply_inbox = parts[2].to_owned();
        let len: usize = parts[3].parse().expect("byte count");
        let _ = conn.read_payload(len).await;

        conn.send_msg(&reply_inbox, 999, None, b"vote-a").await;
        conn.send_msg(&reply_inbox, 999, None, b"vote-b").await;
        conn.send_msg(&reply_inbox, 999, None, b"vote-c").await;
    });

    let client = Client::connect(ConnectOptions::new().server(&url))
        .await
        .unwrap();
    let mut replies = client
        .request_multi("survey", &b""[..], Some(3), Some(Duration::from_secs(2)))
        .unwrap();

    let mut collected = Vec::new();
    for _ in 0..3 {
        let msg = tokio::time::timeout(Duration::from_secs(2), replies.next())
            .await
            .expect("timed out waiting for a reply")
            .expect("reply channel closed early")
            .expect("reply was an error");
        collected.push(String::from_utf8(msg.payload.to_vec()).unwrap());
    }

    assert_eq!(collected, vec!["vote-a", "vote-b", "vote-c"]);

    tokio::time::timeout(Duration::from_secs(2), server_task)
        .await
        .unwrap()
        .unwrap();
}
