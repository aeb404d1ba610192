//! §4.G / §6: a chained credentials file drives the nonce-signing handshake
//! end to end -- JWT and seed are parsed from the file, the seed signer
//! signs the server's nonce, and both land in the CONNECT payload.

#[path = "support/mod.rs"]
mod support;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use flotilla::{Client, ConnectOptions, SeedSigner};

const CREDS: &str = "\
-----BEGIN NATS USER JWT-----
eyJhbGciOiJFZERTQSJ9.fake.jwt
-----END NATS USER JWT-----

-----BEGIN USER NKEY SEED-----
SUAEZFAKESEEDFAKESEEDFAKESEEDFAKESEED
-----END USER NKEY SEED-----
";

#[tokio::test]
async fn creds_file_signs_nonce_and_forwards_jwt() {
    support::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let creds_path = dir.path().join("user.creds");
    std::fs::write(&creds_path, CREDS).unwrap();

    let server = support::MockServer::start().await;
    let url = server.url();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        let nonce = base64::engine::general_purpose::STANDARD.encode(b"test-nonce");
        conn.send_info(&format!(
            r#"{{"server_id":"mock","version":"2.0.0","nonce":"{nonce}"}}"#
        ))
        .await;

        let connect_line = conn.expect_line("CONNECT").await;
        let json = connect_line.trim_start_matches("CONNECT ");
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["jwt"], "eyJhbGciOiJFZERTQSJ9.fake.jwt");
        assert!(
            value["sig"].as_str().is_some_and(|s| !s.is_empty()),
            "CONNECT payload must carry a non-empty signature: {value}"
        );

        conn.expect_line("PING").await;
        conn.send_pong().await;
    });

    let seed_signer: SeedSigner = Arc::new(|seed: &str, nonce: &[u8]| {
        let mut sig = seed.as_bytes().to_vec();
        sig.extend_from_slice(nonce);
        sig
    });

    let opts = ConnectOptions::new()
        .server(&url)
        .creds_path(creds_path.to_str().unwrap(), seed_signer);

    let client = Client::connect(opts).await.unwrap();
    assert!(client.is_connected());

    tokio::time::timeout(Duration::from_secs(2), server_task)
        .await
        .expect("timed out waiting for handshake")
        .unwrap();
}

#[tokio::test]
async fn missing_signer_for_a_nonce_fails_before_any_dial() {
    support::init_tracing();
    // No signer and no creds file configured, but the server would demand
    // one (§4.G). `build()` can't know that in advance -- the nonce only
    // shows up in the first INFO -- so the client dials, reads the nonce,
    // and then fails the handshake with SigReq rather than trying CONNECT.
    let server = support::MockServer::start().await;
    let url = server.url();

    let server_task = tokio::spawn(async move {
        let mut conn = server.accept().await;
        let nonce = base64::engine::general_purpose::STANDARD.encode(b"test-nonce");
        conn.send_info(&format!(
            r#"{{"server_id":"mock","version":"2.0.0","nonce":"{nonce}"}}"#
        ))
        .await;
    });

    let opts = ConnectOptions::new().server(&url).reconnect(false);
    let err = Client::connect(opts).await.unwrap_err();
    assert_eq!(err, flotilla::ClientError::SigReq);

    tokio::time::timeout(Duration::from_secs(2), server_task)
        .await
        .unwrap()
        .unwrap();
}
