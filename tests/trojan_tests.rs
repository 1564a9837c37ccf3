//! Trojan client and server over in-memory pipes
//!
//! The outer TLS channel is opaque to the handshake, so duplex streams stand
//! in for it.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tunnel_proto::auth::AuthPassword;
use tunnel_proto::common::net::{Address, Network};
use tunnel_proto::common::trojan::TrojanCommand;
use tunnel_proto::crypto::PasswordDigest;
use tunnel_proto::inbound::trojan::{server_handshake, server_handshake_timeout};
use tunnel_proto::outbound::trojan::{client_handshake, client_handshake_with_command};
use tunnel_proto::Error;

fn auth() -> AuthPassword {
    AuthPassword::from_passwords(["correct horse", "battery staple"])
}

#[tokio::test]
async fn test_handshake_then_payload() {
    let (mut client, mut server) = tokio::io::duplex(1024);

    let digest = PasswordDigest::new("battery staple");
    client_handshake(&mut client, "example.com:443", &digest).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let request = server_handshake(&mut server, &auth()).await.unwrap();
    assert_eq!(request.network, Network::Tcp);
    assert_eq!(request.destination.address, Address::Domain("example.com".into()));
    assert_eq!(request.destination.port, 443);

    // Payload starts right after the header
    let mut payload = [0u8; 18];
    server.read_exact(&mut payload).await.unwrap();
    assert_eq!(&payload, b"GET / HTTP/1.1\r\n\r\n");
}

#[tokio::test]
async fn test_udp_associate() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let digest = PasswordDigest::new("correct horse");
    client_handshake_with_command(&mut client, TrojanCommand::UdpAssociate, "8.8.8.8:53", &digest)
        .await
        .unwrap();

    let request = server_handshake(&mut server, &auth()).await.unwrap();
    assert_eq!(request.network, Network::Udp);
    assert_eq!(request.destination.to_string(), "8.8.8.8:53");
}

#[tokio::test]
async fn test_wrong_password_returns_exact_digest() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    let digest = PasswordDigest::new("wrong");
    client_handshake(&mut client, "example.com:443", &digest).await.unwrap();

    let err = server_handshake(&mut server, &auth()).await.unwrap_err();
    assert!(err.is_auth_failure());
    assert_eq!(err.received_bytes().unwrap(), &digest.as_bytes()[..]);
}

#[tokio::test]
async fn test_short_read_returns_partial_bytes() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    client.write_all(b"0123456789").await.unwrap();
    drop(client);

    let err = server_handshake(&mut server, &auth()).await.unwrap_err();
    match err {
        Error::AuthFailure { received, .. } => assert_eq!(received, b"0123456789"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_prehashed_digests() {
    let hex = PasswordDigest::new("from elsewhere");
    let auth = AuthPassword::from_digests([hex.as_bytes()]).unwrap();

    let (mut client, mut server) = tokio::io::duplex(1024);
    client_handshake(&mut client, "[2001:db8::1]:8443", &hex).await.unwrap();
    let request = server_handshake(&mut server, &auth).await.unwrap();
    assert_eq!(request.destination.to_string(), "[2001:db8::1]:8443");

    assert!(AuthPassword::from_digests([b"too short".as_slice()]).is_err());
}

#[tokio::test]
async fn test_deadline_keeps_partial_digest() {
    let (mut client, mut server) = tokio::io::duplex(1024);
    client.write_all(b"\x16\x03\x01").await.unwrap();

    let err = server_handshake_timeout(&mut server, &auth(), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert_eq!(err.received_bytes(), Some(&b"\x16\x03\x01"[..]));
    drop(client);
}
