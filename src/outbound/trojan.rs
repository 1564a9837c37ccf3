//! Trojan client
//!
//! Trojan has no negotiation: the client writes its header and starts
//! sending payload. Confidentiality of the password digest relies on the
//! outer TLS channel.

use super::connect_server;
use crate::common::deadline::with_deadline;
use crate::common::error::IoContext;
use crate::common::net::Destination;
use crate::common::trojan::{build_header_bytes, TrojanCommand};
use crate::crypto::kdf::PasswordDigest;
use crate::{Error, Result};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

const HANDSHAKE_OP: &str = "trojan client handshake";

/// Send the request header for a TCP CONNECT to `host_port`
pub async fn client_handshake<S>(stream: &mut S, host_port: &str, digest: &PasswordDigest) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    client_handshake_with_command(stream, TrojanCommand::Connect, host_port, digest).await
}

/// [`client_handshake`] bounded by `timeout`; zero means no deadline
pub async fn client_handshake_timeout<S>(
    stream: &mut S,
    host_port: &str,
    digest: &PasswordDigest,
    timeout: Duration,
) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    with_deadline(
        timeout,
        HANDSHAKE_OP,
        handshake(stream, TrojanCommand::Connect, host_port, digest),
    )
    .await
}

/// Same as [`client_handshake`] with an explicit command
pub async fn client_handshake_with_command<S>(
    stream: &mut S,
    command: TrojanCommand,
    host_port: &str,
    digest: &PasswordDigest,
) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    handshake(stream, command, host_port, digest)
        .await
        .map_err(|e| e.context(HANDSHAKE_OP))
}

async fn handshake<S>(stream: &mut S, command: TrojanCommand, host_port: &str, digest: &PasswordDigest) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let destination = Destination::parse_as_domain(host_port)?;
    let header = build_header_bytes(digest, command, &destination)?;
    stream.write_all(&header).await.context("write request header")?;
    stream.flush().await.context("flush request header")?;
    debug!(protocol = "trojan", dst = %destination, ?command, "request sent");
    Ok(())
}

/// Connect to `server`, complete TLS for `server_name` and send the header
pub async fn dial(
    server: &str,
    host_port: &str,
    digest: &PasswordDigest,
    connector: &TlsConnector,
    server_name: ServerName<'static>,
    timeout: Duration,
) -> Result<TlsStream<TcpStream>> {
    let tcp = connect_server(server, timeout).await?;
    let mut stream = with_deadline(timeout, "trojan tls handshake", async {
        connector.connect(server_name, tcp).await.context("tls connect")
    })
    .await?;
    client_handshake_timeout(&mut stream, host_port, digest, timeout).await?;
    Ok(stream)
}

/// TLS connector trusting the webpki roots, or anything when
/// `skip_cert_verify` is set
pub fn tls_connector(skip_cert_verify: bool) -> TlsConnector {
    TlsConnector::from(Arc::new(build_tls_config(skip_cert_verify)))
}

/// Parse the SNI name used for the TLS handshake
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|e| Error::tls(format!("invalid server name {:?}: {}", host, e)))
}

fn build_tls_config(skip_cert_verify: bool) -> rustls::ClientConfig {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = if skip_cert_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    config.resumption = rustls::client::Resumption::default()
        .tls12_resumption(rustls::client::Tls12Resumption::SessionIdOrTickets);
    config
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_header_single_write() {
        let digest = PasswordDigest::new("password");
        let mut expected = digest.as_bytes().to_vec();
        expected.extend_from_slice(b"\r\n\x01\x03\x0bexample.com\x01\xbb\r\n");

        let mut mock = Builder::new().write(&expected).build();
        client_handshake(&mut mock, "example.com:443", &digest).await.unwrap();
    }

    #[tokio::test]
    async fn test_udp_command() {
        let digest = PasswordDigest::new("password");
        let mut out = Vec::new();
        client_handshake_with_command(&mut out, TrojanCommand::UdpAssociate, "1.2.3.4:53", &digest)
            .await
            .unwrap();
        assert_eq!(out[58], 0x03);
        assert_eq!(out[59], 0x03);
        assert_eq!(&out[61..68], b"1.2.3.4");
    }

    #[tokio::test]
    async fn test_ipv6_literal_travels_as_text() {
        let digest = PasswordDigest::new("password");
        let mut out = Vec::new();
        client_handshake(&mut out, "[::1]:80", &digest).await.unwrap();
        assert_eq!(out[60], 3);
        assert_eq!(&out[61..64], b"::1");
    }

    #[test]
    fn test_tls_helpers() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let _ = tls_connector(false);
        let _ = tls_connector(true);
        assert!(server_name("example.com").is_ok());
        assert!(server_name("not a host!").is_err());
    }
}
