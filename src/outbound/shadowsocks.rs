//! Shadowsocks client
//!
//! The handshake runs over an already encrypted stream: the client sends the
//! destination TLV as its first plaintext and expects no reply.

use super::connect_server;
use crate::common::deadline::with_deadline;
use crate::common::net::Destination;
use crate::crypto::CipherRegistry;
use crate::transport::ShadowsocksStream;
use crate::Result;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const HANDSHAKE_OP: &str = "shadowsocks client handshake";

/// Send the destination, always as a domain TLV, in a single write
pub async fn client_handshake<S>(stream: &mut S, host_port: &str) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    handshake(stream, host_port)
        .await
        .map_err(|e| e.context(HANDSHAKE_OP))
}

/// [`client_handshake`] bounded by `timeout`; zero means no deadline
pub async fn client_handshake_timeout<S>(stream: &mut S, host_port: &str, timeout: Duration) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    with_deadline(timeout, HANDSHAKE_OP, handshake(stream, host_port)).await
}

async fn handshake<S>(stream: &mut S, host_port: &str) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let destination = Destination::parse_as_domain(host_port)?;
    destination.write_to(stream).await?;
    stream.flush().await?;
    debug!(protocol = "shadowsocks", dst = %destination, "request sent");
    Ok(())
}

/// Connect to `server`, wrap the connection with `method` and send the
/// destination. The stream is dropped if any step fails.
pub async fn dial(
    registry: &CipherRegistry,
    server: &str,
    host_port: &str,
    method: &str,
    password: &str,
    timeout: Duration,
) -> Result<ShadowsocksStream<TcpStream>> {
    let cryptor = registry.new_cryptor(method, password)?;
    let tcp = connect_server(server, timeout).await?;
    let mut stream = ShadowsocksStream::new(tcp, cryptor);
    client_handshake_timeout(&mut stream, host_port, timeout).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::net::{Address, ATYP_DOMAIN};
    use crate::Error;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_client_sends_domain_tlv() {
        let registry = CipherRegistry::with_builtin();
        let (a, b) = tokio::io::duplex(1024);
        let mut client = ShadowsocksStream::new(a, registry.new_cryptor("aes-256-gcm", "pw").unwrap());
        let mut server = ShadowsocksStream::new(b, registry.new_cryptor("aes-256-gcm", "pw").unwrap());

        client_handshake(&mut client, "127.0.0.1:8080").await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(buf[0], ATYP_DOMAIN);
        let (dest, used) = Destination::decode(&buf[..n]).unwrap();
        assert_eq!(used, n);
        assert_eq!(dest.address, Address::Domain("127.0.0.1".into()));
        assert_eq!(dest.port, 8080);
    }

    #[tokio::test]
    async fn test_bad_host_port() {
        let mut sink = Vec::new();
        let err = client_handshake(&mut sink, "no-port").await.unwrap_err();
        assert!(matches!(err, Error::Address(_)));
        assert!(sink.is_empty());
    }
}
