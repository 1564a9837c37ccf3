//! Trojan server
//!
//! The server reads the 56 byte digest before anything else. When the
//! digest is short or unknown the bytes read so far travel back inside
//! `Error::AuthFailure` so the connection can be handed to a fallback
//! service as if nothing had been consumed.

use super::{connect_destination, relay, InboundListener, ServiceState};
use crate::auth::Authenticator;
use crate::common::deadline::{deadline_from, until, with_deadline};
use crate::common::error::IoContext;
use crate::common::net::{Destination, Network};
use crate::common::trojan::TrojanCommand;
use crate::crypto::kdf::DIGEST_LEN;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const HANDSHAKE_OP: &str = "trojan server handshake";

/// What the client asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrojanRequest {
    pub network: Network,
    pub destination: Destination,
}

/// Authenticate the client and read its request
pub async fn server_handshake<S>(stream: &mut S, auth: &dyn Authenticator) -> Result<TrojanRequest>
where
    S: AsyncRead + Unpin + ?Sized,
{
    handshake(stream, auth, None)
        .await
        .map_err(|e| e.context(HANDSHAKE_OP))
}

/// [`server_handshake`] bounded by `timeout`; zero means no deadline.
///
/// The deadline is checked on every read so that a client stalling in the
/// middle of its digest still yields the partial bytes.
pub async fn server_handshake_timeout<S>(
    stream: &mut S,
    auth: &dyn Authenticator,
    timeout: Duration,
) -> Result<TrojanRequest>
where
    S: AsyncRead + Unpin + ?Sized,
{
    handshake(stream, auth, deadline_from(timeout))
        .await
        .map_err(|e| e.context(HANDSHAKE_OP))
}

async fn handshake<S>(stream: &mut S, auth: &dyn Authenticator, deadline: Option<Instant>) -> Result<TrojanRequest>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let digest = read_digest(stream, deadline).await?;
    if !auth.verify(&digest) {
        warn!(protocol = "trojan", method = auth.method(), "unknown password digest");
        return Err(Error::auth_with_bytes("unknown password digest", digest.to_vec()));
    }

    let mut crlf = [0u8; 2];
    until(deadline, "discard crlf", read_exact(stream, &mut crlf, "discard crlf")).await?;

    let mut head = [0u8; 2];
    until(deadline, "read command", read_exact(stream, &mut head, "read command and address type")).await?;
    let command = TrojanCommand::try_from(head[0])?;

    let destination = until(deadline, "read destination", Destination::read_with_type(stream, head[1])).await?;

    until(deadline, "discard crlf", read_exact(stream, &mut crlf, "discard crlf")).await?;

    debug!(protocol = "trojan", dst = %destination, ?command, "request received");
    Ok(TrojanRequest {
        network: command.network(),
        destination,
    })
}

/// Fill the digest read by read. A failure after some bytes arrived
/// becomes an auth failure carrying exactly those bytes.
async fn read_digest<S>(stream: &mut S, deadline: Option<Instant>) -> Result<[u8; DIGEST_LEN]>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; DIGEST_LEN];
    let mut filled = 0;

    while filled < DIGEST_LEN {
        let read = until(deadline, "read password digest", async {
            stream.read(&mut buf[filled..]).await.context("read password digest")
        })
        .await;

        let err = match read {
            Ok(0) => Error::io(
                "read password digest",
                std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            ),
            Ok(n) => {
                filled += n;
                continue;
            }
            Err(e) => e,
        };

        if filled == 0 {
            return Err(err);
        }
        debug!(protocol = "trojan", received = filled, "short password digest: {}", err);
        return Err(Error::auth_with_bytes("short password digest", buf[..filled].to_vec()));
    }

    Ok(buf)
}

async fn read_exact<S>(stream: &mut S, buf: &mut [u8], op: &'static str) -> Result<()>
where
    S: AsyncRead + Unpin + ?Sized,
{
    stream.read_exact(buf).await.context(op)?;
    Ok(())
}

/// Completes TLS and the Trojan handshake on accepted connections
#[derive(Clone)]
pub struct TrojanAcceptor {
    tls: TlsAcceptor,
    auth: Arc<dyn Authenticator>,
    timeout: Duration,
}

impl TrojanAcceptor {
    pub fn new(tls: TlsAcceptor, auth: Arc<dyn Authenticator>, timeout: Duration) -> Self {
        Self { tls, auth, timeout }
    }

    /// The outer error covers TLS. The inner result is the Trojan handshake,
    /// returned next to the stream so a failed client can still be served
    /// by a fallback.
    pub async fn accept(&self, tcp: TcpStream) -> Result<(TlsStream<TcpStream>, Result<TrojanRequest>)> {
        let mut stream = with_deadline(self.timeout, "trojan tls accept", async {
            self.tls.accept(tcp).await.context("tls accept")
        })
        .await?;
        let request = server_handshake_timeout(&mut stream, self.auth.as_ref(), self.timeout).await;
        Ok((stream, request))
    }
}

/// TLS listener running the Trojan handshake on every connection
pub struct TrojanListener {
    listener: TcpListener,
    acceptor: TrojanAcceptor,
}

impl TrojanListener {
    pub async fn bind(addr: &str, acceptor: TrojanAcceptor) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.context("bind trojan listener")?;
        Ok(Self { listener, acceptor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("local addr")
    }

    pub fn acceptor(&self) -> &TrojanAcceptor {
        &self.acceptor
    }

    pub async fn accept(&self) -> Result<(TlsStream<TcpStream>, Result<TrojanRequest>, SocketAddr)> {
        let (tcp, peer_addr) = self.listener.accept().await.context("accept")?;
        let (stream, request) = self.acceptor.accept(tcp).await?;
        Ok((stream, request, peer_addr))
    }
}

/// Trojan inbound service
///
/// Clients failing authentication are relayed to `fallback` when one is
/// set, starting with the bytes they already sent.
pub struct TrojanInbound {
    listen: String,
    acceptor: TrojanAcceptor,
    fallback: Option<Destination>,
    state: ServiceState,
}

impl TrojanInbound {
    pub fn new(listen: impl Into<String>, acceptor: TrojanAcceptor) -> Self {
        Self {
            listen: listen.into(),
            acceptor,
            fallback: None,
            state: ServiceState::default(),
        }
    }

    pub fn with_fallback(mut self, fallback: Destination) -> Self {
        self.fallback = Some(fallback);
        self
    }

    async fn handle_connection(
        acceptor: TrojanAcceptor,
        fallback: Option<Destination>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) {
        if let Err(e) = Self::process_connection(&acceptor, fallback.as_ref(), stream).await {
            debug!("Trojan connection error from {}: {}", peer_addr, e);
        }
    }

    async fn process_connection(
        acceptor: &TrojanAcceptor,
        fallback: Option<&Destination>,
        tcp: TcpStream,
    ) -> Result<()> {
        let (stream, request) = acceptor.accept(tcp).await?;

        let request = match (request, fallback) {
            (Ok(request), _) => request,
            (Err(e), Some(fallback)) if e.is_auth_failure() => {
                let received = e.received_bytes().unwrap_or_default();
                let mut remote = connect_destination(fallback).await?;
                remote.write_all(received).await.context("replay to fallback")?;
                debug!(protocol = "trojan", fallback = %fallback, replayed = received.len(), "fallback");
                return relay(stream, remote, fallback).await;
            }
            (Err(e), _) => return Err(e),
        };

        if request.network != Network::Tcp {
            return Err(Error::protocol("UDP associate is not supported by this inbound"));
        }

        let remote = connect_destination(&request.destination).await?;
        relay(stream, remote, &request.destination).await
    }
}

#[async_trait]
impl InboundListener for TrojanInbound {
    fn name(&self) -> &str {
        "Trojan"
    }

    async fn start(&self) -> Result<()> {
        let listener = TrojanListener::bind(&self.listen, self.acceptor.clone()).await?;
        info!("Trojan listening on {}", listener.local_addr()?);

        let fallback = self.fallback.clone();
        self.state
            .serve(self.name(), &listener.listener, |stream, peer_addr| {
                Self::handle_connection(listener.acceptor.clone(), fallback.clone(), stream, peer_addr)
            })
            .await
    }

    async fn stop(&self) -> Result<()> {
        self.state.stop();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }
}
