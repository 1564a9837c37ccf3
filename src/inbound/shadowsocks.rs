//! Shadowsocks server
//!
//! The first plaintext a client sends is the destination TLV. The server
//! answers nothing; payload relaying starts right after.

use super::{connect_destination, relay, InboundListener, ServiceState};
use crate::common::deadline::with_deadline;
use crate::common::error::IoContext;
use crate::common::net::Destination;
use crate::crypto::CipherRegistry;
use crate::transport::ShadowsocksStream;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

const HANDSHAKE_OP: &str = "shadowsocks server handshake";

/// Read the destination a client asked for
pub async fn server_handshake<S>(stream: &mut S) -> Result<Destination>
where
    S: AsyncRead + Unpin + ?Sized,
{
    handshake(stream).await.map_err(|e| e.context(HANDSHAKE_OP))
}

/// [`server_handshake`] bounded by `timeout`; zero means no deadline
pub async fn server_handshake_timeout<S>(stream: &mut S, timeout: Duration) -> Result<Destination>
where
    S: AsyncRead + Unpin + ?Sized,
{
    with_deadline(timeout, HANDSHAKE_OP, handshake(stream)).await
}

async fn handshake<S>(stream: &mut S) -> Result<Destination>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let destination = Destination::read_from(stream).await?;
    debug!(protocol = "shadowsocks", dst = %destination, "request received");
    Ok(destination)
}

/// Wraps accepted connections with a fresh cryptor and reads the request
#[derive(Clone)]
pub struct ShadowsocksAcceptor {
    registry: Arc<CipherRegistry>,
    method: String,
    password: String,
    timeout: Duration,
}

impl ShadowsocksAcceptor {
    /// Fails with `UnsupportedMethod` when `method` is not registered
    pub fn new(
        registry: Arc<CipherRegistry>,
        method: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let method = method.into();
        if !registry.contains(&method) {
            return Err(Error::UnsupportedMethod(method));
        }
        Ok(Self {
            registry,
            method,
            password: password.into(),
            timeout,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub async fn accept<S>(&self, stream: S) -> Result<(ShadowsocksStream<S>, Destination)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let cryptor = self.registry.new_cryptor(&self.method, &self.password)?;
        let mut stream = ShadowsocksStream::new(stream, cryptor);
        let destination = server_handshake_timeout(&mut stream, self.timeout).await?;
        Ok((stream, destination))
    }
}

/// TCP listener that hands out handshaken Shadowsocks streams
pub struct ShadowsocksListener {
    listener: TcpListener,
    acceptor: ShadowsocksAcceptor,
}

impl ShadowsocksListener {
    pub async fn bind(addr: &str, acceptor: ShadowsocksAcceptor) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.context("bind shadowsocks listener")?;
        Ok(Self { listener, acceptor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("local addr")
    }

    pub fn acceptor(&self) -> &ShadowsocksAcceptor {
        &self.acceptor
    }

    /// Accept one connection and run the handshake on it. A failed handshake
    /// drops the connection and returns the error.
    pub async fn accept(&self) -> Result<(ShadowsocksStream<TcpStream>, Destination, SocketAddr)> {
        let (tcp, peer_addr) = self.listener.accept().await.context("accept")?;
        let (stream, destination) = self.acceptor.accept(tcp).await?;
        Ok((stream, destination, peer_addr))
    }
}

/// Shadowsocks inbound service
pub struct ShadowsocksInbound {
    listen: String,
    acceptor: ShadowsocksAcceptor,
    state: ServiceState,
}

impl ShadowsocksInbound {
    pub fn new(listen: impl Into<String>, acceptor: ShadowsocksAcceptor) -> Self {
        Self {
            listen: listen.into(),
            acceptor,
            state: ServiceState::default(),
        }
    }

    async fn handle_connection(acceptor: ShadowsocksAcceptor, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = Self::process_connection(&acceptor, stream).await {
            debug!("Shadowsocks connection error from {}: {}", peer_addr, e);
        }
    }

    async fn process_connection(acceptor: &ShadowsocksAcceptor, stream: TcpStream) -> Result<()> {
        let (inbound, destination) = acceptor.accept(stream).await?;
        let remote = connect_destination(&destination).await?;
        relay(inbound, remote, &destination).await
    }
}

#[async_trait]
impl InboundListener for ShadowsocksInbound {
    fn name(&self) -> &str {
        "Shadowsocks"
    }

    async fn start(&self) -> Result<()> {
        let listener = ShadowsocksListener::bind(&self.listen, self.acceptor.clone()).await?;
        info!(
            "Shadowsocks listening on {} ({})",
            listener.local_addr()?,
            self.acceptor.method()
        );

        self.state
            .serve(self.name(), &listener.listener, |stream, peer_addr| {
                Self::handle_connection(listener.acceptor.clone(), stream, peer_addr)
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
