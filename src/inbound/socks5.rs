//! SOCKS5 server (RFC 1928)
//!
//! The handshake stops after the request has been read. The reply is left
//! to the caller because the bound address is only known once the
//! outbound connection exists.

use super::{connect_destination, relay, InboundListener, ServiceState};
use crate::auth::{ProxyStream, Socks5Auth};
use crate::common::deadline::with_deadline;
use crate::common::error::IoContext;
use crate::common::net::Destination;
use crate::common::socks::{Command, HelloRequest, HelloResponse, ReplyCode, Request, Response, AUTH_NO_ACCEPTABLE};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

const HANDSHAKE_OP: &str = "socks5 server handshake";

/// What the client asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Request {
    pub command: Command,
    pub destination: Destination,
}

/// Negotiate a method from `auths`, authenticate the client and read its
/// request. The server's order of `auths` decides between methods the
/// client offers.
pub async fn server_handshake(stream: &mut dyn ProxyStream, auths: &[Arc<dyn Socks5Auth>]) -> Result<Socks5Request> {
    handshake(stream, auths).await.map_err(|e| e.context(HANDSHAKE_OP))
}

/// [`server_handshake`] bounded by `timeout`; zero means no deadline
pub async fn server_handshake_timeout(
    stream: &mut dyn ProxyStream,
    auths: &[Arc<dyn Socks5Auth>],
    timeout: Duration,
) -> Result<Socks5Request> {
    with_deadline(timeout, HANDSHAKE_OP, handshake(stream, auths)).await
}

async fn handshake(stream: &mut dyn ProxyStream, auths: &[Arc<dyn Socks5Auth>]) -> Result<Socks5Request> {
    let hello = HelloRequest::read_from(stream).await?;

    let Some(auth) = auths.iter().find(|a| hello.supports(a.method())) else {
        HelloResponse::new(AUTH_NO_ACCEPTABLE).write_to(stream).await?;
        debug!(protocol = "socks5", offered = ?hello.methods, "no acceptable method");
        return Err(Error::NoAcceptableMethod);
    };

    let method = auth.method();
    HelloResponse::new(method).write_to(stream).await?;
    debug!(protocol = "socks5", method, "method negotiated");

    auth.authenticate(stream).await?;

    let request = Request::read_from(stream).await?;
    debug!(protocol = "socks5", dst = %request.destination, command = ?request.command, "request received");
    Ok(Socks5Request {
        command: request.command,
        destination: request.destination,
    })
}

/// Runs the server handshake with a fixed method list
#[derive(Clone)]
pub struct Socks5Acceptor {
    auths: Arc<[Arc<dyn Socks5Auth>]>,
    timeout: Duration,
}

impl Socks5Acceptor {
    pub fn new(auths: Vec<Arc<dyn Socks5Auth>>, timeout: Duration) -> Self {
        Self {
            auths: auths.into(),
            timeout,
        }
    }

    pub fn methods(&self) -> Vec<u8> {
        self.auths.iter().map(|a| a.method()).collect()
    }

    pub async fn accept(&self, stream: &mut dyn ProxyStream) -> Result<Socks5Request> {
        server_handshake_timeout(stream, &self.auths, self.timeout).await
    }
}

/// TCP listener that hands out connections with their SOCKS5 request read
/// and replied to
pub struct Socks5Listener {
    listener: TcpListener,
    acceptor: Socks5Acceptor,
}

impl Socks5Listener {
    pub async fn bind(addr: &str, acceptor: Socks5Acceptor) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.context("bind socks5 listener")?;
        Ok(Self { listener, acceptor })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("local addr")
    }

    pub fn acceptor(&self) -> &Socks5Acceptor {
        &self.acceptor
    }

    /// Accept one connection and reply with success bound to `0.0.0.0:0`
    pub async fn accept(&self) -> Result<(TcpStream, Socks5Request, SocketAddr)> {
        self.accept_with_response(|_, _| Response::success(Destination::new(Ipv4Addr::UNSPECIFIED.into(), 0)))
            .await
    }

    /// Accept one connection and reply with what `respond` builds from the
    /// connection's local address and the request. A failed handshake drops
    /// the connection and returns the error.
    pub async fn accept_with_response<F>(&self, respond: F) -> Result<(TcpStream, Socks5Request, SocketAddr)>
    where
        F: FnOnce(SocketAddr, &Socks5Request) -> Response,
    {
        let (mut stream, peer_addr) = self.listener.accept().await.context("accept")?;
        let request = self.acceptor.accept(&mut stream).await?;
        let local_addr = stream.local_addr().context("local addr")?;
        respond(local_addr, &request).write_to(&mut stream).await?;
        Ok((stream, request, peer_addr))
    }
}

/// SOCKS5 inbound service, CONNECT only
pub struct Socks5Inbound {
    listen: String,
    acceptor: Socks5Acceptor,
    state: ServiceState,
}

impl Socks5Inbound {
    pub fn new(listen: impl Into<String>, acceptor: Socks5Acceptor) -> Self {
        Self {
            listen: listen.into(),
            acceptor,
            state: ServiceState::default(),
        }
    }

    async fn handle_connection(acceptor: Socks5Acceptor, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = Self::process_connection(&acceptor, stream).await {
            debug!("SOCKS5 connection error from {}: {}", peer_addr, e);
        }
    }

    async fn process_connection(acceptor: &Socks5Acceptor, mut stream: TcpStream) -> Result<()> {
        let request = acceptor.accept(&mut stream).await?;

        if request.command != Command::Connect {
            Response::failure(ReplyCode::CommandNotSupported)
                .write_to(&mut stream)
                .await?;
            return Err(Error::InvalidCommand(request.command.into()));
        }

        let remote = match connect_destination(&request.destination).await {
            Ok(remote) => remote,
            Err(e) => {
                Response::failure(ReplyCode::HostUnreachable)
                    .write_to(&mut stream)
                    .await?;
                return Err(e);
            }
        };

        let bound = remote.local_addr().context("local addr")?;
        Response::success(bound.into()).write_to(&mut stream).await?;
        relay(stream, remote, &request.destination).await
    }
}

#[async_trait]
impl InboundListener for Socks5Inbound {
    fn name(&self) -> &str {
        "SOCKS5"
    }

    async fn start(&self) -> Result<()> {
        let listener = Socks5Listener::bind(&self.listen, self.acceptor.clone()).await?;
        info!("SOCKS5 proxy listening on {}", listener.local_addr()?);

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{NoAuth, UserPasswordServer};
    use std::collections::HashMap;
    use tokio_test::io::Builder;

    fn user_table() -> UserPasswordServer {
        let mut users = HashMap::new();
        users.insert("u".to_string(), "p".to_string());
        UserPasswordServer::new(users)
    }

    #[tokio::test]
    async fn test_no_auth_connect() {
        let auths: Vec<Arc<dyn Socks5Auth>> = vec![Arc::new(NoAuth)];
        let mut mock = Builder::new()
            .read(&[5, 1, 0])
            .write(&[5, 0])
            .read(b"\x05\x01\x00\x03\x0bexample.com\x01\xbb")
            .build();
        let request = server_handshake(&mut mock, &auths).await.unwrap();
        assert_eq!(request.command, Command::Connect);
        assert_eq!(request.destination.to_string(), "example.com:443");
    }

    #[tokio::test]
    async fn test_server_order_wins() {
        let auths: Vec<Arc<dyn Socks5Auth>> = vec![Arc::new(user_table()), Arc::new(NoAuth)];
        let mut mock = Builder::new()
            .read(&[5, 2, 0, 2])
            .write(&[5, 2])
            .read(b"\x01\x01u\x01p")
            .write(&[1, 0])
            .read(&[5, 1, 0, 1, 127, 0, 0, 1, 0, 80])
            .build();
        let request = server_handshake(&mut mock, &auths).await.unwrap();
        assert_eq!(request.destination.to_string(), "127.0.0.1:80");
    }

    #[tokio::test]
    async fn test_no_common_method_sends_sentinel() {
        let auths: Vec<Arc<dyn Socks5Auth>> = vec![Arc::new(user_table())];
        let mut mock = Builder::new().read(&[5, 1, 0]).write(&[5, 0xFF]).build();
        let err = server_handshake(&mut mock, &auths).await.unwrap_err();
        assert!(matches!(err, Error::NoAcceptableMethod));
    }

    #[tokio::test]
    async fn test_empty_method_list_sends_sentinel() {
        let mut mock = Builder::new().read(&[5, 2, 0, 2]).write(&[5, 0xFF]).build();
        let err = server_handshake(&mut mock, &[]).await.unwrap_err();
        assert!(matches!(err, Error::NoAcceptableMethod));
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let auths: Vec<Arc<dyn Socks5Auth>> = vec![Arc::new(user_table())];
        let mut mock = Builder::new()
            .read(&[5, 1, 2])
            .write(&[5, 2])
            .read(b"\x01\x01u\x01x")
            .write(&[1, 1])
            .build();
        let err = server_handshake(&mut mock, &auths).await.unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn test_wrong_version() {
        let auths: Vec<Arc<dyn Socks5Auth>> = vec![Arc::new(NoAuth)];
        let mut mock = Builder::new().read(&[4]).build();
        let err = server_handshake(&mut mock, &auths).await.unwrap_err();
        assert!(matches!(err, Error::InvalidVersion(4)));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let auths: Vec<Arc<dyn Socks5Auth>> = vec![Arc::new(NoAuth)];
        let mut mock = Builder::new()
            .read(&[5, 1, 0])
            .write(&[5, 0])
            .read(&[5, 9, 0, 1])
            .build();
        let err = server_handshake(&mut mock, &auths).await.unwrap_err();
        assert!(matches!(err, Error::InvalidCommand(9)));
    }

    #[tokio::test]
    async fn test_acceptor_methods() {
        let acceptor = Socks5Acceptor::new(vec![Arc::new(NoAuth), Arc::new(user_table())], Duration::ZERO);
        assert_eq!(acceptor.methods(), vec![0, 2]);
    }
}
