//! SOCKS5 client (RFC 1928)

use super::connect_server;
use crate::auth::{NoAuth, ProxyStream, Socks5Auth};
use crate::common::deadline::with_deadline;
use crate::common::net::Destination;
use crate::common::socks::{Command, HelloRequest, HelloResponse, Request, Response, AUTH_NO_ACCEPTABLE};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

const HANDSHAKE_OP: &str = "socks5 client handshake";

/// Negotiate a method from `auths`, authenticate and request CONNECT to
/// `host_port`. Returns the address the server bound for the connection.
pub async fn client_handshake(
    stream: &mut dyn ProxyStream,
    host_port: &str,
    auths: &[Arc<dyn Socks5Auth>],
) -> Result<Destination> {
    client_handshake_with_command(stream, Command::Connect, host_port, auths).await
}

/// [`client_handshake`] bounded by `timeout`; zero means no deadline
pub async fn client_handshake_timeout(
    stream: &mut dyn ProxyStream,
    host_port: &str,
    auths: &[Arc<dyn Socks5Auth>],
    timeout: Duration,
) -> Result<Destination> {
    with_deadline(
        timeout,
        HANDSHAKE_OP,
        handshake(stream, Command::Connect, host_port, auths),
    )
    .await
}

/// Same as [`client_handshake`] with an explicit request command
pub async fn client_handshake_with_command(
    stream: &mut dyn ProxyStream,
    command: Command,
    host_port: &str,
    auths: &[Arc<dyn Socks5Auth>],
) -> Result<Destination> {
    handshake(stream, command, host_port, auths)
        .await
        .map_err(|e| e.context(HANDSHAKE_OP))
}

async fn handshake(
    stream: &mut dyn ProxyStream,
    command: Command,
    host_port: &str,
    auths: &[Arc<dyn Socks5Auth>],
) -> Result<Destination> {
    if auths.is_empty() {
        return Err(Error::protocol("no authentication methods to offer"));
    }
    let destination = Destination::parse_as_domain(host_port)?;

    // Method negotiation
    let methods: Vec<u8> = auths.iter().map(|a| a.method()).collect();
    HelloRequest::new(methods).write_to(stream).await?;

    let selected = HelloResponse::read_from(stream).await?.method;
    if selected == AUTH_NO_ACCEPTABLE {
        return Err(Error::NoAcceptableMethod);
    }
    let auth = auths
        .iter()
        .find(|a| a.method() == selected)
        .ok_or(Error::MethodNotOffered(selected))?;
    debug!(protocol = "socks5", method = selected, "method negotiated");

    auth.authenticate(stream).await?;

    // Request and reply
    Request::new(command, destination).write_to(stream).await?;
    let response = Response::read_from(stream).await?;
    debug!(protocol = "socks5", bound = %response.bound, "request granted");
    Ok(response.bound)
}

/// Connect to `server` and run the handshake. An empty `auths` list offers
/// only no-auth.
pub async fn dial(
    server: &str,
    host_port: &str,
    auths: &[Arc<dyn Socks5Auth>],
    timeout: Duration,
) -> Result<TcpStream> {
    let no_auth: [Arc<dyn Socks5Auth>; 1] = [Arc::new(NoAuth)];
    let auths = if auths.is_empty() { &no_auth[..] } else { auths };

    let mut stream = connect_server(server, timeout).await?;
    client_handshake_timeout(&mut stream, host_port, auths, timeout).await?;
    Ok(stream)
}
