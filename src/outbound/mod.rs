//! Client side handshakes and dialers
//!
//! Each protocol exposes a plain handshake, a deadline-bounded variant and a
//! `dial` helper that connects to the proxy server and runs the handshake.

pub mod shadowsocks;
pub mod socks5;
pub mod trojan;

use crate::common::deadline::with_deadline;
use crate::common::error::IoContext;
use crate::common::net::configure_tcp_stream;
use crate::Result;
use std::time::Duration;
use tokio::net::TcpStream;

/// Connect to a proxy server, bounded by `timeout` (zero disables it)
pub(crate) async fn connect_server(server: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = with_deadline(timeout, "connect proxy server", async {
        TcpStream::connect(server).await.context("tcp connect")
    })
    .await?;
    configure_tcp_stream(&stream);
    Ok(stream)
}
