//! Server side handshakes, listeners and inbound services
//!
//! Every protocol module offers three layers:
//! - `server_handshake` / `server_handshake_timeout` over any stream
//! - a `*Listener` that accepts TCP connections and runs the handshake
//! - a `*Inbound` service that relays accepted connections to their
//!   destination

pub mod shadowsocks;
pub mod socks5;
pub mod trojan;

pub use shadowsocks::{ShadowsocksAcceptor, ShadowsocksInbound, ShadowsocksListener};
pub use socks5::{Socks5Acceptor, Socks5Inbound, Socks5Listener, Socks5Request};
pub use trojan::{TrojanAcceptor, TrojanInbound, TrojanListener, TrojanRequest};

use crate::common::error::IoContext;
use crate::common::net::{configure_tcp_stream, Destination};
use crate::Result;
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error};

/// Trait for inbound listeners
#[async_trait]
pub trait InboundListener: Send + Sync {
    /// Get listener name
    fn name(&self) -> &str;

    /// Accept connections until stopped
    async fn start(&self) -> Result<()>;

    /// Stop the listener
    async fn stop(&self) -> Result<()>;

    /// Check if listener is running
    fn is_running(&self) -> bool;
}

/// Running flag and stop signal of an inbound service
#[derive(Default)]
pub(crate) struct ServiceState {
    running: AtomicBool,
    shutdown: Notify,
}

impl ServiceState {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the accept loop to end. A stop issued before the loop starts
    /// is kept and ends it on entry.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Accept loop: every connection is handed to `handle` on its own task
    pub(crate) async fn serve<F, Fut>(&self, name: &str, listener: &TcpListener, mut handle: F) -> Result<()>
    where
        F: FnMut(TcpStream, SocketAddr) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.running.store(true, Ordering::SeqCst);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        configure_tcp_stream(&stream);
                        tokio::spawn(handle(stream, peer_addr));
                    }
                    Err(e) => {
                        if self.is_running() {
                            error!("{} accept error: {}", name, e);
                        }
                    }
                },
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Open the outbound leg for a negotiated destination
pub(crate) async fn connect_destination(destination: &Destination) -> Result<TcpStream> {
    let remote = TcpStream::connect(destination.to_string())
        .await
        .context("connect destination")?;
    configure_tcp_stream(&remote);
    Ok(remote)
}

/// Copy bytes both ways until either side closes
pub(crate) async fn relay<A, B>(mut inbound: A, mut remote: B, destination: &Destination) -> Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (sent, received) = tokio::io::copy_bidirectional(&mut inbound, &mut remote)
        .await
        .context("relay")?;
    debug!(dst = %destination, sent, received, "relay finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn local_listener() -> TcpListener {
        TcpListener::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_stop_before_serve_is_not_lost() {
        let state = ServiceState::default();
        let listener = local_listener().await;

        state.stop();
        tokio::time::timeout(Duration::from_secs(2), state.serve("test", &listener, |_, _| async {}))
            .await
            .expect("accept loop kept running after stop")
            .unwrap();
        assert!(!state.is_running());
    }

    #[tokio::test]
    async fn test_stop_ends_running_loop() {
        let state = Arc::new(ServiceState::default());
        let listener = local_listener().await;

        let serving = {
            let state = state.clone();
            tokio::spawn(async move { state.serve("test", &listener, |_, _| async {}).await })
        };
        while !state.is_running() {
            tokio::task::yield_now().await;
        }

        state.stop();
        tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .expect("accept loop kept running after stop")
            .unwrap()
            .unwrap();
        assert!(!state.is_running());
    }
}
