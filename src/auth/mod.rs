//! Authentication methods run inside the handshakes
//!
//! SOCKS5 methods exchange messages over the raw connection; the Trojan
//! method only checks a password digest.

pub mod socks5;
pub mod trojan;

pub use socks5::{NoAuth, Socks5Auth, UserPassword, UserPasswordServer};
pub use trojan::{AuthPassword, Authenticator};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional stream an auth method can run over
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyStream for T {}
