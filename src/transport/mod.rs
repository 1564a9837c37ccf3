//! Transport layer implementations
//!
//! Stream wrappers that sit between a raw connection and a handshake.

pub mod shadowsocks;

pub use shadowsocks::ShadowsocksStream;
