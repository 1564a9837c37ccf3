//! Error types for the protocol layer

use super::socks::ReplyCode;
use std::io;
use thiserror::Error;

/// Operation label given to I/O errors lifted without context
const GENERIC_IO_OP: &str = "io";

/// Protocol layer error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("{op}: {source}")]
    Io {
        op: String,
        #[source]
        source: io::Error,
    },

    #[error("Decryption failed: {0}")]
    Decrypt(String),

    #[error("Buffer too small: need {needed} bytes, capacity {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(u8),

    #[error("Invalid command: {0}")]
    InvalidCommand(u8),

    #[error("Invalid address type: {0}")]
    InvalidAddrType(u8),

    #[error("Invalid length: {0}")]
    InvalidLength(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No acceptable authentication methods")]
    NoAcceptableMethod,

    #[error("Server selected method {0:#04x} which the client did not offer")]
    MethodNotOffered(u8),

    #[error("Authentication failed: {reason}")]
    AuthFailure { reason: String, received: Vec<u8> },

    #[error("Unknown authentication status: {0}")]
    UnknownStatus(u8),

    #[error("SOCKS5 request rejected: {0}")]
    Reply(ReplyCode),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),
}

impl Error {
    pub fn io<S: Into<String>>(op: S, source: io::Error) -> Self {
        Error::Io {
            op: op.into(),
            source,
        }
    }

    pub fn decrypt<S: Into<String>>(msg: S) -> Self {
        Error::Decrypt(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn address<S: Into<String>>(msg: S) -> Self {
        Error::Address(msg.into())
    }

    pub fn crypto<S: Into<String>>(msg: S) -> Self {
        Error::Crypto(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Error::Tls(msg.into())
    }

    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Error::AuthFailure {
            reason: reason.into(),
            received: Vec::new(),
        }
    }

    /// Authentication failure carrying the raw bytes read from the peer
    pub fn auth_with_bytes<S: Into<String>>(reason: S, received: Vec<u8>) -> Self {
        Error::AuthFailure {
            reason: reason.into(),
            received,
        }
    }

    pub fn timeout<S: Into<String>>(op: S) -> Self {
        Error::Io {
            op: op.into(),
            source: io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"),
        }
    }

    /// Prefix the operation label of an I/O error with the calling layer.
    ///
    /// Typed protocol errors pass through untouched.
    pub fn context(self, layer: &str) -> Self {
        match self {
            Error::Io { op, source } => {
                let op = if op == GENERIC_IO_OP {
                    layer.to_string()
                } else {
                    format!("{}: {}", layer, op)
                };
                Error::Io { op, source }
            }
            other => other,
        }
    }

    /// True when the root cause is an expired deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Io { source, .. } if source.kind() == io::ErrorKind::TimedOut)
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::AuthFailure { .. })
    }

    /// Raw bytes received before an authentication failure (Trojan fallback)
    pub fn received_bytes(&self) -> Option<&[u8]> {
        match self {
            Error::AuthFailure { received, .. } => Some(received),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        // Errors raised inside poll_read/poll_write travel wrapped in io::Error
        let kind = e.kind();
        if e.get_ref().map_or(false, |inner| inner.is::<Error>()) {
            return match e.into_inner().map(|inner| inner.downcast::<Error>()) {
                Some(Ok(inner)) => *inner,
                _ => Error::io(GENERIC_IO_OP, io::Error::from(kind)),
            };
        }
        Error::io(GENERIC_IO_OP, e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::Io { source, .. } => source.kind(),
            Error::Decrypt(_) | Error::BufferTooSmall { .. } => io::ErrorKind::InvalidData,
            Error::AuthFailure { .. } => io::ErrorKind::PermissionDenied,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

/// Attach an operation label to a fallible I/O call
pub trait IoContext<T> {
    fn context(self, op: &'static str) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn context(self, op: &'static str) -> Result<T> {
        self.map_err(|e| Error::from(e).context(op))
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::protocol("invalid header");
        assert_eq!(e.to_string(), "Protocol error: invalid header");
    }

    #[test]
    fn test_context_chains_labels() {
        let e = Error::from(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"))
            .context("read port")
            .context("shadowsocks server handshake");
        match &e {
            Error::Io { op, source } => {
                assert_eq!(op, "shadowsocks server handshake: read port");
                assert_eq!(source.kind(), io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn test_context_keeps_typed_errors() {
        let e = Error::InvalidAddrType(9).context("trojan server handshake");
        assert!(matches!(e, Error::InvalidAddrType(9)));
    }

    #[test]
    fn test_timeout_detection() {
        let e = Error::timeout("socks5 client handshake");
        assert!(e.is_timeout());
        assert!(!Error::NoAcceptableMethod.is_timeout());
    }

    #[test]
    fn test_round_trip_through_io_error() {
        let io_err: io::Error = Error::decrypt("payload").into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);

        let back = Error::from(io_err);
        assert!(matches!(back, Error::Decrypt(_)));
    }

    #[test]
    fn test_received_bytes() {
        let e = Error::auth_with_bytes("digest mismatch", vec![1, 2, 3]);
        assert!(e.is_auth_failure());
        assert_eq!(e.received_bytes(), Some(&[1u8, 2, 3][..]));
        assert_eq!(Error::NoAcceptableMethod.received_bytes(), None);
    }
}
