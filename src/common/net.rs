//! Network utilities and the shared address codec
//!
//! All three protocols carry the destination in the same tag-length-value
//! layout borrowed from SOCKS5:
//!
//! ```text
//! +------+----------+----------+
//! | ATYP |   ADDR   |   PORT   |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```

use super::error::IoContext;
use crate::{Error, Result};
use bytes::Bytes;
use socket2::SockRef;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Longest domain a one-byte length prefix can describe
pub const MAX_DOMAIN_LEN: usize = 255;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Transport requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Destination host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 address
    Ipv4(Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// Domain name, 1 to 255 bytes. Kept as raw wire bytes; nothing
    /// requires them to be UTF-8.
    Domain(Bytes),
}

impl Address {
    /// Domain address, validating the length the wire format can carry
    pub fn domain<D: AsRef<[u8]>>(domain: D) -> Result<Self> {
        let domain = domain.as_ref();
        if domain.is_empty() {
            return Err(Error::InvalidLength("empty domain"));
        }
        if domain.len() > MAX_DOMAIN_LEN {
            return Err(Error::address(format!(
                "domain longer than {} bytes",
                MAX_DOMAIN_LEN
            )));
        }
        Ok(Address::Domain(Bytes::copy_from_slice(domain)))
    }

    pub fn atyp(&self) -> u8 {
        match self {
            Address::Ipv4(_) => ATYP_IPV4,
            Address::Ipv6(_) => ATYP_IPV6,
            Address::Domain(_) => ATYP_DOMAIN,
        }
    }

    /// Encoded length of the address part (type tag excluded)
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self {
            Address::Ipv4(_) => 4,
            Address::Ipv6(_) => 16,
            Address::Domain(d) => 1 + d.len(),
        }
    }

    /// Get as IP if resolved
    pub fn to_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Address::Domain(_) => None,
        }
    }

    /// Host part without brackets; domain bytes that are not UTF-8 are
    /// replaced lossily
    pub fn to_host(&self) -> String {
        match self {
            Address::Ipv4(ip) => ip.to_string(),
            Address::Ipv6(ip) => ip.to_string(),
            Address::Domain(d) => String::from_utf8_lossy(d).into_owned(),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Address::Ipv4(ip)
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Address::Ipv6(ip)
    }
}

/// A host plus port, the unit every handshake negotiates
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub address: Address,
    pub port: u16,
}

impl Destination {
    pub fn new(address: Address, port: u16) -> Self {
        Destination { address, port }
    }

    /// Parse "host:port" text. IP literals become IPv4/IPv6 addresses,
    /// anything else a domain.
    pub fn parse(host_port: &str) -> Result<Self> {
        let (host, port) = split_host_port(host_port)?;
        let address = match host.parse::<IpAddr>() {
            Ok(ip) => Address::from(ip),
            Err(_) => Address::domain(host)?,
        };
        Ok(Destination { address, port })
    }

    /// Parse "host:port" text keeping the host as a domain TLV even when it
    /// is an IP literal. Clients send destinations this way.
    pub fn parse_as_domain(host_port: &str) -> Result<Self> {
        let (host, port) = split_host_port(host_port)?;
        Ok(Destination {
            address: Address::domain(host)?,
            port,
        })
    }

    /// Encoded TLV length including the type tag and port
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        1 + self.address.len() + 2
    }

    /// Append the TLV encoding to `buf`
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.reserve(self.len());
        buf.push(self.address.atyp());
        match &self.address {
            Address::Ipv4(ip) => buf.extend_from_slice(&ip.octets()),
            Address::Ipv6(ip) => buf.extend_from_slice(&ip.octets()),
            Address::Domain(domain) => {
                let bytes = &domain[..];
                if bytes.is_empty() {
                    return Err(Error::InvalidLength("empty domain"));
                }
                if bytes.len() > MAX_DOMAIN_LEN {
                    return Err(Error::address("Domain name too long"));
                }
                buf.push(bytes.len() as u8);
                buf.extend_from_slice(bytes);
            }
        }
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode a TLV from the front of `data`, returning the consumed length
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let short = || Error::protocol("address truncated");
        let atyp = *data.first().ok_or_else(short)?;
        let (address, addr_len) = match atyp {
            ATYP_IPV4 => {
                let octets: [u8; 4] = data.get(1..5).ok_or_else(short)?.try_into().map_err(|_| short())?;
                (Address::Ipv4(Ipv4Addr::from(octets)), 4)
            }
            ATYP_IPV6 => {
                let octets: [u8; 16] = data.get(1..17).ok_or_else(short)?.try_into().map_err(|_| short())?;
                (Address::Ipv6(Ipv6Addr::from(octets)), 16)
            }
            ATYP_DOMAIN => {
                let len = *data.get(1).ok_or_else(short)? as usize;
                if len == 0 {
                    return Err(Error::InvalidLength("empty domain"));
                }
                let bytes = data.get(2..2 + len).ok_or_else(short)?;
                (Address::Domain(Bytes::copy_from_slice(bytes)), 1 + len)
            }
            t => return Err(Error::InvalidAddrType(t)),
        };
        let port_at = 1 + addr_len;
        let port = data.get(port_at..port_at + 2).ok_or_else(short)?;
        let port = u16::from_be_bytes([port[0], port[1]]);
        Ok((Destination { address, port }, port_at + 2))
    }

    /// Read a full TLV (type tag first)
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Self> {
        let atyp = reader.read_u8().await.context("read address type")?;
        Self::read_with_type(reader, atyp).await
    }

    /// Read the TLV body after the type tag has already been consumed
    pub async fn read_with_type<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, atyp: u8) -> Result<Self> {
        let address = match atyp {
            ATYP_IPV4 => {
                let mut buf = [0u8; 4];
                reader.read_exact(&mut buf).await.context("read IPv4 bytes")?;
                Address::Ipv4(Ipv4Addr::from(buf))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await.context("read domain length")? as usize;
                if len == 0 {
                    return Err(Error::InvalidLength("empty domain"));
                }
                let mut buf = vec![0u8; len];
                reader.read_exact(&mut buf).await.context("read domain bytes")?;
                Address::Domain(Bytes::from(buf))
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 16];
                reader.read_exact(&mut buf).await.context("read IPv6 bytes")?;
                Address::Ipv6(Ipv6Addr::from(buf))
            }
            t => return Err(Error::InvalidAddrType(t)),
        };
        let port = reader.read_u16().await.context("read port")?;
        Ok(Destination { address, port })
    }

    /// Write the TLV in a single write
    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let buf = self.to_bytes()?;
        writer.write_all(&buf).await.context("write address")?;
        Ok(())
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            Address::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            Address::Domain(d) => {
                let host = String::from_utf8_lossy(d);
                if host.contains(':') {
                    write!(f, "[{}]:{}", host, self.port)
                } else {
                    write!(f, "{}:{}", host, self.port)
                }
            }
        }
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Destination::new(addr.ip().into(), addr.port())
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Destination::parse(s)
    }
}

/// Split "host:port", accepting "[v6]:port"
pub fn split_host_port(host_port: &str) -> Result<(&str, u16)> {
    let missing_port = || Error::address(format!("missing port in address {:?}", host_port));
    let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| Error::address(format!("missing ']' in address {:?}", host_port)))?;
        let port = rest[end + 1..].strip_prefix(':').ok_or_else(missing_port)?;
        (&rest[..end], port)
    } else {
        let idx = host_port.rfind(':').ok_or_else(missing_port)?;
        let host = &host_port[..idx];
        if host.contains(':') {
            return Err(Error::address(format!(
                "too many colons in address {:?}",
                host_port
            )));
        }
        (host, &host_port[idx + 1..])
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::address(format!("invalid port in address {:?}", host_port)))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(text: &str, expected_bytes: &[u8]) {
        let dest = Destination::parse(text).unwrap();
        let bytes = dest.to_bytes().unwrap();
        assert_eq!(bytes, expected_bytes);

        let (decoded, used) = Destination::decode(&bytes).unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded.to_string(), text);
        assert_eq!(decoded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_domain_round_trip() {
        let mut expected = vec![ATYP_DOMAIN, 11];
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&[0x01, 0xBB]);
        round_trip("example.com:443", &expected);
    }

    #[test]
    fn test_ipv4_round_trip() {
        round_trip("127.0.0.1:80", &[ATYP_IPV4, 127, 0, 0, 1, 0x00, 0x50]);
    }

    #[test]
    fn test_ipv6_round_trip() {
        let mut expected = vec![ATYP_IPV6];
        expected.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        expected.extend_from_slice(&[0x00, 0x50]);
        round_trip("[::1]:80", &expected);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let err = Destination::decode(&[0x05, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::InvalidAddrType(0x05)));
    }

    #[test]
    fn test_decode_rejects_empty_domain() {
        let err = Destination::decode(&[ATYP_DOMAIN, 0, 0, 80]).unwrap_err();
        assert!(matches!(err, Error::InvalidLength(_)));
    }

    #[test]
    fn test_parse_as_domain_keeps_literal() {
        let dest = Destination::parse_as_domain("127.0.0.1:6666").unwrap();
        assert_eq!(dest.address, Address::Domain("127.0.0.1".into()));
        assert_eq!(dest.to_string(), "127.0.0.1:6666");
    }

    #[test]
    fn test_split_host_port_errors() {
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port("::1:80").is_err());
        assert!(split_host_port("example.com:http").is_err());
        assert_eq!(split_host_port("[::1]:80").unwrap(), ("::1", 80));
    }

    #[test]
    fn test_domain_length_limits() {
        assert!(Address::domain("").is_err());
        assert!(Address::domain("a".repeat(256)).is_err());
        assert!(Address::domain("a".repeat(255)).is_ok());
    }

    #[test]
    fn test_non_utf8_domain_survives_decode() {
        let wire = [ATYP_DOMAIN, 2, 0xFF, 0xFE, 0x00, 0x50];
        let (dest, used) = Destination::decode(&wire).unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(dest.address, Address::Domain(Bytes::from_static(&[0xFF, 0xFE])));
        assert_eq!(dest.port, 80);
        assert_eq!(dest.to_bytes().unwrap(), wire);
        assert_eq!(dest.address.to_host(), "\u{FFFD}\u{FFFD}");
    }

    #[tokio::test]
    async fn test_read_non_utf8_domain() {
        let wire = [ATYP_DOMAIN, 3, b'a', 0xC3, 0x28, 0x01, 0xBB];
        let mut reader = &wire[..];
        let dest = Destination::read_from(&mut reader).await.unwrap();
        assert_eq!(dest.address, Address::Domain(Bytes::from_static(b"a\xC3\x28")));
        assert_eq!(dest.to_bytes().unwrap(), wire);
    }

    #[tokio::test]
    async fn test_read_from_stream() {
        let bytes = [ATYP_IPV4, 10, 0, 0, 1, 0x1F, 0x90];
        let mut reader = &bytes[..];
        let dest = Destination::read_from(&mut reader).await.unwrap();
        assert_eq!(dest.to_string(), "10.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_read_from_truncated_stream() {
        let bytes = [ATYP_DOMAIN, 4, b'a', b'b'];
        let mut reader = &bytes[..];
        let err = Destination::read_from(&mut reader).await.unwrap_err();
        match err {
            Error::Io { op, source } => {
                assert_eq!(op, "read domain bytes");
                assert_eq!(source.kind(), std::io::ErrorKind::UnexpectedEof);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
