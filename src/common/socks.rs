//! SOCKS5 wire messages (RFC 1928, RFC 1929)
//!
//! Every message is assembled in full before it is written so that peers
//! without a read-exact primitive still see complete packets.

use super::error::IoContext;
use super::net::{Address, Destination};
use crate::{Error, Result};
use std::fmt;
use std::net::Ipv4Addr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// SOCKS5 version
pub const SOCKS5_VERSION: u8 = 0x05;

// SOCKS5 authentication methods
pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_GSSAPI: u8 = 0x01;
pub const AUTH_USERNAME_PASSWORD: u8 = 0x02;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

// Username/password sub-negotiation
pub const USER_PASSWORD_VERSION: u8 = 0x01;
pub const USER_PASSWORD_SUCCESS: u8 = 0x00;
pub const USER_PASSWORD_FAILURE: u8 = 0x01;

// SOCKS5 commands
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

// SOCKS5 reply codes
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            CMD_CONNECT => Ok(Command::Connect),
            CMD_BIND => Ok(Command::Bind),
            CMD_UDP_ASSOCIATE => Ok(Command::UdpAssociate),
            _ => Err(Error::InvalidCommand(value)),
        }
    }
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> u8 {
        match cmd {
            Command::Connect => CMD_CONNECT,
            Command::Bind => CMD_BIND,
            Command::UdpAssociate => CMD_UDP_ASSOCIATE,
        }
    }
}

/// SOCKS5 reply code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unknown(u8),
}

impl ReplyCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ReplyCode::Succeeded)
    }
}

impl From<u8> for ReplyCode {
    fn from(code: u8) -> Self {
        match code {
            REP_SUCCEEDED => ReplyCode::Succeeded,
            REP_GENERAL_FAILURE => ReplyCode::GeneralFailure,
            REP_CONNECTION_NOT_ALLOWED => ReplyCode::ConnectionNotAllowed,
            REP_NETWORK_UNREACHABLE => ReplyCode::NetworkUnreachable,
            REP_HOST_UNREACHABLE => ReplyCode::HostUnreachable,
            REP_CONNECTION_REFUSED => ReplyCode::ConnectionRefused,
            REP_TTL_EXPIRED => ReplyCode::TtlExpired,
            REP_COMMAND_NOT_SUPPORTED => ReplyCode::CommandNotSupported,
            REP_ADDRESS_TYPE_NOT_SUPPORTED => ReplyCode::AddressTypeNotSupported,
            other => ReplyCode::Unknown(other),
        }
    }
}

impl From<ReplyCode> for u8 {
    fn from(code: ReplyCode) -> u8 {
        match code {
            ReplyCode::Succeeded => REP_SUCCEEDED,
            ReplyCode::GeneralFailure => REP_GENERAL_FAILURE,
            ReplyCode::ConnectionNotAllowed => REP_CONNECTION_NOT_ALLOWED,
            ReplyCode::NetworkUnreachable => REP_NETWORK_UNREACHABLE,
            ReplyCode::HostUnreachable => REP_HOST_UNREACHABLE,
            ReplyCode::ConnectionRefused => REP_CONNECTION_REFUSED,
            ReplyCode::TtlExpired => REP_TTL_EXPIRED,
            ReplyCode::CommandNotSupported => REP_COMMAND_NOT_SUPPORTED,
            ReplyCode::AddressTypeNotSupported => REP_ADDRESS_TYPE_NOT_SUPPORTED,
            ReplyCode::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyCode::Succeeded => write!(f, "succeeded"),
            ReplyCode::GeneralFailure => write!(f, "general SOCKS server failure"),
            ReplyCode::ConnectionNotAllowed => write!(f, "connection not allowed by ruleset"),
            ReplyCode::NetworkUnreachable => write!(f, "network unreachable"),
            ReplyCode::HostUnreachable => write!(f, "host unreachable"),
            ReplyCode::ConnectionRefused => write!(f, "connection refused"),
            ReplyCode::TtlExpired => write!(f, "TTL expired"),
            ReplyCode::CommandNotSupported => write!(f, "command not supported"),
            ReplyCode::AddressTypeNotSupported => write!(f, "address type not supported"),
            ReplyCode::Unknown(code) => write!(f, "unknown code: {}", code),
        }
    }
}

async fn read_version<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, op: &'static str) -> Result<u8> {
    let version = reader.read_u8().await.context(op)?;
    if version != SOCKS5_VERSION {
        return Err(Error::InvalidVersion(version));
    }
    Ok(version)
}

/// Method negotiation request
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloRequest {
    pub methods: Vec<u8>,
}

impl HelloRequest {
    pub fn new(methods: Vec<u8>) -> Self {
        HelloRequest { methods }
    }

    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Self> {
        read_version(reader, "read hello version").await?;

        let n = reader.read_u8().await.context("read hello nmethods")? as usize;
        if n == 0 {
            return Err(Error::InvalidLength("hello offers no methods"));
        }

        let mut methods = vec![0u8; n];
        reader
            .read_exact(&mut methods)
            .await
            .context("read hello methods")?;

        Ok(HelloRequest { methods })
    }

    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<()> {
        if self.methods.is_empty() || self.methods.len() > 255 {
            return Err(Error::InvalidLength("hello must offer 1 to 255 methods"));
        }
        let mut buf = Vec::with_capacity(2 + self.methods.len());
        buf.push(SOCKS5_VERSION);
        buf.push(self.methods.len() as u8);
        buf.extend_from_slice(&self.methods);
        writer.write_all(&buf).await.context("write hello")?;
        Ok(())
    }

    pub fn supports(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

/// Method selection reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloResponse {
    pub method: u8,
}

impl HelloResponse {
    pub fn new(method: u8) -> Self {
        HelloResponse { method }
    }

    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 2];
        reader
            .read_exact(&mut buf)
            .await
            .context("read hello response")?;
        if buf[0] != SOCKS5_VERSION {
            return Err(Error::InvalidVersion(buf[0]));
        }
        Ok(HelloResponse { method: buf[1] })
    }

    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<()> {
        writer
            .write_all(&[SOCKS5_VERSION, self.method])
            .await
            .context("write hello response")?;
        Ok(())
    }
}

/// SOCKS5 request
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub destination: Destination,
}

impl Request {
    pub fn new(command: Command, destination: Destination) -> Self {
        Request {
            command,
            destination,
        }
    }

    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 4];
        reader
            .read_exact(&mut header)
            .await
            .context("read request header")?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::InvalidVersion(header[0]));
        }

        let command = Command::try_from(header[1])?;

        // Reserved byte (header[2]) is ignored
        let destination = Destination::read_with_type(reader, header[3])
            .await
            .map_err(|e| e.context("request"))?;

        Ok(Request {
            command,
            destination,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(3 + self.destination.len());
        buf.extend_from_slice(&[SOCKS5_VERSION, self.command.into(), 0x00]);
        self.destination.encode(&mut buf)?;
        writer.write_all(&buf).await.context("write request")?;
        Ok(())
    }
}

/// SOCKS5 response
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub reply: ReplyCode,
    pub bound: Destination,
}

impl Response {
    pub fn success(bound: Destination) -> Self {
        Response {
            reply: ReplyCode::Succeeded,
            bound,
        }
    }

    pub fn failure(reply: ReplyCode) -> Self {
        Response {
            reply,
            bound: Destination::new(Address::Ipv4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }

    /// Read a response; any non-success reply code is returned as an error
    /// before the bound address is read.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 4];
        reader
            .read_exact(&mut header)
            .await
            .context("read response header")?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::InvalidVersion(header[0]));
        }

        let reply = ReplyCode::from(header[1]);
        if !reply.is_success() {
            return Err(Error::Reply(reply));
        }

        let bound = Destination::read_with_type(reader, header[3])
            .await
            .map_err(|e| e.context("response"))?;

        Ok(Response { reply, bound })
    }

    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<()> {
        let mut buf = Vec::with_capacity(3 + self.bound.len());
        buf.extend_from_slice(&[SOCKS5_VERSION, self.reply.into(), 0x00]);
        self.bound.encode(&mut buf)?;
        writer.write_all(&buf).await.context("write response")?;
        Ok(())
    }
}

/// Username/Password authentication request (RFC 1929)
///
/// ```text
/// +-----+------+--------+------+----------+
/// | VER | ULEN |  UNAME | PLEN |  PASSWD  |
/// +-----+------+--------+------+----------+
/// |  1  |  1   |1 to 255|  1   | 1 to 255 |
/// +-----+------+--------+------+----------+
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct UsernamePasswordRequest {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

impl fmt::Debug for UsernamePasswordRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsernamePasswordRequest")
            .field("username", &String::from_utf8_lossy(&self.username))
            .field("password", &"<redacted>")
            .finish()
    }
}

impl UsernamePasswordRequest {
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<Self> {
        let version = reader.read_u8().await.context("read auth version")?;
        if version != USER_PASSWORD_VERSION {
            return Err(Error::InvalidVersion(version));
        }

        let ulen = reader.read_u8().await.context("read username length")?;
        let mut username = vec![0u8; ulen as usize];
        reader
            .read_exact(&mut username)
            .await
            .context("read username bytes")?;

        let plen = reader.read_u8().await.context("read password length")?;
        let mut password = vec![0u8; plen as usize];
        reader
            .read_exact(&mut password)
            .await
            .context("read password bytes")?;

        Ok(UsernamePasswordRequest { username, password })
    }

    pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(&self, writer: &mut W) -> Result<()> {
        if self.username.len() > 255 || self.password.len() > 255 {
            return Err(Error::InvalidLength("username or password longer than 255 bytes"));
        }
        let mut buf = Vec::with_capacity(3 + self.username.len() + self.password.len());
        buf.push(USER_PASSWORD_VERSION);
        buf.push(self.username.len() as u8);
        buf.extend_from_slice(&self.username);
        buf.push(self.password.len() as u8);
        buf.extend_from_slice(&self.password);
        writer.write_all(&buf).await.context("write credentials")?;
        Ok(())
    }
}

/// Username/Password status reply, returns the raw status byte
pub async fn read_auth_status<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 2];
    reader
        .read_exact(&mut buf)
        .await
        .context("read auth status")?;
    if buf[0] != USER_PASSWORD_VERSION {
        return Err(Error::InvalidVersion(buf[0]));
    }
    Ok(buf[1])
}

pub async fn write_auth_status<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, success: bool) -> Result<()> {
    let status = if success {
        USER_PASSWORD_SUCCESS
    } else {
        USER_PASSWORD_FAILURE
    };
    writer
        .write_all(&[USER_PASSWORD_VERSION, status])
        .await
        .context("write auth status")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::net::ATYP_IPV4;

    #[test]
    fn test_command_conversion() {
        assert_eq!(Command::try_from(0x01).unwrap(), Command::Connect);
        assert_eq!(u8::from(Command::UdpAssociate), 0x03);
        assert!(matches!(
            Command::try_from(0x09),
            Err(Error::InvalidCommand(0x09))
        ));
    }

    #[test]
    fn test_reply_codes() {
        for code in 0u8..=8 {
            assert_eq!(u8::from(ReplyCode::from(code)), code);
        }
        assert_eq!(ReplyCode::from(0x42), ReplyCode::Unknown(0x42));
        assert_eq!(ReplyCode::ConnectionRefused.to_string(), "connection refused");
        assert_eq!(ReplyCode::Unknown(9).to_string(), "unknown code: 9");
    }

    #[tokio::test]
    async fn test_hello_request_rejects_zero_methods() {
        let mut reader = &[SOCKS5_VERSION, 0][..];
        let err = HelloRequest::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::InvalidLength(_)));
    }

    #[tokio::test]
    async fn test_hello_request_rejects_bad_version() {
        let mut reader = &[0x04, 1, AUTH_NO_AUTH][..];
        let err = HelloRequest::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::InvalidVersion(0x04)));
    }

    #[tokio::test]
    async fn test_response_wire_format() {
        let mut out = Vec::new();
        Response::failure(ReplyCode::HostUnreachable)
            .write_to(&mut out)
            .await
            .unwrap();
        assert_eq!(out, vec![5, 4, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_response_failure_code_is_error() {
        let mut reader = &[5, REP_CONNECTION_REFUSED, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0][..];
        let err = Response::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Reply(ReplyCode::ConnectionRefused)));
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let request = Request::new(
            Command::Connect,
            Destination::parse_as_domain("example.com:443").unwrap(),
        );
        let mut out = Vec::new();
        request.write_to(&mut out).await.unwrap();
        let mut reader = &out[..];
        assert_eq!(Request::read_from(&mut reader).await.unwrap(), request);
    }

    #[tokio::test]
    async fn test_credentials_round_trip() {
        let creds = UsernamePasswordRequest {
            username: b"alice".to_vec(),
            password: b"wonderland".to_vec(),
        };
        let mut out = Vec::new();
        creds.write_to(&mut out).await.unwrap();
        assert_eq!(out[0], USER_PASSWORD_VERSION);
        assert_eq!(out[1], 5);

        let mut reader = &out[..];
        assert_eq!(UsernamePasswordRequest::read_from(&mut reader).await.unwrap(), creds);
        assert!(!format!("{:?}", creds).contains("wonderland"));
    }
}
