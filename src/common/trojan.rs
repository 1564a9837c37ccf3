//! Trojan request header
//!
//! ```text
//! +-----------------------+---------+----------------+---------+----------+
//! | hex(SHA224(password)) |  CRLF   | CMD | ATYP ... |  PORT   |   CRLF   |
//! +-----------------------+---------+----------------+---------+----------+
//! |          56           | X'0D0A' |  1  | Variable |    2    | X'0D0A'  |
//! +-----------------------+---------+----------------+---------+----------+
//! ```

use super::net::{Destination, Network};
use crate::crypto::kdf::PasswordDigest;
use crate::{Error, Result};

pub const CRLF: &[u8; 2] = b"\r\n";

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Trojan command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrojanCommand {
    Connect = 0x01,
    UdpAssociate = 0x03,
}

impl TrojanCommand {
    pub fn network(&self) -> Network {
        match self {
            TrojanCommand::Connect => Network::Tcp,
            TrojanCommand::UdpAssociate => Network::Udp,
        }
    }
}

impl TryFrom<u8> for TrojanCommand {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            CMD_CONNECT => Ok(TrojanCommand::Connect),
            CMD_UDP_ASSOCIATE => Ok(TrojanCommand::UdpAssociate),
            _ => Err(Error::InvalidCommand(value)),
        }
    }
}

impl From<Network> for TrojanCommand {
    fn from(network: Network) -> Self {
        match network {
            Network::Tcp => TrojanCommand::Connect,
            Network::Udp => TrojanCommand::UdpAssociate,
        }
    }
}

/// Build the full client header so it goes out in one write
pub fn build_header_bytes(
    digest: &PasswordDigest,
    command: TrojanCommand,
    destination: &Destination,
) -> Result<Vec<u8>> {
    let mut header = Vec::with_capacity(digest.as_bytes().len() + 2 + 1 + destination.len() + 2);
    header.extend_from_slice(digest.as_bytes());
    header.extend_from_slice(CRLF);
    header.push(command as u8);
    destination.encode(&mut header)?;
    header.extend_from_slice(CRLF);
    Ok(header)
}
