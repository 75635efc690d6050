//! Binary preamble carried on the first message of a tunneling session.
//!
//! ```text
//! offset 0        version            (1 byte)
//! offset 1..17    identity token     (16 bytes)
//! offset 17       addon length N     (1 byte)
//! offset 18..18+N addon data         (ignored)
//! next            command            (1 byte, 1 = CONNECT_TCP)
//! next            destination port   (2 bytes, big-endian)
//! next            address type       (1 = IPv4, 2 = domain, 3 = IPv6)
//! next            address value      (4 / 1+L / 16 bytes)
//! remainder       initial payload
//! ```
//!
//! Every field is read through [`Cursor`], which checks the remaining length
//! before touching the buffer.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

use thiserror::Error;

use crate::codec::{self, ClientId};

/// Shortest buffer that can possibly hold a header.
pub const MIN_HEADER_LEN: usize = 19;

const ADDR_IPV4: u8 = 1;
const ADDR_DOMAIN: u8 = 2;
const ADDR_IPV6: u8 = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("header truncated at offset {offset}: needed {needed} bytes, {remaining} remaining")]
    TruncatedHeader {
        offset: usize,
        needed: usize,
        remaining: usize,
    },
    #[error("unsupported command {0}")]
    UnsupportedCommand(u8),
    #[error("unknown address type {0}")]
    UnknownAddressType(u8),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("domain name is {0} bytes, at most 255 fit in a header")]
    DomainTooLong(usize),
}

/// Read-only cursor with fallible, bounds-checked primitives.
#[derive(Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let truncated = ParseError::TruncatedHeader {
            offset: self.pos,
            needed: n,
            remaining: self.remaining(),
        };
        if n > self.remaining() {
            return Err(truncated);
        }
        let bytes = self.buf.get(self.pos..self.pos + n).ok_or(truncated)?;
        self.pos += n;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ParseError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, ParseError> {
        let [byte] = self.read_array()?;
        Ok(byte)
    }

    pub fn read_u16_be(&mut self) -> Result<u16, ParseError> {
        self.read_array().map(u16::from_be_bytes)
    }

    /// Consumes the cursor, returning everything not yet read.
    #[must_use]
    pub fn rest(self) -> &'a [u8] {
        self.buf.get(self.pos..).unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    ConnectTcp = 1,
}

impl TryFrom<u8> for Command {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ConnectTcp),
            other => Err(ParseError::UnsupportedCommand(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl Address {
    /// Text form used to dial the destination.
    #[must_use]
    pub fn host(&self) -> String {
        match self {
            Self::Ipv4(addr) => codec::ipv4_text(addr.octets()),
            Self::Domain(name) => name.clone(),
            Self::Ipv6(addr) => codec::ipv6_text(addr),
        }
    }

    const fn type_byte(&self) -> u8 {
        match self {
            Self::Ipv4(_) => ADDR_IPV4,
            Self::Domain(_) => ADDR_DOMAIN,
            Self::Ipv6(_) => ADDR_IPV6,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub address: Address,
    pub port: u16,
}

impl Destination {
    #[must_use]
    pub fn authority(&self) -> String {
        codec::authority(&self.address.host(), self.port)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub version: u8,
    pub client_id: ClientId,
    pub command: Command,
    pub destination: Destination,
    pub initial_payload: Vec<u8>,
}

impl ConnectionRequest {
    /// Serializes the request as a client would send it, with no addon data.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::with_capacity(MIN_HEADER_LEN + 22 + self.initial_payload.len());
        out.push(self.version);
        out.extend_from_slice(self.client_id.as_bytes());
        out.push(0);
        out.push(self.command as u8);
        out.extend_from_slice(&self.destination.port.to_be_bytes());
        out.push(self.destination.address.type_byte());
        match &self.destination.address {
            Address::Ipv4(addr) => out.extend_from_slice(&addr.octets()),
            Address::Domain(name) => {
                let len =
                    u8::try_from(name.len()).map_err(|_| EncodeError::DomainTooLong(name.len()))?;
                out.push(len);
                out.extend_from_slice(name.as_bytes());
            }
            Address::Ipv6(addr) => out.extend_from_slice(&addr.octets()),
        }
        out.extend_from_slice(&self.initial_payload);
        Ok(out)
    }
}

/// Parses the first message of a session into a connection request.
pub fn parse_header(buf: &[u8]) -> Result<ConnectionRequest, ParseError> {
    if buf.len() < MIN_HEADER_LEN {
        return Err(ParseError::TruncatedHeader {
            offset: 0,
            needed: MIN_HEADER_LEN,
            remaining: buf.len(),
        });
    }

    let mut cursor = Cursor::new(buf);
    let version = cursor.read_u8()?;
    let client_id = ClientId::from_bytes(cursor.read_array()?);

    // Addon block is reserved; skip it.
    let addon_len = cursor.read_u8()?;
    cursor.read_bytes(usize::from(addon_len))?;

    let command = Command::try_from(cursor.read_u8()?)?;
    let port = cursor.read_u16_be()?;
    let address = match cursor.read_u8()? {
        ADDR_IPV4 => Address::Ipv4(Ipv4Addr::from(cursor.read_array::<4>()?)),
        ADDR_DOMAIN => {
            let len = cursor.read_u8()?;
            let raw = cursor.read_bytes(usize::from(len))?;
            Address::Domain(String::from_utf8_lossy(raw).into_owned())
        }
        ADDR_IPV6 => Address::Ipv6(Ipv6Addr::from(cursor.read_array::<16>()?)),
        other => return Err(ParseError::UnknownAddressType(other)),
    };

    Ok(ConnectionRequest {
        version,
        client_id,
        command,
        destination: Destination { address, port },
        initial_payload: cursor.rest().to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: [u8; 16] = [7u8; 16];

    fn request(address: Address, payload: &[u8]) -> ConnectionRequest {
        ConnectionRequest {
            version: 0,
            client_id: ClientId::from_bytes(TOKEN),
            command: Command::ConnectTcp,
            destination: Destination { address, port: 443 },
            initial_payload: payload.to_vec(),
        }
    }

    /// Version, token, addon length, command, port.
    fn prefix(addon: &[u8], command: u8, port: u16) -> Vec<u8> {
        let mut buf = vec![0u8];
        buf.extend_from_slice(&TOKEN);
        buf.push(addon.len() as u8);
        buf.extend_from_slice(addon);
        buf.push(command);
        buf.extend_from_slice(&port.to_be_bytes());
        buf
    }

    mod cursor {
        use super::*;

        #[test]
        fn reads_in_order_and_tracks_position() {
            let mut cursor = Cursor::new(&[1, 0x01, 0xbb, 9, 9]);
            assert_eq!(cursor.read_u8().unwrap(), 1);
            assert_eq!(cursor.read_u16_be().unwrap(), 443);
            assert_eq!(cursor.position(), 3);
            assert_eq!(cursor.remaining(), 2);
            assert_eq!(cursor.rest(), &[9, 9]);
        }

        #[test]
        fn refuses_to_read_past_the_end() {
            let mut cursor = Cursor::new(&[1, 2, 3]);
            cursor.read_u8().unwrap();
            let err = cursor.read_bytes(3).unwrap_err();
            assert_eq!(
                err,
                ParseError::TruncatedHeader {
                    offset: 1,
                    needed: 3,
                    remaining: 2,
                }
            );
            // A failed read consumes nothing.
            assert_eq!(cursor.read_u16_be().unwrap(), 0x0203);
            assert!(cursor.read_u8().is_err());
        }
    }

    mod decoding {
        use super::*;

        #[test]
        fn decodes_ipv4() {
            let mut buf = prefix(&[], 1, 80);
            buf.extend_from_slice(&[ADDR_IPV4, 93, 184, 216, 34]);
            let req = parse_header(&buf).unwrap();
            assert_eq!(req.destination.address.host(), "93.184.216.34");
            assert_eq!(req.destination.port, 80);
            assert!(req.initial_payload.is_empty());
        }

        #[test]
        fn decodes_domain() {
            let mut buf = prefix(&[], 1, 443);
            buf.push(ADDR_DOMAIN);
            buf.push(11);
            buf.extend_from_slice(b"example.com");
            buf.extend_from_slice(b"GET / HTTP/1.1\r\n");
            let req = parse_header(&buf).unwrap();
            assert_eq!(req.destination.address.host(), "example.com");
            assert_eq!(req.initial_payload, b"GET / HTTP/1.1\r\n");
        }

        #[test]
        fn decodes_ipv6() {
            let mut buf = prefix(&[], 1, 443);
            buf.push(ADDR_IPV6);
            buf.extend_from_slice(&[0u8; 16]);
            let req = parse_header(&buf).unwrap();
            assert_eq!(req.destination.address.host(), "[0:0:0:0:0:0:0:0]");
            assert_eq!(req.destination.authority(), "[0:0:0:0:0:0:0:0]:443");
        }

        #[test]
        fn skips_addon_block() {
            let mut buf = prefix(&[0xde, 0xad, 0xbe, 0xef], 1, 22);
            buf.extend_from_slice(&[ADDR_IPV4, 10, 0, 0, 1, b'x']);
            let req = parse_header(&buf).unwrap();
            assert_eq!(req.destination.authority(), "10.0.0.1:22");
            assert_eq!(req.initial_payload, b"x");
        }

        #[test]
        fn keeps_version_and_token() {
            let mut buf = prefix(&[], 1, 80);
            buf[0] = 5;
            buf.extend_from_slice(&[ADDR_IPV4, 1, 1, 1, 1]);
            let req = parse_header(&buf).unwrap();
            assert_eq!(req.version, 5);
            assert_eq!(req.client_id.as_bytes(), &TOKEN);
        }
    }

    mod rejection {
        use super::*;

        #[test]
        fn short_buffers_are_truncated() {
            let mut full = prefix(&[], 1, 80);
            full.extend_from_slice(&[ADDR_IPV4, 1, 2, 3, 4]);
            for len in 0..MIN_HEADER_LEN {
                assert!(
                    matches!(
                        parse_header(&full[..len]),
                        Err(ParseError::TruncatedHeader { offset: 0, .. })
                    ),
                    "length {len}"
                );
            }
        }

        #[test]
        fn addon_longer_than_buffer_is_truncated() {
            let mut buf = prefix(&[], 1, 80);
            buf[17] = 200;
            buf.extend_from_slice(&[ADDR_IPV4, 1, 2, 3, 4]);
            assert!(matches!(
                parse_header(&buf),
                Err(ParseError::TruncatedHeader { offset: 18, needed: 200, .. })
            ));
        }

        #[test]
        fn domain_longer_than_buffer_is_truncated() {
            let mut buf = prefix(&[], 1, 80);
            buf.extend_from_slice(&[ADDR_DOMAIN, 40]);
            buf.extend_from_slice(b"short.example");
            assert!(matches!(
                parse_header(&buf),
                Err(ParseError::TruncatedHeader { needed: 40, .. })
            ));
        }

        #[test]
        fn partial_ipv6_is_truncated() {
            let mut buf = prefix(&[], 1, 80);
            buf.push(ADDR_IPV6);
            buf.extend_from_slice(&[0u8; 10]);
            assert!(matches!(
                parse_header(&buf),
                Err(ParseError::TruncatedHeader { needed: 16, remaining: 10, .. })
            ));
        }

        #[test]
        fn missing_address_type_is_truncated() {
            let buf = prefix(&[], 1, 80);
            assert!(matches!(
                parse_header(&buf),
                Err(ParseError::TruncatedHeader { offset: 21, needed: 1, remaining: 0 })
            ));
        }

        #[test]
        fn rejects_udp_command() {
            let mut buf = prefix(&[], 2, 53);
            buf.extend_from_slice(&[ADDR_IPV4, 8, 8, 8, 8]);
            assert_eq!(parse_header(&buf), Err(ParseError::UnsupportedCommand(2)));
        }

        #[test]
        fn rejects_unknown_address_type() {
            let mut buf = prefix(&[], 1, 80);
            buf.extend_from_slice(&[4, 1, 2, 3, 4]);
            assert_eq!(parse_header(&buf), Err(ParseError::UnknownAddressType(4)));
        }
    }

    mod encoding {
        use super::*;

        #[test]
        fn parse_inverts_encode_for_every_address_type() {
            let addresses = [
                Address::Ipv4(Ipv4Addr::new(93, 184, 216, 34)),
                Address::Domain("example.com".to_string()),
                Address::Ipv6("2001:db8::1".parse().unwrap()),
            ];
            for address in addresses {
                let original = request(address, b"hello");
                let decoded = parse_header(&original.encode().unwrap()).unwrap();
                assert_eq!(decoded, original);
            }
        }

        #[test]
        fn refuses_oversized_domain() {
            let original = request(Address::Domain("a".repeat(256)), b"");
            assert_eq!(original.encode(), Err(EncodeError::DomainTooLong(256)));
        }
    }
}
