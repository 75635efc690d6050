//! Conversions between raw header bytes and their text forms.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use thiserror::Error;
use uuid::Uuid;

/// The 16-byte identity token a client presents in its header.
///
/// Rendered as a canonical lowercase hyphenated string (groups of
/// 4-2-2-2-6 bytes), and parsed back from the same form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

#[derive(Debug, Error)]
#[error("invalid identity token {value:?}")]
pub struct InvalidClientId {
    pub value: String,
    #[source]
    source: uuid::Error,
}

impl ClientId {
    pub const LEN: usize = 16;

    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        self.0.as_bytes()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl FromStr for ClientId {
    type Err = InvalidClientId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Uuid::parse_str(trimmed).map(Self).map_err(|source| InvalidClientId {
            value: trimmed.to_string(),
            source,
        })
    }
}

/// Dotted-decimal form of four address bytes.
#[must_use]
pub fn ipv4_text(octets: [u8; 4]) -> String {
    Ipv4Addr::from(octets).to_string()
}

/// Bracketed form of an IPv6 address with all eight groups spelled out.
///
/// Groups are lowercase hex without zero padding and no `::` compression,
/// so sixteen zero bytes render as `[0:0:0:0:0:0:0:0]`.
#[must_use]
pub fn ipv6_text(addr: &Ipv6Addr) -> String {
    let groups: Vec<String> = addr.segments().iter().map(|g| format!("{g:x}")).collect();
    format!("[{}]", groups.join(":"))
}

/// Joins a host and port into something `TcpStream::connect` accepts.
///
/// Bare IPv6 literals (as an operator might write a fallback address) get
/// bracketed; hosts that are already bracketed pass through unchanged.
#[must_use]
pub fn authority(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
