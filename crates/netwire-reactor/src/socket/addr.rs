//! IP address value type with a privacy-preserving display form.
//!
//! Peer addresses end up in logs, so alongside the usual textual form every
//! address has an anonymized rendering that keeps only a coarse prefix: an
//! IPv4 address shows as `A.B.0.0`, an IPv6 address keeps only its low 24
//! bits.

use std::fmt;
use std::net::{AddrParseError, IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IPv4 or IPv6 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpAddress {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl IpAddress {
    pub fn is_v4(&self) -> bool {
        matches!(self, IpAddress::V4(_))
    }

    /// Whether every byte is zero (the unspecified address of either
    /// family).
    pub fn is_unspecified(&self) -> bool {
        match self {
            IpAddress::V4(octets) => octets.iter().all(|&b| b == 0),
            IpAddress::V6(octets) => octets.iter().all(|&b| b == 0),
        }
    }

    /// The 16-byte form: IPv6 octets as-is, IPv4 mapped per RFC 4291.
    pub fn to_v6_octets(&self) -> [u8; 16] {
        match self {
            IpAddress::V4(octets) => {
                let mut out = [0u8; 16];
                out[10] = 0xFF;
                out[11] = 0xFF;
                out[12..].copy_from_slice(octets);
                out
            }
            IpAddress::V6(octets) => *octets,
        }
    }

    pub fn to_std(&self) -> IpAddr {
        match self {
            IpAddress::V4(octets) => IpAddr::V4(Ipv4Addr::from(*octets)),
            IpAddress::V6(octets) => IpAddr::V6(Ipv6Addr::from(*octets)),
        }
    }

    /// Display adaptor that truncates the address for logging.
    pub fn anonymized(&self) -> Anonymized<'_> {
        Anonymized(self)
    }
}

impl Default for IpAddress {
    fn default() -> Self {
        IpAddress::V4([0; 4])
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(octets) => Ipv4Addr::from(*octets).fmt(f),
            IpAddress::V6(octets) => Ipv6Addr::from(*octets).fmt(f),
        }
    }
}

impl FromStr for IpAddress {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(v4) = Ipv4Addr::from_str(s) {
            return Ok(IpAddress::from(v4));
        }
        Ipv6Addr::from_str(s).map(IpAddress::from)
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress::V4(addr.octets())
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress::V6(addr.octets())
    }
}

impl From<IpAddr> for IpAddress {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => IpAddress::from(v4),
            IpAddr::V6(v6) => IpAddress::from(v6),
        }
    }
}

impl From<IpAddress> for IpAddr {
    fn from(addr: IpAddress) -> Self {
        addr.to_std()
    }
}

/// Truncated rendering of an [`IpAddress`] for logs.
pub struct Anonymized<'a>(&'a IpAddress);

impl fmt::Display for Anonymized<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            IpAddress::V4(octets) => write!(f, "{}.{}.0.0", octets[0], octets[1]),
            IpAddress::V6(octets) => {
                // Keep only the low 24 bits.
                let mut masked = [0u8; 16];
                masked[13..].copy_from_slice(&octets[13..]);
                Ipv6Addr::from(masked).fmt(f)
            }
        }
    }
}
