//! Endpoint addresses: an IPv4 or IPv6 host plus a port.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::proto::DEFAULT_PORT;

/// An endpoint address: either four IPv4 octets or eight IPv6 groups, plus
/// a port. Distinct from `std::net::SocketAddr` only in that it exposes
/// the protocol's own `host()` formatting rules.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    V4 { octets: [u8; 4], port: u16 },
    V6 { groups: [u16; 8], port: u16 },
}

impl Address {
    #[inline]
    pub fn ipv4(octets: [u8; 4], port: u16) -> Address {
        Address::V4 { octets, port }
    }

    #[inline]
    pub fn ipv6(groups: [u16; 8], port: u16) -> Address {
        Address::V6 { groups, port }
    }

    #[inline]
    pub fn ipv4_any() -> Address {
        Address::V4 { octets: [0, 0, 0, 0], port: 0 }
    }

    #[inline]
    pub fn ipv6_any() -> Address {
        Address::V6 { groups: [0; 8], port: 0 }
    }

    #[inline]
    pub fn ipv4_loopback(port: u16) -> Address {
        Address::V4 { octets: [127, 0, 0, 1], port }
    }

    #[inline]
    pub fn ipv6_loopback(port: u16) -> Address {
        let mut groups = [0u16; 8];
        groups[7] = 1;
        Address::V6 { groups, port }
    }

    #[inline]
    pub fn port(&self) -> u16 {
        match self {
            Address::V4 { port, .. } => *port,
            Address::V6 { port, .. } => *port,
        }
    }

    /// Builds an `Address` from a socket address, preserving its family.
    ///
    /// The reference implementation this protocol was distilled from
    /// always tagged the result IPv6, even for an IPv4 socket address; a
    /// mapped IPv4 peer ended up compared against a genuine IPv6 peer as
    /// if they were the same family. Here the family of `addr` survives
    /// unchanged.
    pub fn from_socket(addr: SocketAddr) -> Address {
        match addr.ip() {
            IpAddr::V4(v4) => Address::V4 { octets: v4.octets(), port: addr.port() },
            IpAddr::V6(v6) => Address::V6 { groups: v6.segments(), port: addr.port() },
        }
    }

    pub fn to_socket(&self) -> SocketAddr {
        match self {
            Address::V4 { octets, port } => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*octets)), *port)
            }
            Address::V6 { groups, port } => {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*groups)), *port)
            }
        }
    }

    /// Host part of the address, formatted per the protocol's string
    /// grammar: dotted-quad for IPv4, canonical RFC 5952 compression for
    /// IPv6 (the longest run of all-zero groups is elided, earliest run
    /// wins a tie, and a lone zero group is never compressed).
    pub fn host(&self) -> String {
        match self {
            Address::V4 { octets, .. } => {
                format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3])
            }
            Address::V6 { groups, .. } => format_ipv6_host(groups),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4 { port, .. } => write!(f, "{}:{}", self.host(), port),
            Address::V6 { port, .. } => write!(f, "[{}]:{}", self.host(), port),
        }
    }
}

/// Finds the longest run of consecutive zero groups, earliest run winning
/// ties, and compresses exactly that run with `::`. A run of length one is
/// never compressed (RFC 5952 section 4.2.2).
fn format_ipv6_host(groups: &[u16; 8]) -> String {
    let (best_start, best_len) = longest_zero_run(groups);

    if best_len <= 1 {
        return groups.iter().map(|g| format!("{:x}", g)).collect::<Vec<_>>().join(":");
    }

    let head: Vec<String> = groups[..best_start].iter().map(|g| format!("{:x}", g)).collect();
    let tail: Vec<String> = groups[best_start + best_len..].iter().map(|g| format!("{:x}", g)).collect();
    format!("{}::{}", head.join(":"), tail.join(":"))
}

fn longest_zero_run(groups: &[u16; 8]) -> (usize, usize) {
    let mut best_start = 0;
    let mut best_len = 0;
    let mut cur_start = 0;
    let mut cur_len = 0;

    for (i, &g) in groups.iter().enumerate() {
        if g == 0 {
            if cur_len == 0 {
                cur_start = i;
            }
            cur_len += 1;
            if cur_len > best_len {
                best_len = cur_len;
                best_start = cur_start;
            }
        } else {
            cur_len = 0;
        }
    }

    (best_start, best_len)
}

impl Default for Address {
    fn default() -> Address {
        Address::ipv4_any()
    }
}

/// Parses an address that may or may not carry an explicit port, using
/// [`DEFAULT_PORT`] when it is omitted. IPv6 hosts must be bracketed when
/// a port follows (`[::1]:3413`); a bare bracketed host with no port is
/// also accepted.
pub fn parse_address(text: &str) -> Option<Address> {
    if let Some(rest) = text.strip_prefix('[') {
        let close = rest.find(']')?;
        let host = &rest[..close];
        let after = &rest[close + 1..];
        let port = if let Some(p) = after.strip_prefix(':') {
            p.parse::<u16>().ok()?
        } else {
            DEFAULT_PORT
        };
        let ip: Ipv6Addr = host.parse().ok()?;
        return Some(Address::V6 { groups: ip.segments(), port });
    }

    // Disambiguate "host:port" from a bare IPv6 literal with no brackets.
    if text.matches(':').count() > 1 {
        let ip: Ipv6Addr = text.parse().ok()?;
        return Some(Address::V6 { groups: ip.segments(), port: DEFAULT_PORT });
    }

    if let Some((host, port_str)) = text.rsplit_once(':') {
        let ip: Ipv4Addr = host.parse().ok()?;
        let port: u16 = port_str.parse().ok()?;
        return Some(Address::V4 { octets: ip.octets(), port });
    }

    let ip: Ipv4Addr = text.parse().ok()?;
    Some(Address::V4 { octets: ip.octets(), port: DEFAULT_PORT })
}
