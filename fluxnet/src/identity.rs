//! Peer identity: an immutable (ip, port) pair used as the map key for the
//! server-side client table (spec.md §3 Identity).

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Tagged IP address variant, as spec.md §3 requires: `{none, v4, v6}`,
/// with v6 held network-byte-ordered as eight 16-bit words.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum IpAddr {
    None,
    V4(u32),
    V6([u16; 8]),
}

impl IpAddr {
    pub const fn is_none(&self) -> bool {
        matches!(self, IpAddr::None)
    }
}

impl From<Ipv4Addr> for IpAddr {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddr::V4(u32::from_be_bytes(addr.octets()))
    }
}

impl From<Ipv6Addr> for IpAddr {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddr::V6(addr.segments())
    }
}

impl From<std::net::IpAddr> for IpAddr {
    fn from(addr: std::net::IpAddr) -> Self {
        match addr {
            std::net::IpAddr::V4(v4) => IpAddr::from(v4),
            std::net::IpAddr::V6(v6) => IpAddr::from(v6),
        }
    }
}

impl From<IpAddr> for Option<std::net::IpAddr> {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::None => None,
            IpAddr::V4(bits) => Some(std::net::IpAddr::V4(Ipv4Addr::from(bits))),
            IpAddr::V6(segments) => Some(std::net::IpAddr::V6(Ipv6Addr::from(segments))),
        }
    }
}

impl fmt::Display for IpAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            IpAddr::None => write!(f, "none"),
            IpAddr::V4(bits) => write!(f, "{}", Ipv4Addr::from(bits)),
            IpAddr::V6(segments) => write!(f, "{}", Ipv6Addr::from(segments)),
        }
    }
}

/// Port number. Plain alias, kept distinct from `u16` in signatures for
/// readability the way the original source's `fge::net::Port` is.
pub type Port = u16;

/// Immutable peer identity: the pair used to key the server-side client
/// table and to address outbound datagrams.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Identity {
    pub ip: IpAddr,
    pub port: Port,
}

impl Identity {
    pub const fn new(ip: IpAddr, port: Port) -> Self {
        Identity { ip, port }
    }

    pub const fn none() -> Self {
        Identity {
            ip: IpAddr::None,
            port: 0,
        }
    }
}

impl From<SocketAddr> for Identity {
    fn from(addr: SocketAddr) -> Self {
        Identity {
            ip: IpAddr::from(addr.ip()),
            port: addr.port(),
        }
    }
}

impl TryFrom<Identity> for SocketAddr {
    type Error = ();

    fn try_from(id: Identity) -> Result<Self, Self::Error> {
        let ip: Option<std::net::IpAddr> = id.ip.into();
        ip.map(|ip| SocketAddr::new(ip, id.port)).ok_or(())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;
    use std::net::SocketAddr;

    #[test]
    fn v4_roundtrip_through_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:4455".parse().unwrap();
        let id = Identity::from(addr);
        let back: SocketAddr = id.try_into().unwrap();
        assert_eq!(addr, back);
    }

    #[test]
    fn v6_roundtrip_through_socket_addr() {
        let addr: SocketAddr = "[::1]:4455".parse().unwrap();
        let id = Identity::from(addr);
        let back: SocketAddr = id.try_into().unwrap();
        assert_eq!(addr, back);
    }

    #[test]
    fn equality_and_hash_over_the_pair() {
        use std::collections::HashSet;
        let a = Identity::new(IpAddr::V4(1), 100);
        let b = Identity::new(IpAddr::V4(1), 100);
        let c = Identity::new(IpAddr::V4(1), 101);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }
}
