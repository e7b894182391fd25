use std::fmt;
use std::net::Ipv6Addr;

/// A socket address in the shape every transport in this workspace
/// shares, so callers don't depend on `std::net::SocketAddr` directly
/// at the `ByteTransport` contract boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum TransportSocketAddr {
    /// An IPv4 address.
    V4 { addr: [u8; 4], port: u16 },
    /// An IPv6 address.
    V6 { addr: [u16; 8], port: u16 },
}

impl TransportSocketAddr {
    /// Converts the `V6` variant's 8 segments into an [`Ipv6Addr`].
    pub fn as_ipv6_addr(&self) -> Option<Ipv6Addr> {
        match self {
            Self::V6 { addr, .. } => Some(Ipv6Addr::from(*addr)),
            _ => None,
        }
    }
}

impl fmt::Display for TransportSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportSocketAddr::V4 { addr, port } => write!(
                f,
                "{}.{}.{}.{}:{}",
                addr[0], addr[1], addr[2], addr[3], port
            ),
            TransportSocketAddr::V6 { addr, port } => {
                let segments: Vec<String> = addr
                    .iter()
                    .map(|segment| format!("{:x}", segment))
                    .collect();
                write!(f, "[{}]:{}", segments.join(":"), port)
            }
        }
    }
}

impl From<std::net::SocketAddr> for TransportSocketAddr {
    fn from(addr: std::net::SocketAddr) -> Self {
        match addr {
            std::net::SocketAddr::V4(v4) => Self::V4 {
                addr: v4.ip().octets(),
                port: v4.port(),
            },
            std::net::SocketAddr::V6(v6) => Self::V6 {
                addr: v6.ip().segments(),
                port: v6.port(),
            },
        }
    }
}

impl From<TransportSocketAddr> for std::net::SocketAddr {
    fn from(addr: TransportSocketAddr) -> Self {
        match addr {
            TransportSocketAddr::V4 { addr, port } => std::net::SocketAddr::from((addr, port)),
            TransportSocketAddr::V6 { addr, port } => {
                let ipv6 = std::net::Ipv6Addr::from(addr);
                std::net::SocketAddr::from((ipv6, port))
            }
        }
    }
}
