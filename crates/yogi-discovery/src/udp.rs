//! The multicast UDP socket advertising/discovery is built on.
//!
//! Built the same way `yogi-transport-tcp`'s `TcpListener::bind` builds
//! its own socket: a `socket2::Socket` for the low-level options a bare
//! `tokio::net::UdpSocket::bind` cannot express -- here, multicast group
//! membership -- then handed off to Tokio once those options are set.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use yogi_transport::error::{YogiError, YogiErrorCode};

use crate::interfaces::SelectedInterface;

/// A UDP socket bound to an advertising group's port and joined to its
/// multicast group on every qualifying local interface.
pub struct MulticastSocket {
    sock: UdpSocket,
    group: SocketAddr,
}

impl MulticastSocket {
    /// Binds to `group`'s port (on the wildcard address for `group`'s
    /// family) and joins the multicast group on each of `interfaces`.
    /// Interfaces whose address family doesn't match `group`'s are
    /// skipped rather than failing the whole bind.
    pub fn join(group: SocketAddr, interfaces: &[SelectedInterface]) -> Result<Self, YogiError> {
        let domain = if group.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(map_bind_error)?;
        socket.set_reuse_address(true).map_err(map_bind_error)?;
        #[cfg(unix)]
        socket.set_reuse_port(true).map_err(map_bind_error)?;

        let bind_addr: SocketAddr = if group.is_ipv6() {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), group.port())
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port())
        };
        socket.bind(&bind_addr.into()).map_err(map_bind_error)?;
        socket.set_nonblocking(true).map_err(map_bind_error)?;

        match group.ip() {
            IpAddr::V4(mcast) => {
                for iface in interfaces {
                    if let IpAddr::V4(iface_addr) = iface.address {
                        if let Err(err) = socket.join_multicast_v4(&mcast, &iface_addr) {
                            tracing::warn!(interface = %iface.name, %err, "failed to join multicast group on interface");
                        }
                    }
                }
            }
            IpAddr::V6(mcast) => {
                // `if-addrs` does not expose interface indices reliably
                // across platforms, so every IPv6 join uses the default
                // (index 0) interface; multi-homed IPv6 advertising is a
                // documented limitation.
                if let Err(err) = socket.join_multicast_v6(&mcast, 0) {
                    tracing::warn!(%err, "failed to join ipv6 multicast group");
                }
            }
        }

        let std_socket: std::net::UdpSocket = socket.into();
        let sock = UdpSocket::from_std(std_socket).map_err(map_bind_error)?;
        tracing::debug!(%group, "joined advertising multicast group");
        Ok(Self { sock, group })
    }

    /// Sends `buf` to the multicast group.
    pub async fn send_to_group(&self, buf: &[u8]) -> Result<usize, YogiError> {
        self.sock.send_to(buf, self.group).await.map_err(map_io_error)
    }

    /// Receives one datagram.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), YogiError> {
        self.sock.recv_from(buf).await.map_err(map_io_error)
    }
}

fn map_bind_error(err: std::io::Error) -> YogiError {
    YogiError::with_cause(YogiErrorCode::BindSocketFailed, "udp multicast bind failed", err)
}

fn map_io_error(err: std::io::Error) -> YogiError {
    YogiError::with_cause(YogiErrorCode::RwFailed, "udp multicast i/o failed", err)
}
