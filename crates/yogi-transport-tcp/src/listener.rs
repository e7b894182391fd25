//! `TcpListener` (accept side) and `TcpConnector` (connect side): both
//! accept and connect timeouts are distinct from the per-transfer timeout
//! each `send_some`/`recv_some` call on the resulting [`TcpByteTransport`]
//! carries separately.

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};

use yogi_transport::TransportSocketAddr;
use yogi_transport::byte_transport::{ByteTransportConnector, ByteTransportListener, TransceiveLimits};
use yogi_transport::context::CallContext;
use yogi_transport::error::YogiError;

use crate::channel::{TcpByteTransport, set_nodelay};
use crate::error;
use crate::util::{run_with_context, to_socket_addr};

/// Accepts inbound TCP connections.
///
/// `IPV6_V6ONLY` is set independently of `SO_REUSEADDR` rather than
/// inheriting the platform default (which on some systems ties the two
/// together), so a branch bound to a wildcard IPv6 address never silently
/// also accepts IPv4-mapped connections.
pub struct TcpListener {
    inner: TokioTcpListener,
    local_addr: TransportSocketAddr,
    limits: TransceiveLimits,
}

impl TcpListener {
    pub async fn bind(addr: TransportSocketAddr) -> Result<Self, YogiError> {
        Self::bind_with_limits(addr, TransceiveLimits::default()).await
    }

    pub async fn bind_with_limits(
        addr: TransportSocketAddr,
        limits: TransceiveLimits,
    ) -> Result<Self, YogiError> {
        let socket_addr = to_socket_addr(addr);
        let domain = if socket_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket =
            Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(error::map_bind_error)?;
        if domain == Domain::IPV6 {
            // IPV6_V6ONLY is set explicitly rather than left at the
            // platform default so dual-stack behavior never depends on
            // SO_REUSEADDR being set first or on OS-specific defaults.
            socket.set_only_v6(true).map_err(error::map_bind_error)?;
        }
        socket.set_reuse_address(true).map_err(error::map_bind_error)?;
        socket
            .bind(&socket_addr.into())
            .map_err(error::map_bind_error)?;
        socket.set_nonblocking(true).map_err(error::map_bind_error)?;
        socket.listen(1024).map_err(error::map_listen_error)?;
        let inner = TokioTcpListener::from_std(socket.into()).map_err(error::map_listen_error)?;
        let local_addr = TransportSocketAddr::from(inner.local_addr().map_err(error::map_bind_error)?);
        tracing::debug!(%local_addr, "tcp listener bound");
        Ok(Self {
            inner,
            local_addr,
            limits,
        })
    }
}

#[async_trait]
impl ByteTransportListener for TcpListener {
    type Connection = TcpByteTransport;

    fn local_addr(&self) -> Result<TransportSocketAddr, YogiError> {
        Ok(self.local_addr)
    }

    async fn accept(
        &self,
        ctx: &CallContext,
    ) -> Result<(Self::Connection, TransportSocketAddr), YogiError> {
        let (stream, peer): (TcpStream, std::net::SocketAddr) =
            run_with_context(ctx, error::map_accept_error, self.inner.accept()).await?;
        set_nodelay(&stream).map_err(error::map_accept_error)?;
        let peer_addr = TransportSocketAddr::from(peer);
        tracing::debug!(%peer_addr, "tcp connection accepted");
        let transport = TcpByteTransport::new(stream, self.limits);
        Ok((transport, peer_addr))
    }

    async fn close(&self) {
        // tokio's TcpListener has no explicit close; dropping the
        // listener (which happens when this struct is dropped) releases
        // the bound socket. Nothing to do eagerly here.
    }
}

/// Establishes outbound TCP connections.
#[derive(Clone, Copy, Default)]
pub struct TcpConnector {
    limits: TransceiveLimits,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: TransceiveLimits) -> Self {
        Self { limits }
    }
}

#[async_trait]
impl ByteTransportConnector for TcpConnector {
    type Connection = TcpByteTransport;

    async fn connect(
        &self,
        addr: TransportSocketAddr,
        ctx: &CallContext,
    ) -> Result<Self::Connection, YogiError> {
        TcpByteTransport::connect(to_socket_addr(addr), ctx, self.limits).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yogi_transport::ByteTransport;

    #[tokio::test(flavor = "multi_thread")]
    async fn connector_reaches_listener() {
        let listener = TcpListener::bind(TransportSocketAddr::V4 {
            addr: [127, 0, 0, 1],
            port: 0,
        })
        .await
        .unwrap();
        let local_addr = listener.local_addr().unwrap();

        let accept_ctx = CallContext::infinite();
        let accept_task = tokio::spawn(async move { listener.accept(&accept_ctx).await });

        let connector = TcpConnector::new();
        let connect_ctx = CallContext::infinite();
        let client = connector.connect(local_addr, &connect_ctx).await.unwrap();

        let (server, peer_addr) = accept_task.await.unwrap().unwrap();
        assert_eq!(Some(peer_addr), client.local_addr());

        let ctx = CallContext::infinite();
        client.send_all(b"ping", &ctx).await.unwrap();
        let mut buf = [0u8; 4];
        server.recv_all(&mut buf, &ctx).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_to_closed_port_fails() {
        let listener = TcpListener::bind(TransportSocketAddr::V4 {
            addr: [127, 0, 0, 1],
            port: 0,
        })
        .await
        .unwrap();
        let local_addr = listener.local_addr().unwrap();
        listener.close().await;
        drop(listener);

        let connector = TcpConnector::new();
        let ctx = CallContext::infinite();
        let result = connector.connect(local_addr, &ctx).await;
        assert!(result.is_err());
    }
}
