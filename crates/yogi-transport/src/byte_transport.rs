//! The abstract byte transport contract shared by every concrete
//! transport in this workspace.
//!
//! Uses a single concrete call-context type ([`CallContext`]) with
//! `async_trait`, rather than a protocol-polymorphic generic-associated-
//! type shape that could serve TCP/QUIC/TLS simultaneously behind one
//! vocabulary. This workspace only ships one concrete implementation
//! (TCP, in `yogi-transport-tcp`), so the extra trait-object indirection
//! that pluggability across several protocols would need buys nothing
//! here.

use async_trait::async_trait;

use crate::addr::TransportSocketAddr;
use crate::context::CallContext;
use crate::error::{YogiError, YogiErrorCode};
use crate::shutdown::ShutdownDirection;

/// Per-direction byte ceiling applied before a `send_some`/`recv_some`
/// call reaches the OS, so tests can force message fragmentation across
/// multiple transport-level operations. `None` means no limit beyond
/// the caller's own buffer size.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransceiveLimits {
    pub send_limit: Option<usize>,
    pub recv_limit: Option<usize>,
}

impl TransceiveLimits {
    pub fn clamp_send<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        match self.send_limit {
            Some(limit) if limit < buf.len() => &buf[..limit],
            _ => buf,
        }
    }

    pub fn clamp_recv<'a>(&self, buf: &'a mut [u8]) -> &'a mut [u8] {
        match self.recv_limit {
            Some(limit) if limit < buf.len() => &mut buf[..limit],
            _ => buf,
        }
    }
}

/// Delivers chunked, ordered, reliable bytes with per-operation timeout.
/// On any non-success outcome the implementation MUST close itself
/// internally so that subsequent operations fail fast with the same
/// latched error.
#[async_trait]
pub trait ByteTransport: Send + Sync + 'static {
    /// The peer's address, if known (not every transport has one).
    fn peer_addr(&self) -> Option<TransportSocketAddr>;
    /// The local bound address, if known.
    fn local_addr(&self) -> Option<TransportSocketAddr>;

    /// Writes some of `buf`, returning the number of bytes actually
    /// written (may be fewer than `buf.len()`). Completes with
    /// `Err(Timeout)` if no progress is made within `ctx`'s deadline,
    /// `Err(RwFailed)` on a socket error, or `Err(Canceled)` if shut
    /// down mid-call.
    async fn send_some(&self, buf: &[u8], ctx: &CallContext) -> Result<usize, YogiError>;

    /// Reads some bytes into `buf`, symmetric to [`ByteTransport::send_some`].
    async fn recv_some(&self, buf: &mut [u8], ctx: &CallContext) -> Result<usize, YogiError>;

    /// Re-issues [`ByteTransport::send_some`] until `buf` is fully
    /// transferred or a non-success status arises.
    async fn send_all(&self, buf: &[u8], ctx: &CallContext) -> Result<(), YogiError> {
        let mut offset = 0;
        while offset < buf.len() {
            if ctx.is_cancelled() {
                return Err(YogiError::from(YogiErrorCode::Canceled));
            }
            let n = self.send_some(&buf[offset..], ctx).await?;
            if n == 0 {
                return Err(YogiError::new(
                    YogiErrorCode::RwFailed,
                    "send_some made no progress",
                ));
            }
            offset += n;
        }
        Ok(())
    }

    /// Re-issues [`ByteTransport::recv_some`] until `buf` is fully
    /// filled or a non-success status arises.
    async fn recv_all(&self, buf: &mut [u8], ctx: &CallContext) -> Result<(), YogiError> {
        let mut offset = 0;
        while offset < buf.len() {
            if ctx.is_cancelled() {
                return Err(YogiError::from(YogiErrorCode::Canceled));
            }
            let n = self.recv_some(&mut buf[offset..], ctx).await?;
            if n == 0 {
                return Err(YogiError::new(
                    YogiErrorCode::RwFailed,
                    "recv_some made no progress",
                ));
            }
            offset += n;
        }
        Ok(())
    }

    /// Shuts down the given direction(s) and cancels any in-flight I/O.
    async fn shutdown(&self, direction: ShutdownDirection, ctx: &CallContext) -> Result<(), YogiError>;

    /// Shuts down both directions and cancels pending I/O. Idempotent.
    async fn close(&self);
}

/// Accepts inbound connections. Acceptor and connector take a
/// connect/accept timeout distinct from the per-transfer timeout carried
/// by [`CallContext`] on each `send_some`/`recv_some` call.
#[async_trait]
pub trait ByteTransportListener: Send + Sync + 'static {
    type Connection: ByteTransport;

    fn local_addr(&self) -> Result<TransportSocketAddr, YogiError>;

    /// Accepts one inbound connection. A connection-guard returned to the
    /// caller (or held internally) MUST cancel this accept if dropped
    /// before it resolves.
    async fn accept(
        &self,
        ctx: &CallContext,
    ) -> Result<(Self::Connection, TransportSocketAddr), YogiError>;

    async fn close(&self);
}

/// Establishes outbound connections.
#[async_trait]
pub trait ByteTransportConnector: Send + Sync + 'static {
    type Connection: ByteTransport;

    async fn connect(
        &self,
        addr: TransportSocketAddr,
        ctx: &CallContext,
    ) -> Result<Self::Connection, YogiError>;
}
