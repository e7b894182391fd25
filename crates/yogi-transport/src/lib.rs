//! `yogi-transport`: the transport-contract layer every concrete byte
//! transport and the branch runtime core build on.
//!
//! This is the bottom of the workspace's dependency graph -- it carries
//! the error domain ([`error`]), the `Context`/`Timer` scheduler and
//! per-operation `CallContext` ([`context`]), the abstract
//! `ByteTransport`/`ByteTransportListener`/`ByteTransportConnector`
//! contract ([`byte_transport`]), and the address/transceive-limit
//! vocabulary shared by every concrete transport -- precisely so that
//! `yogi-core` (and `yogi-transport-tcp`, `yogi-discovery`) can depend on
//! it without a cycle.

pub mod addr;
pub mod byte_transport;
pub mod context;
pub mod error;
pub mod shutdown;

pub use addr::TransportSocketAddr;
pub use byte_transport::{ByteTransport, ByteTransportConnector, ByteTransportListener, TransceiveLimits};
pub use context::{CallContext, Cancellation, Context, Deadline, Timer};
pub use error::{YogiError, YogiErrorCode};
pub use shutdown::ShutdownDirection;

/// Prelude re-exporting the types almost every downstream crate needs.
pub mod prelude {
    pub use crate::{
        ByteTransport, ByteTransportConnector, ByteTransportListener, CallContext, Cancellation,
        Context, Deadline, ShutdownDirection, Timer, TransportSocketAddr, YogiError, YogiErrorCode,
    };
}
