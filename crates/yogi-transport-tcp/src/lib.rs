//! `yogi-transport-tcp`: the `tokio`-backed TCP [`ByteTransport`]
//! implementation -- `TCP_NODELAY` on every connection, and distinct
//! connect/accept timeouts from the per-transfer timeout each
//! `send_some`/`recv_some` call carries.

mod channel;
mod error;
mod listener;
mod util;

pub use channel::TcpByteTransport;
pub use listener::{TcpConnector, TcpListener};

pub use yogi_transport::{ByteTransport, ByteTransportConnector, ByteTransportListener};
