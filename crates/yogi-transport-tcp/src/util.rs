//! Cancellation/deadline-aware driver shared by every TCP operation in
//! this crate.
//!
//! `send_some`/`recv_some`/accept/connect must respect a per-operation
//! [`CallContext`] (timeout + cancellation) even though the underlying
//! `tokio` I/O future knows nothing about either. Since [`Cancellation`]
//! is a plain atomic flag rather than a `tokio::sync::Notify`-backed
//! future, the only portable way to race it against an arbitrary I/O
//! future is to poll it periodically, so cancellation response has
//! millisecond-level delay rather than being instantaneous.

use std::future::Future;
use std::time::{Duration, Instant};

use yogi_transport::context::{CallContext, Deadline};
use yogi_transport::error::YogiError;

use crate::error;

/// How often the cancellation flag and deadline are re-checked while an
/// I/O future is outstanding.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(15);

/// Drives `fut` to completion, failing fast with `Err(Timeout)` or
/// `Err(Canceled)` if `ctx` expires or is canceled first. `map_err`
/// translates the future's `io::Error` into the code appropriate for the
/// calling operation (connect/accept/bind vs. a mid-stream read/write).
pub async fn run_with_context<F, T>(
    ctx: &CallContext,
    map_err: fn(std::io::Error) -> YogiError,
    fut: F,
) -> Result<T, YogiError>
where
    F: Future<Output = std::io::Result<T>>,
{
    if ctx.is_cancelled() {
        return Err(error::canceled());
    }
    if deadline_expired(ctx.deadline()) {
        return Err(error::timeout());
    }

    tokio::pin!(fut);
    loop {
        tokio::select! {
            res = &mut fut => return res.map_err(map_err),
            _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {
                if ctx.is_cancelled() {
                    return Err(error::canceled());
                }
                if deadline_expired(ctx.deadline()) {
                    return Err(error::timeout());
                }
            }
        }
    }
}

pub fn deadline_expired(deadline: Deadline) -> bool {
    match deadline {
        Deadline::Infinite => false,
        Deadline::At(instant) => Instant::now() >= instant,
    }
}

pub fn to_socket_addr(addr: yogi_transport::TransportSocketAddr) -> std::net::SocketAddr {
    addr.into()
}
