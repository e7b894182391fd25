//! `yogi-core`: the framed Message Transport, ring buffer, varint
//! size-field codec, branch identity/registry types, and branch event
//! bus.
//!
//! The `Context`/`Timer` scheduler and the `YogiError`/`YogiErrorCode`
//! domain live in `yogi-transport` (see that crate's module doc for why)
//! and are re-exported here so every call site in this crate, and every
//! downstream consumer, can reach them as `yogi_core::{Context, Timer,
//! YogiError, YogiErrorCode}` without depending on `yogi-transport`
//! directly.

pub mod branch;
pub mod events;
pub mod message_transport;
pub mod ring;
pub mod varint;

pub use branch::{BranchConfig, BranchInfo, LocalBranchInfo, Timestamp, TimeoutDuration, Uuid};
pub use events::{BranchEvent, EventBus, EventKind, EventOutcome};
pub use message_transport::MessageTransport;
pub use yogi_transport::context::{CallContext, Cancellation, Context, Deadline, Timer};
pub use yogi_transport::error::{YogiError, YogiErrorCode};

/// Re-exports the full public surface of this crate, for embedders that
/// want a single `use yogi_core::prelude::*;`.
pub mod prelude {
    pub use crate::{
        BranchConfig, BranchEvent, BranchInfo, CallContext, Cancellation, Context, Deadline,
        EventBus, EventKind, EventOutcome, LocalBranchInfo, MessageTransport, TimeoutDuration,
        Timer, Timestamp, Uuid, YogiError, YogiErrorCode,
    };
}
