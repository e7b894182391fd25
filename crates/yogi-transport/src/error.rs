//! The branch runtime's error domain.
//!
//! Lives in this crate rather than `yogi-core` because `ByteTransport`
//! (below this crate's `transport` module) already needs to return it,
//! and `yogi-core` depends on `yogi-transport`, not the other way
//! around. Every fallible operation in this workspace -- here,
//! `yogi-transport-tcp`, `yogi-discovery` and `yogi-core` -- resolves to
//! [`YogiError`], a stable `code` (one of [`YogiErrorCode`]) paired with
//! a human-readable message and an optional underlying cause, rather
//! than an open-ended `&'static str` code space: the branch runtime has
//! a fixed, closed set of error names and does not need to plead
//! forward-compatibility with externally-registered error codes the way
//! a protocol-agnostic framework core does.
//!
//! `YogiErrorCode` derives `thiserror::Error` over its closed enum with
//! a per-variant `#[error(...)]` message, rather than hand-writing
//! `Display`.

use std::fmt;

use thiserror::Error;

/// The stable error codes surfaced by the branch runtime core (`ok` is
/// represented by `Result::Ok` rather than a variant here).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum YogiErrorCode {
    #[error("canceled")]
    Canceled,
    #[error("timeout")]
    Timeout,
    #[error("busy")]
    Busy,
    #[error("buffer_too_small")]
    BufferTooSmall,
    #[error("rw_failed")]
    RwFailed,
    #[error("open_socket_failed")]
    OpenSocketFailed,
    #[error("bind_socket_failed")]
    BindSocketFailed,
    #[error("listen_socket_failed")]
    ListenSocketFailed,
    #[error("accept_socket_failed")]
    AcceptSocketFailed,
    #[error("connect_socket_failed")]
    ConnectSocketFailed,
    #[error("invalid_magic_prefix")]
    InvalidMagicPrefix,
    #[error("incompatible_version")]
    IncompatibleVersion,
    #[error("deserialize_msg_failed")]
    DeserializeMsgFailed,
    #[error("loopback_connection")]
    LoopbackConnection,
    #[error("password_mismatch")]
    PasswordMismatch,
    #[error("net_name_mismatch")]
    NetNameMismatch,
    #[error("duplicate_branch_name")]
    DuplicateBranchName,
    #[error("duplicate_branch_path")]
    DuplicateBranchPath,
    #[error("tx_queue_full")]
    TxQueueFull,
    #[error("invalid_operation_id")]
    InvalidOperationId,
    #[error("operation_not_running")]
    OperationNotRunning,
    #[error("payload_too_large")]
    PayloadTooLarge,
}

impl YogiErrorCode {
    /// The wire/log-stable name of this code, e.g. `"buffer_too_small"`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::BufferTooSmall => "buffer_too_small",
            Self::RwFailed => "rw_failed",
            Self::OpenSocketFailed => "open_socket_failed",
            Self::BindSocketFailed => "bind_socket_failed",
            Self::ListenSocketFailed => "listen_socket_failed",
            Self::AcceptSocketFailed => "accept_socket_failed",
            Self::ConnectSocketFailed => "connect_socket_failed",
            Self::InvalidMagicPrefix => "invalid_magic_prefix",
            Self::IncompatibleVersion => "incompatible_version",
            Self::DeserializeMsgFailed => "deserialize_msg_failed",
            Self::LoopbackConnection => "loopback_connection",
            Self::PasswordMismatch => "password_mismatch",
            Self::NetNameMismatch => "net_name_mismatch",
            Self::DuplicateBranchName => "duplicate_branch_name",
            Self::DuplicateBranchPath => "duplicate_branch_path",
            Self::TxQueueFull => "tx_queue_full",
            Self::InvalidOperationId => "invalid_operation_id",
            Self::OperationNotRunning => "operation_not_running",
            Self::PayloadTooLarge => "payload_too_large",
        }
    }

    /// Whether this code denotes a fatal error: the transport/connection
    /// that produced it is no longer usable and all subsequent
    /// operations on it must report the same latched error.
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::RwFailed
                | Self::Timeout
                | Self::DeserializeMsgFailed
                | Self::OpenSocketFailed
                | Self::ConnectSocketFailed
        )
    }
}

/// The error type returned by every fallible branch-runtime operation.
#[derive(Debug)]
pub struct YogiError {
    code: YogiErrorCode,
    message: String,
    cause: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl YogiError {
    pub fn new(code: YogiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(
        code: YogiErrorCode,
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub const fn code(&self) -> YogiErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for YogiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for YogiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<YogiErrorCode> for YogiError {
    fn from(code: YogiErrorCode) -> Self {
        Self::new(code, code.as_str())
    }
}

/// Maps an [`std::io::Error`] to the fatal [`YogiErrorCode::RwFailed`]
/// unless its kind indicates a more specific code (timeout or would-block
/// are handled by callers directly, since those are not fatal by
/// themselves).
pub fn map_io_error(message: &str, err: std::io::Error) -> YogiError {
    let code = match err.kind() {
        std::io::ErrorKind::TimedOut => YogiErrorCode::Timeout,
        _ => YogiErrorCode::RwFailed,
    };
    YogiError::with_cause(code, message, err)
}

pub type Result<T> = std::result::Result<T, YogiError>;
