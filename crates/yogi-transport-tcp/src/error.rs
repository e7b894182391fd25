//! Maps `std::io::Error` and timeout/cancellation conditions onto
//! [`YogiError`], picking the specific code for each TCP lifecycle stage
//! (connect/accept/bind/listen vs. the generic `rw_failed` a mid-stream
//! read/write failure gets).

use yogi_transport::error::{YogiError, YogiErrorCode};

pub fn map_connect_error(err: std::io::Error) -> YogiError {
    if err.kind() == std::io::ErrorKind::TimedOut {
        return YogiError::with_cause(YogiErrorCode::Timeout, "connect timed out", err);
    }
    YogiError::with_cause(YogiErrorCode::ConnectSocketFailed, "tcp connect failed", err)
}

pub fn map_bind_error(err: std::io::Error) -> YogiError {
    YogiError::with_cause(YogiErrorCode::BindSocketFailed, "tcp bind failed", err)
}

pub fn map_listen_error(err: std::io::Error) -> YogiError {
    YogiError::with_cause(YogiErrorCode::ListenSocketFailed, "tcp listen failed", err)
}

pub fn map_accept_error(err: std::io::Error) -> YogiError {
    YogiError::with_cause(YogiErrorCode::AcceptSocketFailed, "tcp accept failed", err)
}

pub fn map_rw_error(err: std::io::Error) -> YogiError {
    if err.kind() == std::io::ErrorKind::TimedOut {
        return YogiError::with_cause(YogiErrorCode::Timeout, "tcp read/write timed out", err);
    }
    YogiError::with_cause(YogiErrorCode::RwFailed, "tcp read/write failed", err)
}

pub fn timeout() -> YogiError {
    YogiError::from(YogiErrorCode::Timeout)
}

pub fn canceled() -> YogiError {
    YogiError::from(YogiErrorCode::Canceled)
}
