//! Error types for the device shadow.

use std::time::Duration;

use thiserror::Error;

use fabric_data::Status;

/// Coarse classification used by retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable: busy remote, network blip, send failure.
    Transient,
    /// A deadline was exceeded.
    Timeout,
    /// Schema mismatch, decode failure, wrong-state callback.
    Protocol,
    /// A status returned by the node.
    Remote,
    /// Invalid argument from the client, or an invalidated device.
    Fatal,
}

/// Errors surfaced by the device shadow.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No secure session could be established with the node.
    ///
    /// May carry a server-provided retry delay, which resets the backoff
    /// ladder and schedules the next attempt at exactly that delay.
    #[error("session unavailable: {reason}")]
    SessionUnavailable {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// A message could not be handed to the transport.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The engine ran out of packet buffer space building a request.
    #[error("insufficient memory for request")]
    NoMemory,

    /// A client-committed or operation deadline passed.
    #[error("operation timed out")]
    Timeout,

    /// The remote answered with a non-success status.
    #[error("remote status: {0}")]
    Remote(Status),

    /// The peer or the engine violated the interaction contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The storage layer failed to load or persist cluster data.
    #[error("storage error: {0}")]
    Storage(String),

    /// The caller handed the facade an argument outside its domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The device has been invalidated; no further work is accepted.
    #[error("device invalidated")]
    Invalidated,
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::SessionUnavailable { .. }
            | DeviceError::SendFailed(_)
            | DeviceError::NoMemory
            | DeviceError::Storage(_) => ErrorKind::Transient,
            DeviceError::Timeout => ErrorKind::Timeout,
            DeviceError::Remote(_) => ErrorKind::Remote,
            DeviceError::Protocol(_) => ErrorKind::Protocol,
            DeviceError::InvalidArgument(_) | DeviceError::Invalidated => ErrorKind::Fatal,
        }
    }

    /// The server-provided delay before the next subscription attempt,
    /// when the session layer handed one back.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeviceError::SessionUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// True when an invoke may be re-issued for this error: only the
    /// remote `Busy` status qualifies.
    pub fn is_remote_busy(&self) -> bool {
        matches!(self, DeviceError::Remote(status) if status.is_busy())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DeviceError>;
