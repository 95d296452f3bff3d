//! Error taxonomy of the protocol client.
//!
//! Every failure a caller can see is one of these kinds; raw transport
//! errors never escape past the codec boundary.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The device could not be opened or claimed, or no device is
    /// currently connected.
    #[error("connection error: {0}")]
    Connection(String),

    /// The device went away while operations were pending. Cascades to
    /// every queued operation of the session.
    #[error("connection to device lost")]
    ConnectionLost,

    /// No response arrived within the command's timeout window. Local to
    /// the failed operation; the connection stays up.
    #[error("{command} timed out after {elapsed:?}")]
    Timeout {
        command: &'static str,
        elapsed: Duration,
    },

    /// Malformed frame, length mismatch, bad command/seq echo, or a
    /// nonzero device status code.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reserved for a future fail-fast submission mode. The default
    /// policy queues on the operation lock instead of returning this.
    #[error("device is busy")]
    Busy,

    /// Cooperative cancellation observed mid-transfer; any partial data
    /// was discarded.
    #[error("operation aborted")]
    Aborted,

    /// Variant-gated command issued against a model that lacks the
    /// capability. Raised before any transport activity.
    #[error("{command} is not supported by model {model}")]
    Unsupported {
        command: &'static str,
        model: String,
    },
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

impl From<scroll::Error> for Error {
    fn from(e: scroll::Error) -> Self {
        Error::Protocol(format!("malformed frame: {e}"))
    }
}

/// Failures reported by a [`Transport`](crate::transport::Transport)
/// implementation. Translated into the public taxonomy by the session:
/// `Disconnected` becomes [`Error::ConnectionLost`], everything else
/// [`Error::Protocol`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device disconnected")]
    Disconnected,
    #[error("transfer failed: {0}")]
    Transfer(String),
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Disconnected => Error::ConnectionLost,
            TransportError::Transfer(msg) => Error::Protocol(format!("transport: {msg}")),
        }
    }
}
