//! Error types for the session layer

use imp_protocol::{DecodeError, FramingError, MessageCode, ValidationError};
use thiserror::Error;

use crate::state::{Operation, SessionState};

/// Errors raised by one request/response exchange
#[derive(Debug, Error)]
pub enum DispatchError {
    /// I/O error on the channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No matching response within the deadline
    #[error("no response within {0}ms")]
    Timeout(u64),

    /// Bytes that could not be framed arrived instead of the response
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// The device rejected the command
    #[error("command rejected: {0}")]
    Nack(MessageCode),

    /// A measurement stream holds the channel
    #[error("channel busy with a running measurement")]
    Busy,

    /// A response arrived that does not fit the command
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Errors raised by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// Opening the channel or identifying the device failed
    #[error("connection failed: {0}")]
    Connection(String),

    /// A parameter was rejected before anything was sent
    #[error("invalid parameter: {0}")]
    Validation(#[from] ValidationError),

    /// A response could not be framed
    #[error("framing error: {0}")]
    Framing(FramingError),

    /// A response frame could not be interpreted
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// No response within the deadline
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Operation not legal in the current state
    #[error("{attempted} is not allowed while {current}")]
    State {
        current: SessionState,
        attempted: Operation,
    },

    /// The device rejected a command
    #[error("device rejected command: {0}")]
    Nack(MessageCode),

    /// I/O error on the channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol-level surprise (unexpected frame, busy channel)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// LCR-1 answered a command with `NOT OK` or no acknowledgement at all
    #[error("command not acknowledged: {0}")]
    NotAcknowledged(String),
}

impl SessionError {
    /// Whether the session can no longer be used except to disconnect
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Io(_) | SessionError::Connection(_))
    }
}

impl From<DispatchError> for SessionError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Io(e) => SessionError::Io(e),
            DispatchError::Timeout(ms) => SessionError::Timeout(ms),
            DispatchError::Framing(e) => SessionError::Framing(e),
            DispatchError::Nack(code) => SessionError::Nack(code),
            DispatchError::Busy => SessionError::Protocol("channel busy".to_string()),
            DispatchError::UnexpectedResponse(msg) => SessionError::Protocol(msg),
        }
    }
}
