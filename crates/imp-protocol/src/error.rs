//! Error types for frame parsing, parameter validation and measurement decoding

use thiserror::Error;

/// Errors that can occur while parsing or building a wire frame
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// Trailing checksum disagrees with the sum of the preceding bytes
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Fewer bytes than the frame declares
    #[error("truncated frame: need {needed} more bytes")]
    Truncated { needed: usize },

    /// First byte is not a recognized command/response tag
    #[error("unknown tag: 0x{0:02X}")]
    UnknownTag(u8),

    /// Bytes left over after a complete frame
    #[error("{extra} trailing bytes after frame")]
    TrailingBytes { extra: usize },

    /// Payload longer than the tag allows
    #[error("payload of {len} bytes exceeds limit of {max} for tag 0x{tag:02X}")]
    PayloadTooLong { tag: u8, len: usize, max: usize },
}

/// Errors raised when a caller-supplied parameter is outside what the device accepts
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// Numeric value outside its allowed range
    #[error("{field} = {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// String that does not name any member of a closed set
    #[error("unrecognized {field}: {value:?}")]
    UnknownValue { field: &'static str, value: String },

    /// String that could not be read as a number with unit
    #[error("could not parse {field} from {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    /// Sweep bounds that cannot produce a frequency list
    #[error("invalid sweep: {0}")]
    InvalidSweep(String),
}

/// Errors raised while turning measurement frames into points
///
/// None of these end a running measurement; the offending frame is dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame failed envelope checks
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Frequency index not part of the active sweep
    #[error("frequency id {id} outside sweep of {count} points")]
    FrequencyOutOfRange { id: u16, count: usize },

    /// Payload length does not match the layout for this frame type
    #[error("malformed payload: expected {expected} bytes, got {actual}")]
    MalformedPayload { expected: usize, actual: usize },

    /// Payload carries a code this layout does not define
    #[error("invalid field {field}: 0x{value:02X}")]
    InvalidField { field: &'static str, value: u8 },
}
