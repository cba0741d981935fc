//! Impedance Analyzer Protocol Library
//!
//! This crate provides parsing and encoding for the serial protocols of
//! bench impedance analyzers:
//!
//! - **ISX-3**: binary frames (`tag | option | len | payload | checksum`)
//!   for frontend configuration, sweep setup and streamed measurement data
//! - **LCR-1**: newline-terminated SCPI commands with `OK`/`NOT OK`
//!   acknowledgements
//!
//! # Architecture
//!
//! Everything here is pure and free of I/O:
//! - [`frame`]: envelope encode/decode and a streaming, resynchronizing codec
//! - [`payload`]: typed commands and responses per tag
//! - [`params`]: closed parameter enums parsed from user strings
//! - [`sweep`]: sweep validation and frequency planning
//! - [`measurement`]: streaming decoder from data frames to impedance points
//! - [`scpi`]: LCR-1 command encoding and line parsing
//!
//! # Example
//!
//! ```rust
//! use imp_protocol::{Command, EncodeCommand, FrameCodec, ProtocolCodec, Response};
//!
//! let bytes = Command::StartMeasurement { spectra: 20 }.to_frame().encode();
//! assert_eq!(bytes, vec![0xB8, 0x01, 0x02, 0x00, 0x14, 0xCF]);
//!
//! // Parse an acknowledgement from the analyzer
//! let mut codec = FrameCodec::new();
//! codec.push_bytes(&[0x18, 0x83, 0x01, 0xB8, 0x54]);
//! let frame = codec.next_item().unwrap().unwrap();
//! assert!(matches!(Response::from_frame(&frame), Ok(Response::System(msg)) if msg.is_ack()));
//! ```

pub mod error;
pub mod frame;
pub mod measurement;
pub mod params;
pub mod payload;
pub mod scpi;
pub mod sweep;

pub use error::{DecodeError, FramingError, ValidationError};
pub use frame::{Frame, FrameCodec, Tag};
pub use measurement::{DecodeEvent, MeasurementDecoder, MeasurementPoint};
pub use params::{
    CurrentRange, ExcitationType, FrontendSettings, MeasurementChannel, MeasurementMode, Scale,
    VoltageRange,
};
pub use payload::{
    Command, DataPoint, DeviceIdentity, MessageCode, Response, SweepBlock, SystemMessage,
};
pub use sweep::{plan, validate_spectra, SweepSpec};

/// Identifies which instrument family a link talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Instrument {
    /// ISX-3 impedance spectroscope (binary frames)
    Isx3,
    /// LCR-1 meter (SCPI lines)
    Lcr1,
}

impl Instrument {
    /// Returns a human-readable name for the instrument
    pub fn name(&self) -> &'static str {
        match self {
            Instrument::Isx3 => "ISX-3",
            Instrument::Lcr1 => "LCR-1",
        }
    }
}

/// Trait for codecs that parse incoming byte streams
pub trait ProtocolCodec {
    /// The item type produced by this codec
    type Item;

    /// Push raw bytes into the codec's buffer
    fn push_bytes(&mut self, data: &[u8]);

    /// Try to extract the next complete item from the buffer
    fn next_item(&mut self) -> Option<Self::Item>;

    /// Clear the internal buffer
    fn clear(&mut self);
}

/// Encode a command to protocol bytes
pub trait EncodeCommand {
    /// Encode this command to bytes for transmission
    fn encode(&self) -> Vec<u8>;
}
