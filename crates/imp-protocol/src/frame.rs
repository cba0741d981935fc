//! Binary frame envelope
//!
//! Every command and response on the analyzer link travels in the same
//! envelope:
//!
//! # Frame Format
//! ```text
//! [tag] [option] [len] [payload...] [checksum]
//! ```
//!
//! - `tag`: Command group (see [`Tag`])
//! - `option`: Sub-command within the group
//! - `len`: Payload length in bytes (0..=255)
//! - `payload`: `len` bytes, layout defined per tag in [`crate::payload`]
//! - `checksum`: Sum of all preceding bytes modulo 256
//!
//! The envelope is validated here by tag, length and checksum only.

use crate::error::FramingError;
use crate::{EncodeCommand, ProtocolCodec};

/// Bytes before the payload: tag, option, length
pub const HEADER_LEN: usize = 3;

/// Smallest possible frame (empty payload)
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 1;

/// Largest payload the one-byte length field can describe
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Upper bound for the streaming buffer before old bytes are discarded
const MAX_BUFFER_LEN: usize = 4096;

/// Command and response tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Tag {
    /// System message (acknowledge, not-acknowledge, status)
    SystemMessage = 0x18,
    /// Software reset
    SoftwareReset = 0xA1,
    /// Set frontend settings
    SetFrontend = 0xB0,
    /// Read back frontend settings
    GetFrontend = 0xB1,
    /// Measurement setup (sweep definition)
    Setup = 0xB6,
    /// Measurement control and measurement data
    Measurement = 0xB8,
    /// Device identity query and reply
    DeviceId = 0xD1,
}

impl Tag {
    /// All recognized tags
    pub const ALL: [Tag; 7] = [
        Tag::SystemMessage,
        Tag::SoftwareReset,
        Tag::SetFrontend,
        Tag::GetFrontend,
        Tag::Setup,
        Tag::Measurement,
        Tag::DeviceId,
    ];

    /// Wire value of this tag
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Tag::SystemMessage => "system message",
            Tag::SoftwareReset => "software reset",
            Tag::SetFrontend => "set frontend",
            Tag::GetFrontend => "get frontend",
            Tag::Setup => "setup",
            Tag::Measurement => "measurement",
            Tag::DeviceId => "device id",
        }
    }

    /// Longest payload accepted for this tag
    ///
    /// Declared lengths above this are rejected before waiting for the bytes,
    /// which keeps resynchronization from swallowing valid frames behind a
    /// false frame start.
    pub fn max_payload_len(self) -> usize {
        match self {
            Tag::SystemMessage => 4,
            Tag::SoftwareReset => 0,
            Tag::SetFrontend | Tag::GetFrontend => 14,
            Tag::Setup => 21,
            Tag::Measurement => 10,
            Tag::DeviceId => 64,
        }
    }
}

impl TryFrom<u8> for Tag {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x18 => Ok(Tag::SystemMessage),
            0xA1 => Ok(Tag::SoftwareReset),
            0xB0 => Ok(Tag::SetFrontend),
            0xB1 => Ok(Tag::GetFrontend),
            0xB6 => Ok(Tag::Setup),
            0xB8 => Ok(Tag::Measurement),
            0xD1 => Ok(Tag::DeviceId),
            _ => Err(FramingError::UnknownTag(value)),
        }
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}

/// One decoded wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command group
    pub tag: Tag,
    /// Sub-command
    pub option: u8,
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Checksum as carried on (or computed for) the wire
    pub checksum: u8,
}

impl Frame {
    /// Build a frame, computing its checksum
    pub fn new(tag: Tag, option: u8, payload: impl Into<Vec<u8>>) -> Result<Self, FramingError> {
        let payload = payload.into();
        let max = tag.max_payload_len();
        if payload.len() > max {
            return Err(FramingError::PayloadTooLong {
                tag: tag.code(),
                len: payload.len(),
                max,
            });
        }
        Ok(Self::build(tag, option, payload))
    }

    /// Build a frame whose payload length is known to fit the tag
    pub(crate) fn build(tag: Tag, option: u8, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= tag.max_payload_len());
        let checksum = frame_checksum(tag.code(), option, &payload);
        Self {
            tag,
            option,
            payload,
            checksum,
        }
    }

    /// Total length of this frame on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len() + 1
    }
}

impl EncodeCommand for Frame {
    fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.wire_len());
        bytes.push(self.tag.code());
        bytes.push(self.option);
        bytes.push(self.payload.len() as u8);
        bytes.extend_from_slice(&self.payload);
        bytes.push(self.checksum);
        bytes
    }
}

/// Sum of `bytes` modulo 256
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn frame_checksum(tag: u8, option: u8, payload: &[u8]) -> u8 {
    tag.wrapping_add(option)
        .wrapping_add(payload.len() as u8)
        .wrapping_add(checksum(payload))
}

/// Encode a frame to wire bytes
pub fn encode(tag: Tag, option: u8, payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    Ok(Frame::new(tag, option, payload)?.encode())
}

/// Decode exactly one frame occupying all of `bytes`
pub fn decode(bytes: &[u8]) -> Result<Frame, FramingError> {
    let (frame, used) = decode_prefix(bytes)?;
    if used < bytes.len() {
        return Err(FramingError::TrailingBytes {
            extra: bytes.len() - used,
        });
    }
    Ok(frame)
}

/// Decode the frame at the start of `bytes`, returning it and its length
pub fn decode_prefix(bytes: &[u8]) -> Result<(Frame, usize), FramingError> {
    let Some(&first) = bytes.first() else {
        return Err(FramingError::Truncated {
            needed: MIN_FRAME_LEN,
        });
    };
    let tag = Tag::try_from(first)?;

    if bytes.len() < HEADER_LEN {
        return Err(FramingError::Truncated {
            needed: MIN_FRAME_LEN - bytes.len(),
        });
    }

    let len = bytes[2] as usize;
    let max = tag.max_payload_len();
    if len > max {
        return Err(FramingError::PayloadTooLong {
            tag: tag.code(),
            len,
            max,
        });
    }

    let total = HEADER_LEN + len + 1;
    if bytes.len() < total {
        return Err(FramingError::Truncated {
            needed: total - bytes.len(),
        });
    }

    let expected = checksum(&bytes[..total - 1]);
    let actual = bytes[total - 1];
    if expected != actual {
        return Err(FramingError::ChecksumMismatch { expected, actual });
    }

    let frame = Frame {
        tag,
        option: bytes[1],
        payload: bytes[HEADER_LEN..total - 1].to_vec(),
        checksum: actual,
    };
    Ok((frame, total))
}

/// Streaming frame codec
///
/// Accepts arbitrary chunks of the serial byte stream and yields frames as
/// they complete. After a framing error it drops one byte at a time and
/// rescans for the next byte sequence that parses as a valid frame. Only the
/// first error of a corrupted region is reported.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: Vec<u8>,
    resyncing: bool,
}

impl FrameCodec {
    /// Create an empty codec
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(64),
            resyncing: false,
        }
    }

    /// Number of bytes waiting to be parsed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Remove and return all unparsed bytes
    pub fn take_buffered(&mut self) -> Vec<u8> {
        self.resyncing = false;
        std::mem::take(&mut self.buffer)
    }

    /// Try to extract the next frame
    ///
    /// Returns `None` when more bytes are needed, `Some(Err(_))` once per
    /// corrupted region, and `Some(Ok(frame))` for each valid frame.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FramingError>> {
        loop {
            let &first = self.buffer.first()?;

            if Tag::try_from(first).is_err() {
                self.buffer.remove(0);
                if !self.resyncing {
                    self.resyncing = true;
                    return Some(Err(FramingError::UnknownTag(first)));
                }
                continue;
            }

            match decode_prefix(&self.buffer) {
                Ok((frame, used)) => {
                    self.buffer.drain(..used);
                    self.resyncing = false;
                    return Some(Ok(frame));
                }
                Err(FramingError::Truncated { .. }) => return None,
                Err(e) => {
                    self.buffer.remove(0);
                    if !self.resyncing {
                        self.resyncing = true;
                        tracing::debug!("Frame error, resynchronizing: {}", e);
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

impl ProtocolCodec for FrameCodec {
    type Item = Result<Frame, FramingError>;

    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        // Prevent unbounded growth if the link is delivering garbage
        if self.buffer.len() > MAX_BUFFER_LEN {
            let start = self.buffer.len() - MAX_BUFFER_LEN / 2;
            tracing::warn!("Frame buffer overflow, discarding {} bytes", start);
            self.buffer.drain(..start);
            self.resyncing = true;
        }
    }

    fn next_item(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.resyncing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_layout() {
        let bytes = encode(Tag::Measurement, 0x01, &[0x00, 0x02]).unwrap();
        assert_eq!(bytes, vec![0xB8, 0x01, 0x02, 0x00, 0x02, 0xBD]);
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[0xFF, 0x02]), 0x01);
        assert_eq!(checksum(&[]), 0x00);
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        assert_eq!(
            decode(&[0x42, 0x00, 0x00, 0x42]),
            Err(FramingError::UnknownTag(0x42))
        );
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = encode(Tag::Setup, 0x01, &[1, 2, 3]).unwrap();
        assert_eq!(
            decode(&bytes[..4]),
            Err(FramingError::Truncated { needed: 3 })
        );
        assert_eq!(
            decode(&bytes[..2]),
            Err(FramingError::Truncated { needed: 2 })
        );
    }

    #[test]
    fn test_decode_trailing_bytes() {
        let mut bytes = encode(Tag::SoftwareReset, 0x00, &[]).unwrap();
        bytes.push(0x00);
        assert_eq!(
            decode(&bytes),
            Err(FramingError::TrailingBytes { extra: 1 })
        );
    }

    #[test]
    fn test_payload_too_long() {
        let err = Frame::new(Tag::SoftwareReset, 0x00, vec![0x01]).unwrap_err();
        assert_eq!(
            err,
            FramingError::PayloadTooLong {
                tag: 0xA1,
                len: 1,
                max: 0
            }
        );
    }

    #[test]
    fn test_streaming_partial_frame() {
        let bytes = encode(Tag::DeviceId, 0x00, b"ISX-3").unwrap();
        let mut codec = FrameCodec::new();

        codec.push_bytes(&bytes[..4]);
        assert!(codec.next_frame().is_none());

        codec.push_bytes(&bytes[4..]);
        let frame = codec.next_frame().unwrap().unwrap();
        assert_eq!(frame.payload, b"ISX-3");
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_streaming_resync_reports_once() {
        let mut corrupted = encode(Tag::Measurement, 0x02, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        corrupted[5] ^= 0x40;
        let good = encode(Tag::SystemMessage, 0x83, &[0xB8]).unwrap();

        let mut codec = FrameCodec::new();
        codec.push_bytes(&corrupted);
        codec.push_bytes(&good);

        assert!(matches!(
            codec.next_frame(),
            Some(Err(FramingError::ChecksumMismatch { .. }))
        ));
        let frame = codec.next_frame().unwrap().unwrap();
        assert_eq!(frame.tag, Tag::SystemMessage);
        assert!(codec.next_frame().is_none());
    }

    #[test]
    fn test_streaming_skips_leading_garbage() {
        let good = encode(Tag::SoftwareReset, 0x00, &[]).unwrap();
        let mut codec = FrameCodec::new();
        codec.push_bytes(&[0x00, 0x11, 0x22]);
        codec.push_bytes(&good);

        assert_eq!(
            codec.next_frame(),
            Some(Err(FramingError::UnknownTag(0x00)))
        );
        assert_eq!(codec.next_frame().unwrap().unwrap().tag, Tag::SoftwareReset);
    }

    fn tag() -> impl Strategy<Value = Tag> {
        prop::sample::select(Tag::ALL.to_vec())
    }

    fn tag_option_payload() -> impl Strategy<Value = (Tag, u8, Vec<u8>)> {
        tag().prop_flat_map(|t| {
            (
                Just(t),
                any::<u8>(),
                prop::collection::vec(any::<u8>(), 0..=t.max_payload_len()),
            )
        })
    }

    proptest! {
        #[test]
        fn roundtrip_preserves_fields((t, option, payload) in tag_option_payload()) {
            let bytes = encode(t, option, &payload).unwrap();
            let frame = decode(&bytes).unwrap();
            prop_assert_eq!(frame.tag, t);
            prop_assert_eq!(frame.option, option);
            prop_assert_eq!(&frame.payload, &payload);
            prop_assert_eq!(frame.checksum, *bytes.last().unwrap());
        }

        #[test]
        fn single_payload_byte_corruption_is_detected(
            payload in prop::collection::vec(any::<u8>(), 1..=10),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mut bytes = encode(Tag::Measurement, 0x02, &payload).unwrap();
            let i = HEADER_LEN + index.index(payload.len());
            bytes[i] ^= flip;
            let is_checksum_mismatch = matches!(
                decode(&bytes),
                Err(FramingError::ChecksumMismatch { .. })
            );
            prop_assert!(is_checksum_mismatch);
        }
    }
}
