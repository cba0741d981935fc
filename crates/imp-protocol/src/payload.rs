//! Typed commands and responses carried inside frames
//!
//! # Payload Table
//! ```text
//! tag   option  direction  payload
//! 0x18  code    device     [acknowledged tag] or empty
//! 0xA1  0x00    host       -
//! 0xB0  mode    host       current, voltage, (channel, ext_hi, ext_lo) x electrodes
//! 0xB1  0x00    host       -
//! 0xB1  mode    device     same layout as 0xB0
//! 0xB6  0x01    host       - (reset setup)
//! 0xB6  0x03    host       start f32, end f32, count f32, scale u8, precision f32, amplitude f32
//! 0xB8  0x00    host       - (stop)
//! 0xB8  0x01    host       spectra u16
//! 0xB8  0x02    device     frequency_id u16, real f32, imaginary f32
//! 0xD1  0x00    host       -
//! 0xD1  0x00    device     identity bytes
//! ```
//!
//! All multi-byte values are big-endian.

use crate::error::DecodeError;
use crate::frame::{Frame, Tag};
use crate::params::{
    CurrentRange, MeasurementChannel, MeasurementMode, FrontendSettings, Scale, VoltageRange,
};
use crate::sweep::SweepSpec;

/// Setup option: clear all sweep blocks
pub const SETUP_RESET: u8 = 0x01;
/// Setup option: append one sweep block
pub const SETUP_ADD_SWEEP: u8 = 0x03;
/// Measurement option: stop
pub const MEASUREMENT_STOP: u8 = 0x00;
/// Measurement option: start
pub const MEASUREMENT_START: u8 = 0x01;
/// Measurement option: one data point
pub const MEASUREMENT_DATA: u8 = 0x02;

/// Length of an add-sweep payload
pub const SWEEP_BLOCK_LEN: usize = 21;
/// Length of a measurement data payload
pub const DATA_POINT_LEN: usize = 10;

/// Commands the host sends to the analyzer
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Query the device identity
    Identify,
    /// Reboot the device firmware
    SoftwareReset,
    /// Apply frontend settings
    SetFrontend(FrontendSettings),
    /// Read back the frontend settings
    QueryFrontend,
    /// Clear the measurement setup
    ResetSetup,
    /// Append a sweep block to the measurement setup
    AddSweep(SweepBlock),
    /// Start measuring for the given number of spectra
    StartMeasurement { spectra: u16 },
    /// Stop a running measurement
    StopMeasurement,
}

impl Command {
    pub fn tag(&self) -> Tag {
        match self {
            Command::Identify => Tag::DeviceId,
            Command::SoftwareReset => Tag::SoftwareReset,
            Command::SetFrontend(_) => Tag::SetFrontend,
            Command::QueryFrontend => Tag::GetFrontend,
            Command::ResetSetup | Command::AddSweep(_) => Tag::Setup,
            Command::StartMeasurement { .. } | Command::StopMeasurement => Tag::Measurement,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify => "identify",
            Command::SoftwareReset => "software reset",
            Command::SetFrontend(_) => "set frontend",
            Command::QueryFrontend => "query frontend",
            Command::ResetSetup => "reset setup",
            Command::AddSweep(_) => "add sweep",
            Command::StartMeasurement { .. } => "start measurement",
            Command::StopMeasurement => "stop measurement",
        }
    }

    /// Tag of the data reply this command expects, if it is a query
    ///
    /// Non-query commands are answered by a system message only.
    pub fn reply_tag(&self) -> Option<Tag> {
        match self {
            Command::Identify => Some(Tag::DeviceId),
            Command::QueryFrontend => Some(Tag::GetFrontend),
            _ => None,
        }
    }

    /// Build the wire frame for this command
    pub fn to_frame(&self) -> Frame {
        match self {
            Command::Identify => Frame::build(Tag::DeviceId, 0x00, Vec::new()),
            Command::SoftwareReset => Frame::build(Tag::SoftwareReset, 0x00, Vec::new()),
            Command::SetFrontend(fs) => {
                Frame::build(Tag::SetFrontend, fs.mode.code(), frontend_payload(fs))
            }
            Command::QueryFrontend => Frame::build(Tag::GetFrontend, 0x00, Vec::new()),
            Command::ResetSetup => Frame::build(Tag::Setup, SETUP_RESET, Vec::new()),
            Command::AddSweep(block) => {
                Frame::build(Tag::Setup, SETUP_ADD_SWEEP, block.to_bytes().to_vec())
            }
            Command::StartMeasurement { spectra } => Frame::build(
                Tag::Measurement,
                MEASUREMENT_START,
                spectra.to_be_bytes().to_vec(),
            ),
            Command::StopMeasurement => {
                Frame::build(Tag::Measurement, MEASUREMENT_STOP, Vec::new())
            }
        }
    }

    /// Interpret a frame received from the host
    pub fn from_frame(frame: &Frame) -> Result<Self, DecodeError> {
        match (frame.tag, frame.option) {
            (Tag::DeviceId, _) => Ok(Command::Identify),
            (Tag::SoftwareReset, _) => Ok(Command::SoftwareReset),
            (Tag::SetFrontend, mode) => Ok(Command::SetFrontend(decode_frontend(
                mode,
                &frame.payload,
            )?)),
            (Tag::GetFrontend, _) => Ok(Command::QueryFrontend),
            (Tag::Setup, SETUP_RESET) => Ok(Command::ResetSetup),
            (Tag::Setup, SETUP_ADD_SWEEP) => {
                Ok(Command::AddSweep(SweepBlock::from_bytes(&frame.payload)?))
            }
            (Tag::Measurement, MEASUREMENT_START) => {
                let bytes: [u8; 2] = frame.payload.as_slice().try_into().map_err(|_| {
                    DecodeError::MalformedPayload {
                        expected: 2,
                        actual: frame.payload.len(),
                    }
                })?;
                Ok(Command::StartMeasurement {
                    spectra: u16::from_be_bytes(bytes),
                })
            }
            (Tag::Measurement, MEASUREMENT_STOP) => Ok(Command::StopMeasurement),
            (Tag::Setup, option) => Err(DecodeError::InvalidField {
                field: "setup option",
                value: option,
            }),
            (Tag::Measurement, option) => Err(DecodeError::InvalidField {
                field: "measurement option",
                value: option,
            }),
            (Tag::SystemMessage, option) => Err(DecodeError::InvalidField {
                field: "command tag",
                value: option,
            }),
        }
    }
}

/// Electrodes addressed by each measurement mode
fn electrode_count(mode: MeasurementMode) -> usize {
    mode.points() as usize
}

fn frontend_payload(fs: &FrontendSettings) -> Vec<u8> {
    let mut payload = vec![fs.current_range.code(), fs.voltage_range.code()];
    for _ in 0..electrode_count(fs.mode) {
        // Extension channel number stays zero unless a multiplexer is addressed
        payload.extend_from_slice(&[fs.channel.code(), 0x00, 0x00]);
    }
    payload
}

fn decode_frontend(mode: u8, payload: &[u8]) -> Result<FrontendSettings, DecodeError> {
    let mode = MeasurementMode::from_code(mode).ok_or(DecodeError::InvalidField {
        field: "measurement mode",
        value: mode,
    })?;
    let expected = 2 + 3 * electrode_count(mode);
    if payload.len() != expected {
        return Err(DecodeError::MalformedPayload {
            expected,
            actual: payload.len(),
        });
    }
    let current_range = CurrentRange::from_code(payload[0]).ok_or(DecodeError::InvalidField {
        field: "current range",
        value: payload[0],
    })?;
    let voltage_range = VoltageRange::from_code(payload[1]).ok_or(DecodeError::InvalidField {
        field: "voltage range",
        value: payload[1],
    })?;
    let channel = MeasurementChannel::from_code(payload[2]).ok_or(DecodeError::InvalidField {
        field: "measurement channel",
        value: payload[2],
    })?;
    Ok(FrontendSettings {
        mode,
        channel,
        current_range,
        voltage_range,
    })
}

/// Sweep block as carried by the add-sweep command
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepBlock {
    pub start_hz: f32,
    pub end_hz: f32,
    pub count: f32,
    pub scale: Scale,
    pub precision: f32,
    pub amplitude: f32,
}

impl SweepBlock {
    pub fn to_bytes(&self) -> [u8; SWEEP_BLOCK_LEN] {
        let mut bytes = [0u8; SWEEP_BLOCK_LEN];
        bytes[0..4].copy_from_slice(&self.start_hz.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.end_hz.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.count.to_be_bytes());
        bytes[12] = self.scale.code();
        bytes[13..17].copy_from_slice(&self.precision.to_be_bytes());
        bytes[17..21].copy_from_slice(&self.amplitude.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != SWEEP_BLOCK_LEN {
            return Err(DecodeError::MalformedPayload {
                expected: SWEEP_BLOCK_LEN,
                actual: bytes.len(),
            });
        }
        let scale = Scale::from_code(bytes[12]).ok_or(DecodeError::InvalidField {
            field: "scale",
            value: bytes[12],
        })?;
        Ok(Self {
            start_hz: be_f32(&bytes[0..4]),
            end_hz: be_f32(&bytes[4..8]),
            count: be_f32(&bytes[8..12]),
            scale,
            precision: be_f32(&bytes[13..17]),
            amplitude: be_f32(&bytes[17..21]),
        })
    }

    /// Number of frequency points the block describes
    pub fn points(&self) -> u32 {
        self.count.round().max(0.0) as u32
    }
}

impl From<&SweepSpec> for SweepBlock {
    fn from(spec: &SweepSpec) -> Self {
        Self {
            start_hz: spec.start_hz as f32,
            end_hz: spec.end_hz as f32,
            count: spec.count as f32,
            scale: spec.scale,
            precision: spec.precision as f32,
            amplitude: spec.amplitude as f32,
        }
    }
}

fn be_f32(bytes: &[u8]) -> f32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    f32::from_be_bytes(raw)
}

/// System message codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MessageCode {
    NoMessage,
    CommunicationTimeout,
    WakeUp,
    TcpConnected,
    NotExecuted,
    NotRecognized,
    Ack,
    SystemReady,
    DataHoldup,
    Other(u8),
}

impl MessageCode {
    pub fn code(self) -> u8 {
        match self {
            MessageCode::NoMessage => 0x01,
            MessageCode::CommunicationTimeout => 0x02,
            MessageCode::WakeUp => 0x04,
            MessageCode::TcpConnected => 0x11,
            MessageCode::NotExecuted => 0x81,
            MessageCode::NotRecognized => 0x82,
            MessageCode::Ack => 0x83,
            MessageCode::SystemReady => 0x84,
            MessageCode::DataHoldup => 0x92,
            MessageCode::Other(code) => code,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            MessageCode::NoMessage => "no message inside the message buffer",
            MessageCode::CommunicationTimeout => "communication timeout, less data than expected",
            MessageCode::WakeUp => "system boot ready",
            MessageCode::TcpConnected => "valid TCP client-socket connection",
            MessageCode::NotExecuted => "command has not been executed",
            MessageCode::NotRecognized => "command could not be recognized",
            MessageCode::Ack => "command has been executed successfully",
            MessageCode::SystemReady => "system is operational and ready to receive data",
            MessageCode::DataHoldup => {
                "measurement data could not be sent via the master interface"
            }
            MessageCode::Other(_) => "unknown system message",
        }
    }

    pub fn is_nack(self) -> bool {
        matches!(self, MessageCode::NotExecuted | MessageCode::NotRecognized)
    }
}

impl From<u8> for MessageCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => MessageCode::NoMessage,
            0x02 => MessageCode::CommunicationTimeout,
            0x04 => MessageCode::WakeUp,
            0x11 => MessageCode::TcpConnected,
            0x81 => MessageCode::NotExecuted,
            0x82 => MessageCode::NotRecognized,
            0x83 => MessageCode::Ack,
            0x84 => MessageCode::SystemReady,
            0x92 => MessageCode::DataHoldup,
            other => MessageCode::Other(other),
        }
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X} ({})", self.code(), self.description())
    }
}

/// Status frame from the analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemMessage {
    pub code: MessageCode,
    /// Tag byte of the command this message answers, when the device names one
    pub acknowledged: Option<u8>,
}

impl SystemMessage {
    pub fn ack(tag: Tag) -> Self {
        Self {
            code: MessageCode::Ack,
            acknowledged: Some(tag.code()),
        }
    }

    pub fn nack(code: MessageCode, tag: Tag) -> Self {
        Self {
            code,
            acknowledged: Some(tag.code()),
        }
    }

    pub fn is_ack(&self) -> bool {
        self.code == MessageCode::Ack
    }

    pub fn is_nack(&self) -> bool {
        self.code.is_nack()
    }

    /// Whether this message answers a command with the given tag
    ///
    /// A message without a tag byte applies to whatever command is outstanding.
    pub fn refers_to(&self, tag: Tag) -> bool {
        self.acknowledged.map_or(true, |t| t == tag.code())
    }

    pub fn to_frame(&self) -> Frame {
        let payload = self.acknowledged.map(|t| vec![t]).unwrap_or_default();
        Frame::build(Tag::SystemMessage, self.code.code(), payload)
    }
}

/// One raw measurement sample as carried by a data frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub frequency_id: u16,
    pub real: f32,
    pub imaginary: f32,
}

impl DataPoint {
    pub fn to_frame(&self) -> Frame {
        let mut payload = Vec::with_capacity(DATA_POINT_LEN);
        payload.extend_from_slice(&self.frequency_id.to_be_bytes());
        payload.extend_from_slice(&self.real.to_be_bytes());
        payload.extend_from_slice(&self.imaginary.to_be_bytes());
        Frame::build(Tag::Measurement, MEASUREMENT_DATA, payload)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() != DATA_POINT_LEN {
            return Err(DecodeError::MalformedPayload {
                expected: DATA_POINT_LEN,
                actual: payload.len(),
            });
        }
        Ok(Self {
            frequency_id: u16::from_be_bytes([payload[0], payload[1]]),
            real: be_f32(&payload[2..6]),
            imaginary: be_f32(&payload[6..10]),
        })
    }
}

/// Device identity reply
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceIdentity {
    pub raw: Vec<u8>,
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = String::from_utf8_lossy(&self.raw);
        let text = text.trim_matches(char::from(0)).trim();
        if text.is_empty() {
            write!(f, "<no identity>")
        } else {
            write!(f, "{}", text)
        }
    }
}

/// Frames the analyzer sends to the host
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    System(SystemMessage),
    Identity(DeviceIdentity),
    Frontend(FrontendSettings),
    Data(DataPoint),
}

impl Response {
    pub fn from_frame(frame: &Frame) -> Result<Self, DecodeError> {
        match frame.tag {
            Tag::SystemMessage => Ok(Response::System(SystemMessage {
                code: MessageCode::from(frame.option),
                acknowledged: frame.payload.first().copied(),
            })),
            Tag::DeviceId => Ok(Response::Identity(DeviceIdentity {
                raw: frame.payload.clone(),
            })),
            Tag::GetFrontend => Ok(Response::Frontend(decode_frontend(
                frame.option,
                &frame.payload,
            )?)),
            Tag::Measurement if frame.option == MEASUREMENT_DATA => {
                Ok(Response::Data(DataPoint::from_payload(&frame.payload)?))
            }
            Tag::Measurement => Err(DecodeError::InvalidField {
                field: "measurement option",
                value: frame.option,
            }),
            other => Err(DecodeError::InvalidField {
                field: "response tag",
                value: other.code(),
            }),
        }
    }

    pub fn to_frame(&self) -> Frame {
        match self {
            Response::System(msg) => msg.to_frame(),
            Response::Identity(id) => {
                let mut raw = id.raw.clone();
                raw.truncate(Tag::DeviceId.max_payload_len());
                Frame::build(Tag::DeviceId, 0x00, raw)
            }
            Response::Frontend(fs) => {
                Frame::build(Tag::GetFrontend, fs.mode.code(), frontend_payload(fs))
            }
            Response::Data(point) => point.to_frame(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode;
    use crate::EncodeCommand;

    #[test]
    fn test_start_measurement_frame() {
        let frame = Command::StartMeasurement { spectra: 20 }.to_frame();
        assert_eq!(frame.encode(), vec![0xB8, 0x01, 0x02, 0x00, 0x14, 0xCF]);
    }

    #[test]
    fn test_set_frontend_layout() {
        let fs = FrontendSettings::new(4, "Main Port", "10mA", "autoranging").unwrap();
        let frame = Command::SetFrontend(fs).to_frame();
        assert_eq!(frame.tag, Tag::SetFrontend);
        assert_eq!(frame.option, 0x02);
        assert_eq!(frame.payload.len(), 14);
        assert_eq!(&frame.payload[..5], &[0x01, 0x00, 0x01, 0x00, 0x00]);

        let two_point = FrontendSettings::new(2, "Port 2", "autoranging", "1V").unwrap();
        let frame = Command::SetFrontend(two_point).to_frame();
        assert_eq!(frame.option, 0x01);
        assert_eq!(frame.payload, vec![0x00, 0x01, 0x03, 0x00, 0x00, 0x03, 0x00, 0x00]);
    }

    #[test]
    fn test_command_from_frame() {
        let fs = FrontendSettings::new(3, "Extension Port", "1uA", "0.09V").unwrap();
        let commands = [
            Command::Identify,
            Command::SoftwareReset,
            Command::SetFrontend(fs),
            Command::QueryFrontend,
            Command::ResetSetup,
            Command::StartMeasurement { spectra: 300 },
            Command::StopMeasurement,
        ];
        for cmd in commands {
            let frame = decode(&cmd.to_frame().encode()).unwrap();
            assert_eq!(Command::from_frame(&frame).unwrap(), cmd);
        }
    }

    #[test]
    fn test_sweep_block_layout() {
        let block = SweepBlock {
            start_hz: 1000.0,
            end_hz: 1_000_000.0,
            count: 60.0,
            scale: Scale::Log,
            precision: 1.0,
            amplitude: 0.1,
        };
        let bytes = block.to_bytes();
        assert_eq!(&bytes[0..4], &1000.0f32.to_be_bytes());
        assert_eq!(bytes[12], 0x01);
        assert_eq!(SweepBlock::from_bytes(&bytes).unwrap(), block);
        assert_eq!(block.points(), 60);

        assert_eq!(
            SweepBlock::from_bytes(&bytes[..20]),
            Err(DecodeError::MalformedPayload {
                expected: 21,
                actual: 20
            })
        );
    }

    #[test]
    fn test_system_message_refers_to() {
        let ack = SystemMessage::ack(Tag::SetFrontend);
        assert!(ack.is_ack());
        assert!(ack.refers_to(Tag::SetFrontend));
        assert!(!ack.refers_to(Tag::Setup));

        let bare = SystemMessage {
            code: MessageCode::Ack,
            acknowledged: None,
        };
        assert!(bare.refers_to(Tag::Setup));

        let nack = SystemMessage::nack(MessageCode::NotRecognized, Tag::Setup);
        assert!(nack.is_nack());
        assert_eq!(nack.to_frame().encode(), vec![0x18, 0x82, 0x01, 0xB6, 0x51]);
    }

    #[test]
    fn test_response_from_frame() {
        let frame = SystemMessage::ack(Tag::Measurement).to_frame();
        assert!(matches!(
            Response::from_frame(&frame),
            Ok(Response::System(SystemMessage { code: MessageCode::Ack, acknowledged: Some(0xB8) }))
        ));

        let point = DataPoint {
            frequency_id: 7,
            real: 100.5,
            imaginary: -20.25,
        };
        assert_eq!(
            Response::from_frame(&point.to_frame()).unwrap(),
            Response::Data(point)
        );

        let fs = FrontendSettings::default();
        assert_eq!(
            Response::from_frame(&Response::Frontend(fs).to_frame()).unwrap(),
            Response::Frontend(fs)
        );

        let unknown = Frame::new(Tag::SystemMessage, 0x55, vec![]).unwrap();
        assert!(matches!(
            Response::from_frame(&unknown),
            Ok(Response::System(SystemMessage { code: MessageCode::Other(0x55), .. }))
        ));
    }

    #[test]
    fn test_identity_display() {
        let id = DeviceIdentity {
            raw: b"ISX-3 v2\0".to_vec(),
        };
        assert_eq!(id.to_string(), "ISX-3 v2");
        assert_eq!(DeviceIdentity::default().to_string(), "<no identity>");
    }
}
