//! LCR-1 SCPI command set
//!
//! The LCR-1 speaks line-oriented ASCII: every command is terminated with
//! `\n`, every set command is answered with `OK` or `NOT OK`, and every query
//! is answered with a value line followed by an acknowledgement line. While
//! triggered, the meter emits one `first,second` reading per line.

use crate::{EncodeCommand, ProtocolCodec};

/// Longest line kept before the buffer is trimmed
const MAX_LINE_LEN: usize = 256;

/// Acknowledgement line
pub const ACK: &str = "OK";
/// Negative acknowledgement line
pub const NACK: &str = "NOT OK";

/// Excitation source selected with `LEVEL:TYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LevelType {
    Voltage,
    Current,
}

impl LevelType {
    fn as_str(self) -> &'static str {
        match self {
            LevelType::Voltage => "V",
            LevelType::Current => "I",
        }
    }
}

/// Settings that can be read back with a `?` query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScpiSetting {
    Mode,
    LevelType,
    LevelVoltage,
    LevelCurrent,
    AutoRange,
    Aperture,
    MeasurementMode,
    MeasurementModel,
    Frequency,
}

impl ScpiSetting {
    pub fn header(self) -> &'static str {
        match self {
            ScpiSetting::Mode => "MODE",
            ScpiSetting::LevelType => "LEVEL:TYPE",
            ScpiSetting::LevelVoltage => "LEVEL:VOLTAGE",
            ScpiSetting::LevelCurrent => "LEVEL:CURRENT",
            ScpiSetting::AutoRange => "FUNCTION:IMPEDANCE:RANGE:AUTO",
            ScpiSetting::Aperture => "APERTURE",
            ScpiSetting::MeasurementMode => "FUNCTION:MEASUREMENT:MODE",
            ScpiSetting::MeasurementModel => "FUNCTION:MEASUREMENT:TYPE",
            ScpiSetting::Frequency => "FREQUENCY",
        }
    }
}

/// Commands understood by the LCR-1
#[derive(Debug, Clone, PartialEq)]
pub enum ScpiCommand {
    /// `*IDN?`
    Identify,
    /// `*RST`
    Reset,
    /// `MODE LCR`
    ModeLcr,
    LevelType(LevelType),
    /// Excitation voltage in volts
    LevelVoltage(f64),
    /// Excitation current in amperes
    LevelCurrent(f64),
    AutoRange(bool),
    /// Integration time setting
    Aperture(u8),
    /// Electrode configuration (2 or 4)
    MeasurementMode(u8),
    /// Equivalent-circuit model number
    MeasurementModel(u8),
    /// Measurement frequency in Hz
    Frequency(f64),
    /// `*TRG`, start continuous readings
    Trigger,
    /// `ABORT`, stop readings
    Abort,
    /// Read back a setting
    Query(ScpiSetting),
}

impl ScpiCommand {
    /// Command line without terminator
    pub fn line(&self) -> String {
        match self {
            ScpiCommand::Identify => "*IDN?".to_string(),
            ScpiCommand::Reset => "*RST".to_string(),
            ScpiCommand::ModeLcr => "MODE LCR".to_string(),
            ScpiCommand::LevelType(t) => format!("LEVEL:TYPE {}", t.as_str()),
            ScpiCommand::LevelVoltage(v) => format!("LEVEL:VOLTAGE {}", v),
            ScpiCommand::LevelCurrent(a) => format!("LEVEL:CURRENT {}", a),
            ScpiCommand::AutoRange(on) => {
                format!("FUNCTION:IMPEDANCE:RANGE:AUTO {}", u8::from(*on))
            }
            ScpiCommand::Aperture(n) => format!("APERTURE {}", n),
            ScpiCommand::MeasurementMode(n) => format!("FUNCTION:MEASUREMENT:MODE {}", n),
            ScpiCommand::MeasurementModel(n) => format!("FUNCTION:MEASUREMENT:TYPE {}", n),
            ScpiCommand::Frequency(hz) => format!("FREQUENCY {}", hz),
            ScpiCommand::Trigger => "*TRG".to_string(),
            ScpiCommand::Abort => "ABORT".to_string(),
            ScpiCommand::Query(setting) => format!("{}?", setting.header()),
        }
    }

    /// Whether the meter answers with a value line before the acknowledgement
    pub fn is_query(&self) -> bool {
        matches!(self, ScpiCommand::Identify | ScpiCommand::Query(_))
    }

    /// Setting written by this command, for reading it back
    pub fn setting(&self) -> Option<ScpiSetting> {
        let setting = match self {
            ScpiCommand::ModeLcr => ScpiSetting::Mode,
            ScpiCommand::LevelType(_) => ScpiSetting::LevelType,
            ScpiCommand::LevelVoltage(_) => ScpiSetting::LevelVoltage,
            ScpiCommand::LevelCurrent(_) => ScpiSetting::LevelCurrent,
            ScpiCommand::AutoRange(_) => ScpiSetting::AutoRange,
            ScpiCommand::Aperture(_) => ScpiSetting::Aperture,
            ScpiCommand::MeasurementMode(_) => ScpiSetting::MeasurementMode,
            ScpiCommand::MeasurementModel(_) => ScpiSetting::MeasurementModel,
            ScpiCommand::Frequency(_) => ScpiSetting::Frequency,
            ScpiCommand::Identify
            | ScpiCommand::Reset
            | ScpiCommand::Trigger
            | ScpiCommand::Abort
            | ScpiCommand::Query(_) => return None,
        };
        Some(setting)
    }
}

impl EncodeCommand for ScpiCommand {
    fn encode(&self) -> Vec<u8> {
        let mut bytes = self.line().into_bytes();
        bytes.push(b'\n');
        bytes
    }
}

/// Range fault reported between readings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeFault {
    OverCurrent,
    OverVoltage,
}

/// One line received from the LCR-1
#[derive(Debug, Clone, PartialEq)]
pub enum ScpiLine {
    Ok,
    NotOk,
    OutOfRange(RangeFault),
    /// Two comma-separated measurement values
    Reading(f64, f64),
    /// Anything else (identity, query values)
    Text(String),
}

impl ScpiLine {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            ACK => return ScpiLine::Ok,
            NACK => return ScpiLine::NotOk,
            "Out of range: Over current detected" => {
                return ScpiLine::OutOfRange(RangeFault::OverCurrent)
            }
            "Out of range: Over voltage detected" => {
                return ScpiLine::OutOfRange(RangeFault::OverVoltage)
            }
            _ => {}
        }

        if let Some((first, second)) = line.split_once(',') {
            if let (Ok(a), Ok(b)) = (first.trim().parse::<f64>(), second.trim().parse::<f64>()) {
                return ScpiLine::Reading(a, b);
            }
        }
        ScpiLine::Text(line.to_string())
    }
}

/// Streaming line codec for LCR-1 replies
#[derive(Debug, Default)]
pub struct ScpiCodec {
    buffer: Vec<u8>,
}

impl ScpiCodec {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(64),
        }
    }
}

impl ProtocolCodec for ScpiCodec {
    type Item = ScpiLine;

    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        // Prevent buffer overflow from a link that never sends a newline
        if self.buffer.len() > MAX_LINE_LEN * 4 {
            let start = self.buffer.len() - MAX_LINE_LEN;
            self.buffer.drain(..start);
        }
    }

    fn next_item(&mut self) -> Option<ScpiLine> {
        loop {
            let end = self.buffer.iter().position(|&b| b == b'\n')?;
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let text = String::from_utf8_lossy(&raw);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            return Some(ScpiLine::parse(text));
        }
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}
