//! Frontend and sweep parameter types
//!
//! User-facing strings ("Main Port", "±10 mA", "1kHz", "100mV") are parsed
//! into closed enums and numbers here, before anything reaches the wire.

use std::str::FromStr;

use crate::error::ValidationError;

/// Electrode configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MeasurementMode {
    TwoPoint,
    ThreePoint,
    FourPoint,
}

impl MeasurementMode {
    /// Select a mode from its electrode count
    pub fn from_points(points: u8) -> Result<Self, ValidationError> {
        match points {
            2 => Ok(MeasurementMode::TwoPoint),
            3 => Ok(MeasurementMode::ThreePoint),
            4 => Ok(MeasurementMode::FourPoint),
            other => Err(ValidationError::UnknownValue {
                field: "measurement mode",
                value: other.to_string(),
            }),
        }
    }

    /// Wire code
    ///
    /// The device numbers 4-point before 3-point.
    pub fn code(self) -> u8 {
        match self {
            MeasurementMode::TwoPoint => 0x01,
            MeasurementMode::FourPoint => 0x02,
            MeasurementMode::ThreePoint => 0x03,
        }
    }

    /// Decode a wire code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(MeasurementMode::TwoPoint),
            0x02 => Some(MeasurementMode::FourPoint),
            0x03 => Some(MeasurementMode::ThreePoint),
            _ => None,
        }
    }

    /// Number of electrodes
    pub fn points(self) -> u8 {
        match self {
            MeasurementMode::TwoPoint => 2,
            MeasurementMode::ThreePoint => 3,
            MeasurementMode::FourPoint => 4,
        }
    }
}

impl FromStr for MeasurementMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace([' ', '-'], "");
        let digits = normalized.trim_end_matches("point");
        match digits.parse::<u8>() {
            Ok(points) => Self::from_points(points),
            Err(_) => Err(ValidationError::UnknownValue {
                field: "measurement mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Physical port the electrodes are attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MeasurementChannel {
    /// BNC / main port
    Main,
    /// First extension port
    Extension,
    /// Second extension port (internal multiplexer)
    Extension2,
}

impl MeasurementChannel {
    pub fn code(self) -> u8 {
        match self {
            MeasurementChannel::Main => 0x01,
            MeasurementChannel::Extension => 0x02,
            MeasurementChannel::Extension2 => 0x03,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(MeasurementChannel::Main),
            0x02 => Some(MeasurementChannel::Extension),
            0x03 => Some(MeasurementChannel::Extension2),
            _ => None,
        }
    }
}

impl FromStr for MeasurementChannel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bnc port" | "port 1" | "main port" => Ok(MeasurementChannel::Main),
            "extension port" | "extensionport" => Ok(MeasurementChannel::Extension),
            "extension port 2" | "extensionport2" | "port 2" | "internalmux" => {
                Ok(MeasurementChannel::Extension2)
            }
            _ => Err(ValidationError::UnknownValue {
                field: "measurement channel",
                value: s.to_string(),
            }),
        }
    }
}

/// Current measurement range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CurrentRange {
    Autoranging,
    /// ±10 mA (100 Ω shunt)
    Milli10,
    /// ±100 µA (10 kΩ shunt)
    Micro100,
    /// ±1 µA (1 MΩ shunt)
    Micro1,
    /// ±10 nA (100 MΩ shunt)
    Nano10,
}

impl CurrentRange {
    pub fn code(self) -> u8 {
        match self {
            CurrentRange::Autoranging => 0x00,
            CurrentRange::Milli10 => 0x01,
            CurrentRange::Micro100 => 0x02,
            CurrentRange::Micro1 => 0x04,
            CurrentRange::Nano10 => 0x06,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(CurrentRange::Autoranging),
            0x01 => Some(CurrentRange::Milli10),
            0x02 => Some(CurrentRange::Micro100),
            0x04 => Some(CurrentRange::Micro1),
            0x06 => Some(CurrentRange::Nano10),
            _ => None,
        }
    }
}

impl FromStr for CurrentRange {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .trim()
            .to_lowercase()
            .replace(['±', ' '], "")
            .replace('µ', "u");
        match normalized.as_str() {
            "autoranging" => Ok(CurrentRange::Autoranging),
            "10ma" | "100" => Ok(CurrentRange::Milli10),
            "100ua" | "10k" => Ok(CurrentRange::Micro100),
            "1ua" | "1m" => Ok(CurrentRange::Micro1),
            "10na" | "100m" => Ok(CurrentRange::Nano10),
            _ => Err(ValidationError::UnknownValue {
                field: "current range",
                value: s.to_string(),
            }),
        }
    }
}

/// Voltage measurement range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VoltageRange {
    Autoranging,
    /// ±1 V
    Volt1,
    /// ±0.09 V
    Milli90,
}

impl VoltageRange {
    pub fn code(self) -> u8 {
        match self {
            VoltageRange::Autoranging => 0x00,
            VoltageRange::Volt1 => 0x01,
            VoltageRange::Milli90 => 0x02,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(VoltageRange::Autoranging),
            0x01 => Some(VoltageRange::Volt1),
            0x02 => Some(VoltageRange::Milli90),
            _ => None,
        }
    }
}

impl FromStr for VoltageRange {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .trim()
            .to_lowercase()
            .replace('±', "")
            .replace(' ', "")
            .replace("+/-", "");
        match normalized.as_str() {
            "autoranging" => Ok(VoltageRange::Autoranging),
            "1v" => Ok(VoltageRange::Volt1),
            "0.09v" => Ok(VoltageRange::Milli90),
            _ => Err(ValidationError::UnknownValue {
                field: "voltage range",
                value: s.to_string(),
            }),
        }
    }
}

/// Frequency spacing of a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Scale {
    Linear,
    #[default]
    Log,
}

impl Scale {
    pub fn code(self) -> u8 {
        match self {
            Scale::Linear => 0x00,
            Scale::Log => 0x01,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Scale::Linear),
            0x01 => Some(Scale::Log),
            _ => None,
        }
    }
}

impl FromStr for Scale {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" | "lin" => Ok(Scale::Linear),
            "log" | "logarithmic" => Ok(Scale::Log),
            _ => Err(ValidationError::UnknownValue {
                field: "scale",
                value: s.to_string(),
            }),
        }
    }
}

/// Whether the excitation amplitude is a voltage or a current
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExcitationType {
    #[default]
    Voltage,
    Current,
}

impl ExcitationType {
    /// Accepted amplitude range in volts or amperes
    pub fn amplitude_limits(self) -> (f64, f64) {
        match self {
            ExcitationType::Voltage => (0.0001, 1.0),
            ExcitationType::Current => (0.000_001, 0.01),
        }
    }
}

impl FromStr for ExcitationType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "voltage" => Ok(ExcitationType::Voltage),
            "current" => Ok(ExcitationType::Current),
            _ => Err(ValidationError::UnknownValue {
                field: "excitation type",
                value: s.to_string(),
            }),
        }
    }
}

/// Complete frontend configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrontendSettings {
    pub mode: MeasurementMode,
    pub channel: MeasurementChannel,
    pub current_range: CurrentRange,
    pub voltage_range: VoltageRange,
}

impl FrontendSettings {
    /// Parse and validate frontend settings from boundary values
    pub fn new(
        points: u8,
        channel: &str,
        current_range: &str,
        voltage_range: &str,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            mode: MeasurementMode::from_points(points)?,
            channel: channel.parse()?,
            current_range: current_range.parse()?,
            voltage_range: voltage_range.parse()?,
        })
    }
}

impl Default for FrontendSettings {
    fn default() -> Self {
        Self {
            mode: MeasurementMode::FourPoint,
            channel: MeasurementChannel::Main,
            current_range: CurrentRange::Autoranging,
            voltage_range: VoltageRange::Volt1,
        }
    }
}

/// Split a number from its unit suffix, returning the scaled value
fn parse_with_units(
    field: &'static str,
    input: &str,
    units: &[(&str, f64)],
) -> Result<f64, ValidationError> {
    let normalized = input.trim().to_lowercase().replace(' ', "").replace('µ', "u");
    let (number, multiplier) = units
        .iter()
        .find_map(|(suffix, mult)| normalized.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((normalized.as_str(), 1.0));

    match number.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value * multiplier),
        _ => Err(ValidationError::InvalidNumber {
            field,
            value: input.to_string(),
        }),
    }
}

/// Parse a frequency such as "1kHz", "10 MHz", "500hz" or "2500" into Hz
pub fn parse_frequency(input: &str) -> Result<f64, ValidationError> {
    parse_with_units(
        "frequency",
        input,
        &[("khz", 1e3), ("mhz", 1e6), ("ghz", 1e9), ("hz", 1.0)],
    )
}

/// Parse an amplitude such as "100mV" or "10 µA" into volts or amperes
///
/// Unit suffixes must match the excitation type; "10mA" for a voltage
/// excitation is rejected.
pub fn parse_amplitude(input: &str, excitation: ExcitationType) -> Result<f64, ValidationError> {
    let units: &[(&str, f64)] = match excitation {
        ExcitationType::Voltage => &[("mv", 1e-3), ("uv", 1e-6), ("v", 1.0)],
        ExcitationType::Current => &[("ma", 1e-3), ("ua", 1e-6), ("na", 1e-9), ("a", 1.0)],
    };
    parse_with_units("amplitude", input, units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_mode_codes() {
        assert_eq!(MeasurementMode::from_points(2).unwrap().code(), 0x01);
        assert_eq!(MeasurementMode::from_points(3).unwrap().code(), 0x03);
        assert_eq!(MeasurementMode::from_points(4).unwrap().code(), 0x02);
        assert!(MeasurementMode::from_points(5).is_err());
        assert_eq!("4-point".parse::<MeasurementMode>().unwrap(), MeasurementMode::FourPoint);
    }

    #[test]
    fn test_channel_aliases() {
        for name in ["BNC Port", "Port 1", " main port "] {
            assert_eq!(name.parse::<MeasurementChannel>().unwrap().code(), 0x01);
        }
        for name in ["Extension Port", "ExtensionPort"] {
            assert_eq!(name.parse::<MeasurementChannel>().unwrap().code(), 0x02);
        }
        for name in ["Extension Port 2", "Extensionport2", "Port 2", "InternalMux"] {
            assert_eq!(name.parse::<MeasurementChannel>().unwrap().code(), 0x03);
        }
        assert!(matches!(
            "Port 3".parse::<MeasurementChannel>(),
            Err(ValidationError::UnknownValue { .. })
        ));
    }

    #[test]
    fn test_current_range_normalization() {
        assert_eq!("±10 mA".parse::<CurrentRange>().unwrap(), CurrentRange::Milli10);
        assert_eq!("100 µA".parse::<CurrentRange>().unwrap(), CurrentRange::Micro100);
        assert_eq!("1M".parse::<CurrentRange>().unwrap().code(), 0x04);
        assert_eq!("100M".parse::<CurrentRange>().unwrap().code(), 0x06);
        assert_eq!("Autoranging".parse::<CurrentRange>().unwrap().code(), 0x00);
        assert!("5mA".parse::<CurrentRange>().is_err());
    }

    #[test]
    fn test_voltage_range_normalization() {
        assert_eq!("+ / - 1 v".parse::<VoltageRange>().unwrap(), VoltageRange::Volt1);
        assert_eq!("+/-0.09V".parse::<VoltageRange>().unwrap(), VoltageRange::Milli90);
        assert_eq!(" ± 0.09 v ".parse::<VoltageRange>().unwrap(), VoltageRange::Milli90);
        assert_eq!(" Autoranging ".parse::<VoltageRange>().unwrap(), VoltageRange::Autoranging);
        assert!("2V".parse::<VoltageRange>().is_err());
    }

    #[test]
    fn test_scale_aliases() {
        assert_eq!("lin".parse::<Scale>().unwrap(), Scale::Linear);
        assert_eq!("logarithmic".parse::<Scale>().unwrap().code(), 0x01);
        assert!("cubic".parse::<Scale>().is_err());
    }

    #[test]
    fn test_parse_frequency() {
        assert_eq!(parse_frequency("1kHz").unwrap(), 1000.0);
        assert_eq!(parse_frequency("10 MHz").unwrap(), 10_000_000.0);
        assert_eq!(parse_frequency("500hz").unwrap(), 500.0);
        assert_eq!(parse_frequency("2500").unwrap(), 2500.0);
        assert!(matches!(
            parse_frequency("fast"),
            Err(ValidationError::InvalidNumber { field: "frequency", .. })
        ));
    }

    #[test]
    fn test_parse_amplitude() {
        let v = parse_amplitude("100mV", ExcitationType::Voltage).unwrap();
        assert!((v - 0.1).abs() < 1e-12);
        let a = parse_amplitude("10 µA", ExcitationType::Current).unwrap();
        assert!((a - 1e-5).abs() < 1e-15);
        assert!(parse_amplitude("10mA", ExcitationType::Voltage).is_err());
    }

    #[test]
    fn test_frontend_settings_new() {
        let fs = FrontendSettings::new(4, "Main Port", "10mA", "autoranging").unwrap();
        assert_eq!(fs.mode, MeasurementMode::FourPoint);
        assert_eq!(fs.channel, MeasurementChannel::Main);
        assert_eq!(fs.current_range, CurrentRange::Milli10);
        assert_eq!(fs.voltage_range, VoltageRange::Autoranging);

        assert!(FrontendSettings::new(1, "Main Port", "10mA", "1V").is_err());
    }
}
