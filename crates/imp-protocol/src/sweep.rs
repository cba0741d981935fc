//! Frequency sweep definition and planning

use crate::error::ValidationError;
use crate::params::{parse_amplitude, parse_frequency, ExcitationType, Scale};

/// Lowest frequency the analyzer can excite, in Hz
pub const MIN_FREQUENCY_HZ: f64 = 1.0;
/// Highest frequency the analyzer can excite, in Hz
pub const MAX_FREQUENCY_HZ: f64 = 10_000_000.0;
/// Most frequency points in one sweep block
pub const MAX_POINTS: u32 = 1000;
pub const MIN_PRECISION: f64 = 0.0001;
pub const MAX_PRECISION: f64 = 1.0;
/// Most spectra a single start command can request
pub const MAX_SPECTRA: u32 = u16::MAX as u32;

/// A requested frequency sweep
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SweepSpec {
    /// First frequency in Hz
    pub start_hz: f64,
    /// Last frequency in Hz
    pub end_hz: f64,
    /// Number of frequency points
    pub count: u32,
    pub scale: Scale,
    /// Measurement precision factor (device unit, 0.0001..=1.0)
    pub precision: f64,
    /// Excitation amplitude in volts or amperes
    pub amplitude: f64,
    pub excitation: ExcitationType,
}

impl SweepSpec {
    /// Build a sweep from boundary strings, then validate it against device limits
    pub fn parse(
        start: &str,
        end: &str,
        count: u32,
        scale: &str,
        precision: f64,
        amplitude: &str,
        excitation: &str,
    ) -> Result<Self, ValidationError> {
        let excitation: ExcitationType = excitation.parse()?;
        let spec = Self {
            start_hz: parse_frequency(start)?,
            end_hz: parse_frequency(end)?,
            count,
            scale: scale.parse()?,
            precision,
            amplitude: parse_amplitude(amplitude, excitation)?,
            excitation,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Check the sweep against what the analyzer accepts
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_bounds(self.start_hz, self.end_hz, self.count)?;
        check_range("start frequency", self.start_hz, MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ)?;
        check_range("end frequency", self.end_hz, MIN_FREQUENCY_HZ, MAX_FREQUENCY_HZ)?;
        check_range("count", self.count as f64, 1.0, MAX_POINTS as f64)?;
        check_range("precision", self.precision, MIN_PRECISION, MAX_PRECISION)?;
        let (min, max) = self.excitation.amplitude_limits();
        check_range("amplitude", self.amplitude, min, max)?;
        Ok(())
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            value,
            min,
            max,
        })
    }
}

fn check_bounds(start: f64, end: f64, count: u32) -> Result<(), ValidationError> {
    if !(start.is_finite() && start > 0.0) {
        return Err(ValidationError::InvalidSweep(format!(
            "start frequency {start} is not a positive finite number"
        )));
    }
    if !(end.is_finite() && end > 0.0) {
        return Err(ValidationError::InvalidSweep(format!(
            "end frequency {end} is not a positive finite number"
        )));
    }
    if start >= end {
        return Err(ValidationError::InvalidSweep(format!(
            "start frequency {start} must be below end frequency {end}"
        )));
    }
    if count < 1 {
        return Err(ValidationError::InvalidSweep("count must be at least 1".into()));
    }
    Ok(())
}

/// Generate the ordered frequency list for a sweep
///
/// Only the sweep geometry is checked here; device limits are applied by
/// [`SweepSpec::validate`]. The last element is exactly `end_hz`.
pub fn plan(spec: &SweepSpec) -> Result<Vec<f64>, ValidationError> {
    check_bounds(spec.start_hz, spec.end_hz, spec.count)?;

    let start = spec.start_hz;
    let end = spec.end_hz;
    let count = spec.count as usize;

    if count == 1 {
        return Ok(vec![start]);
    }

    let steps = (count - 1) as f64;
    let mut frequencies: Vec<f64> = match spec.scale {
        Scale::Linear => {
            let step = (end - start) / steps;
            (0..count).map(|i| start + i as f64 * step).collect()
        }
        Scale::Log => {
            let ratio = end / start;
            (0..count)
                .map(|i| start * ratio.powf(i as f64 / steps))
                .collect()
        }
    };

    if let Some(last) = frequencies.last_mut() {
        *last = end;
    }
    Ok(frequencies)
}

/// Check a spectrum count and narrow it to the wire width
pub fn validate_spectra(spectra: u32) -> Result<u16, ValidationError> {
    check_range("spectra", spectra as f64, 1.0, MAX_SPECTRA as f64)?;
    Ok(spectra as u16)
}
