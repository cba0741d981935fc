//! Measurement settings file

use std::path::{Path, PathBuf};

use imp_protocol::{Instrument, SweepSpec, ValidationError};
use imp_session::{LcrSettings, SerialConfig, SessionConfig};
use serde::{Deserialize, Serialize};

/// Frontend strings, parsed when the measurement starts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FrontendSection {
    /// Electrode configuration: 2, 3 or 4
    pub points: u8,
    pub channel: String,
    pub current_range: String,
    pub voltage_range: String,
}

impl Default for FrontendSection {
    fn default() -> Self {
        Self {
            points: 4,
            channel: "Main Port".to_string(),
            current_range: "autoranging".to_string(),
            voltage_range: "autoranging".to_string(),
        }
    }
}

/// Sweep strings as a user would type them ("1kHz", "100mV")
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SweepSection {
    pub start: String,
    pub end: String,
    pub count: u32,
    /// "linear" or "log"
    pub scale: String,
    pub precision: f64,
    pub amplitude: String,
    /// "voltage" or "current"
    pub excitation: String,
}

impl Default for SweepSection {
    fn default() -> Self {
        Self {
            start: "100Hz".to_string(),
            end: "1MHz".to_string(),
            count: 50,
            scale: "log".to_string(),
            precision: 1.0,
            amplitude: "100mV".to_string(),
            excitation: "voltage".to_string(),
        }
    }
}

impl SweepSection {
    pub fn to_spec(&self) -> Result<SweepSpec, ValidationError> {
        SweepSpec::parse(
            &self.start,
            &self.end,
            self.count,
            &self.scale,
            self.precision,
            &self.amplitude,
            &self.excitation,
        )
    }
}

/// Settings for one measurement run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_instrument")]
    pub instrument: Instrument,
    /// Run against a virtual instrument instead of the serial port
    #[serde(default)]
    pub simulated: bool,
    #[serde(default = "default_serial")]
    pub serial: SerialConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub frontend: FrontendSection,
    #[serde(default)]
    pub sweep: SweepSection,
    /// Sweep repetitions (ISX-3)
    #[serde(default = "default_spectra")]
    pub spectra: u32,
    #[serde(default)]
    pub lcr: LcrSettings,
    /// Readings per frequency (LCR-1)
    #[serde(default = "default_runs")]
    pub runs: usize,
    /// CSV output path
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// Software-reset the analyzer once the measurement is written
    #[serde(default)]
    pub reset_after: bool,
}

fn default_instrument() -> Instrument {
    Instrument::Isx3
}

fn default_serial() -> SerialConfig {
    SerialConfig::new(if cfg!(windows) { "COM3" } else { "/dev/ttyACM0" })
}

fn default_spectra() -> u32 {
    1
}

fn default_runs() -> usize {
    1
}

fn default_output() -> PathBuf {
    PathBuf::from("measurement.csv")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            instrument: default_instrument(),
            simulated: false,
            serial: default_serial(),
            session: SessionConfig::default(),
            frontend: FrontendSection::default(),
            sweep: SweepSection::default(),
            spectra: default_spectra(),
            lcr: LcrSettings::default(),
            runs: default_runs(),
            output: default_output(),
            reset_after: false,
        }
    }
}

impl Settings {
    /// Get the XDG config directory for impedance
    /// Uses $XDG_CONFIG_HOME/impedance, falls back to ~/.config/impedance
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("impedance"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("impedance"))
    }

    /// Default settings file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings
    ///
    /// An explicit path must exist. The default path falls back to built-in
    /// settings when the file is absent; a malformed file is always an error.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No settings at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(format!("Failed to read {}: {}", path.display(), e)),
        };

        let settings = Self::from_json(&text)
            .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;
        tracing::info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Write settings as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create settings directory: {}", e))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;

        std::fs::write(path, json).map_err(|e| format!("Failed to write settings: {}", e))?;

        Ok(())
    }
}
