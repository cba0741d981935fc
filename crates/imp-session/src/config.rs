//! Session and serial transport configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

/// Timing and retry policy for a device session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Deadline for a configuration or control response in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
    /// Longest gap between measurement frames in milliseconds
    #[serde(default = "default_frame_timeout")]
    pub frame_timeout_ms: u64,
    /// Slice length for reads while a measurement streams, in milliseconds
    ///
    /// The stop flag is checked between slices.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Extra attempts for configuration commands that time out
    #[serde(default)]
    pub config_retries: u32,
    /// Wait after a software reset before the device accepts commands
    #[serde(default = "default_reset_settle")]
    pub reset_settle_ms: u64,
}

fn default_command_timeout() -> u64 {
    2000
}

fn default_frame_timeout() -> u64 {
    10_000
}

fn default_poll_interval() -> u64 {
    100
}

fn default_reset_settle() -> u64 {
    6000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout(),
            frame_timeout_ms: default_frame_timeout(),
            poll_interval_ms: default_poll_interval(),
            config_retries: 0,
            reset_settle_ms: default_reset_settle(),
        }
    }
}

impl SessionConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }
}

/// Serial port parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialConfig {
    /// Serial port path (e.g. `/dev/ttyACM0`, `COM3`)
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// Driver-level read timeout in milliseconds
    #[serde(default = "default_serial_timeout")]
    pub timeout_ms: u64,
}

fn default_baud() -> u32 {
    9600
}

fn default_serial_timeout() -> u64 {
    100
}

impl SerialConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud(),
            timeout_ms: default_serial_timeout(),
        }
    }

    /// Open the port as 8N1
    pub fn open(&self) -> Result<SerialStream, tokio_serial::Error> {
        tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(self.timeout_ms))
            .open_native_async()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_secs(2));
        assert_eq!(config.config_retries, 0);
        assert_eq!(config.reset_settle(), Duration::from_secs(6));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"config_retries": 2}"#).unwrap();
        assert_eq!(config.config_retries, 2);
        assert_eq!(config.command_timeout_ms, 2000);
        assert_eq!(config.frame_timeout_ms, 10_000);

        let serial: SerialConfig = serde_json::from_str(r#"{"port": "COM3"}"#).unwrap();
        assert_eq!(serial, SerialConfig::new("COM3"));
    }
}
