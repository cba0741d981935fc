//! LCR-1 meter session over SCPI
//!
//! Every set command must be answered with `OK`. Queries return a value line
//! followed by the acknowledgement. A measurement at one frequency triggers
//! the meter, collects readings, then aborts and searches a bounded number of
//! lines for the abort acknowledgement.

use std::io::ErrorKind;
use std::time::Duration;

use imp_protocol::scpi::{LevelType, ScpiCodec, ScpiCommand, ScpiLine, ScpiSetting};
use imp_protocol::{plan, EncodeCommand, ProtocolCodec, SweepSpec, ValidationError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_serial::SerialStream;
use tracing::{debug, info, trace, warn};

use crate::config::SerialConfig;
use crate::error::SessionError;

/// Lines searched for the abort acknowledgement
const ABORT_SEARCH_LINES: usize = 10;

/// Meter configuration applied by [`LcrSession::configure`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LcrSettings {
    /// Excitation by voltage or by current
    pub level_type: LcrLevel,
    /// Excitation amplitude in volts or amperes
    pub level: f64,
    pub auto_range: bool,
    /// Integration time setting
    pub aperture: u8,
    /// Electrode configuration
    pub measurement_mode: u8,
    /// Equivalent-circuit model (4 = capacitance)
    pub model: u8,
    /// Read back every setting after it is acknowledged
    #[serde(default)]
    pub verify: bool,
}

/// Serializable excitation selector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LcrLevel {
    Voltage,
    Current,
}

impl From<LcrLevel> for LevelType {
    fn from(level: LcrLevel) -> Self {
        match level {
            LcrLevel::Voltage => LevelType::Voltage,
            LcrLevel::Current => LevelType::Current,
        }
    }
}

impl Default for LcrSettings {
    fn default() -> Self {
        Self {
            level_type: LcrLevel::Voltage,
            level: 0.1,
            auto_range: true,
            aperture: 1,
            measurement_mode: 4,
            model: 4,
            verify: false,
        }
    }
}

/// One reading at one frequency
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LcrReading {
    pub frequency_hz: f64,
    /// Zero-based run counter at this frequency
    pub run: usize,
    /// First reported parameter (model dependent)
    pub first: f64,
    /// Second reported parameter (model dependent)
    pub second: f64,
}

/// Session with one LCR-1 meter
pub struct LcrSession<T> {
    io: T,
    codec: ScpiCodec,
    buffer: Vec<u8>,
    timeout: Duration,
    identity: Option<String>,
    verify: bool,
}

impl LcrSession<SerialStream> {
    /// Open the serial port and identify the meter
    pub async fn connect(serial: &SerialConfig, timeout: Duration) -> Result<Self, SessionError> {
        let stream = serial
            .open()
            .map_err(|e| SessionError::Connection(format!("{}: {}", serial.port, e)))?;
        info!("Opened LCR-1 on {}", serial.port);
        Self::connect_with(stream, timeout).await
    }
}

impl<T> LcrSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an open channel; `timeout` bounds the wait for each line
    pub fn new(io: T, timeout: Duration) -> Self {
        Self {
            io,
            codec: ScpiCodec::new(),
            buffer: vec![0u8; 256],
            timeout,
            identity: None,
            verify: false,
        }
    }

    /// Wrap an open channel and identify the meter
    pub async fn connect_with(io: T, timeout: Duration) -> Result<Self, SessionError> {
        let mut session = Self::new(io, timeout);
        session.identify().await?;
        Ok(session)
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    async fn write(&mut self, command: &ScpiCommand) -> Result<(), SessionError> {
        let bytes = command.encode();
        trace!("TX: {:?}", command.line());
        self.io.write_all(&bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn next_line(&mut self) -> Result<ScpiLine, SessionError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(line) = self.codec.next_item() {
                trace!("RX: {:?}", line);
                return Ok(line);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::Timeout(self.timeout.as_millis() as u64));
            }
            match tokio::time::timeout(deadline - now, self.io.read(&mut self.buffer)).await {
                Ok(Ok(0)) => {
                    return Err(SessionError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "channel closed",
                    )))
                }
                Ok(Ok(n)) => self.codec.push_bytes(&self.buffer[..n]),
                Ok(Err(e)) => return Err(SessionError::Io(e)),
                Err(_) => return Err(SessionError::Timeout(self.timeout.as_millis() as u64)),
            }
        }
    }

    async fn expect_ack(&mut self, command: &ScpiCommand) -> Result<(), SessionError> {
        loop {
            match self.next_line().await? {
                ScpiLine::Ok => return Ok(()),
                ScpiLine::NotOk => {
                    warn!("{} rejected", command.line());
                    return Err(SessionError::NotAcknowledged(command.line()));
                }
                other => debug!("Skipping {:?} while waiting for acknowledgement", other),
            }
        }
    }

    /// Send a set command and wait for `OK`
    pub async fn command(&mut self, command: ScpiCommand) -> Result<(), SessionError> {
        self.write(&command).await?;
        self.expect_ack(&command).await
    }

    async fn value_then_ack(&mut self, command: &ScpiCommand) -> Result<String, SessionError> {
        self.write(command).await?;
        let value = match self.next_line().await? {
            ScpiLine::Text(text) => text,
            ScpiLine::Reading(first, second) => format!("{},{}", first, second),
            ScpiLine::NotOk => return Err(SessionError::NotAcknowledged(command.line())),
            other => {
                return Err(SessionError::Protocol(format!(
                    "expected a value for {}, got {:?}",
                    command.line(),
                    other
                )));
            }
        };
        self.expect_ack(command).await?;
        Ok(value)
    }

    /// Send a set command, then read the setting back if verification is on
    async fn apply(&mut self, command: ScpiCommand) -> Result<(), SessionError> {
        let setting = command.setting();
        self.command(command).await?;
        if let (true, Some(setting)) = (self.verify, setting) {
            let value = self.query(setting).await?;
            debug!("{} reads back {:?}", setting.header(), value);
        }
        Ok(())
    }

    /// Read back a setting
    pub async fn query(&mut self, setting: ScpiSetting) -> Result<String, SessionError> {
        self.value_then_ack(&ScpiCommand::Query(setting)).await
    }

    /// Query and store the meter identity
    pub async fn identify(&mut self) -> Result<String, SessionError> {
        let identity = self
            .value_then_ack(&ScpiCommand::Identify)
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        info!("Connected to {}", identity);
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    /// Restore the meter defaults
    pub async fn reset(&mut self) -> Result<(), SessionError> {
        self.command(ScpiCommand::Reset).await
    }

    /// Apply measurement settings, each of which must be acknowledged
    ///
    /// With `verify` set, each setting and later each measurement frequency is
    /// read back and logged.
    pub async fn configure(&mut self, settings: &LcrSettings) -> Result<(), SessionError> {
        self.verify = settings.verify;
        let level = match settings.level_type {
            LcrLevel::Voltage => ScpiCommand::LevelVoltage(settings.level),
            LcrLevel::Current => ScpiCommand::LevelCurrent(settings.level),
        };
        let commands = [
            ScpiCommand::ModeLcr,
            ScpiCommand::LevelType(settings.level_type.into()),
            level,
            ScpiCommand::AutoRange(settings.auto_range),
            ScpiCommand::Aperture(settings.aperture),
            ScpiCommand::MeasurementMode(settings.measurement_mode),
            ScpiCommand::MeasurementModel(settings.model),
        ];
        for command in commands {
            self.apply(command).await?;
        }
        info!("LCR-1 configured: {:?}", settings);
        Ok(())
    }

    /// Measure `runs` readings at one frequency
    pub async fn measure(
        &mut self,
        frequency_hz: f64,
        runs: usize,
    ) -> Result<Vec<LcrReading>, SessionError> {
        if runs == 0 {
            return Err(ValidationError::OutOfRange {
                field: "runs",
                value: 0.0,
                min: 1.0,
                max: f64::MAX,
            }
            .into());
        }

        self.apply(ScpiCommand::Frequency(frequency_hz)).await?;
        self.command(ScpiCommand::Trigger).await?;

        let mut readings = Vec::with_capacity(runs);
        while readings.len() < runs {
            match self.next_line().await? {
                ScpiLine::Reading(first, second) => readings.push(LcrReading {
                    frequency_hz,
                    run: readings.len(),
                    first,
                    second,
                }),
                ScpiLine::OutOfRange(fault) => {
                    warn!("{:?} at {} Hz", fault, frequency_hz);
                }
                other => debug!("Skipping {:?} during readings", other),
            }
        }

        self.abort().await?;
        debug!("{} readings at {} Hz", readings.len(), frequency_hz);
        Ok(readings)
    }

    /// Stop readings and search for the acknowledgement behind in-flight data
    async fn abort(&mut self) -> Result<(), SessionError> {
        let command = ScpiCommand::Abort;
        self.write(&command).await?;

        for _ in 0..ABORT_SEARCH_LINES {
            match self.next_line().await? {
                ScpiLine::Ok => return Ok(()),
                ScpiLine::NotOk => return Err(SessionError::NotAcknowledged(command.line())),
                other => debug!("Discarding {:?} after abort", other),
            }
        }
        warn!("No acknowledgement within {} lines of ABORT", ABORT_SEARCH_LINES);
        Err(SessionError::NotAcknowledged(command.line()))
    }

    /// Measure every frequency of a sweep
    pub async fn sweep(
        &mut self,
        spec: &SweepSpec,
        runs: usize,
    ) -> Result<Vec<LcrReading>, SessionError> {
        let frequencies = plan(spec)?;
        let mut readings = Vec::with_capacity(frequencies.len() * runs);
        for frequency in frequencies {
            readings.extend(self.measure(frequency, runs).await?);
        }
        Ok(readings)
    }

    /// Release the channel
    pub fn into_inner(self) -> T {
        self.io
    }
}
