//! Impedance Analyzer Session Layer
//!
//! This crate drives Sciospec instruments over an async byte channel:
//!
//! - **CommandDispatcher**: one request/response exchange at a time, with
//!   per-command acknowledgement matching and timeouts
//! - **DeviceSession**: the ISX-3 state machine from connect to stop
//! - **MeasurementStream**: lazy, per-point access to a running measurement
//! - **ResultSink**: where decoded points go (CSV, memory)
//! - **LcrSession**: the LCR-1 SCPI driver
//!
//! Sessions are generic over `AsyncRead + AsyncWrite`, so the same code runs
//! against a serial port or an in-memory `tokio::io::duplex` pair.
//!
//! # Example
//!
//! ```rust,no_run
//! use imp_protocol::SweepSpec;
//! use imp_session::{CsvSink, DeviceSession, SerialConfig, SessionConfig};
//!
//! # async fn run() -> Result<(), imp_session::SessionError> {
//! let mut session = DeviceSession::new(SessionConfig::default());
//! session.connect(&SerialConfig::new("/dev/ttyUSB0")).await?;
//! session.configure_frontend(4, "main port", "autoranging", "autoranging").await?;
//! session
//!     .set_setup(SweepSpec::parse("100", "10000", 20, "log", 1.0, "0.1", "voltage")?)
//!     .await?;
//!
//! session.start_measurement(1).await?;
//! let mut sink = CsvSink::new(std::io::stdout());
//! session.measurements()?.drain_into(&mut sink).await?;
//! session.stop_measurement().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lcr;
pub mod session;
pub mod sink;
pub mod state;
pub mod stream;

pub use config::{SerialConfig, SessionConfig};
pub use dispatcher::CommandDispatcher;
pub use error::{DispatchError, SessionError};
pub use lcr::{LcrLevel, LcrReading, LcrSession, LcrSettings};
pub use session::{DeviceSession, StopHandle};
pub use sink::{CsvSink, ResultSink, CSV_HEADER};
pub use state::{Operation, SessionState};
pub use stream::{DrainSummary, MeasurementStream, Spectrum};
