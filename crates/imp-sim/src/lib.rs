//! Impedance Analyzer Simulation Library
//!
//! This crate provides virtual instruments for exercising the session layer
//! without physical hardware. It includes:
//!
//! - **VirtualAnalyzer**: ISX-3 binary protocol with a series RC load model
//! - **VirtualLcrMeter**: LCR-1 SCPI line protocol
//! - **Actor tasks**: drive either instrument over an async stream
//!
//! # Example
//!
//! ```rust
//! use imp_protocol::{Command, EncodeCommand, FrontendSettings};
//! use imp_sim::VirtualAnalyzer;
//!
//! let mut analyzer = VirtualAnalyzer::default();
//! analyzer.process_bytes(&Command::SetFrontend(FrontendSettings::default()).to_frame().encode());
//!
//! // Get pending protocol-encoded output
//! while let Some(bytes) = analyzer.take_output() {
//!     println!("Analyzer output: {:02X?}", bytes);
//! }
//! ```

pub mod analyzer;
pub mod lcr;
pub mod task;

pub use analyzer::{VirtualAnalyzer, VirtualAnalyzerConfig};
pub use lcr::{VirtualLcrConfig, VirtualLcrMeter};
pub use task::{run_virtual_analyzer, run_virtual_lcr, VirtualInstrumentCommand};
