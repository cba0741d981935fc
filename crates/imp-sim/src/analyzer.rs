//! Virtual ISX-3 analyzer
//!
//! Answers configuration commands the way the instrument does and produces
//! measurement data frames for a series RC load. Faults (silence, NACKs,
//! corrupted data frames, stalls) can be injected for testing.

use std::collections::{HashSet, VecDeque};
use std::f64::consts::PI;

use imp_protocol::payload::DataPoint;
use imp_protocol::{
    plan, Command, DeviceIdentity, EncodeCommand, FrameCodec, FrontendSettings, MessageCode,
    ProtocolCodec, Response, SweepBlock, SweepSpec, SystemMessage, Tag,
};
use serde::{Deserialize, Serialize};

/// Configuration for creating a virtual analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualAnalyzerConfig {
    /// Identity string returned for the identity query
    pub identity: String,
    /// Series resistance of the simulated load in ohms
    pub resistance_ohms: f64,
    /// Series capacitance of the simulated load in farads
    pub capacitance_farads: f64,
    /// Delay between measurement frames in milliseconds
    pub frame_interval_ms: u64,
}

impl Default for VirtualAnalyzerConfig {
    fn default() -> Self {
        Self {
            identity: "ISX-3 virtual".to_string(),
            resistance_ohms: 1000.0,
            capacitance_farads: 100e-9,
            frame_interval_ms: 2,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    silent: HashSet<u8>,
    nack: HashSet<u8>,
    corrupt: HashSet<usize>,
    in_flight_after_stop: usize,
    stall_after: Option<usize>,
}

/// A simulated analyzer that speaks the binary frame protocol
#[derive(Debug)]
pub struct VirtualAnalyzer {
    config: VirtualAnalyzerConfig,
    codec: FrameCodec,
    frontend: Option<FrontendSettings>,
    sweep: Option<SweepBlock>,
    frequencies: Vec<f64>,
    measuring: bool,
    spectra: u16,
    spectrum: u32,
    next_id: u16,
    frames_sent: usize,
    faults: Faults,
    received: Vec<Command>,
    pending_output: VecDeque<Vec<u8>>,
}

impl VirtualAnalyzer {
    pub fn new(config: VirtualAnalyzerConfig) -> Self {
        Self {
            config,
            codec: FrameCodec::new(),
            frontend: None,
            sweep: None,
            frequencies: Vec::new(),
            measuring: false,
            spectra: 0,
            spectrum: 0,
            next_id: 0,
            frames_sent: 0,
            faults: Faults::default(),
            received: Vec::new(),
            pending_output: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &VirtualAnalyzerConfig {
        &self.config
    }

    /// Never answer commands with this tag
    pub fn silence(&mut self, tag: Tag) {
        self.faults.silent.insert(tag.code());
    }

    /// Reject commands with this tag
    pub fn reject(&mut self, tag: Tag) {
        self.faults.nack.insert(tag.code());
    }

    /// Flip a payload byte of the n-th data frame (0-based, counted over the whole run)
    pub fn corrupt_data_frame(&mut self, index: usize) {
        self.faults.corrupt.insert(index);
    }

    /// Emit this many further data frames between receiving stop and acknowledging it
    pub fn set_in_flight_after_stop(&mut self, frames: usize) {
        self.faults.in_flight_after_stop = frames;
    }

    /// Stop producing data frames after this many, without leaving measuring mode
    pub fn stall_after(&mut self, frames: usize) {
        self.faults.stall_after = Some(frames);
    }

    pub fn frontend(&self) -> Option<&FrontendSettings> {
        self.frontend.as_ref()
    }

    pub fn sweep(&self) -> Option<&SweepBlock> {
        self.sweep.as_ref()
    }

    pub fn is_measuring(&self) -> bool {
        self.measuring
    }

    /// Commands received so far, in order
    pub fn received(&self) -> &[Command] {
        &self.received
    }

    /// Data frames emitted so far
    pub fn frames_sent(&self) -> usize {
        self.frames_sent
    }

    /// Impedance of the simulated load at `frequency_hz`
    pub fn impedance(&self, frequency_hz: f64) -> (f64, f64) {
        let reactance = -1.0 / (2.0 * PI * frequency_hz * self.config.capacitance_farads);
        (self.config.resistance_ohms, reactance)
    }

    /// Feed bytes written by the host. Returns true if any command was handled.
    pub fn process_bytes(&mut self, data: &[u8]) -> bool {
        self.codec.push_bytes(data);
        let mut handled = false;

        while let Some(result) = self.codec.next_item() {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("Virtual analyzer dropped bytes: {}", e);
                    continue;
                }
            };
            match Command::from_frame(&frame) {
                Ok(cmd) => {
                    self.handle(cmd);
                    handled = true;
                }
                Err(e) => {
                    tracing::debug!("Virtual analyzer could not decode {}: {}", frame.tag, e);
                    self.queue(SystemMessage::nack(MessageCode::NotRecognized, frame.tag).to_frame().encode());
                }
            }
        }
        handled
    }

    fn handle(&mut self, cmd: Command) {
        let tag = cmd.tag();
        tracing::debug!("Virtual analyzer received {}", cmd.name());
        self.received.push(cmd.clone());

        if self.faults.silent.contains(&tag.code()) {
            return;
        }
        if self.faults.nack.contains(&tag.code()) {
            self.nack(tag);
            return;
        }

        match cmd {
            Command::Identify => {
                let identity = DeviceIdentity {
                    raw: self.config.identity.as_bytes().to_vec(),
                };
                self.respond(Response::Identity(identity));
            }
            Command::SoftwareReset => {
                self.frontend = None;
                self.sweep = None;
                self.frequencies.clear();
                self.measuring = false;
                self.ack(tag);
                self.respond(Response::System(SystemMessage {
                    code: MessageCode::WakeUp,
                    acknowledged: None,
                }));
            }
            Command::SetFrontend(fs) => {
                self.frontend = Some(fs);
                self.ack(tag);
            }
            Command::QueryFrontend => match self.frontend {
                Some(fs) => self.respond(Response::Frontend(fs)),
                None => self.nack(tag),
            },
            Command::ResetSetup => {
                self.sweep = None;
                self.frequencies.clear();
                self.ack(tag);
            }
            Command::AddSweep(block) => match plan_block(&block) {
                Some(frequencies) => {
                    self.frequencies = frequencies;
                    self.sweep = Some(block);
                    self.ack(tag);
                }
                None => self.nack(tag),
            },
            Command::StartMeasurement { spectra } => {
                if self.frequencies.is_empty() || spectra == 0 {
                    self.nack(tag);
                    return;
                }
                self.measuring = true;
                self.spectra = spectra;
                self.spectrum = 0;
                self.next_id = 0;
                self.ack(tag);
            }
            Command::StopMeasurement => {
                for _ in 0..self.faults.in_flight_after_stop {
                    match self.next_measurement_frame() {
                        Some(frame) => self.queue(frame),
                        None => break,
                    }
                }
                self.measuring = false;
                self.ack(tag);
            }
        }
    }

    /// Produce the next data frame of a running measurement
    ///
    /// Returns `None` when not measuring, when stalled, or once all spectra
    /// have been sent.
    pub fn next_measurement_frame(&mut self) -> Option<Vec<u8>> {
        if !self.measuring {
            return None;
        }
        if self.faults.stall_after.is_some_and(|n| self.frames_sent >= n) {
            return None;
        }

        let id = self.next_id;
        let frequency = *self.frequencies.get(id as usize)?;
        let (real, imaginary) = self.impedance(frequency);
        let mut bytes = DataPoint {
            frequency_id: id,
            real: real as f32,
            imaginary: imaginary as f32,
        }
        .to_frame()
        .encode();

        if self.faults.corrupt.contains(&self.frames_sent) {
            bytes[4] ^= 0x5A;
        }
        self.frames_sent += 1;

        self.next_id += 1;
        if self.next_id as usize >= self.frequencies.len() {
            self.next_id = 0;
            self.spectrum += 1;
            if self.spectrum >= self.spectra as u32 {
                tracing::debug!("Virtual analyzer finished {} spectra", self.spectra);
                self.measuring = false;
            }
        }
        Some(bytes)
    }

    /// Take the next pending output chunk
    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        self.pending_output.pop_front()
    }

    /// Queue raw bytes for output
    pub fn queue(&mut self, bytes: Vec<u8>) {
        self.pending_output.push_back(bytes);
    }

    fn respond(&mut self, response: Response) {
        self.queue(response.to_frame().encode());
    }

    fn ack(&mut self, tag: Tag) {
        self.respond(Response::System(SystemMessage::ack(tag)));
    }

    fn nack(&mut self, tag: Tag) {
        self.respond(Response::System(SystemMessage::nack(
            MessageCode::NotExecuted,
            tag,
        )));
    }
}

impl Default for VirtualAnalyzer {
    fn default() -> Self {
        Self::new(VirtualAnalyzerConfig::default())
    }
}

/// Expand a received sweep block into its frequency list
fn plan_block(block: &SweepBlock) -> Option<Vec<f64>> {
    let points = block.points();
    if points == 0 || points > imp_protocol::sweep::MAX_POINTS {
        return None;
    }
    let spec = SweepSpec {
        start_hz: block.start_hz as f64,
        end_hz: block.end_hz as f64,
        count: points,
        scale: block.scale,
        precision: block.precision as f64,
        amplitude: block.amplitude as f64,
        excitation: Default::default(),
    };
    plan(&spec).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use imp_protocol::frame::decode;
    use imp_protocol::Scale;

    fn send(analyzer: &mut VirtualAnalyzer, cmd: Command) -> Vec<Response> {
        analyzer.process_bytes(&cmd.to_frame().encode());
        std::iter::from_fn(|| analyzer.take_output())
            .map(|bytes| Response::from_frame(&decode(&bytes).unwrap()).unwrap())
            .collect()
    }

    fn block(count: f32) -> SweepBlock {
        SweepBlock {
            start_hz: 1000.0,
            end_hz: 100_000.0,
            count,
            scale: Scale::Log,
            precision: 1.0,
            amplitude: 0.1,
        }
    }

    #[test]
    fn test_identify_replies_with_identity() {
        let mut analyzer = VirtualAnalyzer::default();
        let replies = send(&mut analyzer, Command::Identify);
        assert_eq!(
            replies,
            vec![Response::Identity(DeviceIdentity {
                raw: b"ISX-3 virtual".to_vec()
            })]
        );
    }

    #[test]
    fn test_configuration_is_acknowledged() {
        let mut analyzer = VirtualAnalyzer::default();
        let fs = FrontendSettings::default();

        let replies = send(&mut analyzer, Command::SetFrontend(fs));
        assert_eq!(replies, vec![Response::System(SystemMessage::ack(Tag::SetFrontend))]);
        assert_eq!(analyzer.frontend(), Some(&fs));

        let replies = send(&mut analyzer, Command::QueryFrontend);
        assert_eq!(replies, vec![Response::Frontend(fs)]);

        let replies = send(&mut analyzer, Command::AddSweep(block(5.0)));
        assert_eq!(replies, vec![Response::System(SystemMessage::ack(Tag::Setup))]);
    }

    #[test]
    fn test_start_without_sweep_is_rejected() {
        let mut analyzer = VirtualAnalyzer::default();
        let replies = send(&mut analyzer, Command::StartMeasurement { spectra: 1 });
        assert!(matches!(&replies[0], Response::System(msg) if msg.is_nack()));
        assert!(!analyzer.is_measuring());
    }

    #[test]
    fn test_measurement_frames_cycle_spectra() {
        let mut analyzer = VirtualAnalyzer::default();
        send(&mut analyzer, Command::AddSweep(block(3.0)));
        send(&mut analyzer, Command::StartMeasurement { spectra: 2 });

        let ids: Vec<u16> = std::iter::from_fn(|| analyzer.next_measurement_frame())
            .map(|bytes| match Response::from_frame(&decode(&bytes).unwrap()).unwrap() {
                Response::Data(point) => point.frequency_id,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 0, 1, 2]);
        assert!(!analyzer.is_measuring());
    }

    #[test]
    fn test_impedance_model() {
        let analyzer = VirtualAnalyzer::default();
        let (real, imaginary) = analyzer.impedance(1000.0);
        assert_eq!(real, 1000.0);
        assert!((imaginary + 1591.549).abs() < 0.01);
    }

    #[test]
    fn test_corrupted_frame_fails_checksum() {
        let mut analyzer = VirtualAnalyzer::default();
        analyzer.corrupt_data_frame(0);
        send(&mut analyzer, Command::AddSweep(block(2.0)));
        send(&mut analyzer, Command::StartMeasurement { spectra: 1 });

        let bytes = analyzer.next_measurement_frame().unwrap();
        assert!(decode(&bytes).is_err());
        let bytes = analyzer.next_measurement_frame().unwrap();
        assert!(decode(&bytes).is_ok());
    }

    #[test]
    fn test_stop_emits_in_flight_frames_before_ack() {
        let mut analyzer = VirtualAnalyzer::default();
        analyzer.set_in_flight_after_stop(2);
        send(&mut analyzer, Command::AddSweep(block(10.0)));
        send(&mut analyzer, Command::StartMeasurement { spectra: 1 });

        let replies = send(&mut analyzer, Command::StopMeasurement);
        assert_eq!(replies.len(), 3);
        assert!(matches!(replies[0], Response::Data(_)));
        assert!(matches!(replies[1], Response::Data(_)));
        assert_eq!(replies[2], Response::System(SystemMessage::ack(Tag::Measurement)));
        assert!(!analyzer.is_measuring());
    }

    #[test]
    fn test_silenced_tag_gets_no_reply() {
        let mut analyzer = VirtualAnalyzer::default();
        analyzer.silence(Tag::SetFrontend);
        let replies = send(&mut analyzer, Command::SetFrontend(FrontendSettings::default()));
        assert!(replies.is_empty());
        assert_eq!(analyzer.received().len(), 1);
    }
}
