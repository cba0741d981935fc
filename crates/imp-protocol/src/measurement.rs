//! Streaming decoder for measurement data frames
//!
//! While a measurement runs the analyzer emits one data frame per frequency
//! point, spectrum after spectrum. [`MeasurementDecoder`] consumes the raw
//! byte stream and yields [`DecodeEvent`]s: decoded points, non-fatal errors,
//! status messages, and the stop acknowledgement.

use crate::error::DecodeError;
use crate::frame::{FrameCodec, Tag};
use crate::payload::{Response, SystemMessage};
use crate::ProtocolCodec;

/// One decoded impedance sample
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeasurementPoint {
    /// Index into the planned frequency list
    pub frequency_id: u16,
    /// Frequency in Hz resolved from the planned sweep
    pub frequency_hz: f64,
    /// Real part of the impedance in ohms
    pub real: f64,
    /// Imaginary part of the impedance in ohms
    pub imaginary: f64,
    /// Zero-based spectrum (repetition) counter
    pub spectrum_index: u32,
}

/// Output of the decoder
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    Point(MeasurementPoint),
    /// A frame was dropped; decoding continues
    Error(DecodeError),
    /// The analyzer confirmed the stop command
    StopAcknowledged,
    /// Any other system message seen mid-stream
    Message(SystemMessage),
}

/// Decoder for one measurement run
#[derive(Debug)]
pub struct MeasurementDecoder {
    codec: FrameCodec,
    frequencies: Vec<f64>,
    spectra: u16,
    spectrum_index: u32,
    last_id: Option<u16>,
    produced: u64,
    complete: bool,
    stop_sent: bool,
    stopped: bool,
}

impl MeasurementDecoder {
    /// Create a decoder for `spectra` repetitions of the given frequency list
    pub fn new(frequencies: Vec<f64>, spectra: u16) -> Self {
        Self {
            codec: FrameCodec::new(),
            frequencies,
            spectra,
            spectrum_index: 0,
            last_id: None,
            produced: 0,
            complete: false,
            stop_sent: false,
            stopped: false,
        }
    }

    pub fn push_bytes(&mut self, data: &[u8]) {
        self.codec.push_bytes(data);
    }

    /// Record that the stop command went out, so the next acknowledgement
    /// for the measurement tag is taken as the stop confirmation
    pub fn stop_requested(&mut self) {
        self.stop_sent = true;
    }

    /// Planned frequencies of one spectrum
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Total number of points the run should produce
    pub fn expected_points(&self) -> u64 {
        self.spectra as u64 * self.frequencies.len() as u64
    }

    /// Points decoded so far
    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// All expected points have been decoded
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The stop acknowledgement has been seen
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Pull the next event from buffered bytes
    ///
    /// Returns `None` when more bytes are needed or once the stop
    /// acknowledgement has been delivered.
    pub fn next_event(&mut self) -> Option<DecodeEvent> {
        loop {
            if self.stopped {
                return None;
            }

            let frame = match self.codec.next_frame()? {
                Ok(frame) => frame,
                Err(e) => return Some(DecodeEvent::Error(e.into())),
            };

            match Response::from_frame(&frame) {
                Ok(Response::Data(data)) => {
                    if self.complete {
                        tracing::trace!("Dropping data frame after completion: id {}", data.frequency_id);
                        continue;
                    }
                    return Some(self.point(data.frequency_id, data.real, data.imaginary));
                }
                Ok(Response::System(msg))
                    if self.stop_sent && msg.is_ack() && msg.refers_to(Tag::Measurement) =>
                {
                    self.stopped = true;
                    return Some(DecodeEvent::StopAcknowledged);
                }
                Ok(Response::System(msg)) => return Some(DecodeEvent::Message(msg)),
                Ok(other) => {
                    tracing::debug!("Ignoring non-measurement frame: {:?}", other);
                }
                Err(e) => return Some(DecodeEvent::Error(e)),
            }
        }
    }

    fn point(&mut self, id: u16, real: f32, imaginary: f32) -> DecodeEvent {
        let count = self.frequencies.len();
        let Some(&frequency_hz) = self.frequencies.get(id as usize) else {
            return DecodeEvent::Error(DecodeError::FrequencyOutOfRange { id, count });
        };

        if let Some(last) = self.last_id {
            if id <= last {
                self.spectrum_index += 1;
            }
        }
        self.last_id = Some(id);
        self.produced += 1;

        let last_spectrum = self.spectra.saturating_sub(1) as u32;
        if self.produced >= self.expected_points()
            || (self.spectrum_index >= last_spectrum && id as usize == count - 1)
        {
            self.complete = true;
        }

        DecodeEvent::Point(MeasurementPoint {
            frequency_id: id,
            frequency_hz,
            real: real as f64,
            imaginary: imaginary as f64,
            spectrum_index: self.spectrum_index,
        })
    }
}
