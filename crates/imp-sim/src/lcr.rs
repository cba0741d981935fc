//! Virtual LCR-1 meter
//!
//! Acknowledges SCPI set commands with `OK`, answers queries with a value
//! line plus `OK`, and streams `first,second` readings while triggered.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Configuration for creating a virtual LCR meter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualLcrConfig {
    pub identity: String,
    /// Capacitance reported by every reading, in farads
    pub capacitance_farads: f64,
    /// Dissipation factor reported by every reading
    pub dissipation: f64,
    /// Delay between readings in milliseconds
    pub reading_interval_ms: u64,
}

impl Default for VirtualLcrConfig {
    fn default() -> Self {
        Self {
            identity: "Sciospec LCR-1 virtual".to_string(),
            capacitance_farads: 100e-9,
            dissipation: 0.01,
            reading_interval_ms: 2,
        }
    }
}

/// A simulated LCR-1 that speaks SCPI over a line stream
#[derive(Debug)]
pub struct VirtualLcrMeter {
    config: VirtualLcrConfig,
    buffer: Vec<u8>,
    settings: Vec<(String, String)>,
    triggered: bool,
    readings_sent: usize,
    out_of_range_every: Option<usize>,
    readings_before_abort_ack: usize,
    rejected: Vec<String>,
    received: Vec<String>,
    pending_output: VecDeque<Vec<u8>>,
}

impl VirtualLcrMeter {
    pub fn new(config: VirtualLcrConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            settings: Vec::new(),
            triggered: false,
            readings_sent: 0,
            out_of_range_every: None,
            readings_before_abort_ack: 0,
            rejected: Vec::new(),
            received: Vec::new(),
            pending_output: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &VirtualLcrConfig {
        &self.config
    }

    /// Insert an over-current notice before every n-th reading
    pub fn out_of_range_every(&mut self, n: usize) {
        self.out_of_range_every = Some(n.max(1));
    }

    /// Emit this many readings between receiving `ABORT` and acknowledging it
    pub fn set_readings_before_abort_ack(&mut self, n: usize) {
        self.readings_before_abort_ack = n;
    }

    /// Answer `NOT OK` to commands starting with this header
    pub fn reject(&mut self, header: impl Into<String>) {
        self.rejected.push(header.into());
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// Command lines received so far
    pub fn received(&self) -> &[String] {
        &self.received
    }

    /// Last value written for a setting header
    pub fn setting(&self, header: &str) -> Option<&str> {
        self.settings
            .iter()
            .rev()
            .find(|(h, _)| h == header)
            .map(|(_, v)| v.as_str())
    }

    /// Feed bytes written by the host. Returns true if any line was handled.
    pub fn process_bytes(&mut self, data: &[u8]) -> bool {
        self.buffer.extend_from_slice(data);
        let mut handled = false;
        while let Some(end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if line.is_empty() {
                continue;
            }
            self.handle(&line);
            handled = true;
        }
        handled
    }

    fn handle(&mut self, line: &str) {
        tracing::debug!("Virtual LCR received {:?}", line);
        self.received.push(line.to_string());

        if self.rejected.iter().any(|h| line.starts_with(h.as_str())) {
            self.send_line("NOT OK");
            return;
        }

        match line {
            "*IDN?" => {
                let identity = self.config.identity.clone();
                self.send_line(&identity);
                self.send_line("OK");
            }
            "*RST" => {
                self.settings.clear();
                self.triggered = false;
                self.send_line("OK");
            }
            "*TRG" => {
                self.triggered = true;
                self.send_line("OK");
            }
            "ABORT" => {
                for _ in 0..self.readings_before_abort_ack {
                    if let Some(reading) = self.next_reading() {
                        self.queue(reading);
                    }
                }
                self.triggered = false;
                self.send_line("OK");
            }
            query if query.ends_with('?') => {
                let header = query.trim_end_matches('?');
                let value = self.setting(header).unwrap_or("0").to_string();
                self.send_line(&value);
                self.send_line("OK");
            }
            command => {
                let (header, value) = command.split_once(' ').unwrap_or((command, ""));
                self.settings.push((header.to_string(), value.trim().to_string()));
                self.send_line("OK");
            }
        }
    }

    /// Produce the next reading line while triggered
    pub fn next_reading(&mut self) -> Option<Vec<u8>> {
        if !self.triggered {
            return None;
        }
        self.readings_sent += 1;
        let mut out = Vec::new();
        if let Some(n) = self.out_of_range_every {
            if self.readings_sent % n == 0 {
                out.extend_from_slice(b"Out of range: Over current detected\n");
            }
        }
        out.extend_from_slice(
            format!("{:e},{}\n", self.config.capacitance_farads, self.config.dissipation)
                .as_bytes(),
        );
        Some(out)
    }

    pub fn take_output(&mut self) -> Option<Vec<u8>> {
        self.pending_output.pop_front()
    }

    fn queue(&mut self, bytes: Vec<u8>) {
        self.pending_output.push_back(bytes);
    }

    fn send_line(&mut self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.queue(bytes);
    }
}

impl Default for VirtualLcrMeter {
    fn default() -> Self {
        Self::new(VirtualLcrConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(meter: &mut VirtualLcrMeter) -> String {
        std::iter::from_fn(|| meter.take_output())
            .map(|b| String::from_utf8(b).unwrap())
            .collect()
    }

    #[test]
    fn test_set_and_query() {
        let mut meter = VirtualLcrMeter::default();
        meter.process_bytes(b"LEVEL:VOLTAGE 0.1\n");
        assert_eq!(output(&mut meter), "OK\n");
        meter.process_bytes(b"LEVEL:VOLTAGE?\n");
        assert_eq!(output(&mut meter), "0.1\nOK\n");
        assert_eq!(meter.setting("LEVEL:VOLTAGE"), Some("0.1"));
    }

    #[test]
    fn test_identify() {
        let mut meter = VirtualLcrMeter::default();
        meter.process_bytes(b"*IDN?\n");
        assert_eq!(output(&mut meter), "Sciospec LCR-1 virtual\nOK\n");
    }

    #[test]
    fn test_trigger_and_abort() {
        let mut meter = VirtualLcrMeter::default();
        meter.out_of_range_every(2);
        meter.process_bytes(b"*TRG\n");
        assert_eq!(output(&mut meter), "OK\n");

        let first = String::from_utf8(meter.next_reading().unwrap()).unwrap();
        assert_eq!(first, "1e-7,0.01\n");
        let second = String::from_utf8(meter.next_reading().unwrap()).unwrap();
        assert!(second.starts_with("Out of range"));

        meter.set_readings_before_abort_ack(1);
        meter.process_bytes(b"ABORT\n");
        let out = output(&mut meter);
        assert!(out.ends_with("OK\n"));
        assert!(!meter.is_triggered());
        assert!(meter.next_reading().is_none());
    }

    #[test]
    fn test_rejected_header() {
        let mut meter = VirtualLcrMeter::default();
        meter.reject("APERTURE");
        meter.process_bytes(b"APERTURE 1\n");
        assert_eq!(output(&mut meter), "NOT OK\n");
    }
}
