//! Virtual instrument actor tasks
//!
//! Each task owns a virtual instrument and talks to the host over an async
//! stream (usually one end of `tokio::io::duplex`). A `select!` loop:
//! - reads host bytes and feeds them to the instrument
//! - writes queued replies back
//! - emits measurement frames on a timer while the instrument is measuring
//! - handles commands from the control channel

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{VirtualAnalyzer, VirtualLcrMeter};

/// Commands that can be sent to a virtual instrument task
#[derive(Debug, Clone)]
pub enum VirtualInstrumentCommand {
    /// Write raw bytes to the host as if the instrument sent them
    Inject(Vec<u8>),
    /// Shutdown the task
    Shutdown,
}

/// Byte-level behaviour shared by the virtual instruments
trait VirtualInstrument {
    fn name(&self) -> &'static str;
    fn process_bytes(&mut self, data: &[u8]) -> bool;
    fn take_output(&mut self) -> Option<Vec<u8>>;
    /// Next unsolicited output produced on the timer
    fn tick(&mut self) -> Option<Vec<u8>>;
    fn is_streaming(&self) -> bool;
    fn tick_interval(&self) -> Duration;
}

impl VirtualInstrument for VirtualAnalyzer {
    fn name(&self) -> &'static str {
        "ISX-3"
    }

    fn process_bytes(&mut self, data: &[u8]) -> bool {
        VirtualAnalyzer::process_bytes(self, data)
    }

    fn take_output(&mut self) -> Option<Vec<u8>> {
        VirtualAnalyzer::take_output(self)
    }

    fn tick(&mut self) -> Option<Vec<u8>> {
        self.next_measurement_frame()
    }

    fn is_streaming(&self) -> bool {
        self.is_measuring()
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.config().frame_interval_ms.max(1))
    }
}

impl VirtualInstrument for VirtualLcrMeter {
    fn name(&self) -> &'static str {
        "LCR-1"
    }

    fn process_bytes(&mut self, data: &[u8]) -> bool {
        VirtualLcrMeter::process_bytes(self, data)
    }

    fn take_output(&mut self) -> Option<Vec<u8>> {
        VirtualLcrMeter::take_output(self)
    }

    fn tick(&mut self) -> Option<Vec<u8>> {
        self.next_reading()
    }

    fn is_streaming(&self) -> bool {
        self.is_triggered()
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.config().reading_interval_ms.max(1))
    }
}

/// Run the virtual analyzer actor task
///
/// Returns the analyzer when the stream closes or shutdown is requested, so
/// tests can inspect what it received.
pub async fn run_virtual_analyzer<S>(
    stream: S,
    analyzer: VirtualAnalyzer,
    cmd_rx: mpsc::Receiver<VirtualInstrumentCommand>,
) -> io::Result<VirtualAnalyzer>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    run_instrument(stream, analyzer, cmd_rx).await
}

/// Run the virtual LCR-1 actor task
pub async fn run_virtual_lcr<S>(
    stream: S,
    meter: VirtualLcrMeter,
    cmd_rx: mpsc::Receiver<VirtualInstrumentCommand>,
) -> io::Result<VirtualLcrMeter>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    run_instrument(stream, meter, cmd_rx).await
}

async fn run_instrument<S, I>(
    mut stream: S,
    mut instrument: I,
    mut cmd_rx: mpsc::Receiver<VirtualInstrumentCommand>,
) -> io::Result<I>
where
    S: AsyncRead + AsyncWrite + Unpin,
    I: VirtualInstrument,
{
    let mut buf = [0u8; 1024];
    let mut timer = interval(instrument.tick_interval());
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut commands_open = true;

    info!("Starting virtual {} task", instrument.name());

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!("Virtual {} stream closed", instrument.name());
                        break;
                    }
                    Ok(n) => {
                        debug!("Virtual {} received {} bytes: {:02X?}", instrument.name(), n, &buf[..n]);
                        if instrument.process_bytes(&buf[..n]) {
                            timer.reset();
                        }
                        while let Some(out) = instrument.take_output() {
                            stream.write_all(&out).await?;
                        }
                        stream.flush().await?;
                    }
                    Err(e) => {
                        warn!("Virtual {} stream error: {}", instrument.name(), e);
                        return Err(e);
                    }
                }
            }

            cmd = cmd_rx.recv(), if commands_open => {
                match cmd {
                    Some(VirtualInstrumentCommand::Inject(bytes)) => {
                        debug!("Virtual {} injecting {} bytes", instrument.name(), bytes.len());
                        stream.write_all(&bytes).await?;
                        stream.flush().await?;
                    }
                    Some(VirtualInstrumentCommand::Shutdown) => {
                        info!("Shutdown requested for virtual {}", instrument.name());
                        break;
                    }
                    None => {
                        // Keep serving the stream when nobody holds the sender
                        commands_open = false;
                    }
                }
            }

            _ = timer.tick(), if instrument.is_streaming() => {
                if let Some(out) = instrument.tick() {
                    stream.write_all(&out).await?;
                    stream.flush().await?;
                }
            }
        }
    }

    info!("Virtual {} task ended", instrument.name());
    Ok(instrument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imp_protocol::frame::FrameCodec;
    use imp_protocol::{Command, EncodeCommand, ProtocolCodec, Response, Tag};

    async fn read_frame(stream: &mut tokio::io::DuplexStream, codec: &mut FrameCodec) -> Response {
        let mut buf = [0u8; 256];
        loop {
            if let Some(Ok(frame)) = codec.next_item() {
                return Response::from_frame(&frame).unwrap();
            }
            let n = tokio::time::timeout(Duration::from_millis(500), stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "stream closed");
            codec.push_bytes(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_virtual_analyzer_acknowledges_commands() {
        let (mut host, device) = tokio::io::duplex(1024);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let task = tokio::spawn(run_virtual_analyzer(device, VirtualAnalyzer::default(), cmd_rx));

        host.write_all(&Command::ResetSetup.to_frame().encode()).await.unwrap();
        let mut codec = FrameCodec::new();
        match read_frame(&mut host, &mut codec).await {
            Response::System(msg) => {
                assert!(msg.is_ack());
                assert!(msg.refers_to(Tag::Setup));
            }
            other => panic!("expected ack, got {:?}", other),
        }

        cmd_tx.send(VirtualInstrumentCommand::Shutdown).await.unwrap();
        let analyzer = task.await.unwrap().unwrap();
        assert_eq!(analyzer.received(), &[Command::ResetSetup]);
    }

    #[tokio::test]
    async fn test_virtual_analyzer_streams_measurement() {
        let (mut host, device) = tokio::io::duplex(4096);
        let (_cmd_tx, cmd_rx) = mpsc::channel(8);
        let task = tokio::spawn(run_virtual_analyzer(device, VirtualAnalyzer::default(), cmd_rx));

        let block = imp_protocol::SweepBlock {
            start_hz: 100.0,
            end_hz: 1000.0,
            count: 4.0,
            scale: imp_protocol::Scale::Linear,
            precision: 1.0,
            amplitude: 0.1,
        };
        let mut codec = FrameCodec::new();
        host.write_all(&Command::AddSweep(block).to_frame().encode()).await.unwrap();
        assert!(matches!(read_frame(&mut host, &mut codec).await, Response::System(m) if m.is_ack()));

        host.write_all(&Command::StartMeasurement { spectra: 1 }.to_frame().encode())
            .await
            .unwrap();
        assert!(matches!(read_frame(&mut host, &mut codec).await, Response::System(m) if m.is_ack()));

        for expected in 0..4u16 {
            match read_frame(&mut host, &mut codec).await {
                Response::Data(point) => assert_eq!(point.frequency_id, expected),
                other => panic!("expected data, got {:?}", other),
            }
        }

        drop(host);
        let analyzer = task.await.unwrap().unwrap();
        assert_eq!(analyzer.frames_sent(), 4);
        assert!(!analyzer.is_measuring());
    }

    #[tokio::test]
    async fn test_inject_writes_raw_bytes() {
        let (mut host, device) = tokio::io::duplex(1024);
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let task = tokio::spawn(run_virtual_lcr(device, VirtualLcrMeter::default(), cmd_rx));

        cmd_tx
            .send(VirtualInstrumentCommand::Inject(b"hello\n".to_vec()))
            .await
            .unwrap();
        let mut buf = [0u8; 6];
        tokio::time::timeout(Duration::from_millis(500), host.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello\n");

        cmd_tx.send(VirtualInstrumentCommand::Shutdown).await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }
}
