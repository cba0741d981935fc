//! Device session for the ISX-3
//!
//! [`DeviceSession`] wraps a [`CommandDispatcher`] and tracks which commands
//! are legal. Configuration commands transition the state only on a positive
//! acknowledgement; while measuring, the channel belongs to the
//! [`MeasurementStream`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use imp_protocol::{
    plan, validate_spectra, Command, DecodeEvent, DeviceIdentity, FrontendSettings,
    MeasurementDecoder, MeasurementPoint, Response, SweepBlock, SweepSpec,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_serial::SerialStream;
use tracing::{debug, info, warn};

use crate::config::{SerialConfig, SessionConfig};
use crate::dispatcher::CommandDispatcher;
use crate::error::{DispatchError, SessionError};
use crate::state::{Operation, SessionState};
use crate::stream::MeasurementStream;

/// Requests the end of a running measurement from another task
///
/// The stream checks the flag between reads, writes the stop frame itself
/// and drains to the stop acknowledgement.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Decoder state of the active measurement
struct MeasurementRun {
    decoder: MeasurementDecoder,
    /// Points drained by a stop attempt that did not complete
    backlog: VecDeque<MeasurementPoint>,
    stop_sent: bool,
    /// Stop acknowledgement overdue; the stream ends but the run stays open
    drain_expired: bool,
    idle: Duration,
    consecutive_timeouts: u32,
}

/// Session with one ISX-3 analyzer
pub struct DeviceSession<T> {
    config: SessionConfig,
    state: SessionState,
    dispatcher: Option<CommandDispatcher<T>>,
    identity: Option<DeviceIdentity>,
    frontend: Option<FrontendSettings>,
    sweep: Option<SweepSpec>,
    frequencies: Vec<f64>,
    run: Option<MeasurementRun>,
    stop: StopHandle,
}

impl DeviceSession<SerialStream> {
    /// Open the serial port and identify the device
    pub async fn connect(&mut self, serial: &SerialConfig) -> Result<DeviceIdentity, SessionError> {
        self.require(Operation::Connect)?;
        let stream = serial.open().map_err(|e| {
            warn!("Failed to open {}: {}", serial.port, e);
            SessionError::Connection(format!("{}: {}", serial.port, e))
        })?;
        info!("Opened {} at {} baud", serial.port, serial.baud_rate);
        self.connect_with(stream).await
    }
}

impl<T> DeviceSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            dispatcher: None,
            identity: None,
            frontend: None,
            sweep: None,
            frequencies: Vec::new(),
            run: None,
            stop: StopHandle::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Identity reported on connect
    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    /// Frontend settings last acknowledged by the device
    pub fn frontend(&self) -> Option<&FrontendSettings> {
        self.frontend.as_ref()
    }

    /// Sweep last acknowledged by the device
    pub fn sweep(&self) -> Option<&SweepSpec> {
        self.sweep.as_ref()
    }

    /// Planned frequencies of the configured sweep
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Handle for stopping a measurement from another task
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn require(&self, op: Operation) -> Result<(), SessionError> {
        if self.state.allows(op) {
            Ok(())
        } else {
            debug!("Rejected {} while {}", op, self.state);
            Err(SessionError::State {
                current: self.state,
                attempted: op,
            })
        }
    }

    fn dispatcher(&mut self) -> Result<&mut CommandDispatcher<T>, SessionError> {
        self.dispatcher
            .as_mut()
            .ok_or_else(|| SessionError::Protocol("no open channel".to_string()))
    }

    /// Move to Errored and release the measurement run
    fn fail(&mut self, reason: &dyn std::fmt::Display) {
        warn!("Session failed while {}: {}", self.state, reason);
        self.state = SessionState::Errored;
        self.run = None;
        if let Some(dispatcher) = self.dispatcher.as_mut() {
            dispatcher.end_stream();
        }
    }

    /// Send one command, mapping I/O failures to the Errored state
    async fn exchange(&mut self, command: &Command) -> Result<Response, SessionError> {
        match self.dispatcher()?.send(command).await {
            Ok(response) => Ok(response),
            Err(DispatchError::Io(e)) => {
                self.fail(&e);
                Err(SessionError::Io(e))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send a configuration command, retrying on timeout
    async fn configure(&mut self, command: &Command) -> Result<Response, SessionError> {
        let mut retries_left = self.config.config_retries;
        loop {
            match self.exchange(command).await {
                Err(SessionError::Timeout(ms)) if retries_left > 0 => {
                    retries_left -= 1;
                    warn!(
                        "{} timed out after {}ms, retrying ({} left)",
                        command.name(),
                        ms,
                        retries_left
                    );
                }
                other => return other,
            }
        }
    }

    /// Attach an open channel and identify the device
    pub async fn connect_with(&mut self, io: T) -> Result<DeviceIdentity, SessionError> {
        self.require(Operation::Connect)?;

        let mut dispatcher = CommandDispatcher::new(io, self.config.command_timeout());
        match dispatcher.send(&Command::Identify).await {
            Ok(Response::Identity(identity)) => {
                info!("Connected to {}", identity);
                self.dispatcher = Some(dispatcher);
                self.identity = Some(identity.clone());
                self.state = SessionState::Connected;
                Ok(identity)
            }
            Ok(other) => Err(SessionError::Connection(format!(
                "unexpected identity reply: {:?}",
                other
            ))),
            Err(e) => {
                warn!("Identity query failed: {}", e);
                Err(SessionError::Connection(e.to_string()))
            }
        }
    }

    /// Close the channel and forget all device state
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        self.require(Operation::Disconnect)?;
        if let Some(dispatcher) = self.dispatcher.take() {
            drop(dispatcher.into_inner());
        }
        self.identity = None;
        self.frontend = None;
        self.sweep = None;
        self.frequencies.clear();
        self.run = None;
        self.state = SessionState::Disconnected;
        info!("Disconnected");
        Ok(())
    }

    /// Apply frontend settings
    pub async fn set_fs_settings(&mut self, settings: FrontendSettings) -> Result<(), SessionError> {
        self.require(Operation::SetFsSettings)?;
        self.configure(&Command::SetFrontend(settings)).await?;

        info!(
            "Frontend set: {}-point, {:?}, current {:?}, voltage {:?}",
            settings.mode.points(),
            settings.channel,
            settings.current_range,
            settings.voltage_range
        );
        self.frontend = Some(settings);
        self.state = SessionState::FrontendConfigured;
        Ok(())
    }

    /// Parse boundary strings, then apply the frontend settings
    pub async fn configure_frontend(
        &mut self,
        points: u8,
        channel: &str,
        current_range: &str,
        voltage_range: &str,
    ) -> Result<(), SessionError> {
        self.require(Operation::SetFsSettings)?;
        let settings = FrontendSettings::new(points, channel, current_range, voltage_range)?;
        self.set_fs_settings(settings).await
    }

    /// Read back the device's frontend settings
    pub async fn query_fs_settings(&mut self) -> Result<FrontendSettings, SessionError> {
        self.require(Operation::QueryFsSettings)?;
        match self.configure(&Command::QueryFrontend).await? {
            Response::Frontend(settings) => Ok(settings),
            other => Err(SessionError::Protocol(format!(
                "unexpected frontend reply: {:?}",
                other
            ))),
        }
    }

    /// Replace the measurement setup with one sweep
    ///
    /// The device setup is cleared first. If the sweep block is then refused,
    /// the device holds no sweep and a session that had one drops back to
    /// FrontendConfigured.
    pub async fn set_setup(&mut self, spec: SweepSpec) -> Result<(), SessionError> {
        self.require(Operation::SetSetup)?;
        spec.validate()?;
        let frequencies = plan(&spec)?;

        self.configure(&Command::ResetSetup).await?;

        let block = SweepBlock::from(&spec);
        if let Err(e) = self.configure(&Command::AddSweep(block)).await {
            if matches!(self.state, SessionState::SweepConfigured | SessionState::Stopped) {
                warn!("Sweep cleared on device but not replaced: {}", e);
                self.sweep = None;
                self.frequencies.clear();
                self.state = SessionState::FrontendConfigured;
            }
            return Err(e);
        }

        info!(
            "Sweep set: {} to {} Hz, {} points, {:?}",
            spec.start_hz, spec.end_hz, spec.count, spec.scale
        );
        self.sweep = Some(spec);
        self.frequencies = frequencies;
        self.state = SessionState::SweepConfigured;
        Ok(())
    }

    /// Start measuring `spectra` repetitions of the configured sweep
    ///
    /// Returns a handle that stops the measurement from another task.
    pub async fn start_measurement(&mut self, spectra: u32) -> Result<StopHandle, SessionError> {
        self.require(Operation::StartMeasurement)?;
        let spectra = validate_spectra(spectra)?;

        self.exchange(&Command::StartMeasurement { spectra }).await?;

        let mut decoder = MeasurementDecoder::new(self.frequencies.clone(), spectra);
        let leftover = self.dispatcher()?.begin_stream();
        if !leftover.is_empty() {
            debug!("Handing {} buffered bytes to the decoder", leftover.len());
            decoder.push_bytes(&leftover);
        }

        self.stop.clear();
        self.run = Some(MeasurementRun {
            decoder,
            backlog: VecDeque::new(),
            stop_sent: false,
            drain_expired: false,
            idle: Duration::ZERO,
            consecutive_timeouts: 0,
        });
        self.state = SessionState::Measuring;
        info!(
            "Measurement started: {} spectra of {} points",
            spectra,
            self.frequencies.len()
        );
        Ok(self.stop.clone())
    }

    /// Borrow the running measurement as a lazy stream of points
    pub fn measurements(&mut self) -> Result<MeasurementStream<'_, T>, SessionError> {
        self.require(Operation::ReadMeasurements)?;
        Ok(MeasurementStream::new(self))
    }

    /// Stop the running measurement
    ///
    /// Returns points carried by frames that were still in flight. If the stop
    /// acknowledgement does not arrive in time the session stays Measuring and
    /// the drained points are kept for the next attempt.
    pub async fn stop_measurement(&mut self) -> Result<Vec<MeasurementPoint>, SessionError> {
        self.require(Operation::StopMeasurement)?;
        self.send_stop().await?;
        self.run_mut()?.drain_expired = false;

        let deadline = Instant::now() + self.config.command_timeout();
        loop {
            let run = self.run_mut()?;
            while let Some(event) = run.decoder.next_event() {
                match event {
                    DecodeEvent::Point(point) => run.backlog.push_back(point),
                    DecodeEvent::StopAcknowledged => {
                        let points: Vec<MeasurementPoint> = run.backlog.drain(..).collect();
                        self.finish_stop();
                        return Ok(points);
                    }
                    DecodeEvent::Error(e) => warn!("Dropped frame while stopping: {}", e),
                    DecodeEvent::Message(msg) => debug!("Message while stopping: {}", msg.code),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let ms = self.config.command_timeout_ms;
                warn!("Stop not acknowledged within {}ms", ms);
                return Err(SessionError::Timeout(ms));
            }

            let wait = deadline - now;
            match self.dispatcher()?.read_raw(wait).await {
                Ok(Some(bytes)) => self.run_mut()?.decoder.push_bytes(&bytes),
                Ok(None) => {}
                Err(e) => {
                    self.fail(&e);
                    return Err(SessionError::Io(e));
                }
            }
        }
    }

    /// Software-reset the device and return to Connected
    pub async fn reset(&mut self) -> Result<(), SessionError> {
        self.require(Operation::Reset)?;
        self.exchange(&Command::SoftwareReset).await?;

        info!("Software reset, waiting {:?}", self.config.reset_settle());
        tokio::time::sleep(self.config.reset_settle()).await;

        let poll = self.config.poll_interval();
        if let Err(e) = self.dispatcher()?.discard_input(poll).await {
            self.fail(&e);
            return Err(SessionError::Io(e));
        }

        self.frontend = None;
        self.sweep = None;
        self.frequencies.clear();
        self.state = SessionState::Connected;
        Ok(())
    }

    fn run_mut(&mut self) -> Result<&mut MeasurementRun, SessionError> {
        self.run
            .as_mut()
            .ok_or_else(|| SessionError::Protocol("no measurement running".to_string()))
    }

    /// Write the stop frame once per run
    async fn send_stop(&mut self) -> Result<(), SessionError> {
        if self.run_mut()?.stop_sent {
            return Ok(());
        }
        if let Err(e) = self.dispatcher()?.send_stop().await {
            self.fail(&e);
            return Err(SessionError::Io(e));
        }
        let run = self.run_mut()?;
        run.stop_sent = true;
        run.decoder.stop_requested();
        run.idle = Duration::ZERO;
        Ok(())
    }

    fn finish_stop(&mut self) {
        self.run = None;
        if let Some(dispatcher) = self.dispatcher.as_mut() {
            dispatcher.end_stream();
        }
        self.state = SessionState::Stopped;
        info!("Measurement stopped");
    }

    /// Produce the next item of the measurement stream
    ///
    /// `None` ends the stream: all points decoded, stop acknowledged, or the
    /// session failed. A stop acknowledgement that does not arrive within the
    /// frame timeout is reported once as `Timeout`; the stream then ends with
    /// the session still Measuring, as after [`Self::stop_measurement`].
    pub(crate) async fn next_measurement(
        &mut self,
    ) -> Option<Result<MeasurementPoint, SessionError>> {
        loop {
            if self.state != SessionState::Measuring {
                return None;
            }

            if self.stop.is_stop_requested() {
                if let Err(e) = self.send_stop().await {
                    return Some(Err(e));
                }
            }

            let run = self.run.as_mut()?;
            if let Some(point) = run.backlog.pop_front() {
                return Some(Ok(point));
            }

            while let Some(event) = run.decoder.next_event() {
                match event {
                    DecodeEvent::Point(point) => {
                        run.consecutive_timeouts = 0;
                        return Some(Ok(point));
                    }
                    DecodeEvent::Error(e) => {
                        warn!("Dropped measurement frame: {}", e);
                        return Some(Err(SessionError::Decode(e)));
                    }
                    DecodeEvent::StopAcknowledged => {
                        self.finish_stop();
                        return None;
                    }
                    DecodeEvent::Message(msg) => {
                        warn!("Device message during measurement: {}", msg.code);
                    }
                }
            }

            if run.decoder.is_complete() && !run.stop_sent {
                debug!("All {} points received", run.decoder.produced());
                return None;
            }
            if run.drain_expired {
                return None;
            }

            let poll = self.config.poll_interval();
            let frame_timeout = self.config.frame_timeout();
            let read = match self.dispatcher.as_mut() {
                Some(dispatcher) => dispatcher.read_raw(poll).await,
                None => return None,
            };

            match read {
                Ok(Some(bytes)) => {
                    let run = self.run.as_mut()?;
                    run.idle = Duration::ZERO;
                    run.consecutive_timeouts = 0;
                    run.decoder.push_bytes(&bytes);
                }
                Ok(None) => {
                    let run = self.run.as_mut()?;
                    run.idle += poll;
                    if run.idle >= frame_timeout {
                        run.idle = Duration::ZERO;
                        let ms = self.config.frame_timeout_ms;
                        if run.stop_sent {
                            warn!("Stop not acknowledged within {}ms", ms);
                            run.drain_expired = true;
                            return Some(Err(SessionError::Timeout(ms)));
                        }
                        run.consecutive_timeouts += 1;
                        if run.consecutive_timeouts >= 2 {
                            self.fail(&format!("no measurement frame for {}ms, twice", ms));
                        } else {
                            warn!("No measurement frame for {}ms", ms);
                        }
                        return Some(Err(SessionError::Timeout(ms)));
                    }
                }
                Err(e) => {
                    self.fail(&e);
                    return Some(Err(SessionError::Io(e)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imp_protocol::{
        EncodeCommand, ExcitationType, FrameCodec, MessageCode, ProtocolCodec, Scale,
        SystemMessage, Tag,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn quick_config() -> SessionConfig {
        SessionConfig {
            command_timeout_ms: 100,
            frame_timeout_ms: 100,
            poll_interval_ms: 10,
            config_retries: 0,
            reset_settle_ms: 0,
        }
    }

    fn sweep() -> SweepSpec {
        SweepSpec {
            start_hz: 1000.0,
            end_hz: 10_000.0,
            count: 3,
            scale: Scale::Log,
            precision: 1.0,
            amplitude: 0.1,
            excitation: ExcitationType::Voltage,
        }
    }

    /// Connected session against a hand-driven device end
    async fn connected() -> (DeviceSession<DuplexStream>, DuplexStream) {
        let (host, mut device) = tokio::io::duplex(4096);
        let identity = Response::Identity(DeviceIdentity {
            raw: b"ISX-3".to_vec(),
        });
        device.write_all(&identity.to_frame().encode()).await.unwrap();

        let mut session = DeviceSession::new(quick_config());
        session.connect_with(host).await.unwrap();
        drain(&mut device).await;
        (session, device)
    }

    /// Discard what the host wrote so far
    async fn drain(device: &mut DuplexStream) {
        let mut buf = [0u8; 256];
        while let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(5), device.read(&mut buf)).await
        {
            if n == 0 {
                break;
            }
        }
    }

    async fn ack(device: &mut DuplexStream, tag: Tag) {
        device
            .write_all(&SystemMessage::ack(tag).to_frame().encode())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_stores_identity() {
        let (session, _device) = connected().await;
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.identity().unwrap().to_string(), "ISX-3");
    }

    #[tokio::test]
    async fn test_connect_without_reply_fails() {
        let (host, _device) = tokio::io::duplex(1024);
        let mut session = DeviceSession::new(quick_config());
        let err = session.connect_with(host).await.unwrap_err();
        assert!(matches!(err, SessionError::Connection(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_fs_settings_wait_for_ack() {
        let (mut session, mut device) = connected().await;
        ack(&mut device, Tag::SetFrontend).await;

        session
            .configure_frontend(4, "Main Port", "10mA", "autoranging")
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::FrontendConfigured);
    }

    #[tokio::test]
    async fn test_fs_settings_timeout_leaves_state() {
        let (mut session, _device) = connected().await;
        let err = session
            .configure_frontend(4, "Main Port", "10mA", "autoranging")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout(100)));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_invalid_frontend_string_sends_nothing() {
        let (mut session, mut device) = connected().await;
        let err = session
            .configure_frontend(4, "Port 9", "10mA", "autoranging")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
        assert_eq!(session.state(), SessionState::Connected);

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_millis(20), device.read(&mut buf)).await;
        assert!(read.is_err(), "nothing should have been written");
    }

    #[tokio::test]
    async fn test_start_before_setup_is_state_error() {
        let (mut session, _device) = connected().await;
        let err = session.start_measurement(1).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::State {
                current: SessionState::Connected,
                attempted: Operation::StartMeasurement
            }
        ));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_retry_after_timeout() {
        let (host, mut device) = tokio::io::duplex(4096);
        let identity = Response::Identity(DeviceIdentity::default());
        device.write_all(&identity.to_frame().encode()).await.unwrap();

        let mut config = quick_config();
        config.config_retries = 1;
        let mut session = DeviceSession::new(config);
        session.connect_with(host).await.unwrap();

        // Answer only the second attempt
        let device_task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let mut frames = 0;
            let mut codec = imp_protocol::FrameCodec::new();
            loop {
                let n = device.read(&mut buf).await.unwrap();
                imp_protocol::ProtocolCodec::push_bytes(&mut codec, &buf[..n]);
                while let Some(Ok(frame)) = imp_protocol::ProtocolCodec::next_item(&mut codec) {
                    if frame.tag == Tag::SetFrontend {
                        frames += 1;
                        if frames == 2 {
                            ack(&mut device, Tag::SetFrontend).await;
                            return frames;
                        }
                    }
                }
            }
        });

        session
            .set_fs_settings(FrontendSettings::default())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::FrontendConfigured);
        assert_eq!(device_task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_setup_failure_after_reset_drops_sweep() {
        let (mut session, mut device) = connected().await;
        ack(&mut device, Tag::SetFrontend).await;
        session.set_fs_settings(FrontendSettings::default()).await.unwrap();

        ack(&mut device, Tag::Setup).await;
        ack(&mut device, Tag::Setup).await;
        session.set_setup(sweep()).await.unwrap();
        assert_eq!(session.state(), SessionState::SweepConfigured);
        assert_eq!(session.frequencies().len(), 3);

        // Reset acknowledged, sweep block rejected
        ack(&mut device, Tag::Setup).await;
        device
            .write_all(
                &SystemMessage::nack(imp_protocol::MessageCode::NotExecuted, Tag::Setup)
                    .to_frame()
                    .encode(),
            )
            .await
            .unwrap();
        let err = session.set_setup(sweep()).await.unwrap_err();
        assert!(matches!(err, SessionError::Nack(_)));
        assert_eq!(session.state(), SessionState::FrontendConfigured);
        assert!(session.sweep().is_none());
    }

    #[tokio::test]
    async fn test_late_ack_after_timeout_is_discarded() {
        let (mut session, mut device) = connected().await;
        ack(&mut device, Tag::SetFrontend).await;
        session.set_fs_settings(FrontendSettings::default()).await.unwrap();

        let err = session.set_setup(sweep()).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout(100)));
        assert_eq!(session.state(), SessionState::FrontendConfigured);
        drain(&mut device).await;

        // Late answer to the expired reset
        ack(&mut device, Tag::Setup).await;

        // The retry: reset accepted, sweep block refused
        let device_task = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let mut codec = FrameCodec::new();
            let mut setup_frames = 0;
            loop {
                let n = device.read(&mut buf).await.unwrap();
                codec.push_bytes(&buf[..n]);
                while let Some(Ok(frame)) = codec.next_item() {
                    if frame.tag != Tag::Setup {
                        continue;
                    }
                    setup_frames += 1;
                    if setup_frames == 1 {
                        ack(&mut device, Tag::Setup).await;
                    } else {
                        let nack = SystemMessage::nack(MessageCode::NotExecuted, Tag::Setup);
                        device.write_all(&nack.to_frame().encode()).await.unwrap();
                        return setup_frames;
                    }
                }
            }
        });

        let err = session.set_setup(sweep()).await.unwrap_err();
        assert!(matches!(err, SessionError::Nack(MessageCode::NotExecuted)));
        assert_eq!(session.state(), SessionState::FrontendConfigured);
        assert!(session.sweep().is_none());
        assert_eq!(device_task.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stop_ack_timeout_keeps_measuring() {
        let (mut session, mut device) = connected().await;
        ack(&mut device, Tag::SetFrontend).await;
        session.set_fs_settings(FrontendSettings::default()).await.unwrap();
        ack(&mut device, Tag::Setup).await;
        ack(&mut device, Tag::Setup).await;
        session.set_setup(sweep()).await.unwrap();
        ack(&mut device, Tag::Measurement).await;
        let stop = session.start_measurement(1).await.unwrap();
        drain(&mut device).await;

        // No data and no stop acknowledgement
        stop.stop();
        let mut stream = session.measurements().unwrap();
        assert!(matches!(stream.next().await, Some(Err(SessionError::Timeout(100)))));
        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), SessionState::Measuring);
        drop(stream);

        let summary = session
            .measurements()
            .unwrap()
            .drain_into(&mut Vec::<MeasurementPoint>::new())
            .await
            .unwrap();
        assert_eq!(summary.points, 0);
        assert_eq!(session.state(), SessionState::Measuring);

        assert!(matches!(
            session.stop_measurement().await,
            Err(SessionError::Timeout(100))
        ));
        assert_eq!(session.state(), SessionState::Measuring);

        // A late acknowledgement still completes the stop
        ack(&mut device, Tag::Measurement).await;
        assert!(session.stop_measurement().await.unwrap().is_empty());
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_disconnect_from_errored() {
        let (mut session, device) = connected().await;
        drop(device);
        let err = session
            .set_fs_settings(FrontendSettings::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(session.state(), SessionState::Errored);

        assert!(matches!(
            session.set_fs_settings(FrontendSettings::default()).await,
            Err(SessionError::State { .. })
        ));
        session.disconnect().unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.identity().is_none());
    }

    #[tokio::test]
    async fn test_stop_handle_is_shared() {
        let handle = StopHandle::default();
        let clone = handle.clone();
        clone.stop();
        assert!(handle.is_stop_requested());
        handle.clear();
        assert!(!clone.is_stop_requested());
    }
}
