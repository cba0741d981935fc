//! Lazy access to a running measurement
//!
//! [`MeasurementStream`] borrows the session for as long as the measurement
//! is read, so nothing else can use the channel meanwhile. Points are pulled
//! one at a time with [`MeasurementStream::next`], grouped per spectrum with
//! [`MeasurementStream::next_spectrum`], or pumped into a
//! [`ResultSink`] with [`MeasurementStream::drain_into`].

use imp_protocol::MeasurementPoint;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::session::{DeviceSession, StopHandle};
use crate::sink::ResultSink;
use crate::state::SessionState;

/// All points of one spectrum, plus the errors seen while it was read
#[derive(Debug)]
pub struct Spectrum {
    pub index: u32,
    pub points: Vec<MeasurementPoint>,
    pub errors: Vec<SessionError>,
}

/// Counts from [`MeasurementStream::drain_into`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainSummary {
    pub points: usize,
    /// Non-fatal errors (dropped frames, a single timeout)
    pub errors: usize,
}

/// Stream of points from a running measurement
pub struct MeasurementStream<'a, T> {
    session: &'a mut DeviceSession<T>,
    lookahead: Option<MeasurementPoint>,
    next_index: u32,
}

impl<'a, T> MeasurementStream<'a, T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(session: &'a mut DeviceSession<T>) -> Self {
        Self {
            session,
            lookahead: None,
            next_index: 0,
        }
    }

    /// Handle for stopping the measurement from another task
    pub fn stop_handle(&self) -> StopHandle {
        self.session.stop_handle()
    }

    /// State of the underlying session
    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Next point or non-fatal error; `None` once the stream has ended
    pub async fn next(&mut self) -> Option<Result<MeasurementPoint, SessionError>> {
        if let Some(point) = self.lookahead.take() {
            return Some(Ok(point));
        }
        self.session.next_measurement().await
    }

    /// Points of the next spectrum
    ///
    /// Errors seen while reading it are attached to the spectrum. Returns
    /// `None` once the stream has ended and nothing is left.
    pub async fn next_spectrum(&mut self) -> Option<Spectrum> {
        let mut current: Option<Spectrum> = None;
        let mut errors = Vec::new();

        loop {
            match self.next().await {
                Some(Ok(point)) => match current.as_mut() {
                    Some(spectrum) if spectrum.index != point.spectrum_index => {
                        self.lookahead = Some(point);
                        break;
                    }
                    Some(spectrum) => spectrum.points.push(point),
                    None => {
                        current = Some(Spectrum {
                            index: point.spectrum_index,
                            points: vec![point],
                            errors: std::mem::take(&mut errors),
                        });
                    }
                },
                Some(Err(e)) => match current.as_mut() {
                    Some(spectrum) => spectrum.errors.push(e),
                    None => errors.push(e),
                },
                None => break,
            }
        }

        let spectrum = match current {
            Some(spectrum) => spectrum,
            None if !errors.is_empty() => Spectrum {
                index: self.next_index,
                points: Vec::new(),
                errors,
            },
            None => return None,
        };
        self.next_index = spectrum.index + 1;
        debug!(
            "Spectrum {} complete: {} points, {} errors",
            spectrum.index,
            spectrum.points.len(),
            spectrum.errors.len()
        );
        Some(spectrum)
    }

    /// Pump every remaining point into `sink`
    ///
    /// Non-fatal errors are logged and counted. If the stream ends because the
    /// session failed, the sink is still finished and the failure is returned.
    pub async fn drain_into<S: ResultSink + ?Sized>(
        &mut self,
        sink: &mut S,
    ) -> Result<DrainSummary, SessionError> {
        let mut summary = DrainSummary::default();
        let mut last_error = None;

        while let Some(item) = self.next().await {
            match item {
                Ok(point) => {
                    sink.accept(&point)?;
                    summary.points += 1;
                }
                Err(e) => {
                    warn!("Measurement error: {}", e);
                    summary.errors += 1;
                    last_error = Some(e);
                }
            }
        }
        sink.finish()?;

        if self.session.state() == SessionState::Errored {
            if let Some(e) = last_error {
                return Err(e);
            }
        }
        Ok(summary)
    }
}
