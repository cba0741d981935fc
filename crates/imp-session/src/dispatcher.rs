//! Request/response dispatch over the serial channel
//!
//! The dispatcher owns the channel. `send` writes one command frame and reads
//! until the matching response arrives or the deadline passes; since it takes
//! `&mut self`, two exchanges can never interleave. After an exchange times
//! out, whatever the device sends late is discarded before the next command
//! is written. While a measurement stream holds the channel only the stop
//! frame may be written.

use std::io::ErrorKind;
use std::time::Duration;

use imp_protocol::{
    Command, EncodeCommand, Frame, FrameCodec, FramingError, ProtocolCodec, Response,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::DispatchError;

/// Read buffer size
const READ_BUFFER_LEN: usize = 1024;

/// Quiet period that ends the discard of late replies
const STALE_INPUT_WAIT: Duration = Duration::from_millis(10);

/// Sends commands and matches their responses
pub struct CommandDispatcher<T> {
    io: T,
    codec: FrameCodec,
    buffer: Vec<u8>,
    timeout: Duration,
    streaming: bool,
    /// The last exchange expired; late replies may still arrive
    stale: bool,
}

impl<T> CommandDispatcher<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an open channel
    ///
    /// For virtual analyzers, use `DuplexStream` from `tokio::io::duplex()`.
    pub fn new(io: T, timeout: Duration) -> Self {
        Self {
            io,
            codec: FrameCodec::new(),
            buffer: vec![0u8; READ_BUFFER_LEN],
            timeout,
            streaming: false,
            stale: false,
        }
    }

    /// Whether a measurement stream currently holds the channel
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Send a command and wait for its response
    ///
    /// Non-query commands resolve to the acknowledging system message; queries
    /// resolve to their reply frame. Frames still buffered from an earlier
    /// exchange are examined first, unless that exchange expired: then all
    /// pending input is dropped before writing. Unrelated frames are skipped.
    /// A framing error is reported only if no matching response follows it
    /// before the deadline.
    pub async fn send(&mut self, command: &Command) -> Result<Response, DispatchError> {
        if self.streaming {
            return Err(DispatchError::Busy);
        }

        if self.stale {
            self.discard_input(STALE_INPUT_WAIT).await?;
            self.stale = false;
        }

        let frame = command.to_frame();
        debug!("Sending {} ({})", command.name(), frame.tag);
        self.write_frame(&frame).await?;

        let tag = command.tag();
        let reply_tag = command.reply_tag();
        let deadline = Instant::now() + self.timeout;
        let mut framing_error: Option<FramingError> = None;

        loop {
            while let Some(item) = self.codec.next_item() {
                let frame = match item {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Framing error while waiting for {}: {}", command.name(), e);
                        framing_error.get_or_insert(e);
                        continue;
                    }
                };

                match Response::from_frame(&frame) {
                    Ok(Response::System(msg)) if msg.refers_to(tag) && msg.is_nack() => {
                        warn!("{} rejected: {}", command.name(), msg.code);
                        return Err(DispatchError::Nack(msg.code));
                    }
                    Ok(Response::System(msg))
                        if msg.refers_to(tag) && msg.is_ack() && reply_tag.is_none() =>
                    {
                        debug!("{} acknowledged", command.name());
                        return Ok(Response::System(msg));
                    }
                    Ok(response) if Some(frame.tag) == reply_tag => {
                        debug!("{} answered", command.name());
                        return Ok(response);
                    }
                    Ok(other) => {
                        debug!("Skipping unrelated frame: {:?}", other);
                    }
                    Err(e) if Some(frame.tag) == reply_tag => {
                        return Err(DispatchError::UnexpectedResponse(e.to_string()));
                    }
                    Err(e) => {
                        debug!("Skipping undecodable {} frame: {}", frame.tag, e);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.expired(framing_error));
            }

            match tokio::time::timeout(deadline - now, self.io.read(&mut self.buffer)).await {
                Ok(Ok(0)) => {
                    return Err(DispatchError::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "channel closed",
                    )))
                }
                Ok(Ok(n)) => {
                    trace!("RX: {:02X?}", &self.buffer[..n]);
                    self.codec.push_bytes(&self.buffer[..n]);
                }
                Ok(Err(e)) => return Err(DispatchError::Io(e)),
                Err(_) => return Err(self.expired(framing_error)),
            }
        }
    }

    fn expired(&mut self, framing_error: Option<FramingError>) -> DispatchError {
        self.stale = true;
        match framing_error {
            Some(e) => DispatchError::Framing(e),
            None => DispatchError::Timeout(self.timeout.as_millis() as u64),
        }
    }

    /// Write an encoded frame
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), std::io::Error> {
        let bytes = frame.encode();
        trace!("TX: {:02X?}", bytes);
        self.io.write_all(&bytes).await?;
        self.io.flush().await
    }

    /// Hand the channel to a measurement stream
    ///
    /// Returns bytes that arrived behind the last response, which belong to
    /// the stream.
    pub fn begin_stream(&mut self) -> Vec<u8> {
        self.streaming = true;
        self.codec.take_buffered()
    }

    /// Take the channel back from a measurement stream
    pub fn end_stream(&mut self) {
        self.streaming = false;
        self.codec.clear();
    }

    /// Write the stop frame; the only write allowed while streaming
    pub async fn send_stop(&mut self) -> Result<(), std::io::Error> {
        debug!("Sending stop measurement");
        self.write_frame(&Command::StopMeasurement.to_frame()).await
    }

    /// Read whatever arrives within `wait`
    ///
    /// Returns `Ok(None)` if nothing arrived. A closed channel is an error.
    pub async fn read_raw(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, std::io::Error> {
        match tokio::time::timeout(wait, self.io.read(&mut self.buffer)).await {
            Ok(Ok(0)) => Err(std::io::Error::new(ErrorKind::UnexpectedEof, "channel closed")),
            Ok(Ok(n)) => {
                trace!("RX: {:02X?}", &self.buffer[..n]);
                Ok(Some(self.buffer[..n].to_vec()))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Drop anything already received
    pub async fn discard_input(&mut self, wait: Duration) -> Result<usize, std::io::Error> {
        self.codec.clear();
        let mut discarded = 0;
        while let Some(bytes) = self.read_raw(wait).await? {
            discarded += bytes.len();
        }
        if discarded > 0 {
            debug!("Discarded {} stale bytes", discarded);
        }
        Ok(discarded)
    }

    /// Release the channel
    pub fn into_inner(self) -> T {
        self.io
    }
}
