//! Rendering pipeline: consumes the PCM transport and renders it.
//!
//! A [`RenderBackend`] builds one [`RenderPipeline`] per playback session. The pipeline's
//! reader end attaches to the transport at build time, before the decoder starts, and
//! end-of-stream or runtime errors are reported asynchronously through [`RenderEvents`].

mod clock;
mod cpal_backend;
mod null;

use std::time::Duration;

use crossbeam_channel::Sender;

use crate::transport::Transport;

pub use clock::{Clock, ManualClock, RunningClock, SystemClock};
pub use cpal_backend::{CpalBackend, CpalOptions};
pub use null::NullBackend;

/// Layout of the PCM carried by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    /// Interleaved stereo signed 16-bit little-endian at `sample_rate`.
    pub fn stereo_s16(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: crate::transport::CHANNELS as u16,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        usize::from(self.channels) * 2
    }

    pub fn bytes_per_second(&self) -> u64 {
        u64::from(self.sample_rate) * self.bytes_per_frame() as u64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderState {
    Playing,
    Paused,
    Stopped,
}

/// Asynchronous notification from a pipeline, tagged with the session that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    EndOfStream { session: u64 },
    Error { session: u64, message: String },
}

impl SessionEvent {
    pub fn session(&self) -> u64 {
        match self {
            SessionEvent::EndOfStream { session } | SessionEvent::Error { session, .. } => *session,
        }
    }
}

/// Event sink handed to a pipeline at build time.
#[derive(Clone)]
pub struct RenderEvents {
    tx: Sender<SessionEvent>,
    session: u64,
}

impl RenderEvents {
    pub fn new(tx: Sender<SessionEvent>, session: u64) -> Self {
        Self { tx, session }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn end_of_stream(&self) {
        tracing::debug!(session = self.session, "pipeline end of stream");
        let _ = self.tx.send(SessionEvent::EndOfStream {
            session: self.session,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(session = self.session, "pipeline error: {message}");
        let _ = self.tx.send(SessionEvent::Error {
            session: self.session,
            message,
        });
    }
}

/// One session's renderer.
pub trait RenderPipeline: Send {
    /// Move to `state`. Stopping releases the transport and the output; it is final.
    fn set_state(&mut self, state: RenderState) -> anyhow::Result<()>;

    fn state(&self) -> RenderState;

    /// Stream duration, when the decoder announced one.
    fn query_duration(&self) -> Option<Duration>;

    /// Current clock reading; `None` unless Playing.
    fn clock_now(&self) -> Option<Duration>;

    /// Clock reading at the most recent transition into Playing; `None` unless Playing.
    fn base_time(&self) -> Option<Duration>;

    /// Rate the pipeline renders the transport at.
    fn sample_rate(&self) -> u32;
}

/// Factory for rendering pipelines.
pub trait RenderBackend: Send + Sync {
    fn build(
        &self,
        transport: &Transport,
        format: PcmFormat,
        events: RenderEvents,
    ) -> anyhow::Result<Box<dyn RenderPipeline>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn pcm_format_byte_rates() {
        let fmt = PcmFormat::stereo_s16(22_050);
        assert_eq!(fmt.channels, 2);
        assert_eq!(fmt.bytes_per_frame(), 4);
        assert_eq!(fmt.bytes_per_second(), 88_200);
    }

    #[test]
    fn events_carry_session_id() {
        let (tx, rx) = unbounded();
        let events = RenderEvents::new(tx, 7);
        events.end_of_stream();
        events.error("boom");
        assert_eq!(rx.recv().unwrap(), SessionEvent::EndOfStream { session: 7 });
        let err = rx.recv().unwrap();
        assert_eq!(err.session(), 7);
        assert_eq!(
            err,
            SessionEvent::Error {
                session: 7,
                message: "boom".into()
            }
        );
    }
}
