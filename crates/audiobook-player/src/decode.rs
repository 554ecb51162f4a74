//! Decoder session: one background thread per playback attempt.
//!
//! The thread holds the decode guard for its whole life:
//! - open the container and initialize the decoder
//! - seek to the requested start
//! - open the transport writer (rendezvous with the rendering pipeline)
//! - decode packets and write interleaved stereo s16le PCM until end of stream,
//!   cancellation, or the reader going away
//!
//! Startup is synchronous: [`DecoderSession::start`] returns only once every step up to
//! the transport open has succeeded, or with the step that failed.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::bounded;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::errors::Error as SymphoniaError;

use crate::config::PlaybackConfig;
use crate::container::{Container, TrackDecoder};
use crate::error::StartError;
use crate::guard;
use crate::transport::{Transport, TransportWriter};

/// Terminal state of a decoder session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Source exhausted; the writer was closed normally.
    Finished,
    /// Cancelled, or the reader went away.
    Cancelled,
    /// Startup or decoding failed.
    Failed(String),
}

/// Handle to a running decoder thread.
pub struct DecoderSession {
    path: PathBuf,
    start_secs: u64,
    stream_rate: Option<u32>,
    cancel: Arc<AtomicBool>,
    transport: Transport,
    join: Option<JoinHandle<SessionOutcome>>,
}

struct Ready {
    stream_rate: Option<u32>,
}

impl DecoderSession {
    /// Spawn a session decoding `path` from `start_secs` into `transport`.
    pub fn start(
        path: &Path,
        start_secs: u64,
        transport: Transport,
        cfg: &PlaybackConfig,
    ) -> Result<Self, StartError> {
        let cancel = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = bounded::<Result<Ready, StartError>>(1);

        let job = SessionJob {
            path: path.to_path_buf(),
            start_secs,
            transport: transport.clone(),
            cancel: cancel.clone(),
            max_consecutive_errors: cfg.max_consecutive_decode_errors,
        };
        let join = thread::Builder::new()
            .name("audiobook-decoder".into())
            .spawn(move || job.run(|r| {
                let _ = ready_tx.send(r);
            }))
            .map_err(StartError::Spawn)?;

        match ready_rx.recv() {
            Ok(Ok(ready)) => {
                tracing::info!(
                    path = %path.display(),
                    start_secs,
                    stream_rate = ?ready.stream_rate,
                    "decoder session started"
                );
                Ok(Self {
                    path: path.to_path_buf(),
                    start_secs,
                    stream_rate: ready.stream_rate,
                    cancel,
                    transport,
                    join: Some(join),
                })
            }
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(StartError::Disconnected)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start_secs(&self) -> u64 {
        self.start_secs
    }

    /// Sample rate of the decoded stream, when the container declares it.
    pub fn stream_rate(&self) -> Option<u32> {
        self.stream_rate
    }

    /// Request cancellation and close the transport so a blocked write returns.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.transport.close();
    }

    /// Whether the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true)
    }

    /// Wait for the thread to exit.
    pub fn join(mut self) -> SessionOutcome {
        self.join_inner()
    }

    /// Cancel, then join.
    pub fn shutdown(self) -> SessionOutcome {
        self.cancel();
        self.join()
    }

    fn join_inner(&mut self) -> SessionOutcome {
        let Some(handle) = self.join.take() else {
            return SessionOutcome::Cancelled;
        };
        match handle.join() {
            Ok(outcome) => {
                tracing::debug!(path = %self.path.display(), ?outcome, "decoder session joined");
                outcome
            }
            Err(_) => SessionOutcome::Failed("decoder thread panicked".to_string()),
        }
    }
}

impl Drop for DecoderSession {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.cancel();
            let _ = self.join_inner();
        }
    }
}

/// Holds at most one decoder session.
#[derive(Default)]
pub struct DecoderSlot {
    session: Option<DecoderSession>,
}

impl DecoderSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session; fails with [`StartError::Busy`] while another is still running.
    pub fn start(
        &mut self,
        path: &Path,
        start_secs: u64,
        transport: Transport,
        cfg: &PlaybackConfig,
    ) -> Result<&DecoderSession, StartError> {
        if let Some(current) = &self.session {
            if !current.is_finished() {
                return Err(StartError::Busy);
            }
        }
        if let Some(done) = self.session.take() {
            let _ = done.join();
        }
        Ok(self
            .session
            .insert(DecoderSession::start(path, start_secs, transport, cfg)?))
    }

    /// Cancel and join the current session, if any.
    pub fn stop(&mut self) -> Option<SessionOutcome> {
        self.session.take().map(DecoderSession::shutdown)
    }

    pub fn is_running(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_finished())
    }

    pub fn session(&self) -> Option<&DecoderSession> {
        self.session.as_ref()
    }
}

struct SessionJob {
    path: PathBuf,
    start_secs: u64,
    transport: Transport,
    cancel: Arc<AtomicBool>,
    max_consecutive_errors: Option<u32>,
}

impl SessionJob {
    fn run(self, report: impl FnOnce(Result<Ready, StartError>)) -> SessionOutcome {
        // Declaration order is teardown order in reverse: writer, decoder, container, lease.
        let lease = guard::acquire();
        let mut container = match Container::open(&lease, &self.path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "decoder open failed: {e}");
                let msg = e.to_string();
                report(Err(StartError::Open(e)));
                return SessionOutcome::Failed(msg);
            }
        };
        let mut decoder = match container.make_decoder() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "decoder init failed: {e}");
                let msg = e.to_string();
                report(Err(StartError::DecoderInit(msg.clone())));
                return SessionOutcome::Failed(msg);
            }
        };

        let skip_until = seek_to_start(&mut container, &mut decoder, self.start_secs);

        let writer = match self.transport.open_writer() {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "transport open failed: {e}");
                report(Err(StartError::TransportOpen));
                return SessionOutcome::Failed(e.to_string());
            }
        };
        writer.announce_duration(container.duration_ms());
        report(Ok(Ready {
            stream_rate: container.sample_rate(),
        }));

        let outcome = self.decode_loop(&mut container, &mut decoder, writer, skip_until);
        tracing::info!(path = %self.path.display(), ?outcome, "decoder session ended");
        outcome
    }

    fn decode_loop(
        &self,
        container: &mut Container<'_>,
        decoder: &mut TrackDecoder<'_>,
        mut writer: TransportWriter,
        skip_until: u64,
    ) -> SessionOutcome {
        let mut consecutive_errors = 0u32;
        let mut sample_buf: Option<SampleBuffer<i16>> = None;
        let mut bytes: Vec<u8> = Vec::new();

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return SessionOutcome::Cancelled;
            }

            let packet = match container.next_packet() {
                Ok(Some(p)) => p,
                Ok(None) => return SessionOutcome::Finished,
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), "read packet failed: {e}");
                    let msg = format!("read packet: {e}");
                    writer.abort(msg.clone());
                    return SessionOutcome::Failed(msg);
                }
            };

            if packet.ts().saturating_add(packet.dur()) <= skip_until {
                continue;
            }
            let trim_frames = skip_until.saturating_sub(packet.ts()) as usize;

            let decoded = match decoder.decode(&packet) {
                Ok(d) => {
                    consecutive_errors = 0;
                    d
                }
                Err(SymphoniaError::ResetRequired) => {
                    decoder.reset();
                    continue;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        ts = packet.ts(),
                        consecutive_errors,
                        "skipping undecodable frame: {e}"
                    );
                    if self
                        .max_consecutive_errors
                        .is_some_and(|cap| consecutive_errors > cap)
                    {
                        let msg = format!("{consecutive_errors} consecutive undecodable frames");
                        tracing::error!(path = %self.path.display(), "{msg}");
                        writer.abort(msg.clone());
                        return SessionOutcome::Failed(msg);
                    }
                    continue;
                }
            };

            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }
            let spec = *decoded.spec();
            let needed = frames * spec.channels.count();
            if sample_buf.as_ref().is_none_or(|b| b.capacity() < needed) {
                sample_buf = Some(SampleBuffer::<i16>::new(frames as u64, spec));
            }
            let Some(buf) = sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            bytes.clear();
            interleave_stereo_s16le(buf.samples(), spec.channels.count(), trim_frames, &mut bytes);
            if bytes.is_empty() {
                continue;
            }

            match writer.write_all(&bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    tracing::debug!(path = %self.path.display(), "transport reader gone");
                    return SessionOutcome::Cancelled;
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), "transport write failed: {e}");
                    return SessionOutcome::Failed(e.to_string());
                }
            }
        }
    }
}

/// Seek so decoding starts at the compressed frame covering `start_secs`.
///
/// Returns the timestamp before which decoded samples are discarded. A failed seek is
/// logged and decoding continues from wherever the reader is.
fn seek_to_start(
    container: &mut Container<'_>,
    decoder: &mut TrackDecoder<'_>,
    start_secs: u64,
) -> u64 {
    let rate = u64::from(container.sample_rate().unwrap_or(0));
    let frame = target_frame(
        start_secs,
        rate,
        container.samples_per_frame(),
        container.total_frames(),
    );
    match container.seek_to_frame(frame) {
        Ok(required_ts) => {
            decoder.reset();
            tracing::debug!(start_secs, frame, required_ts, "seeked");
            required_ts
        }
        Err(e) => {
            tracing::warn!(start_secs, frame, "seek failed: {e}");
            0
        }
    }
}

/// Compressed frame index containing `start_secs`, clamped to the stream.
fn target_frame(start_secs: u64, rate: u64, samples_per_frame: u64, total_samples: Option<u64>) -> u64 {
    if start_secs == 0 || rate == 0 || samples_per_frame == 0 {
        return 0;
    }
    let frame = start_secs.saturating_mul(rate) / samples_per_frame;
    match total_samples {
        Some(total) if total > 0 => frame.min(total.div_ceil(samples_per_frame) - 1),
        _ => frame,
    }
}

/// Map interleaved samples to stereo and append them as s16le bytes.
///
/// Mono is duplicated to both channels; extra channels beyond the first two are dropped.
fn interleave_stereo_s16le(samples: &[i16], channels: usize, skip_frames: usize, out: &mut Vec<u8>) {
    if channels == 0 {
        return;
    }
    for frame in samples.chunks_exact(channels).skip(skip_frames) {
        let left = frame[0];
        let right = if channels > 1 { frame[1] } else { frame[0] };
        out.extend_from_slice(&left.to_le_bytes());
        out.extend_from_slice(&right.to_le_bytes());
    }
}
