//! Audio output backend built on CPAL.
//!
//! Stage wiring per session:
//! - feeder thread: transport reader → s16le to `f32` → source queue
//! - optional resampler thread when the device cannot run at the book's rate
//! - output thread: owns the CPAL stream (not `Send`) until the pipeline stops
//! - watcher thread: waits for the output queue to drain, then reports end of stream
//!
//! Pause uses the callback's paused flag: silence is played and nothing is drained.

use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Sender, bounded};

use super::{
    PcmFormat, RenderBackend, RenderEvents, RenderPipeline, RenderState, RunningClock, SystemClock,
};
use crate::config::PlaybackConfig;
use crate::device;
use crate::playback::{self, OutputOptions};
use crate::queue::{SampleQueue, capacity_for};
use crate::resample::{self, ResampleConfig};
use crate::transport::{Transport, TransportReader};

/// Output selection for [`CpalBackend`].
#[derive(Clone, Debug, Default)]
pub struct CpalOptions {
    /// Case-insensitive device name substring; `None` uses the host default.
    pub device: Option<String>,
}

/// Backend rendering to a CPAL output device.
pub struct CpalBackend {
    options: CpalOptions,
    playback: PlaybackConfig,
}

impl CpalBackend {
    pub fn new(options: CpalOptions, playback: PlaybackConfig) -> Self {
        Self { options, playback }
    }
}

impl RenderBackend for CpalBackend {
    fn build(
        &self,
        transport: &Transport,
        format: PcmFormat,
        events: RenderEvents,
    ) -> Result<Box<dyn RenderPipeline>> {
        let host = cpal::default_host();
        let device = device::pick_device(&host, self.options.device.as_deref())?;
        let config = device::pick_output_config(&device, format.sample_rate)?;
        let mut stream_config: cpal::StreamConfig = config.clone().into();
        if let Some(size) = device::pick_buffer_size(&config) {
            stream_config.buffer_size = size;
        }
        let device_name = device
            .description()
            .map(|d| d.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        tracing::info!(
            device = %device_name,
            src_rate = format.sample_rate,
            dst_rate = stream_config.sample_rate,
            channels = stream_config.channels,
            sample_format = ?config.sample_format(),
            "output selected"
        );

        let reader = transport
            .open_reader()
            .context("attach transport reader")?;
        let channels = usize::from(format.channels);
        let srcq = Arc::new(SampleQueue::new(
            channels,
            capacity_for(format.sample_rate, channels, self.playback.buffer_seconds),
        ));
        let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let mut joins = Vec::new();

        let feeder = Feeder {
            reader,
            srcq: srcq.clone(),
            failure: failure.clone(),
        };
        joins.push(
            thread::Builder::new()
                .name("audiobook-feeder".into())
                .spawn(move || feeder.run())
                .context("spawn feeder thread")?,
        );

        let dst_rate = stream_config.sample_rate;
        let dstq = if dst_rate == format.sample_rate {
            tracing::info!(rate_hz = dst_rate, "resample skipped");
            srcq.clone()
        } else {
            let stage = match resample::start_resampler(
                srcq.clone(),
                format.sample_rate,
                dst_rate,
                ResampleConfig {
                    chunk_frames: self.playback.chunk_frames,
                    buffer_seconds: self.playback.buffer_seconds,
                },
            ) {
                Ok(stage) => stage,
                Err(e) => {
                    transport.close();
                    srcq.close_and_clear();
                    for join in joins {
                        let _ = join.join();
                    }
                    return Err(e);
                }
            };
            joins.push(stage.join);
            stage.output
        };

        let paused = Arc::new(AtomicBool::new(true));
        let played_frames = Arc::new(AtomicU64::new(0));
        let output = OutputOptions {
            refill_max_frames: self.playback.refill_max_frames,
            paused: paused.clone(),
            played_frames: played_frames.clone(),
        };
        let (stop_tx, output_join) = match spawn_output_thread(
            self.options.device.clone(),
            stream_config,
            config.sample_format(),
            dstq.clone(),
            output,
            events.clone(),
        ) {
            Ok(spawned) => spawned,
            Err(e) => {
                transport.close();
                srcq.close_and_clear();
                dstq.close_and_clear();
                for join in joins {
                    let _ = join.join();
                }
                return Err(e);
            }
        };
        joins.push(output_join);

        let cancel = Arc::new(AtomicBool::new(false));
        let mut pipeline = CpalPipeline {
            clock: Mutex::new(RunningClock::new(Arc::new(SystemClock::new()))),
            format,
            transport: transport.clone(),
            srcq,
            dstq: dstq.clone(),
            paused,
            played_frames,
            cancel: cancel.clone(),
            stop_tx: Some(stop_tx),
            joins,
        };

        let watcher = Watcher {
            dstq,
            cancel,
            failure,
            events,
        };
        // On spawn failure the pipeline drops and tears the other stages down.
        let join = thread::Builder::new()
            .name("audiobook-eos-watch".into())
            .spawn(move || watcher.run())
            .context("spawn watcher thread")?;
        pipeline.joins.push(join);

        Ok(Box::new(pipeline))
    }
}

/// Build the CPAL stream on its own thread and keep it there until told to stop.
fn spawn_output_thread(
    device_needle: Option<String>,
    stream_config: cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    dstq: Arc<SampleQueue>,
    output: OutputOptions,
    events: RenderEvents,
) -> Result<(Sender<()>, JoinHandle<()>)> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let (ready_tx, ready_rx) = bounded::<Result<()>>(1);

    let join = thread::Builder::new()
        .name("audiobook-output".into())
        .spawn(move || {
            let stream = (|| -> Result<cpal::Stream> {
                let host = cpal::default_host();
                let device = device::pick_device(&host, device_needle.as_deref())?;
                let err_events = events.clone();
                let stream = playback::build_output_stream(
                    &device,
                    &stream_config,
                    sample_format,
                    &dstq,
                    output,
                    move |err| err_events.error(format!("output stream error: {err}")),
                )?;
                stream.play().context("start output stream")?;
                Ok(stream)
            })();
            match stream {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        })
        .context("spawn output thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok((stop_tx, join)),
        Ok(Err(e)) => {
            let _ = join.join();
            Err(e)
        }
        Err(_) => {
            let _ = join.join();
            Err(anyhow!("output thread exited during setup"))
        }
    }
}

struct CpalPipeline {
    clock: Mutex<RunningClock>,
    format: PcmFormat,
    transport: Transport,
    srcq: Arc<SampleQueue>,
    dstq: Arc<SampleQueue>,
    paused: Arc<AtomicBool>,
    played_frames: Arc<AtomicU64>,
    cancel: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    joins: Vec<JoinHandle<()>>,
}

impl CpalPipeline {
    fn clock(&self) -> MutexGuard<'_, RunningClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&mut self) {
        self.paused.store(true, Ordering::Relaxed);
        self.cancel.store(true, Ordering::Relaxed);
        self.transport.close();
        self.srcq.close_and_clear();
        self.dstq.close_and_clear();
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
        tracing::debug!(
            played_frames = self.played_frames.load(Ordering::Relaxed),
            "output pipeline stopped"
        );
    }
}

impl RenderPipeline for CpalPipeline {
    fn set_state(&mut self, state: RenderState) -> Result<()> {
        if !self.clock().transition(state) {
            return Ok(());
        }
        match state {
            RenderState::Playing => self.paused.store(false, Ordering::Relaxed),
            RenderState::Paused => self.paused.store(true, Ordering::Relaxed),
            RenderState::Stopped => self.teardown(),
        }
        Ok(())
    }

    fn state(&self) -> RenderState {
        self.clock().state()
    }

    fn query_duration(&self) -> Option<Duration> {
        self.transport.duration_ms().map(Duration::from_millis)
    }

    fn clock_now(&self) -> Option<Duration> {
        self.clock().now()
    }

    fn base_time(&self) -> Option<Duration> {
        self.clock().base_time()
    }

    fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }
}

impl Drop for CpalPipeline {
    fn drop(&mut self) {
        let _ = self.set_state(RenderState::Stopped);
    }
}

struct Feeder {
    reader: TransportReader,
    srcq: Arc<SampleQueue>,
    failure: Arc<Mutex<Option<String>>>,
}

impl Feeder {
    fn run(mut self) {
        let mut bytes = vec![0u8; 16 * 1024];
        let mut pending = 0usize;
        let mut samples: Vec<f32> = Vec::with_capacity(bytes.len() / 2);
        loop {
            match self.reader.read(&mut bytes[pending..]) {
                Ok(0) => break,
                Ok(n) => {
                    let have = pending + n;
                    let whole = have - have % 2;
                    samples.clear();
                    samples.extend(
                        bytes[..whole]
                            .chunks_exact(2)
                            .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0),
                    );
                    bytes.copy_within(whole..have, 0);
                    pending = have - whole;
                    if !self.srcq.push_blocking(&samples) {
                        return;
                    }
                }
                Err(e) => {
                    *self.failure.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(format!("transport: {e}"));
                    break;
                }
            }
        }
        self.srcq.close();
    }
}

struct Watcher {
    dstq: Arc<SampleQueue>,
    cancel: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<String>>>,
    events: RenderEvents,
}

impl Watcher {
    fn run(self) {
        if !self.dstq.wait_drained_or_cancel(&self.cancel) {
            return;
        }
        // Let the device play out what the callback already took.
        thread::sleep(Duration::from_millis(100));
        if self.cancel.load(Ordering::Relaxed) {
            return;
        }
        let failure = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match failure {
            Some(message) => self.events.error(message),
            None => self.events.end_of_stream(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SessionEvent;
    use crate::queue::PopStrategy;
    use std::io::Write;

    #[test]
    fn feeder_converts_s16le_and_closes_on_eof() {
        let transport = Transport::new(1024);
        let reader = transport.open_reader().unwrap();
        let srcq = Arc::new(SampleQueue::new(2, 1024));
        let failure = Arc::new(Mutex::new(None));
        let feeder = Feeder {
            reader,
            srcq: srcq.clone(),
            failure: failure.clone(),
        };
        let handle = thread::spawn(move || feeder.run());

        {
            let mut w = transport.open_writer().unwrap();
            w.write_all(&i16::MAX.to_le_bytes()).unwrap();
            w.write_all(&[0x00]).unwrap();
            w.write_all(&[0x80]).unwrap();
        }
        handle.join().unwrap();

        assert!(srcq.is_closed());
        let out = srcq.pop(PopStrategy::NonBlocking { max_frames: 8 }).unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[0] - 32767.0 / 32768.0).abs() < 1e-6);
        assert_eq!(out[1], -1.0);
        assert!(failure.lock().unwrap().is_none());
    }

    #[test]
    fn feeder_records_writer_abort() {
        let transport = Transport::new(1024);
        let reader = transport.open_reader().unwrap();
        let srcq = Arc::new(SampleQueue::new(2, 1024));
        let failure = Arc::new(Mutex::new(None));
        let feeder = Feeder {
            reader,
            srcq: srcq.clone(),
            failure: failure.clone(),
        };
        let handle = thread::spawn(move || feeder.run());
        transport.open_writer().unwrap().abort("bad stream");
        handle.join().unwrap();

        assert!(srcq.is_closed());
        let msg = failure.lock().unwrap().clone().unwrap();
        assert!(msg.contains("bad stream"));
    }

    #[test]
    fn watcher_reports_failure_instead_of_eos() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let dstq = Arc::new(SampleQueue::new(2, 16));
        dstq.close();
        let watcher = Watcher {
            dstq,
            cancel: Arc::new(AtomicBool::new(false)),
            failure: Arc::new(Mutex::new(Some("transport: gone".into()))),
            events: RenderEvents::new(tx, 3),
        };
        watcher.run();
        match rx.recv().unwrap() {
            SessionEvent::Error { session, message } => {
                assert_eq!(session, 3);
                assert_eq!(message, "transport: gone");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn cancelled_watcher_stays_quiet() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let watcher = Watcher {
            dstq: Arc::new(SampleQueue::new(2, 16)),
            cancel: Arc::new(AtomicBool::new(true)),
            failure: Arc::new(Mutex::new(None)),
            events: RenderEvents::new(tx, 3),
        };
        watcher.run();
        assert!(rx.try_recv().is_err());
    }
}
