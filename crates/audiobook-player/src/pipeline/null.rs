//! Headless backend: consumes the transport at real-time pace and discards it.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;

use super::{
    Clock, PcmFormat, RenderBackend, RenderEvents, RenderPipeline, RenderState, RunningClock,
    SystemClock,
};
use crate::transport::{Transport, TransportReader};

/// Audio allowed to be consumed ahead of the clock, like a device buffer.
const DEFAULT_LEAD: Duration = Duration::from_millis(250);
const POLL: Duration = Duration::from_millis(5);

/// Backend whose pipelines pace reads by a [`Clock`] without producing sound.
pub struct NullBackend {
    clock: Arc<dyn Clock>,
    lead: Duration,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            lead: DEFAULT_LEAD,
        }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for NullBackend {
    fn build(
        &self,
        transport: &Transport,
        format: PcmFormat,
        events: RenderEvents,
    ) -> anyhow::Result<Box<dyn RenderPipeline>> {
        let reader = transport
            .open_reader()
            .context("attach transport reader")?;
        let shared = Arc::new(Shared {
            clock: Mutex::new(RunningClock::new(self.clock.clone())),
            cv: Condvar::new(),
            stop: AtomicBool::new(false),
        });

        let drain = Drain {
            reader,
            shared: shared.clone(),
            bytes_per_second: format.bytes_per_second(),
            lead: self.lead,
            events,
        };
        let join = thread::Builder::new()
            .name("audiobook-null-sink".into())
            .spawn(move || drain.run())
            .context("spawn null sink thread")?;

        Ok(Box::new(NullPipeline {
            shared,
            transport: transport.clone(),
            format,
            join: Some(join),
        }))
    }
}

struct Shared {
    clock: Mutex<RunningClock>,
    cv: Condvar,
    stop: AtomicBool,
}

impl Shared {
    fn clock(&self) -> MutexGuard<'_, RunningClock> {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct NullPipeline {
    shared: Arc<Shared>,
    transport: Transport,
    format: PcmFormat,
    join: Option<JoinHandle<()>>,
}

impl RenderPipeline for NullPipeline {
    fn set_state(&mut self, state: RenderState) -> anyhow::Result<()> {
        if !self.shared.clock().transition(state) {
            return Ok(());
        }
        if state == RenderState::Stopped {
            self.shared.stop.store(true, Ordering::Relaxed);
            self.transport.close();
            self.shared.cv.notify_all();
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
        } else {
            self.shared.cv.notify_all();
        }
        Ok(())
    }

    fn state(&self) -> RenderState {
        self.shared.clock().state()
    }

    fn query_duration(&self) -> Option<Duration> {
        self.transport.duration_ms().map(Duration::from_millis)
    }

    fn clock_now(&self) -> Option<Duration> {
        self.shared.clock().now()
    }

    fn base_time(&self) -> Option<Duration> {
        self.shared.clock().base_time()
    }

    fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }
}

impl Drop for NullPipeline {
    fn drop(&mut self) {
        let _ = self.set_state(RenderState::Stopped);
    }
}

struct Drain {
    reader: TransportReader,
    shared: Arc<Shared>,
    bytes_per_second: u64,
    lead: Duration,
    events: RenderEvents,
}

impl Drain {
    fn run(mut self) {
        let mut consumed = 0u64;
        let mut buf = [0u8; 4096];
        loop {
            let Some(running) = self.wait_playing() else {
                return;
            };
            let allowed = bytes_for(running + self.lead, self.bytes_per_second);
            if consumed >= allowed {
                thread::sleep(POLL);
                continue;
            }

            let want = ((allowed - consumed) as usize).min(buf.len());
            match self.reader.read(&mut buf[..want]) {
                Ok(0) => {
                    if !self.stopped() {
                        self.events.end_of_stream();
                    }
                    return;
                }
                Ok(n) => consumed += n as u64,
                Err(e) => {
                    if !self.stopped() {
                        self.events.error(format!("transport: {e}"));
                    }
                    return;
                }
            }
        }
    }

    /// Block while paused; returns the running time once Playing, `None` once stopped.
    fn wait_playing(&self) -> Option<Duration> {
        let mut rc = self.shared.clock();
        loop {
            if self.stopped() {
                return None;
            }
            if rc.state() == RenderState::Playing {
                return Some(rc.running_time());
            }
            rc = self
                .shared
                .cv
                .wait_timeout(rc, Duration::from_millis(20))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Relaxed)
    }
}

fn bytes_for(elapsed: Duration, bytes_per_second: u64) -> u64 {
    (elapsed.as_secs_f64() * bytes_per_second as f64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ManualClock, SessionEvent};
    use crate::transport::BYTES_PER_FRAME;
    use crossbeam_channel::unbounded;
    use std::io::Write;

    fn build(
        clock: &ManualClock,
        transport: &Transport,
    ) -> (Box<dyn RenderPipeline>, crossbeam_channel::Receiver<SessionEvent>) {
        let (tx, rx) = unbounded();
        let backend = NullBackend::with_clock(Arc::new(clock.clone()));
        let pipeline = backend
            .build(transport, PcmFormat::stereo_s16(1_000), RenderEvents::new(tx, 1))
            .unwrap();
        (pipeline, rx)
    }

    #[test]
    fn bytes_for_scales_linearly() {
        assert_eq!(bytes_for(Duration::from_secs(2), 4_000), 8_000);
        assert_eq!(bytes_for(Duration::from_millis(250), 4_000), 1_000);
    }

    #[test]
    fn consumption_follows_the_clock() {
        let clock = ManualClock::new();
        let transport = Transport::new(64 * 1024);
        let (mut pipeline, _rx) = build(&clock, &transport);
        let mut writer = transport.open_writer().unwrap();
        writer.write_all(&vec![0u8; 10 * 1_000 * BYTES_PER_FRAME]).unwrap();

        pipeline.set_state(RenderState::Playing).unwrap();
        clock.advance(Duration::from_secs(2));
        let expected_left = (10 * 1_000 - 2_250) * BYTES_PER_FRAME;
        for _ in 0..400 {
            if transport.buffered() <= expected_left {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(transport.buffered(), expected_left);
        pipeline.set_state(RenderState::Stopped).unwrap();
    }

    #[test]
    fn end_of_stream_after_writer_finishes() {
        let clock = ManualClock::new();
        let transport = Transport::new(64 * 1024);
        let (mut pipeline, rx) = build(&clock, &transport);
        {
            let mut writer = transport.open_writer().unwrap();
            writer.announce_duration(Some(500));
            writer.write_all(&vec![0u8; 500 * BYTES_PER_FRAME]).unwrap();
        }
        assert_eq!(pipeline.query_duration(), Some(Duration::from_millis(500)));

        pipeline.set_state(RenderState::Playing).unwrap();
        clock.advance(Duration::from_secs(1));
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(event, SessionEvent::EndOfStream { session: 1 });
        pipeline.set_state(RenderState::Stopped).unwrap();
    }

    #[test]
    fn writer_abort_becomes_error_event() {
        let clock = ManualClock::new();
        let transport = Transport::new(1024);
        let (mut pipeline, rx) = build(&clock, &transport);
        let writer = transport.open_writer().unwrap();
        writer.abort("decoder gave up");

        pipeline.set_state(RenderState::Playing).unwrap();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            SessionEvent::Error { message, .. } => assert!(message.contains("decoder gave up")),
            other => panic!("unexpected event {other:?}"),
        }
        pipeline.set_state(RenderState::Stopped).unwrap();
    }

    #[test]
    fn stop_is_silent_and_closes_transport() {
        let clock = ManualClock::new();
        let transport = Transport::new(1024);
        let (mut pipeline, rx) = build(&clock, &transport);
        pipeline.set_state(RenderState::Playing).unwrap();
        pipeline.set_state(RenderState::Stopped).unwrap();
        assert!(transport.is_closed());
        assert_eq!(pipeline.state(), RenderState::Stopped);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn clock_readings_only_while_playing() {
        let clock = ManualClock::new();
        let transport = Transport::new(1024);
        let (mut pipeline, _rx) = build(&clock, &transport);
        assert_eq!(pipeline.clock_now(), None);
        clock.advance(Duration::from_secs(3));
        pipeline.set_state(RenderState::Playing).unwrap();
        assert_eq!(pipeline.base_time(), Some(Duration::from_secs(3)));
        clock.advance(Duration::from_secs(2));
        assert_eq!(pipeline.clock_now(), Some(Duration::from_secs(5)));
        pipeline.set_state(RenderState::Paused).unwrap();
        assert_eq!(pipeline.base_time(), None);
    }
}
