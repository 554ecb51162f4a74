//! Bounded queue of interleaved `f32` samples between the render stages.
//!
//! Inside the audio output backend:
//! - the transport feeder pushes converted PCM
//! - the optional resampler pops from one queue and pushes into another
//! - the output callback drains without blocking
//!
//! `close()` lets blocked producers give up and lets consumers drain what is left.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Bounded interleaved sample queue with a fixed channel count.
pub struct SampleQueue {
    channels: usize,
    capacity: usize,
    inner: Mutex<Inner>,
    cv: Condvar,
}

struct Inner {
    samples: VecDeque<f32>,
    closed: bool,
}

/// How many frames a pop takes, and whether it waits.
pub enum PopStrategy {
    /// Wait for exactly `frames`; `None` if closed first.
    BlockingExact { frames: usize },
    /// Wait for at least one frame, take up to `max_frames`; `None` once closed and empty.
    BlockingUpTo { max_frames: usize },
    /// Take up to `max_frames` of what is there; `None` if empty.
    NonBlocking { max_frames: usize },
}

/// Queue capacity in samples for `seconds` of audio.
///
/// Non-finite or non-positive `seconds` fall back to two seconds.
pub fn capacity_for(rate_hz: u32, channels: usize, seconds: f32) -> usize {
    let secs = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        2.0
    };
    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels).max(channels)
}

impl SampleQueue {
    pub fn new(channels: usize, capacity_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            capacity: capacity_samples.max(channels),
            inner: Mutex::new(Inner {
                samples: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn len_frames(&self) -> usize {
        self.lock().samples.len() / self.channels
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Mark the producer side finished. Idempotent.
    pub fn close(&self) {
        self.lock().closed = true;
        self.cv.notify_all();
    }

    /// Close and discard everything buffered.
    pub fn close_and_clear(&self) {
        let mut g = self.lock();
        g.closed = true;
        g.samples.clear();
        drop(g);
        self.cv.notify_all();
    }

    /// Push samples, waiting for room. Returns `false` if the queue closed first.
    pub fn push_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.lock();
            while g.samples.len() >= self.capacity && !g.closed {
                g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
            }
            if g.closed {
                return false;
            }
            let room = self.capacity - g.samples.len();
            let end = (offset + room).min(samples.len());
            g.samples.extend(&samples[offset..end]);
            offset = end;
            drop(g);
            self.cv.notify_all();
        }
        true
    }

    pub fn pop(&self, strategy: PopStrategy) -> Option<Vec<f32>> {
        let mut g = self.lock();
        let take = match strategy {
            PopStrategy::BlockingExact { frames } => {
                let want = frames * self.channels;
                while g.samples.len() < want && !g.closed {
                    g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
                }
                if g.samples.len() < want {
                    return None;
                }
                want
            }
            PopStrategy::BlockingUpTo { max_frames } => {
                while g.samples.len() < self.channels && !g.closed {
                    g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
                }
                let frames = (g.samples.len() / self.channels).min(max_frames);
                if frames == 0 {
                    return None;
                }
                frames * self.channels
            }
            PopStrategy::NonBlocking { max_frames } => {
                let frames = (g.samples.len() / self.channels).min(max_frames);
                if frames == 0 {
                    return None;
                }
                frames * self.channels
            }
        };
        let out: Vec<f32> = g.samples.drain(..take).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Block until the queue is closed and fully drained, or `cancel` is set.
    ///
    /// Returns `true` when drained normally.
    pub fn wait_drained_or_cancel(&self, cancel: &AtomicBool) -> bool {
        let mut g = self.lock();
        loop {
            if cancel.load(Ordering::Relaxed) {
                return false;
            }
            if g.closed && g.samples.len() < self.channels {
                return true;
            }
            let (next, _timeout) = self
                .cv
                .wait_timeout(g, Duration::from_millis(50))
                .unwrap_or_else(PoisonError::into_inner);
            g = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn capacity_for_falls_back_on_bad_seconds() {
        assert_eq!(capacity_for(48_000, 2, 2.0), 192_000);
        assert_eq!(capacity_for(48_000, 2, -1.0), 192_000);
        assert_eq!(capacity_for(48_000, 2, f32::NAN), 192_000);
        assert_eq!(capacity_for(0, 2, 1.0), 2);
    }

    #[test]
    fn nonblocking_pop_on_empty_is_none() {
        let q = SampleQueue::new(2, 16);
        assert!(q.pop(PopStrategy::NonBlocking { max_frames: 4 }).is_none());
    }

    #[test]
    fn blocking_exact_waits_for_full_frames() {
        let q = Arc::new(SampleQueue::new(2, 64));
        let q_pop = q.clone();
        let barrier = Arc::new(Barrier::new(2));
        let start = barrier.clone();

        let handle = thread::spawn(move || {
            start.wait();
            q_pop.pop(PopStrategy::BlockingExact { frames: 3 }).unwrap()
        });

        barrier.wait();
        assert!(q.push_blocking(&[0.1, 0.2, 0.3, 0.4]));
        assert!(q.push_blocking(&[0.5, 0.6]));
        assert_eq!(handle.join().unwrap().len(), 6);
    }

    #[test]
    fn blocking_up_to_drains_tail_then_sees_close() {
        let q = Arc::new(SampleQueue::new(2, 64));
        q.push_blocking(&[1.0, 2.0, 3.0, 4.0]);
        q.close();
        let out = q.pop(PopStrategy::BlockingUpTo { max_frames: 8 }).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        assert!(q.pop(PopStrategy::BlockingUpTo { max_frames: 8 }).is_none());
    }

    #[test]
    fn push_into_closed_queue_is_refused() {
        let q = Arc::new(SampleQueue::new(2, 4));
        q.push_blocking(&[1.0, 2.0, 3.0, 4.0]);
        let q_push = q.clone();
        let handle = thread::spawn(move || q_push.push_blocking(&[5.0, 6.0]));
        thread::sleep(Duration::from_millis(10));
        q.close_and_clear();
        assert!(!handle.join().unwrap());
        assert_eq!(q.len_frames(), 0);
    }

    #[test]
    fn wait_drained_or_cancel_reports_how_it_ended() {
        let q = SampleQueue::new(2, 64);
        let cancel = AtomicBool::new(false);
        q.close();
        assert!(q.wait_drained_or_cancel(&cancel));

        let q = SampleQueue::new(2, 64);
        q.push_blocking(&[1.0, 2.0]);
        cancel.store(true, Ordering::Relaxed);
        assert!(!q.wait_drained_or_cancel(&cancel));
    }
}
