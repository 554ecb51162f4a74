use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::RenderState;

/// Monotonic time source for pipelines.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Wall clock measured from construction.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Render state plus the running-time bookkeeping every backend needs.
///
/// Starts Paused. Entering Playing re-anchors the base time at the current clock reading.
pub struct RunningClock {
    clock: Arc<dyn Clock>,
    state: RenderState,
    base_time: Option<Duration>,
    played_before: Duration,
}

impl RunningClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: RenderState::Paused,
            base_time: None,
            played_before: Duration::ZERO,
        }
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    /// Apply a transition; returns `false` if nothing changed. Stopped is terminal.
    pub fn transition(&mut self, to: RenderState) -> bool {
        if self.state == to || self.state == RenderState::Stopped {
            return false;
        }
        let now = self.clock.now();
        if let Some(base) = self.base_time.take() {
            self.played_before += now.saturating_sub(base);
        }
        if to == RenderState::Playing {
            self.base_time = Some(now);
        }
        self.state = to;
        true
    }

    pub fn now(&self) -> Option<Duration> {
        self.base_time.map(|_| self.clock.now())
    }

    pub fn base_time(&self) -> Option<Duration> {
        self.base_time
    }

    /// Total time spent Playing.
    pub fn running_time(&self) -> Duration {
        let current = self
            .base_time
            .map(|base| self.clock.now().saturating_sub(base))
            .unwrap_or_default();
        self.played_before + current
    }
}
