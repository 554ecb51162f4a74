use std::time::Duration;

/// Pairs a clock reading with the logical track position at that reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PositionAnchor {
    pub instant: Duration,
    pub position: Duration,
}

impl PositionAnchor {
    pub fn new(instant: Duration, position: Duration) -> Self {
        Self { instant, position }
    }

    /// Position at clock reading `now`. Readings before the anchor clamp to it.
    pub fn position_at(&self, now: Duration) -> Duration {
        self.position + now.saturating_sub(self.instant)
    }
}
