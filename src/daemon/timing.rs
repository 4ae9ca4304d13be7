//! Cycle Timing
//!
//! Keeps the last and average cycle durations published in our status
//! block, and works out how long to sleep before the next cycle.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::warn;

/// Number of cycles in the running average
pub const CYCLE_HISTORY: usize = 60;

/// Rolling cycle time statistics
#[derive(Debug, Clone, Default)]
pub struct CycleTimer {
    history: VecDeque<Duration>,
    last: Duration,
}

impl CycleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record how long a cycle took
    pub fn record(&mut self, elapsed: Duration) {
        if self.history.len() == CYCLE_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(elapsed);
        self.last = elapsed;
    }

    pub fn last(&self) -> Duration {
        self.last
    }

    /// Average over the recorded history
    pub fn average(&self) -> Duration {
        if self.history.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.history.iter().sum();
        total / self.history.len() as u32
    }
}

/// Time left in the interval after a cycle that took `elapsed`
///
/// An overrun sleeps a full interval so the loop does not spin.
pub fn sleep_time(elapsed: Duration, interval: Duration) -> Duration {
    match interval.checked_sub(elapsed) {
        Some(rest) if !rest.is_zero() => rest,
        _ => {
            warn!(
                "Qdisk cycle took more than {}s to complete ({:?})",
                interval.as_secs(),
                elapsed
            );
            interval
        }
    }
}
