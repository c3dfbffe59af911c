//! Per-metric schedule tracking.

use std::time::Duration;

use tokio::time::Instant;

use crate::catalog::IntervalUnit;

/// Convert an interval magnitude and unit into a duration.
///
/// Saturates instead of overflowing; the catalog rejects intervals long
/// enough for that to matter.
pub fn interval_duration(magnitude: u64, unit: IntervalUnit) -> Duration {
    Duration::from_secs(magnitude.saturating_mul(unit.seconds()))
}

/// Schedule state for one metric.
///
/// Created the first time the orchestrator sees a metric and only ever
/// changed through [`JobTracker::mark_executed`].
#[derive(Debug, Clone)]
pub struct JobTracker {
    interval: Duration,
    last_run: Option<Instant>,
    next_run: Option<Instant>,
}

impl JobTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_run: None,
            next_run: None,
        }
    }

    /// A job that never ran is always due.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.next_run {
            None => true,
            Some(next_run) => now >= next_run,
        }
    }

    /// Record an execution at `now` and schedule the next one.
    pub fn mark_executed(&mut self, now: Instant) {
        self.last_run = Some(now);
        self.next_run = Some(now + self.interval);
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_run(&self) -> Option<Instant> {
        self.last_run
    }

    pub fn next_run(&self) -> Option<Instant> {
        self.next_run
    }
}
