//! Sliding-window tally of worker spawn failures.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Ring of failure timestamps; entries older than the window are evicted on
/// every query. Backs the failure-rate circuit breaker.
#[derive(Debug)]
pub(crate) struct FailureWindow {
    window: Duration,
    timestamps: VecDeque<Instant>,
}

impl FailureWindow {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            timestamps: VecDeque::new(),
        }
    }

    pub(crate) fn record(&mut self, now: Instant) {
        self.evict(now);
        self.timestamps.push_back(now);
    }

    /// Failures inside the trailing window.
    pub(crate) fn count(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.timestamps.len()
    }

    fn evict(&mut self, now: Instant) {
        while self
            .timestamps
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > self.window)
        {
            self.timestamps.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_within_window() {
        let mut w = FailureWindow::new(Duration::from_secs(60));
        let now = Instant::now();
        w.record(now);
        w.record(now);
        assert_eq!(w.count(now), 2);
    }

    #[test]
    fn test_old_entries_evicted() {
        let mut w = FailureWindow::new(Duration::from_secs(60));
        let start = Instant::now();
        w.record(start);
        w.record(start + Duration::from_secs(30));
        assert_eq!(w.count(start + Duration::from_secs(59)), 2);
        assert_eq!(w.count(start + Duration::from_secs(61)), 1);
        assert_eq!(w.count(start + Duration::from_secs(120)), 0);
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let mut w = FailureWindow::new(Duration::from_secs(60));
        let start = Instant::now();
        w.record(start);
        // Exactly at the window edge the entry still counts.
        assert_eq!(w.count(start + Duration::from_secs(60)), 1);
    }
}
