use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Timestamps of events within a trailing time span
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    span: Duration,
    stamps: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            stamps: VecDeque::new(),
        }
    }

    pub fn span(&self) -> Duration {
        self.span
    }

    /// Drop events older than the span
    pub fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.stamps.front() {
            if now.saturating_duration_since(oldest) >= self.span {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn count(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.stamps.len()
    }

    pub fn push(&mut self, now: Instant) {
        self.stamps.push_back(now);
    }

    /// Time until fewer than `limit` events remain in the window
    pub fn wait_for_capacity(&mut self, now: Instant, limit: usize) -> Duration {
        self.prune(now);
        if self.stamps.len() < limit {
            return Duration::ZERO;
        }
        if limit == 0 {
            return self.span;
        }
        // The oldest `len - limit + 1` events have to age out
        let pivot = self.stamps[self.stamps.len() - limit];
        (pivot + self.span).saturating_duration_since(now)
    }
}
