//! Rolling per-window counter used for log-rate load reporting.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const BUCKET: Duration = Duration::from_secs(1);

/// Counts events over a sliding window using one-second buckets.
#[derive(Debug, Clone)]
pub struct RollingCounter {
    buckets: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl RollingCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            buckets: VecDeque::new(),
            window,
        }
    }

    /// One-minute window
    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    pub fn add(&mut self, n: u64) {
        self.add_at(Instant::now(), n);
    }

    pub fn add_at(&mut self, now: Instant, n: u64) {
        match self.buckets.back_mut() {
            Some((start, count)) if now.saturating_duration_since(*start) < BUCKET => {
                *count += n;
            }
            _ => self.buckets.push_back((now, n)),
        }
        self.expire(now);
    }

    /// Sum of events within the window ending at `now`.
    pub fn total_at(&mut self, now: Instant) -> u64 {
        self.expire(now);
        self.buckets.iter().map(|(_, n)| n).sum()
    }

    pub fn total(&mut self) -> u64 {
        self.total_at(Instant::now())
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((time, _)) = self.buckets.front() {
            if now.saturating_duration_since(*time) > self.window {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }
}
