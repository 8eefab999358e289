//! Sliding-window transfer rate.
//!
//! Bytes are recorded as time-stamped samples; samples older than
//! [`RATE_WINDOW`] are dropped. The rate is the sum of the remaining
//! samples over the time they cover.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Span of history the estimate is computed over.
pub const RATE_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub struct RateEstimator {
    samples: VecDeque<(Instant, u64)>,
    window_start: Instant,
    window_bytes: u64,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RateEstimator {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    pub fn add_data(&mut self, bytes: usize) {
        self.add_data_at(bytes as u64, Instant::now());
    }

    /// Current estimate in bytes/s.
    pub fn transfer_rate(&mut self) -> u64 {
        self.transfer_rate_at(Instant::now())
    }

    /// Forget everything; the window restarts now.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.window_bytes = 0;
        self.window_start = Instant::now();
    }

    pub(crate) fn add_data_at(&mut self, bytes: u64, now: Instant) {
        self.samples.push_back((now, bytes));
        self.window_bytes += bytes;
        self.prune(now);
    }

    pub(crate) fn transfer_rate_at(&mut self, now: Instant) -> u64 {
        self.prune(now);
        if self.window_bytes == 0 {
            return 0;
        }
        let covered = now.saturating_duration_since(self.window_start).min(RATE_WINDOW);
        let millis = covered.as_millis().max(1) as u64;
        self.window_bytes.saturating_mul(1000) / millis
    }

    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(RATE_WINDOW) else {
            return;
        };
        while let Some(&(at, bytes)) = self.samples.front() {
            if at >= cutoff {
                break;
            }
            self.samples.pop_front();
            self.window_bytes -= bytes;
        }
        if self.window_start < cutoff {
            self.window_start = cutoff;
        }
    }
}
