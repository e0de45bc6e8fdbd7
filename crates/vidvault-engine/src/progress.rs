//! Progress throttling and speed estimation.
//!
//! The board lives in a chat message, so edits are rate-limited hard: at
//! most one write per job every [`REPORT_INTERVAL`]. Speed and ETA come
//! from a bounded sliding window of byte-count samples.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Minimum wall-clock gap between two board edits for the same job.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(3);

/// Rate-limiter for board edits.
///
/// Ensures edits are not issued more frequently than the configured
/// interval; the first call always passes.
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    /// Create a new throttle with the specified minimum interval.
    #[must_use]
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            min_interval,
        }
    }

    /// Check if enough time has passed to emit another edit.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    /// Force the next check to return true.
    pub const fn reset(&mut self) {
        self.last_emit = None;
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(REPORT_INTERVAL)
    }
}

/// Sliding window of `(instant, bytes_so_far)` samples.
pub struct SpeedWindow {
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedWindow {
    /// Window capacity; older samples are discarded.
    pub const MAX_SAMPLES: usize = 20;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    /// Record the current byte count.
    pub fn push(&mut self, bytes_so_far: u64) {
        if self.samples.len() == Self::MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back((Instant::now(), bytes_so_far));
    }

    /// Average speed across the window, in bytes per second.
    #[must_use]
    pub fn speed_bps(&self) -> f64 {
        let (Some((t0, b0)), Some((t1, b1))) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = t1.duration_since(*t0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            b1.saturating_sub(*b0) as f64 / elapsed
        }
    }

    /// Estimated time to download the remaining bytes.
    #[must_use]
    pub fn eta(&self, bytes_so_far: u64, total: u64) -> Option<Duration> {
        let speed = self.speed_bps();
        if speed <= 0.0 || bytes_so_far >= total {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let secs = (total - bytes_so_far) as f64 / speed;
        Some(Duration::from_secs_f64(secs))
    }
}

impl Default for SpeedWindow {
    fn default() -> Self {
        Self::new()
    }
}
