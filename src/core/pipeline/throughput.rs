//! Throughput estimation: smoothed transfer speed and ETA.
//!
//! Byte-delta samples are converted into an exponential moving average
//! (`smoothed = α × instant + (1-α) × smoothed`) plus a bounded rolling
//! window of instantaneous values. One calculator per file, reset at the
//! start of each file's transfer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Default EMA smoothing factor.
pub const DEFAULT_ALPHA: f64 = 0.3;

/// Default rolling-window capacity, in samples.
pub const DEFAULT_WINDOW: usize = 10;

/// Rolling/exponential transfer-speed estimator.
#[derive(Debug, Clone)]
pub struct ThroughputCalculator {
    alpha: f64,
    window_capacity: usize,
    /// Instantaneous speeds of the most recent samples (bytes/sec).
    window: VecDeque<f64>,
    /// EMA of instantaneous speed, bytes/sec. Zero until two samples exist.
    smoothed: f64,
    /// Timestamp of the previous sample; the first call only sets this.
    last_sample_at: Option<Instant>,
}

impl Default for ThroughputCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA, DEFAULT_WINDOW)
    }
}

impl ThroughputCalculator {
    pub fn new(alpha: f64, window_capacity: usize) -> Self {
        Self {
            alpha,
            window_capacity,
            window: VecDeque::with_capacity(window_capacity),
            smoothed: 0.0,
            last_sample_at: None,
        }
    }

    /// Record `bytes` transferred as of `at`.
    ///
    /// The first sample only establishes the baseline timestamp and
    /// contributes no speed value. Samples with a non-positive elapsed
    /// time are ignored (clock went backwards or duplicate timestamp).
    pub fn add_sample(&mut self, bytes: u64, at: Instant) {
        let Some(prev) = self.last_sample_at.replace(at) else {
            return;
        };

        let elapsed = at.saturating_duration_since(prev).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }

        let instant_speed = bytes as f64 / elapsed;
        if self.window.len() == self.window_capacity {
            self.window.pop_front();
        }
        self.window.push_back(instant_speed);

        self.smoothed = if self.smoothed == 0.0 {
            instant_speed
        } else {
            self.alpha * instant_speed + (1.0 - self.alpha) * self.smoothed
        };
    }

    /// Convenience wrapper over [`add_sample`](Self::add_sample) using the
    /// current time.
    pub fn record(&mut self, bytes: u64) {
        self.add_sample(bytes, Instant::now());
    }

    /// Current smoothed speed estimate in bytes/sec; 0 before the second
    /// sample.
    pub fn speed(&self) -> f64 {
        self.smoothed
    }

    /// Plain average over the rolling window, for callers that want a
    /// less damped figure.
    pub fn window_average(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Estimated time to transfer `remaining_bytes` at the smoothed speed.
    ///
    /// `None` means "still calculating" (speed zero or non-finite) and
    /// must not be rendered as a numeric time. Zero remaining bytes is
    /// always `Some(0)`.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        if remaining_bytes == 0 {
            return Some(Duration::ZERO);
        }
        if self.smoothed <= 0.0 || !self.smoothed.is_finite() {
            return None;
        }
        let secs = remaining_bytes as f64 / self.smoothed;
        if !secs.is_finite() {
            return None;
        }
        Some(Duration::from_secs_f64(secs))
    }

    /// Clear all state; used at the start of each file's transfer.
    pub fn reset(&mut self) {
        self.window.clear();
        self.smoothed = 0.0;
        self.last_sample_at = None;
    }
}
