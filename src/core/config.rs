//! Centralized configuration for linkdrop sessions.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame type bytes) stay in the
//! protocol module.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Smallest adaptive chunk size (16 KiB).
pub const MIN_CHUNK_SIZE: usize = 16 * 1024;

/// Starting chunk size before any throughput samples exist (64 KiB).
pub const INITIAL_CHUNK_SIZE: usize = 64 * 1024;

/// Largest adaptive chunk size on unconstrained platforms (256 KiB).
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Chunk size ceiling for memory-constrained platforms (64 KiB).
///
/// Small SCTP receive buffers choke on larger messages; the constrained
/// profile never grows past this.
pub const MAX_CHUNK_SIZE_CONSTRAINED: usize = 64 * 1024;

/// Target wall-clock time for a single chunk send. The adaptive sizer
/// aims each chunk at this duration: `speed × 0.1s` bytes per chunk.
pub const CHUNK_TARGET_MILLIS: u64 = 100;

/// Blend weight of the previous chunk size when adapting (70% old /
/// 30% new) to damp oscillation between consecutive estimates.
pub const CHUNK_SIZE_BLEND_OLD: f64 = 0.7;

// ── Connection / Retry ───────────────────────────────────────────────────────

/// Maximum automatic connect/reconnect attempts before the manager
/// transitions to the terminal `Error` state.
pub const MAX_CONNECT_RETRIES: u32 = 3;

/// Base delay between retry attempts; attempt n waits
/// `base × BACKOFF_FACTOR^(n-1)`.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(2000);

/// Exponential backoff multiplier.
pub const RETRY_BACKOFF_FACTOR: f64 = 1.5;

/// Time budget for an outbound connection to reach the open state.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ── Backpressure ─────────────────────────────────────────────────────────────

/// High-water mark for the channel's outbound buffer (1 MiB). Binary
/// sends suspend while `buffered_amount` exceeds this value.
pub const BUFFERED_AMOUNT_HIGH: usize = 1024 * 1024;

/// Poll interval while waiting for the outbound buffer to drain.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ── Pacing / Progress ────────────────────────────────────────────────────────

/// Fixed delay between consecutive chunk sends, yielding the event loop
/// and keeping the channel from saturating.
pub const CHUNK_PACING_DELAY: Duration = Duration::from_millis(1);

/// Poll interval while a file's sending loop is paused.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Minimum interval between flushed progress updates. Chunk-level updates
/// inside the window are coalesced to the latest value per file.
pub const PROGRESS_THROTTLE_INTERVAL: Duration = Duration::from_millis(100);

// ── Session configuration ────────────────────────────────────────────────────

/// Tunables for one transfer session. `Default` mirrors the constants
/// above; embedders override individual knobs as needed.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Maximum connect/reconnect attempts.
    pub max_connect_retries: u32,
    /// Base retry delay.
    pub retry_base_delay: Duration,
    /// Backoff multiplier applied per attempt.
    pub retry_backoff_factor: f64,
    /// Outbound connection open timeout.
    pub connect_timeout: Duration,
    /// Outbound buffer high-water mark in bytes.
    pub buffered_amount_high: usize,
    /// Backpressure poll interval.
    pub backpressure_poll: Duration,
    /// Adaptive chunk size floor.
    pub min_chunk_size: usize,
    /// Chunk size used before throughput is known.
    pub initial_chunk_size: usize,
    /// Adaptive chunk size ceiling.
    pub max_chunk_size: usize,
    /// Delay between consecutive chunk sends.
    pub chunk_pacing: Duration,
    /// Poll interval while paused.
    pub pause_poll: Duration,
    /// Progress flush throttle window.
    pub progress_throttle: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_connect_retries: MAX_CONNECT_RETRIES,
            retry_base_delay: RETRY_BASE_DELAY,
            retry_backoff_factor: RETRY_BACKOFF_FACTOR,
            connect_timeout: CONNECT_TIMEOUT,
            buffered_amount_high: BUFFERED_AMOUNT_HIGH,
            backpressure_poll: BACKPRESSURE_POLL_INTERVAL,
            min_chunk_size: MIN_CHUNK_SIZE,
            initial_chunk_size: INITIAL_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_SIZE,
            chunk_pacing: CHUNK_PACING_DELAY,
            pause_poll: PAUSE_POLL_INTERVAL,
            progress_throttle: PROGRESS_THROTTLE_INTERVAL,
        }
    }
}

impl TransferConfig {
    /// Profile for memory-constrained platforms: chunk growth capped at
    /// [`MAX_CHUNK_SIZE_CONSTRAINED`].
    pub fn constrained() -> Self {
        Self {
            max_chunk_size: MAX_CHUNK_SIZE_CONSTRAINED,
            ..Self::default()
        }
    }

    /// Delay before retry attempt `attempt` (1-based):
    /// `base × factor^(attempt-1)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = self
            .retry_backoff_factor
            .powi(attempt.saturating_sub(1) as i32);
        self.retry_base_delay.mul_f64(factor)
    }
}
