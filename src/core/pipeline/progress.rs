//! Per-file and aggregate transfer progress, with coalescing throttle.
//!
//! Progress values are owned by the engine and exposed to the
//! presentation layer only as cloned snapshots inside events. Updates are
//! flushed at most once per throttle window, coalescing chunk-level churn
//! into the latest value per file, except final-state transitions
//! (completed/failed), which always flush immediately.

use crate::core::protocol::FileMetadata;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

// ── Per-file progress ────────────────────────────────────────────────────────

/// Lifecycle state of one file within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Queued,
    Sending,
    Receiving,
    Completed,
    Failed,
}

impl FileState {
    /// Completed and Failed are terminal; their updates bypass the
    /// throttle so they are never dropped.
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Completed | FileState::Failed)
    }
}

/// Progress of a single file in one direction.
#[derive(Debug, Clone)]
pub struct FileProgress {
    pub file_id: Uuid,
    pub file_name: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Smoothed speed, bytes/sec.
    pub speed: f64,
    /// `None` renders as "calculating".
    pub eta: Option<Duration>,
    pub state: FileState,
    /// 0.0–100.0; monotonically non-decreasing within one transfer.
    pub percentage: f64,
}

impl FileProgress {
    /// Fresh entry for an offered file.
    pub fn queued(meta: &FileMetadata) -> Self {
        Self {
            file_id: meta.id,
            file_name: meta.name.clone(),
            bytes_transferred: 0,
            total_bytes: meta.size,
            speed: 0.0,
            eta: None,
            state: FileState::Queued,
            percentage: 0.0,
        }
    }

    /// Record transferred bytes plus the current speed/ETA estimates.
    ///
    /// Byte counts and percentage never regress: a stale update arriving
    /// after a newer one (throttle races) cannot move the bar backwards.
    pub fn update(&mut self, bytes_transferred: u64, speed: f64, eta: Option<Duration>) {
        self.bytes_transferred = self.bytes_transferred.max(bytes_transferred);
        self.speed = speed;
        self.eta = eta;
        let pct = if self.total_bytes == 0 {
            100.0
        } else {
            (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
        };
        self.percentage = self.percentage.max(pct.min(100.0));
    }

    /// Transition to a terminal or active state.
    pub fn set_state(&mut self, state: FileState) {
        self.state = state;
        if state == FileState::Completed {
            self.bytes_transferred = self.total_bytes;
            self.percentage = 100.0;
            self.eta = Some(Duration::ZERO);
        }
    }
}

// ── Aggregate progress ───────────────────────────────────────────────────────

/// Session-wide totals, recomputed from the per-file set on each change.
/// Derived data, never persisted separately.
#[derive(Debug, Clone, Default)]
pub struct AggregateProgress {
    pub total_files: usize,
    pub completed_files: usize,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    /// Sum of active per-file speeds, bytes/sec.
    pub overall_speed: f64,
    pub eta: Option<Duration>,
    pub percentage: f64,
}

/// Recompute aggregate totals from the per-file entries.
pub fn aggregate<'a, I>(files: I) -> AggregateProgress
where
    I: IntoIterator<Item = &'a FileProgress>,
{
    let mut agg = AggregateProgress::default();
    for fp in files {
        agg.total_files += 1;
        agg.total_bytes += fp.total_bytes;
        agg.transferred_bytes += fp.bytes_transferred;
        if fp.state == FileState::Completed {
            agg.completed_files += 1;
        } else {
            agg.overall_speed += fp.speed;
        }
    }
    agg.percentage = if agg.total_bytes == 0 {
        if agg.total_files > 0 && agg.completed_files == agg.total_files {
            100.0
        } else {
            0.0
        }
    } else {
        (agg.transferred_bytes as f64 / agg.total_bytes as f64) * 100.0
    };
    let remaining = agg.total_bytes.saturating_sub(agg.transferred_bytes);
    agg.eta = if remaining == 0 {
        Some(Duration::ZERO)
    } else if agg.overall_speed > 0.0 && agg.overall_speed.is_finite() {
        Some(Duration::from_secs_f64(remaining as f64 / agg.overall_speed))
    } else {
        None
    };
    agg
}

// ── Throttle ─────────────────────────────────────────────────────────────────

/// Coalescing flush gate for progress updates.
///
/// `offer` buffers the latest update per file and returns the batch to
/// emit when the window has elapsed (or immediately for terminal
/// states); an empty return means "buffered, flush later".
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last_flush: Option<Instant>,
    pending: HashMap<Uuid, FileProgress>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_flush: None,
            pending: HashMap::new(),
        }
    }

    /// Buffer `update`; flush if due.
    pub fn offer(&mut self, update: FileProgress, now: Instant) -> Vec<FileProgress> {
        let force = update.state.is_terminal();
        self.pending.insert(update.file_id, update);

        let due = match self.last_flush {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.interval,
        };
        if force || due {
            self.last_flush = Some(now);
            self.drain()
        } else {
            Vec::new()
        }
    }

    /// Drain everything currently buffered, regardless of the window.
    pub fn drain(&mut self) -> Vec<FileProgress> {
        self.pending.drain().map(|(_, v)| v).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.last_flush = None;
    }
}
