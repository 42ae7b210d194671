//! Chunk math and receive-side reassembly.
//!
//! The adaptive sizer is a pure function of (previous size, smoothed
//! speed, platform bounds) so it can be tested without a live connection.
//! [`FileAssembly`] is the per-file receive buffer: chunks are stored by
//! index, out-of-order arrival and duplicates are tolerated, and gaps are
//! reported as protocol violations at finalization.

use crate::core::config::{CHUNK_SIZE_BLEND_OLD, CHUNK_TARGET_MILLIS};
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use uuid::Uuid;

// ── Adaptive sizing ──────────────────────────────────────────────────────────

/// Platform bounds for the adaptive chunk size.
#[derive(Debug, Clone, Copy)]
pub struct ChunkBounds {
    pub min: usize,
    pub max: usize,
}

/// Compute the next chunk size from the previous one and the current
/// smoothed speed (bytes/sec).
///
/// Targets [`CHUNK_TARGET_MILLIS`] of transfer time per chunk
/// (`speed × 0.1s` bytes), blended 70% old / 30% new to avoid
/// oscillation, then clamped to the platform bounds. A zero or
/// non-finite speed leaves the size unchanged (still clamped).
pub fn next_chunk_size(previous: usize, speed_bps: f64, bounds: ChunkBounds) -> usize {
    let blended = if speed_bps > 0.0 && speed_bps.is_finite() {
        let target = speed_bps * (CHUNK_TARGET_MILLIS as f64 / 1000.0);
        CHUNK_SIZE_BLEND_OLD * previous as f64 + (1.0 - CHUNK_SIZE_BLEND_OLD) * target
    } else {
        previous as f64
    };
    (blended as usize).clamp(bounds.min, bounds.max)
}

/// Number of chunks a file of `size` bytes yields at a fixed `chunk_size`.
/// Empty files still occupy one (empty) chunk so the protocol has
/// something to complete.
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    if size == 0 {
        return 1;
    }
    size.div_ceil(chunk_size as u64) as u32
}

// ── Receive-side assembly ────────────────────────────────────────────────────

/// Ordered buffer accumulating one file's chunks on the receiving side.
///
/// Chunks are indexed, not offset-based: because the sender's chunk size
/// adapts during the transfer, only index order is meaningful. The final
/// chunk count arrives with the file-complete message and drives the gap
/// check in [`finalize`](Self::finalize).
#[derive(Debug)]
pub struct FileAssembly {
    file_id: Uuid,
    expected_bytes: u64,
    received_bytes: u64,
    chunks: BTreeMap<u32, Bytes>,
}

impl FileAssembly {
    pub fn new(file_id: Uuid, expected_bytes: u64) -> Self {
        Self {
            file_id,
            expected_bytes,
            received_bytes: 0,
            chunks: BTreeMap::new(),
        }
    }

    /// Store a chunk at its index. Duplicates (sender retries after a
    /// reconnect race) are ignored so byte counters are not inflated.
    /// Returns whether the chunk was new.
    pub fn insert(&mut self, index: u32, payload: Bytes) -> bool {
        if self.chunks.contains_key(&index) {
            return false;
        }
        self.received_bytes += payload.len() as u64;
        self.chunks.insert(index, payload);
        true
    }

    /// Bytes accumulated so far.
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    /// Total bytes advertised in the offer.
    pub fn expected_bytes(&self) -> u64 {
        self.expected_bytes
    }

    /// Indices missing from `0..total_chunks`.
    pub fn missing(&self, total_chunks: u32) -> Vec<u32> {
        (0..total_chunks)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    /// Concatenate all chunks in index order into the complete payload.
    ///
    /// Fails with a protocol error if any index in `0..total_chunks` was
    /// never received or if the reassembled size does not match the
    /// offered size. A gap is a violation, never silently ignored.
    pub fn finalize(self, total_chunks: u32) -> Result<Bytes> {
        let missing = self.missing(total_chunks);
        if !missing.is_empty() {
            return Err(Error::Protocol(format!(
                "file {} completed with {} missing chunk(s) of {} (first missing: {})",
                self.file_id,
                missing.len(),
                total_chunks,
                missing[0],
            )));
        }
        if self.chunks.len() as u32 != total_chunks {
            return Err(Error::Protocol(format!(
                "file {} has {} chunks but sender declared {}",
                self.file_id,
                self.chunks.len(),
                total_chunks,
            )));
        }

        let mut out = BytesMut::with_capacity(self.received_bytes as usize);
        for (_, chunk) in self.chunks {
            out.extend_from_slice(&chunk);
        }
        let payload = out.freeze();

        if payload.len() as u64 != self.expected_bytes {
            return Err(Error::Protocol(format!(
                "file {} reassembled to {} bytes, offer declared {}",
                self.file_id,
                payload.len(),
                self.expected_bytes,
            )));
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

    const BOUNDS: ChunkBounds = ChunkBounds {
        min: MIN_CHUNK_SIZE,
        max: MAX_CHUNK_SIZE,
    };

    #[test]
    fn sizer_clamps_to_bounds() {
        // 10 GB/s would target a 1 GB chunk; must clamp to max.
        assert_eq!(next_chunk_size(MAX_CHUNK_SIZE, 1e10, BOUNDS), MAX_CHUNK_SIZE);
        // Crawling link targets tiny chunks; must clamp to min.
        assert_eq!(next_chunk_size(MIN_CHUNK_SIZE, 10.0, BOUNDS), MIN_CHUNK_SIZE);
    }

    #[test]
    fn sizer_blends_toward_target() {
        // 1 MB/s targets 100 KiB chunks; from 64 KiB the blend moves 30%
        // of the way there.
        let next = next_chunk_size(64 * 1024, 1_000_000.0, BOUNDS);
        let target = 100_000.0;
        let expected = 0.7 * (64.0 * 1024.0) + 0.3 * target;
        assert!((next as f64 - expected).abs() < 2.0, "next={next}");
    }

    #[test]
    fn sizer_holds_without_speed() {
        assert_eq!(next_chunk_size(64 * 1024, 0.0, BOUNDS), 64 * 1024);
        assert_eq!(next_chunk_size(64 * 1024, f64::NAN, BOUNDS), 64 * 1024);
    }

    #[test]
    fn chunk_count_covers_remainders() {
        assert_eq!(chunk_count(0, 1024), 1);
        assert_eq!(chunk_count(1024, 1024), 1);
        assert_eq!(chunk_count(1025, 1024), 2);
    }

    #[test]
    fn assembly_reassembles_out_of_order() {
        let data: Vec<u8> = (0u8..=255).cycle().take(1000).collect();
        let id = Uuid::new_v4();
        let mut assembly = FileAssembly::new(id, 1000);
        // 4 chunks of 250, inserted out of order.
        for &i in &[2u32, 0, 3, 1] {
            let start = i as usize * 250;
            assembly.insert(i, Bytes::copy_from_slice(&data[start..start + 250]));
        }
        let out = assembly.finalize(4).unwrap();
        assert_eq!(&out[..], &data[..]);
    }

    #[test]
    fn assembly_ignores_duplicates() {
        let mut assembly = FileAssembly::new(Uuid::new_v4(), 4);
        assert!(assembly.insert(0, Bytes::from_static(b"abcd")));
        assert!(!assembly.insert(0, Bytes::from_static(b"abcd")));
        assert_eq!(assembly.received_bytes(), 4);
    }

    #[test]
    fn assembly_reports_gaps() {
        let mut assembly = FileAssembly::new(Uuid::new_v4(), 8);
        assembly.insert(0, Bytes::from_static(b"aaaa"));
        assembly.insert(2, Bytes::from_static(b"cccc"));
        let err = assembly.finalize(3).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
    }

    #[test]
    fn assembly_rejects_size_mismatch() {
        let mut assembly = FileAssembly::new(Uuid::new_v4(), 100);
        assembly.insert(0, Bytes::from_static(b"tiny"));
        let err = assembly.finalize(1).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
    }
}
