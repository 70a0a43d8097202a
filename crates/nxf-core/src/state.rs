//! Volume-wide mutable state shared by every operation on one volume.

use nxf_types::FIRST_USER_RECORD;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::warn;

/// Sticky error flag and the metadata-record allocation cursor.
///
/// Held by each [`crate::Volume`], so independent volumes in one process
/// never share it.
#[derive(Debug)]
pub struct VolumeState {
    has_errors: AtomicBool,
    mft_cursor: AtomicU64,
}

impl Default for VolumeState {
    fn default() -> Self {
        Self {
            has_errors: AtomicBool::new(false),
            mft_cursor: AtomicU64::new(FIRST_USER_RECORD),
        }
    }
}

impl VolumeState {
    /// Flag the volume as needing an offline check. Never cleared while
    /// mounted.
    pub fn mark_errors(&self, reason: &str) {
        let first = !self.has_errors.swap(true, Ordering::AcqRel);
        warn!(reason, first, "volume_marked_with_errors");
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.has_errors.load(Ordering::Acquire)
    }

    /// Where the next base-record search starts.
    #[must_use]
    pub fn mft_cursor(&self) -> u64 {
        self.mft_cursor.load(Ordering::Relaxed)
    }

    pub fn set_mft_cursor(&self, next: u64) {
        self.mft_cursor
            .store(next.max(FIRST_USER_RECORD), Ordering::Relaxed);
    }
}
