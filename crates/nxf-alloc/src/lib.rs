#![forbid(unsafe_code)]
//! Bitmap primitives and cluster allocation.
//!
//! ## Design
//!
//! The crate is layered:
//!
//! 1. **Bitmap**: raw bit manipulation; bit `i` lives in byte `i / 8` at
//!    bit `i % 8`, set means in use.
//! 2. **Record bitmap scan**: the two-pass, locality-preserving search the
//!    metadata-record allocator runs over the initialized part of its
//!    bitmap.
//! 3. **ClusterAllocator**: the interface the volume core calls to obtain
//!    and release clusters, plus [`BitmapClusterAllocator`], an in-memory
//!    implementation with an MFT zone.

use nxf_error::{NxfError, Result};
use nxf_runlist::{Runlist, RunlistElement};
use nxf_types::Lcn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, error, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

fn byte_index(idx: u64) -> Option<usize> {
    usize::try_from(idx / 8).ok()
}

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let Some(byte_idx) = byte_index(idx) else {
        return false;
    };
    bitmap
        .get(byte_idx)
        .is_some_and(|byte| (byte >> (idx % 8)) & 1 == 1)
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    if let Some(byte) = byte_index(idx).and_then(|i| bitmap.get_mut(i)) {
        *byte |= 1 << (idx % 8);
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    if let Some(byte) = byte_index(idx).and_then(|i| bitmap.get_mut(i)) {
        *byte &= !(1 << (idx % 8));
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u64) -> u64 {
    let full_bytes = byte_index(count).unwrap_or(usize::MAX).min(bitmap.len());
    let mut free: u64 = bitmap
        .iter()
        .take(full_bytes)
        .map(|byte| u64::from(byte.count_zeros()))
        .sum();
    let remainder = count % 8;
    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        free += (0..remainder).filter(|bit| (byte >> bit) & 1 == 0).count() as u64;
    }
    free
}

/// First free bit in `range`; bits past the end of `bitmap` count as used.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], range: Range<u64>) -> Option<u64> {
    let mut idx = range.start;
    while idx < range.end {
        let byte = *byte_index(idx).and_then(|i| bitmap.get(i))?;
        if byte == 0xFF && idx % 8 == 0 {
            idx += 8;
            continue;
        }
        if (byte >> (idx % 8)) & 1 == 0 {
            return Some(idx);
        }
        idx += 1;
    }
    None
}

// ── Metadata-record bitmap scan ─────────────────────────────────────────────

/// Two-pass search for a free record in the initialized part of the metadata
/// bitmap: first `[hint, initialized_bits)`, then `[first_user, hint)`.
/// Records below `first_user` are never returned.
#[must_use]
pub fn scan_record_bitmap(
    bitmap: &[u8],
    initialized_bits: u64,
    hint: u64,
    first_user: u64,
) -> Option<u64> {
    let hint = hint.clamp(first_user, initialized_bits.max(first_user));
    let found = bitmap_find_free(bitmap, hint..initialized_bits)
        .or_else(|| bitmap_find_free(bitmap, first_user..hint.min(initialized_bits)));
    trace!(hint, initialized_bits, found = ?found, "record_bitmap_scan");
    found
}

// ── Cluster allocation ──────────────────────────────────────────────────────

/// Which part of the volume an allocation prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocZone {
    /// Metadata table growth: prefer the reserved MFT zone.
    Mft,
    /// Everything else: stay out of the MFT zone while possible.
    Data,
}

/// Cluster allocation service consumed by the volume core.
///
/// `allocate` returns a fragment runlist: undecoded up to `start_vcn`, then
/// real runs totalling exactly `count` clusters, then an end-of-file
/// terminator. The returned clusters are already marked allocated.
pub trait ClusterAllocator: Send + Sync {
    fn allocate(
        &self,
        start_vcn: i64,
        count: i64,
        start_hint: Option<i64>,
        zone: AllocZone,
    ) -> Result<Runlist>;

    /// Release every real run in `runlist`; returns the cluster count freed.
    fn free(&self, runlist: &Runlist) -> Result<u64>;

    /// Free clusters remaining.
    fn free_clusters(&self) -> u64;
}

#[derive(Debug)]
struct ClusterBitmap {
    bits: Vec<u8>,
    total: u64,
    free: u64,
    mft_zone: Range<u64>,
}

impl ClusterBitmap {
    /// Candidate LCNs in preference order for `zone`, starting at `hint`.
    fn tiers(&self, zone: AllocZone) -> [Range<u64>; 3] {
        let Range { start, end } = self.mft_zone;
        match zone {
            AllocZone::Mft => [start..end, end..self.total, 0..start],
            AllocZone::Data => [end..self.total, 0..start, start..end],
        }
    }

    fn take_runs(&mut self, count: u64, hint: Option<u64>, zone: AllocZone) -> Vec<(u64, u64)> {
        let mut runs: Vec<(u64, u64)> = Vec::new();
        let mut remaining = count;
        for tier in self.tiers(zone) {
            if remaining == 0 {
                break;
            }
            let first = hint
                .filter(|h| tier.contains(h))
                .unwrap_or(tier.start);
            for pass in [first..tier.end, tier.start..first] {
                let mut cursor = pass.start;
                while remaining > 0 {
                    let Some(lcn) = bitmap_find_free(&self.bits, cursor..pass.end) else {
                        break;
                    };
                    bitmap_set(&mut self.bits, lcn);
                    remaining -= 1;
                    cursor = lcn + 1;
                    match runs.last_mut() {
                        Some((start, len)) if *start + *len == lcn => *len += 1,
                        _ => runs.push((lcn, 1)),
                    }
                }
            }
        }
        self.free -= count - remaining;
        runs
    }
}

/// In-memory cluster allocator over a bitmap of `total` clusters.
#[derive(Debug)]
pub struct BitmapClusterAllocator {
    state: Mutex<ClusterBitmap>,
}

impl BitmapClusterAllocator {
    /// All clusters free; `mft_zone` is reserved for metadata-table growth
    /// where possible.
    #[must_use]
    pub fn new(total_clusters: u64, mft_zone: Range<u64>) -> Self {
        let bytes = usize::try_from(total_clusters.div_ceil(8)).unwrap_or(usize::MAX);
        let mft_zone = mft_zone.start.min(total_clusters)..mft_zone.end.min(total_clusters);
        Self {
            state: Mutex::new(ClusterBitmap {
                bits: vec![0_u8; bytes],
                total: total_clusters,
                free: total_clusters,
                mft_zone,
            }),
        }
    }

    /// Mark `[lcn, lcn + count)` in use (system areas at format time).
    pub fn reserve(&self, lcn: u64, count: u64) -> Result<()> {
        let mut state = self.state.lock();
        let end = lcn.checked_add(count).filter(|end| *end <= state.total).ok_or_else(|| {
            NxfError::Invalid(format!("reserve {lcn}+{count} past end of volume"))
        })?;
        for idx in lcn..end {
            if !bitmap_get(&state.bits, idx) {
                bitmap_set(&mut state.bits, idx);
                state.free -= 1;
            }
        }
        drop(state);
        Ok(())
    }

    #[must_use]
    pub fn is_allocated(&self, lcn: u64) -> bool {
        bitmap_get(&self.state.lock().bits, lcn)
    }

    #[must_use]
    pub fn total_clusters(&self) -> u64 {
        self.state.lock().total
    }

    /// Copy of the allocation bitmap.
    #[must_use]
    pub fn bitmap_snapshot(&self) -> Vec<u8> {
        self.state.lock().bits.clone()
    }
}

impl ClusterAllocator for BitmapClusterAllocator {
    fn allocate(
        &self,
        start_vcn: i64,
        count: i64,
        start_hint: Option<i64>,
        zone: AllocZone,
    ) -> Result<Runlist> {
        if count <= 0 || start_vcn < 0 {
            return Err(NxfError::Invalid(format!(
                "cluster allocation of {count} at vcn {start_vcn}"
            )));
        }
        let wanted = count.unsigned_abs();
        let mut state = self.state.lock();
        if state.free < wanted {
            debug!(wanted, free = state.free, "cluster_alloc_no_space");
            return Err(NxfError::NoSpace);
        }
        let hint = start_hint.and_then(|h| u64::try_from(h).ok());
        let runs = state.take_runs(wanted, hint, zone);
        let free_after = state.free;
        drop(state);

        let mut elements = Vec::with_capacity(runs.len() + 2);
        if start_vcn > 0 {
            elements.push(RunlistElement::new(0, Lcn::NotMapped, start_vcn));
        }
        let mut vcn = start_vcn;
        for &(lcn, len) in &runs {
            let (lcn, len) = (to_i64(lcn)?, to_i64(len)?);
            elements.push(RunlistElement::new(vcn, Lcn::Real(lcn), len));
            vcn += len;
        }
        elements.push(RunlistElement::new(vcn, Lcn::EndOfFile, 0));
        debug!(
            start_vcn,
            count,
            runs = runs.len(),
            first_lcn = runs.first().map(|r| r.0),
            zone = ?zone,
            free_after,
            "cluster_alloc"
        );
        Runlist::from_elements(elements).map_err(|err| err.into_nxf(0))
    }

    fn free(&self, runlist: &Runlist) -> Result<u64> {
        let mut state = self.state.lock();
        let mut freed = 0_u64;
        let runs: Vec<(u64, u64)> = runlist
            .real_runs()
            .map(|(lcn, len)| (lcn.unsigned_abs(), len.unsigned_abs()))
            .collect();
        for &(lcn, len) in &runs {
            let end = lcn.checked_add(len).filter(|end| *end <= state.total).ok_or_else(|| {
                error!(
                    invariant = "free.cluster_in_volume",
                    lcn,
                    len,
                    "cluster_free_out_of_range"
                );
                NxfError::corruption(0, format!("freeing clusters {lcn}+{len} past end of volume"))
            })?;
            let first_clear = (lcn..end).find(|&idx| !bitmap_get(&state.bits, idx));
            if let Some(idx) = first_clear {
                error!(
                    invariant = "free.cluster_allocated",
                    lcn = idx,
                    "cluster_double_free"
                );
                return Err(NxfError::corruption(
                    0,
                    format!("freeing unallocated cluster {idx}"),
                ));
            }
        }
        for &(lcn, len) in &runs {
            for idx in lcn..lcn + len {
                bitmap_clear(&mut state.bits, idx);
            }
            freed += len;
        }
        state.free += freed;
        drop(state);
        debug!(freed, runs = runs.len(), "cluster_free");
        Ok(freed)
    }

    fn free_clusters(&self) -> u64 {
        self.state.lock().free
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| NxfError::Invalid(format!("cluster number {value} overflows")))
}
