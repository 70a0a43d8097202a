//! Byte-level access to cluster-backed attribute values.
//!
//! Reads and writes walk the runlist piece by piece: each piece is the
//! longest byte range that stays inside one run. Sparse runs read as zero
//! and cannot be written.

use crate::Volume;
use crate::config::VolumeGeometry;
use crate::inode::NtAttr;
use nxf_block::{MappedBuffer, PageCache};
use nxf_error::{NxfError, Result};
use nxf_runlist::Runlist;
use nxf_types::Lcn;
use std::ops::Range;
use tracing::trace;

/// Clusters written per zeroing request.
const ZERO_CHUNK_CLUSTERS: u64 = 16;

const ZERO_PAGE: u64 = 4096;

/// Visit `[pos, pos + len)` of a stream as `(buffer range, device offset)`
/// pieces; `None` marks a sparse piece.
fn for_each_piece(
    geometry: &VolumeGeometry,
    runlist: &Runlist,
    pos: u64,
    len: usize,
    mut visit: impl FnMut(Range<usize>, Option<u64>) -> Result<()>,
) -> Result<()> {
    let cs = geometry.cluster_bytes();
    let shift = geometry.cluster_size.shift();
    let mut done = 0_usize;
    while done < len {
        let at = pos + done as u64;
        let vcn = i64::try_from(at >> shift)
            .map_err(|_| NxfError::Invalid(format!("stream offset {at} overflows")))?;
        let within = at & (cs - 1);
        let Some(run) = runlist.find_element(vcn) else {
            return Err(NxfError::Invalid(format!(
                "stream offset {at} is past the runlist end at vcn {}",
                runlist.end_vcn()
            )));
        };
        let run_bytes = u64::try_from(run.end() - vcn).unwrap_or(0) * cs - within;
        let take = usize::try_from(run_bytes)
            .unwrap_or(usize::MAX)
            .min(len - done);
        let device = match run.lcn_at(vcn) {
            Lcn::Real(lcn) => Some(
                geometry
                    .lcn_offset(lcn)
                    .ok_or_else(|| NxfError::Invalid(format!("lcn {lcn} overflows")))?
                    + within,
            ),
            Lcn::Hole => None,
            other => {
                return Err(NxfError::Invalid(format!(
                    "vcn {vcn} is {other}, decode it before stream i/o"
                )));
            }
        };
        visit(done..done + take, device)?;
        done += take;
    }
    Ok(())
}

/// Read `buf.len()` bytes at `pos`; holes read as zero.
pub(crate) fn read_runs(
    cache: &dyn PageCache,
    geometry: &VolumeGeometry,
    runlist: &Runlist,
    pos: u64,
    buf: &mut [u8],
) -> Result<()> {
    let len = buf.len();
    for_each_piece(geometry, runlist, pos, len, |range, device| {
        match device {
            Some(offset) => {
                let mapped = cache.map_bytes(offset, range.len())?;
                buf[range].copy_from_slice(mapped.as_slice());
            }
            None => buf[range].fill(0),
        }
        Ok(())
    })
}

/// Write `data` at `pos`. Every covered cluster must be allocated.
pub(crate) fn write_runs(
    cache: &dyn PageCache,
    geometry: &VolumeGeometry,
    runlist: &Runlist,
    pos: u64,
    data: &[u8],
) -> Result<()> {
    for_each_piece(geometry, runlist, pos, data.len(), |range, device| {
        let Some(offset) = device else {
            return Err(NxfError::Unsupported(format!(
                "write of {} bytes into a sparse run",
                range.len()
            )));
        };
        cache.mark_dirty(&MappedBuffer::new(offset, data[range].to_vec()))
    })
}

/// Push zero pages for `[pos, pos + len)` through the cache. Sparse pieces
/// already read as zero and are skipped.
pub(crate) fn zero_range(
    cache: &dyn PageCache,
    geometry: &VolumeGeometry,
    runlist: &Runlist,
    pos: u64,
    len: usize,
) -> Result<()> {
    for_each_piece(geometry, runlist, pos, len, |range, device| {
        let Some(offset) = device else {
            return Ok(());
        };
        let mut done = 0;
        while done < range.len() {
            let at = offset + done as u64;
            // Stop each write at the next page boundary.
            let page_left = ZERO_PAGE - (at % ZERO_PAGE);
            let take = usize::try_from(page_left)
                .unwrap_or(usize::MAX)
                .min(range.len() - done);
            cache.mark_dirty(&MappedBuffer::new(at, vec![0_u8; take]))?;
            done += take;
        }
        Ok(())
    })
}

/// Overwrite every real cluster of `runlist` with zeros.
pub(crate) fn zero_runs(
    cache: &dyn PageCache,
    geometry: &VolumeGeometry,
    runlist: &Runlist,
) -> Result<()> {
    let cs = geometry.cluster_bytes();
    for (lcn, len) in runlist.real_runs() {
        let first = geometry
            .lcn_offset(lcn)
            .ok_or_else(|| NxfError::Invalid(format!("lcn {lcn} overflows")))?;
        let clusters = len.unsigned_abs();
        let mut done = 0;
        while done < clusters {
            let chunk = (clusters - done).min(ZERO_CHUNK_CLUSTERS);
            let bytes = usize::try_from(chunk * cs)
                .map_err(|_| NxfError::Invalid("zero chunk overflows".into()))?;
            cache.mark_dirty(&MappedBuffer::new(first + done * cs, vec![0_u8; bytes]))?;
            done += chunk;
        }
        trace!(lcn, clusters, "clusters_zeroed");
    }
    Ok(())
}

impl Volume {
    /// Read cluster-backed bytes of `attr`, decoding extents as needed.
    pub(crate) fn read_stream(&self, attr: &NtAttr, pos: u64, buf: &mut [u8]) -> Result<()> {
        let (start, end) = self.vcn_span(pos, buf.len())?;
        self.ensure_mapped(attr, start, end)?;
        let runlist = attr.runlist.read();
        read_runs(&*self.cache, &self.geometry, &runlist, pos, buf)
    }

    /// Write cluster-backed bytes of `attr`, decoding extents as needed.
    pub(crate) fn write_stream(&self, attr: &NtAttr, pos: u64, data: &[u8]) -> Result<()> {
        let (start, end) = self.vcn_span(pos, data.len())?;
        self.ensure_mapped(attr, start, end)?;
        let runlist = attr.runlist.read();
        write_runs(&*self.cache, &self.geometry, &runlist, pos, data)
    }

    /// Zero `len` bytes of `attr` at `pos` page by page.
    pub(crate) fn zero_stream(&self, attr: &NtAttr, pos: u64, len: usize) -> Result<()> {
        let (start, end) = self.vcn_span(pos, len)?;
        self.ensure_mapped(attr, start, end)?;
        let runlist = attr.runlist.read();
        zero_range(&*self.cache, &self.geometry, &runlist, pos, len)
    }

    /// VCN range `[start, end)` touched by `len` bytes at `pos`.
    fn vcn_span(&self, pos: u64, len: usize) -> Result<(i64, i64)> {
        let shift = self.geometry.cluster_size.shift();
        let end_byte = pos
            .checked_add(len as u64)
            .ok_or_else(|| NxfError::Invalid("stream range overflows".into()))?;
        let start = i64::try_from(pos >> shift)
            .map_err(|_| NxfError::Invalid("stream offset overflows".into()))?;
        let end = i64::try_from(end_byte.div_ceil(self.geometry.cluster_bytes()))
            .map_err(|_| NxfError::Invalid("stream offset overflows".into()))?;
        Ok((start, end))
    }
}
