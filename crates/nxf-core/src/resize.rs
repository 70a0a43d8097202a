//! Size changes of one attribute: cluster allocation and release, the
//! initialized-size boundary, and resident to non-resident conversion.
//!
//! Every operation takes the attribute's runlist lock exclusively, edits
//! the owning records under checkout, and only then commits the new
//! runlist and sizes in memory. A failure before that point restores the
//! records and returns any clusters taken.

use crate::inode::{AttrSizes, NtAttr};
use crate::locator::AttrQuery;
use crate::record::LockedRecord;
use crate::stream::{write_runs, zero_runs};
use crate::{Volume, parse_error, record_error};
use nxf_error::{NxfError, Result};
use nxf_ondisk::{
    AttrRecord, NonResidentHeader, insert_attr, mapping_pairs_capacity, non_resident_attr_bytes,
    remove_attr, resize_mapping_pairs, resize_resident_value, write_compressed_size,
    write_non_resident_sizes, write_vcn_bounds,
};
use nxf_runlist::{Runlist, RunlistError};
use tracing::{debug, error, warn};

/// Where a runlist edit landed on disk.
struct Stored {
    end_vcn: i64,
    sizes: AttrSizes,
}

impl Volume {
    // ── Allocation ──────────────────────────────────────────────────────

    /// Grow the allocation of non-resident `attr` to at least `new_size`
    /// bytes, rounded up to whole clusters. Returns the allocated size
    /// reached, which is less than asked when the owning record could only
    /// describe part of the new clusters.
    pub fn extend_allocation(&self, attr: &NtAttr, new_size: i64) -> Result<i64> {
        let cs = self.geometry.cluster_size;
        let mut runlist = attr.runlist.write();
        let sizes = attr.sizes();
        if sizes.resident {
            return Err(NxfError::Invalid(format!(
                "{} of {} is resident",
                attr.ty(),
                attr.base()
            )));
        }
        let target = cs
            .round_up(new_size)
            .ok_or_else(|| NxfError::Invalid(format!("size {new_size} overflows")))?;
        if target <= sizes.allocated {
            return Ok(sizes.allocated);
        }
        self.map_all(attr, &mut runlist)?;
        let old_clusters = cs.bytes_to_clusters_ceil(sizes.allocated);
        if runlist.end_vcn() != old_clusters {
            return Err(NxfError::corruption(
                attr.base().number.0,
                format!(
                    "runlist of {} ends at vcn {}, allocation holds {old_clusters} clusters",
                    attr.ty(),
                    runlist.end_vcn()
                ),
            ));
        }
        let count = cs.bytes_to_clusters_ceil(target) - old_clusters;
        let fresh = self
            .clusters
            .allocate(old_clusters, count, runlist.next_lcn_hint(), attr.zone())?;
        if let Err(err) = zero_runs(&*self.cache, &self.geometry, &fresh) {
            self.release_clusters(&fresh, "zero_failed");
            return Err(err);
        }
        let merged = match runlist.merge(&fresh) {
            Ok(merged) => merged,
            Err(err) => {
                error!(
                    base = attr.base().number.0,
                    ty = %attr.ty(),
                    error = %err,
                    "allocation_merge_failed"
                );
                self.release_clusters(&fresh, "merge_failed");
                return Err(err.into_nxf(attr.base().number.0));
            }
        };

        let stored = match self.store_runlist(attr, &merged, sizes, old_clusters) {
            Ok(stored) => stored,
            Err(err) => {
                self.release_clusters(&fresh, "store_failed");
                return Err(err);
            }
        };
        let mut merged = merged;
        if stored.end_vcn < merged.end_vcn() {
            warn!(
                base = attr.base().number.0,
                wanted = merged.end_vcn(),
                stored = stored.end_vcn,
                "allocation_shortened"
            );
            self.release_clusters(&merged.tail(stored.end_vcn), "shortened");
            merged
                .truncate(stored.end_vcn)
                .map_err(|err| err.into_nxf(attr.base().number.0))?;
        }
        *runlist = merged;
        attr.set_sizes(stored.sizes);
        if self.mft.is_table_attr(attr) {
            self.mft.publish(&runlist);
        }
        debug!(
            base = attr.base().number.0,
            ty = %attr.ty(),
            old_clusters,
            new_clusters = stored.end_vcn,
            "attr_extend_allocation"
        );
        Ok(stored.sizes.allocated)
    }

    /// Release clusters past `new_size` (rounded up). Data and initialized
    /// sizes are clamped to the new allocation. Returns the allocated size.
    pub fn shrink_allocation(&self, attr: &NtAttr, new_size: i64) -> Result<i64> {
        let cs = self.geometry.cluster_size;
        let mut runlist = attr.runlist.write();
        let sizes = attr.sizes();
        if sizes.resident {
            return Err(NxfError::Invalid(format!("{} is resident", attr.ty())));
        }
        if new_size < 0 {
            return Err(NxfError::Invalid(format!("negative size {new_size}")));
        }
        let old_clusters = cs.bytes_to_clusters_ceil(sizes.allocated);
        let target = cs.bytes_to_clusters_ceil(new_size);
        if target >= old_clusters {
            return Ok(sizes.allocated);
        }
        self.map_all(attr, &mut runlist)?;
        let mut truncated = runlist.clone();
        truncated
            .truncate(target)
            .map_err(|err| err.into_nxf(attr.base().number.0))?;
        let allocated = cs.clusters_to_bytes(target).unwrap_or(0);
        let data = sizes.data.min(allocated);
        let clamped = AttrSizes {
            data,
            initialized: sizes.initialized.min(data),
            ..sizes
        };
        let stored = self.store_runlist(attr, &truncated, clamped, old_clusters)?;
        self.release_clusters(&runlist.tail(target), "shrink");
        *runlist = truncated;
        attr.set_sizes(stored.sizes);
        if self.mft.is_table_attr(attr) {
            self.mft.publish(&runlist);
        }
        debug!(
            base = attr.base().number.0,
            ty = %attr.ty(),
            old_clusters,
            new_clusters = target,
            "attr_shrink_allocation"
        );
        Ok(stored.sizes.allocated)
    }

    /// Write `runlist` into the last extent of `attr` and `sizes` into its
    /// first. `old_end` is the VCN the on-disk runlist currently ends at.
    ///
    /// The last extent only grows into free space of its own record; if
    /// even the clusters up to `old_end` do not fit, nothing is written.
    fn store_runlist(
        &self,
        attr: &NtAttr,
        runlist: &Runlist,
        sizes: AttrSizes,
        old_end: i64,
    ) -> Result<Stored> {
        let cs = self.geometry.cluster_size;
        let base = attr.base();
        let last_vcn = (old_end.min(runlist.end_vcn()) - 1).max(0);

        let mut search = self.search(base)?;
        let found = search.find(&AttrQuery::named(attr.ty(), attr.name()).at_vcn(last_vcn))?;
        let mut record = search.into_found_record()?;
        let number = record.number();
        let Some(header) = found.attr.non_resident().copied() else {
            return Err(NxfError::corruption(number, format!("{} extent is resident", attr.ty())));
        };
        if header.highest_vcn != old_end - 1 {
            return Err(NxfError::Unsupported(format!(
                "{} of {base} would change an extent other than its last",
                attr.ty()
            )));
        }
        let lowest = header.lowest_vcn;
        let offset = found.attr.offset;
        let capacity =
            mapping_pairs_capacity(record.bytes(), offset).map_err(|err| parse_error(number, err))?;
        let mut scratch = vec![0_u8; capacity];
        let end_vcn = match runlist.encode(lowest, None, &mut scratch) {
            Ok(_) => runlist.end_vcn(),
            Err(RunlistError::BufferTooSmall { stop_vcn }) if stop_vcn > old_end.min(runlist.end_vcn()) => {
                stop_vcn
            }
            Err(RunlistError::BufferTooSmall { .. }) => {
                return Err(NxfError::Unsupported(format!(
                    "record {number} is full; moving {} into an extension record is not supported",
                    attr.ty()
                )));
            }
            Err(err) => return Err(err.into_nxf(number)),
        };
        let pairs = runlist
            .encode_to_vec(lowest, Some(end_vcn))
            .map_err(|err| err.into_nxf(number))?;
        let mut stored_sizes = sizes;
        stored_sizes.allocated = cs
            .clusters_to_bytes(end_vcn)
            .ok_or_else(|| NxfError::Invalid("allocation overflows".into()))?;
        stored_sizes.data = stored_sizes.data.min(stored_sizes.allocated);
        stored_sizes.initialized = stored_sizes.initialized.min(stored_sizes.data);
        if stored_sizes.tracks_compressed_size() {
            let real = runlist.real_clusters() - runlist.tail(end_vcn).real_clusters();
            stored_sizes.compressed = cs.clusters_to_bytes(real);
        }

        let saved = record.bytes().to_vec();
        let edited = (|| {
            resize_mapping_pairs(record.bytes_mut(), offset, &pairs)
                .map_err(|err| record_error(number, err))?;
            write_vcn_bounds(record.bytes_mut(), offset, lowest, end_vcn - 1)
                .map_err(|err| parse_error(number, err))?;
            if lowest == 0 {
                write_sizes(record.bytes_mut(), number, offset, &stored_sizes)?;
            }
            self.write_record(&record)
        })();
        if let Err(err) = edited {
            record.restore(&saved);
            return Err(err);
        }
        if lowest != 0 {
            drop(record);
            if let Err(err) = self.write_first_extent_sizes(attr, &stored_sizes) {
                self.restore_record(number, &saved);
                return Err(err);
            }
        }
        Ok(Stored {
            end_vcn,
            sizes: stored_sizes,
        })
    }

    /// Put back bytes of record `number` saved before a multi-record edit.
    fn restore_record(&self, number: u64, saved: &[u8]) {
        let restored = self.checkout_record(number).and_then(|mut record| {
            record.restore(saved);
            self.write_record(&record)
        });
        if let Err(err) = restored {
            error!(record = number, error = %err, "record_restore_failed");
            self.state.mark_errors("record restore failed");
        }
    }

    /// Return clusters to the allocator; a failure leaves them leaked and
    /// flags the volume.
    pub(crate) fn release_clusters(&self, runlist: &Runlist, why: &'static str) {
        if runlist.real_clusters() == 0 {
            return;
        }
        if let Err(err) = self.clusters.free(runlist) {
            error!(why, error = %err, clusters = runlist.real_clusters(), "cluster_release_failed");
            self.state.mark_errors("cluster release failed");
        }
    }

    // ── Initialized size ────────────────────────────────────────────────

    /// Move the initialized boundary of `attr` up to `new_size`, raising the
    /// data size along with it.
    ///
    /// Resident values are zero-filled in place. For non-resident values the
    /// size fields are written first and the runlist lock released, then
    /// zero pages are pushed for the newly initialized range; the clusters
    /// were zeroed when allocated, so readers never see stale bytes.
    pub fn extend_initialized(&self, attr: &NtAttr, new_size: i64) -> Result<()> {
        let Some(old) = self.advance_initialized(attr, new_size)? else {
            return Ok(());
        };
        let len = usize::try_from(new_size - old)
            .map_err(|_| NxfError::Invalid("initialized range overflows".into()))?;
        self.zero_stream(attr, old.unsigned_abs(), len)
    }

    /// Write the raised sizes of `attr` and publish them. Returns the old
    /// initialized size when a non-resident range still needs zero pages.
    pub(crate) fn advance_initialized(&self, attr: &NtAttr, new_size: i64) -> Result<Option<i64>> {
        let _runlist = attr.runlist.write();
        let sizes = attr.sizes();
        if new_size <= sizes.initialized {
            return Ok(None);
        }
        if sizes.resident {
            self.extend_resident(attr, sizes, new_size)?;
            return Ok(None);
        }
        if new_size > sizes.allocated {
            return Err(NxfError::Invalid(format!(
                "initialized size {new_size} past allocation of {}",
                sizes.allocated
            )));
        }
        let updated = AttrSizes {
            data: sizes.data.max(new_size),
            initialized: new_size,
            ..sizes
        };
        self.write_first_extent_sizes(attr, &updated)?;
        attr.set_sizes(updated);
        debug!(
            base = attr.base().number.0,
            ty = %attr.ty(),
            from = sizes.initialized,
            to = new_size,
            "attr_extend_initialized"
        );
        Ok(Some(sizes.initialized))
    }

    /// Put the data and initialized sizes of `attr` back to `before`,
    /// keeping the current allocation.
    pub(crate) fn restore_sizes(&self, attr: &NtAttr, before: AttrSizes) -> Result<()> {
        let _runlist = attr.runlist.write();
        let restored = AttrSizes {
            data: before.data,
            initialized: before.initialized,
            ..attr.sizes()
        };
        self.write_first_extent_sizes(attr, &restored)?;
        attr.set_sizes(restored);
        Ok(())
    }

    fn extend_resident(&self, attr: &NtAttr, sizes: AttrSizes, new_size: i64) -> Result<()> {
        let new_len = usize::try_from(new_size)
            .map_err(|_| NxfError::Invalid(format!("size {new_size} overflows")))?;
        let (found, mut record) = self.first_extent(attr)?;
        let number = record.number();
        let saved = record.bytes().to_vec();
        let edited = resize_resident_value(record.bytes_mut(), found.offset, new_len)
            .map_err(|err| record_error(number, err))
            .and_then(|()| self.write_record(&record));
        if let Err(err) = edited {
            record.restore(&saved);
            return Err(err);
        }
        attr.set_sizes(AttrSizes {
            allocated: i64::try_from(nxf_types::align8(new_len)).unwrap_or(i64::MAX),
            data: new_size,
            initialized: new_size,
            ..sizes
        });
        debug!(record = number, ty = %attr.ty(), new_size, "attr_resident_resize");
        Ok(())
    }

    // ── Resident to non-resident ────────────────────────────────────────

    /// Move the inline value of `attr` into a single extent of freshly
    /// allocated clusters.
    ///
    /// Until the record is written the conversion only touched a private
    /// copy of the record and newly allocated clusters, so any failure puts
    /// both back.
    pub fn make_non_resident(&self, attr: &NtAttr) -> Result<()> {
        let mut runlist = attr.runlist.write();
        let sizes = attr.sizes();
        if !sizes.resident {
            return Ok(());
        }
        let (found, mut record) = self.first_extent(attr)?;
        let number = record.number();
        let value = found
            .value(record.bytes())
            .ok_or_else(|| NxfError::corruption(number, "resident value out of bounds"))?
            .to_vec();
        let cs = self.geometry.cluster_size;
        let value_len = i64::try_from(value.len()).unwrap_or(i64::MAX);
        let clusters = cs.bytes_to_clusters_ceil(value_len);
        let fresh = if clusters > 0 {
            self.clusters.allocate(0, clusters, None, attr.zone())?
        } else {
            Runlist::empty()
        };

        let saved = record.bytes().to_vec();
        match self.rewrite_non_resident(&mut record, &found, &value, &fresh, &sizes) {
            Ok(converted) => {
                *runlist = fresh;
                attr.set_sizes(converted);
                debug!(
                    record = number,
                    ty = %attr.ty(),
                    value_len,
                    clusters,
                    "attr_made_non_resident"
                );
                Ok(())
            }
            Err(err) => {
                record.restore(&saved);
                drop(record);
                self.release_clusters(&fresh, "make_non_resident_failed");
                debug!(record = number, error = %err, "attr_make_non_resident_rolled_back");
                Err(err)
            }
        }
    }

    fn rewrite_non_resident(
        &self,
        record: &mut LockedRecord,
        found: &AttrRecord,
        value: &[u8],
        runs: &Runlist,
        sizes: &AttrSizes,
    ) -> Result<AttrSizes> {
        let number = record.number();
        zero_runs(&*self.cache, &self.geometry, runs)?;
        write_runs(&*self.cache, &self.geometry, runs, 0, value)?;

        let pairs = runs
            .encode_to_vec(0, None)
            .map_err(|err| err.into_nxf(number))?;
        let allocated = self
            .geometry
            .cluster_size
            .clusters_to_bytes(runs.end_vcn())
            .ok_or_else(|| NxfError::Invalid("allocation overflows".into()))?;
        let value_len = i64::try_from(value.len()).unwrap_or(i64::MAX);
        let converted = AttrSizes {
            resident: false,
            allocated,
            data: value_len,
            initialized: value_len,
            compressed: sizes.tracks_compressed_size().then_some(allocated),
            flags: found.flags,
            compression_unit: 0,
        };
        let header = NonResidentHeader {
            highest_vcn: runs.end_vcn() - 1,
            allocated_size: converted.allocated,
            data_size: converted.data,
            initialized_size: converted.initialized,
            compressed_size: converted.compressed,
            ..NonResidentHeader::default()
        };
        let bytes = non_resident_attr_bytes(
            found.ty,
            &found.name,
            found.instance,
            found.flags,
            &header,
            &pairs,
        )
        .map_err(|err| NxfError::Invalid(err.to_string()))?;
        remove_attr(record.bytes_mut(), found.offset).map_err(|err| record_error(number, err))?;
        insert_attr(record.bytes_mut(), found.offset, &bytes)
            .map_err(|err| record_error(number, err))?;
        self.write_record(record)?;
        Ok(converted)
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// The vcn-0 extent of `attr` and its record, checked out.
    pub(crate) fn first_extent(&self, attr: &NtAttr) -> Result<(AttrRecord, LockedRecord)> {
        let mut search = self.search(attr.base())?;
        let found = search.find(&AttrQuery::named(attr.ty(), attr.name()))?;
        Ok((found.attr, search.into_found_record()?))
    }

    /// Write `sizes` into the vcn-0 extent of `attr`.
    fn write_first_extent_sizes(&self, attr: &NtAttr, sizes: &AttrSizes) -> Result<()> {
        let (found, mut record) = self.first_extent(attr)?;
        let number = record.number();
        if found.is_resident() {
            return Err(NxfError::corruption(number, format!("{} extent is resident", attr.ty())));
        }
        let saved = record.bytes().to_vec();
        let written = write_sizes(record.bytes_mut(), number, found.offset, sizes)
            .and_then(|()| self.write_record(&record));
        if written.is_err() {
            record.restore(&saved);
        }
        written
    }
}

fn write_sizes(record: &mut [u8], number: u64, offset: usize, sizes: &AttrSizes) -> Result<()> {
    write_non_resident_sizes(record, offset, sizes.allocated, sizes.data, sizes.initialized)
        .map_err(|err| parse_error(number, err))?;
    if let (true, Some(compressed)) = (sizes.tracks_compressed_size(), sizes.compressed) {
        write_compressed_size(record, offset, compressed).map_err(|err| parse_error(number, err))?;
    }
    Ok(())
}
