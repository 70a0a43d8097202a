//! Metadata-record allocation and release.
//!
//! Allocation runs entirely under the metadata bitmap write lock. Each step
//! that changes the volume pushes an undo entry; on failure the entries are
//! replayed in reverse before the error is returned.

use crate::inode::{AttrSizes, NtAttr};
use crate::mft::MftBitmap;
use crate::record::LockedRecord;
use crate::{Volume, parse_error, record_error};
use nxf_alloc::{bitmap_clear, bitmap_set, scan_record_bitmap};
use nxf_block::MappedBuffer;
use nxf_error::{NxfError, Result};
use nxf_ondisk::{RecordFlags, format_record};
use nxf_types::{FIRST_USER_RECORD, RecordNumber, RecordRef};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Which attribute of the metadata table a step touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableAttr {
    Data,
    Bitmap,
}

/// One reversible step of an allocation.
#[derive(Debug, Clone, Copy)]
enum Undo {
    Allocated { attr: TableAttr, old: i64 },
    Initialized { attr: TableAttr, before: AttrSizes },
    BitSet(u64),
}

impl Undo {
    fn name(&self) -> &'static str {
        match self {
            Self::Allocated { attr: TableAttr::Bitmap, .. } => "bitmap_allocated",
            Self::Allocated { attr: TableAttr::Data, .. } => "table_allocated",
            Self::Initialized { attr: TableAttr::Bitmap, .. } => "bitmap_initialized",
            Self::Initialized { attr: TableAttr::Data, .. } => "table_initialized",
            Self::BitSet(_) => "bit_set",
        }
    }
}

impl Volume {
    /// Allocate a metadata record and return it checked out, in use, with a
    /// fresh header.
    ///
    /// With `extend_of`, the record becomes an extension of that base
    /// record: the search starts just past it and the new record is attached
    /// to the base's shadow.
    pub fn allocate_record(
        &self,
        is_directory: bool,
        extend_of: Option<RecordRef>,
    ) -> Result<(RecordRef, LockedRecord)> {
        let mut bitmap = self.mft.bitmap.write();
        let hint = extend_of.map_or_else(|| self.state.mft_cursor(), |base| base.number.0 + 1);
        let mut undo = Vec::new();
        let result = self.claim_record(&mut bitmap, hint, is_directory, extend_of, &mut undo);
        match result {
            Ok((reference, record)) => {
                self.state.set_mft_cursor(reference.number.0 + 1);
                info!(
                    record = reference.number.0,
                    sequence = reference.sequence,
                    directory = is_directory,
                    base = extend_of.map(|base| base.number.0),
                    "record_alloc"
                );
                Ok((reference, record))
            }
            Err(err) => {
                debug!(steps = undo.len(), error = %err, "record_alloc_failed");
                self.roll_back(&mut bitmap, undo);
                self.observe(Err(err))
            }
        }
    }

    fn claim_record(
        &self,
        bitmap: &mut MftBitmap,
        hint: u64,
        is_directory: bool,
        extend_of: Option<RecordRef>,
        undo: &mut Vec<Undo>,
    ) -> Result<(RecordRef, LockedRecord)> {
        if let Some(base) = extend_of {
            self.check_base(base, None)?;
        }
        let owner = extend_of.map(|base| self.inode_entry(base)).transpose()?;
        let number = match scan_record_bitmap(
            &bitmap.bits,
            bitmap.initialized_bits(),
            hint,
            FIRST_USER_RECORD,
        ) {
            Some(number) => number,
            None => {
                let first_new = bitmap.initialized_bits().max(FIRST_USER_RECORD);
                self.grow_bitmap(bitmap, undo)?;
                first_new
            }
        };
        if number > u64::from(u32::MAX) {
            return Err(NxfError::NoSpace);
        }
        if number >= self.mft.initialized_records() {
            self.grow_table(number, undo)?;
        }

        bitmap_set(&mut bitmap.bits, number);
        undo.push(Undo::BitSet(number));
        self.write_bitmap_byte(bitmap, number)?;

        let mut record = self.checkout_record(number)?;
        let header = record.header()?;
        if header.in_use() {
            error!(
                invariant = "bitmap_free_implies_record_free",
                record = number,
                sequence = header.sequence,
                "record_alloc_conflict"
            );
            return Err(NxfError::corruption(
                number,
                "record is free in the bitmap but marked in use",
            ));
        }
        let sequence = header.sequence.max(1);
        format_record(record.bytes_mut(), number, sequence)
            .map_err(|err| record_error(number, err))?;
        let mut header = record.header()?;
        header.flags = RecordFlags::IN_USE.with(RecordFlags::DIRECTORY, is_directory);
        header.base_record = extend_of.unwrap_or(RecordRef::NONE);
        header
            .write(record.bytes_mut())
            .map_err(|err| parse_error(number, err))?;
        self.write_record(&record)?;

        if let Some(owner) = owner {
            owner.attach(self.record_slot(number));
        }
        Ok((RecordRef::new(number, sequence), record))
    }

    /// Fail with corruption unless `base` names a live base record.
    /// `extension` is the record whose header points at `base`, if any.
    fn check_base(&self, base: RecordRef, extension: Option<u64>) -> Result<()> {
        if base.is_none() {
            return Err(NxfError::Invalid("null base record reference".into()));
        }
        let header = self.peek_record_header(base.number.0)?;
        if header.in_use() && header.is_base() && header.sequence == base.sequence {
            return Ok(());
        }
        error!(
            invariant = "extension.base_is_live",
            base = base.number.0,
            expected_sequence = base.sequence,
            found_sequence = header.sequence,
            in_use = header.in_use(),
            extension = ?extension,
            "extension_base_stale"
        );
        Err(NxfError::corruption(
            extension.unwrap_or(base.number.0),
            format!(
                "base {base} is stale: record holds sequence {}",
                header.sequence
            ),
        ))
    }

    /// Add `bitmap_growth_bytes` of initialized bitmap, allocating clusters
    /// first when the allocation is too small.
    fn grow_bitmap(&self, bitmap: &mut MftBitmap, undo: &mut Vec<Undo>) -> Result<()> {
        let attr = Arc::clone(&self.mft.bitmap_attr);
        let sizes = attr.sizes();
        let quantum = i64::try_from(self.geometry.bitmap_growth_bytes)
            .map_err(|_| NxfError::Invalid("bitmap growth overflows".into()))?;
        let target = sizes.initialized + quantum;
        if target > sizes.allocated {
            let reached = self.extend_allocation(&attr, target)?;
            undo.push(Undo::Allocated {
                attr: TableAttr::Bitmap,
                old: sizes.allocated,
            });
            if reached < target {
                return Err(NxfError::NoSpace);
            }
        }
        self.raise_initialized(&attr, TableAttr::Bitmap, target, undo)?;
        let old = u64::try_from(sizes.initialized).unwrap_or(0);
        self.zero_stream(&attr, old, usize::try_from(quantum).unwrap_or(0))?;
        bitmap
            .bits
            .resize(usize::try_from(target).unwrap_or(0), 0);
        debug!(
            from = sizes.initialized,
            to = target,
            "mft_bitmap_grow"
        );
        Ok(())
    }

    /// Initialize table records up to and including `number`, one record
    /// at a time, formatting each before it becomes part of the table.
    fn grow_table(&self, number: u64, undo: &mut Vec<Undo>) -> Result<()> {
        let attr = Arc::clone(&self.mft.data);
        let record_size = i64::from(self.geometry.record_size);
        let growth = i64::try_from(self.geometry.mft_growth_records)
            .map_err(|_| NxfError::Invalid("table growth overflows".into()))?
            * record_size;
        while self.mft.initialized_records() <= number {
            let sizes = attr.sizes();
            let next = sizes.initialized + record_size;
            if next > sizes.allocated {
                let reached = match self.extend_allocation(&attr, sizes.allocated + growth) {
                    Err(NxfError::NoSpace) => self.extend_allocation(&attr, next)?,
                    other => other?,
                };
                undo.push(Undo::Allocated {
                    attr: TableAttr::Data,
                    old: sizes.allocated,
                });
                if reached < next {
                    return Err(NxfError::NoSpace);
                }
            }
            let fresh = u64::try_from(sizes.initialized / record_size).unwrap_or(0);
            let mut buf = vec![0_u8; self.geometry.record_size as usize];
            format_record(&mut buf, fresh, 0).map_err(|err| record_error(fresh, err))?;
            let offset = self.mft.raw_record_offset(fresh)?;
            self.cache.mark_dirty(&MappedBuffer::new(offset, buf))?;
            self.raise_initialized(&attr, TableAttr::Data, next, undo)?;
            debug!(record = fresh, "mft_record_initialized");
        }
        Ok(())
    }

    fn raise_initialized(
        &self,
        attr: &NtAttr,
        which: TableAttr,
        size: i64,
        undo: &mut Vec<Undo>,
    ) -> Result<()> {
        let before = attr.sizes();
        if self.advance_initialized(attr, size)?.is_some() {
            undo.push(Undo::Initialized { attr: which, before });
        }
        Ok(())
    }

    fn table_attr(&self, which: TableAttr) -> &Arc<NtAttr> {
        match which {
            TableAttr::Data => &self.mft.data,
            TableAttr::Bitmap => &self.mft.bitmap_attr,
        }
    }

    /// Write the bitmap byte holding the bit of record `number`.
    fn write_bitmap_byte(&self, bitmap: &MftBitmap, number: u64) -> Result<()> {
        let idx = usize::try_from(number / 8)
            .map_err(|_| NxfError::Invalid(format!("record {number} overflows")))?;
        let byte = bitmap
            .bits
            .get(idx..=idx)
            .ok_or_else(|| NxfError::Invalid(format!("record {number} past the bitmap")))?;
        self.write_stream(&self.mft.bitmap_attr, idx as u64, byte)
    }

    /// Replay `undo` in reverse. Failures are logged and flag the volume;
    /// they never replace the error that triggered the rollback.
    fn roll_back(&self, bitmap: &mut MftBitmap, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            let result = match step {
                Undo::BitSet(number) => {
                    bitmap_clear(&mut bitmap.bits, number);
                    self.write_bitmap_byte(bitmap, number)
                }
                Undo::Initialized { attr, before } => {
                    let restored = self.restore_sizes(self.table_attr(attr), before);
                    if attr == TableAttr::Bitmap {
                        bitmap
                            .bits
                            .truncate(usize::try_from(before.initialized).unwrap_or(0));
                    }
                    restored
                }
                Undo::Allocated { attr, old } => self
                    .shrink_allocation(self.table_attr(attr), old)
                    .map(|_| ()),
            };
            match result {
                Ok(()) => debug!(step = step.name(), "record_alloc_undo"),
                Err(err) => {
                    error!(step = step.name(), error = %err, "record_alloc_undo_failed");
                    self.state.mark_errors("metadata record allocation rollback failed");
                }
            }
        }
    }

    /// Release extension record `reference`.
    ///
    /// Refuses with `Busy` while attribute handles pin the record or someone
    /// has it checked out. The record is written out free, with a new
    /// sequence number, before its bitmap bit is cleared; if clearing the bit
    /// fails the record stays leaked and the volume is flagged.
    pub fn free_record(&self, reference: RecordRef) -> Result<()> {
        let result = self.free_record_inner(reference);
        self.observe(result)
    }

    fn free_record_inner(&self, reference: RecordRef) -> Result<()> {
        let number = reference.number.0;
        if RecordNumber(number).is_reserved() {
            return Err(NxfError::Invalid(format!("record {number} is reserved")));
        }
        let mut bitmap = self.mft.bitmap.write();
        let slot = self.record_slot(number);
        if slot.users() > 0 {
            return Err(NxfError::Busy { record: number });
        }
        let mut record = self.try_checkout_record(number)?;
        let mut header = record.header()?;
        if !header.in_use() {
            return Err(NxfError::Invalid(format!("record {number} is not in use")));
        }
        if header.sequence != reference.sequence {
            return Err(NxfError::corruption(
                number,
                format!(
                    "free of {reference} but record holds sequence {}",
                    header.sequence
                ),
            ));
        }
        if header.is_base() {
            return Err(NxfError::Invalid(format!(
                "record {number} is a base record"
            )));
        }
        let base = header.base_record;
        self.check_base(base, Some(number))?;
        header.flags = header.flags.with(RecordFlags::IN_USE, false);
        header.sequence = match header.sequence.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        let saved = record.bytes().to_vec();
        let written = header
            .write(record.bytes_mut())
            .map_err(|err| parse_error(number, err))
            .and_then(|()| self.write_record(&record));
        if let Err(err) = written {
            record.restore(&saved);
            return Err(err);
        }
        drop(record);
        let owner = self
            .cached_inode(base.number.0)
            .filter(|inode| inode.base() == base);
        if let Some(inode) = owner {
            inode.detach(number);
        }

        bitmap_clear(&mut bitmap.bits, number);
        if let Err(err) = self.write_bitmap_byte(&bitmap, number) {
            error!(
                record = number,
                error = %err,
                action = "offline check required",
                "record_free_bitmap_clear_failed"
            );
            self.state.mark_errors("metadata bitmap bit left set for a free record");
        }
        debug!(record = number, base = base.number.0, "record_free");
        Ok(())
    }
}
