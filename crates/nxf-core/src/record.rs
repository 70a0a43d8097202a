//! Record cache: one slot per metadata record number, exclusive checkout of
//! record bytes, and pins that count attached users.
//!
//! The cache is keyed by record number. A slot nobody else holds (no pin,
//! checkout or inode reference) carries no state and is swept once the map
//! doubles past its last size, so an `Arc<RecordSlot>` held by an inode
//! always names the live slot for its record.

use crate::{Volume, parse_error};
use nxf_block::MappedBuffer;
use nxf_error::{NxfError, Result};
use nxf_ondisk::RecordHeader;
use nxf_types::RecordRef;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::trace;

/// In-memory shadow of one metadata record.
#[derive(Debug)]
pub struct RecordSlot {
    number: u64,
    users: AtomicU32,
    checked_out: Mutex<bool>,
    released: Condvar,
}

impl RecordSlot {
    fn new(number: u64) -> Self {
        Self {
            number,
            users: AtomicU32::new(0),
            checked_out: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    #[must_use]
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Attached users: open attribute handles pinning this record.
    #[must_use]
    pub fn users(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_checked_out(&self) -> bool {
        *self.checked_out.lock()
    }

    fn acquire(&self) {
        let mut out = self.checked_out.lock();
        while *out {
            self.released.wait(&mut out);
        }
        *out = true;
    }

    fn try_acquire(&self) -> bool {
        let mut out = self.checked_out.lock();
        if *out {
            return false;
        }
        *out = true;
        true
    }

    fn release(&self) {
        *self.checked_out.lock() = false;
        self.released.notify_one();
    }
}

/// Map size below which idle slots are left alone.
const SWEEP_MIN: usize = 256;

#[derive(Debug)]
struct SlotMap {
    slots: HashMap<u64, Arc<RecordSlot>>,
    sweep_at: usize,
}

#[derive(Debug)]
pub(crate) struct RecordCache {
    inner: Mutex<SlotMap>,
}

impl Default for RecordCache {
    fn default() -> Self {
        Self {
            inner: Mutex::new(SlotMap {
                slots: HashMap::new(),
                sweep_at: SWEEP_MIN,
            }),
        }
    }
}

impl RecordCache {
    pub(crate) fn slot(&self, number: u64) -> Arc<RecordSlot> {
        let mut map = self.inner.lock();
        if map.slots.len() >= map.sweep_at && !map.slots.contains_key(&number) {
            // Every clone is taken under this lock, so a count of one means
            // only the map sees the slot.
            let before = map.slots.len();
            map.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            map.sweep_at = (map.slots.len() * 2).max(SWEEP_MIN);
            trace!(before, after = map.slots.len(), "record_slot_sweep");
        }
        Arc::clone(
            map.slots
                .entry(number)
                .or_insert_with(|| Arc::new(RecordSlot::new(number))),
        )
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }
}

/// Releases the checkout when dropped, including on early error returns.
#[derive(Debug)]
struct Checkout {
    slot: Arc<RecordSlot>,
}

impl Drop for Checkout {
    fn drop(&mut self) {
        self.slot.release();
        trace!(record = self.slot.number, "record_release");
    }
}

/// A metadata record checked out for exclusive use.
///
/// Edits go to a private copy of the bytes; [`Volume::write_record`]
/// publishes them. Dropping the record releases the checkout.
pub struct LockedRecord {
    checkout: Checkout,
    buf: MappedBuffer,
}

impl fmt::Debug for LockedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedRecord")
            .field("number", &self.number())
            .field("offset", &self.buf.offset())
            .field("len", &self.buf.len())
            .finish()
    }
}

impl LockedRecord {
    #[must_use]
    pub fn number(&self) -> u64 {
        self.checkout.slot.number
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut_slice()
    }

    /// Parsed header; a malformed header is corruption of this record.
    pub fn header(&self) -> Result<RecordHeader> {
        RecordHeader::parse(self.bytes())
            .map_err(|err| NxfError::corruption(self.number(), err.to_string()))
    }

    /// Reference to this record at its current sequence number.
    pub fn reference(&self) -> Result<RecordRef> {
        let header = self.header()?;
        Ok(RecordRef::new(self.number(), header.sequence))
    }

    pub(crate) fn slot(&self) -> &Arc<RecordSlot> {
        &self.checkout.slot
    }

    /// Put back bytes saved before an edit.
    pub(crate) fn restore(&mut self, saved: &[u8]) {
        self.buf.as_mut_slice().copy_from_slice(saved);
    }
}

/// Counts as an attached user of a record for as long as it lives.
#[derive(Debug)]
pub struct RecordPin {
    slot: Arc<RecordSlot>,
}

impl RecordPin {
    pub(crate) fn new(slot: Arc<RecordSlot>) -> Self {
        slot.users.fetch_add(1, Ordering::AcqRel);
        Self { slot }
    }

    #[must_use]
    pub fn number(&self) -> u64 {
        self.slot.number
    }
}

impl Clone for RecordPin {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.slot))
    }
}

impl Drop for RecordPin {
    fn drop(&mut self) {
        self.slot.users.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Volume {
    /// Check out record `number`, waiting for any other holder to release
    /// it.
    pub fn checkout_record(&self, number: u64) -> Result<LockedRecord> {
        let slot = self.records.slot(number);
        slot.acquire();
        self.map_checked_out(Checkout { slot })
    }

    /// Check out record `number` or fail with `Busy` if someone holds it.
    pub(crate) fn try_checkout_record(&self, number: u64) -> Result<LockedRecord> {
        let slot = self.records.slot(number);
        if !slot.try_acquire() {
            return Err(NxfError::Busy { record: number });
        }
        self.map_checked_out(Checkout { slot })
    }

    fn map_checked_out(&self, checkout: Checkout) -> Result<LockedRecord> {
        let number = checkout.slot.number;
        let offset = self.mft.record_offset(number)?;
        let buf = self
            .cache
            .map_bytes(offset, self.geometry.record_size as usize)?;
        trace!(record = number, offset, "record_checkout");
        Ok(LockedRecord { checkout, buf })
    }

    /// Header of record `number` as last published, without a checkout.
    /// Safe while the caller holds that record checked out.
    pub(crate) fn peek_record_header(&self, number: u64) -> Result<RecordHeader> {
        let offset = self.mft.record_offset(number)?;
        let buf = self
            .cache
            .map_bytes(offset, self.geometry.record_size as usize)?;
        RecordHeader::parse(buf.as_slice()).map_err(|err| parse_error(number, err))
    }

    /// Publish the edited bytes of a checked-out record.
    pub fn write_record(&self, record: &LockedRecord) -> Result<()> {
        trace!(record = record.number(), "record_write");
        self.cache.mark_dirty(&record.buf)
    }

    pub(crate) fn record_slot(&self, number: u64) -> Arc<RecordSlot> {
        self.records.slot(number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn checkout_is_exclusive_and_wakes_waiters() {
        let slot = Arc::new(RecordSlot::new(30));
        slot.acquire();
        assert!(!slot.try_acquire());

        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                slot.acquire();
                slot.release();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(slot.is_checked_out());
        slot.release();
        waiter.join().expect("waiter");
        assert!(!slot.is_checked_out());
    }

    #[test]
    fn pins_count_users() {
        let cache = RecordCache::default();
        let slot = cache.slot(40);
        assert!(Arc::ptr_eq(&slot, &cache.slot(40)));
        let pin = RecordPin::new(Arc::clone(&slot));
        let second = pin.clone();
        assert_eq!(slot.users(), 2);
        drop(pin);
        assert_eq!(second.number(), 40);
        drop(second);
        assert_eq!(slot.users(), 0);
    }

    #[test]
    fn idle_slots_are_swept_and_held_slots_survive() {
        let cache = RecordCache::default();
        let held = cache.slot(5);
        let pin = RecordPin::new(cache.slot(6));
        for number in 100..100 + SWEEP_MIN as u64 - 2 {
            drop(cache.slot(number));
        }
        assert_eq!(cache.len(), SWEEP_MIN);

        let fresh = cache.slot(5_000);
        assert_eq!(cache.len(), 3);
        assert!(Arc::ptr_eq(&held, &cache.slot(5)));
        assert_eq!(cache.slot(6).users(), 1);
        assert_eq!(fresh.number(), 5_000);
        drop(pin);
    }
}
