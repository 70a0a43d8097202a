//! Metadata-record allocation and release on formatted in-memory volumes.

mod common;

use common::{bitmap_device_offset, fresh_volume, new_file};
use nxf_error::NxfError;
use nxf_ondisk::RecordFlags;
use nxf_types::{FIRST_USER_RECORD, RecordRef};
use proptest::prelude::*;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;

#[test]
fn first_allocation_takes_first_user_record() {
    let (_device, volume) = fresh_volume();
    let (reference, record) = volume.allocate_record(true, None).expect("allocate");
    assert_eq!(reference.number.0, FIRST_USER_RECORD);
    // Formatted free records carry sequence 0, which is never handed out.
    assert_eq!(reference.sequence, 1);

    let header = record.header().expect("header");
    assert!(header.in_use());
    assert!(header.is_directory());
    assert!(header.is_base());
    assert_eq!(record.reference().expect("reference"), reference);
    drop(record);

    assert!(volume.record_in_use(FIRST_USER_RECORD));
    assert_eq!(volume.state().mft_cursor(), FIRST_USER_RECORD + 1);
    let next = new_file(&volume);
    assert_eq!(next.number.0, FIRST_USER_RECORD + 1);
}

#[test]
fn table_grows_one_record_at_a_time() {
    let (_device, volume) = fresh_volume();
    assert_eq!(volume.initialized_records(), 32);
    let refs: Vec<RecordRef> = (0..10).map(|_| new_file(&volume)).collect();
    let numbers: Vec<u64> = refs.iter().map(|r| r.number.0).collect();
    assert_eq!(numbers, (24..34).collect::<Vec<_>>());

    let info = volume.info();
    assert_eq!(info.initialized_records, 34);
    // Allocation grows by the configured chunk of 16 records.
    assert_eq!(info.allocated_records, 48);
    assert_eq!(volume.mft_runlist().real_clusters(), 96);

    // The record past the initialized part does not exist yet.
    assert!(matches!(
        volume.checkout_record(34),
        Err(NxfError::NotFound(_))
    ));
    assert!(!volume.has_errors());
}

#[test]
fn bitmap_grows_by_its_quantum() {
    let (_device, volume) = fresh_volume();
    assert_eq!(volume.mft_bitmap().len(), 8);
    let numbers: BTreeSet<u64> = (0..45).map(|_| new_file(&volume).number.0).collect();
    assert_eq!(numbers.len(), 45);
    assert_eq!(numbers.first(), Some(&24));
    assert_eq!(numbers.last(), Some(&68));
    assert_eq!(volume.mft_bitmap().len(), 16);
    assert!(numbers.iter().all(|&n| volume.record_in_use(n)));
    assert_eq!(volume.info().records_in_use, 24 + 45);
}

#[test]
fn concurrent_allocations_never_share_a_record() {
    let (_device, volume) = fresh_volume();
    let seen = Mutex::new(Vec::new());
    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..8 {
                    let (reference, record) =
                        volume.allocate_record(false, None).expect("allocate");
                    drop(record);
                    seen.lock().expect("lock").push(reference.number.0);
                }
            });
        }
    });
    let seen = seen.into_inner().expect("lock");
    let unique: BTreeSet<u64> = seen.iter().copied().collect();
    assert_eq!(seen.len(), 64);
    assert_eq!(unique.len(), 64);
    assert!(unique.iter().all(|&n| n >= FIRST_USER_RECORD));
    assert_eq!(volume.info().records_in_use, 24 + 64);
}

#[test]
fn extension_records_attach_and_free() {
    let (_device, volume) = fresh_volume();
    let base = new_file(&volume);
    let _gap = new_file(&volume);
    let (ext, record) = volume.allocate_record(false, Some(base)).expect("extension");
    // The search starts just past the base; record base+1 is taken.
    assert_eq!(ext.number.0, base.number.0 + 2);
    let header = record.header().expect("header");
    assert!(!header.is_base());
    assert_eq!(header.base_record, base);
    drop(record);

    let inode = volume.open_inode(base).expect("inode");
    assert_eq!(inode.extension_records(), vec![ext.number.0]);

    volume.free_record(ext).expect("free");
    assert!(!volume.record_in_use(ext.number.0));
    assert!(inode.extension_records().is_empty());
    let record = volume.checkout_record(ext.number.0).expect("checkout");
    let header = record.header().expect("header");
    assert!(!header.in_use());
    assert_eq!(header.sequence, ext.sequence + 1);
    drop(record);

    let (again, record) = volume.allocate_record(false, Some(base)).expect("reallocate");
    drop(record);
    assert_eq!(again.number, ext.number);
    assert_eq!(again.sequence, ext.sequence + 1);
}

#[test]
fn free_refuses_what_it_must_not_release() {
    let (_device, volume) = fresh_volume();
    let base = new_file(&volume);

    assert!(matches!(
        volume.free_record(RecordRef::new(5, 5)),
        Err(NxfError::Invalid(_))
    ));
    assert!(matches!(volume.free_record(base), Err(NxfError::Invalid(_))));

    let (ext, held) = volume.allocate_record(false, Some(base)).expect("extension");
    assert!(matches!(
        volume.free_record(ext),
        Err(NxfError::Busy { record }) if record == ext.number.0
    ));
    drop(held);
    volume.free_record(ext).expect("free");
    assert!(matches!(volume.free_record(ext), Err(NxfError::Invalid(_))));
    assert!(!volume.has_errors());

    let (reused, record) = volume.allocate_record(false, Some(base)).expect("reuse");
    drop(record);
    assert_eq!(reused.number, ext.number);
    let err = volume.free_record(ext).expect_err("stale reference");
    assert!(err.is_corruption());
    assert!(volume.has_errors());
    assert!(volume.record_in_use(reused.number.0));
}

#[test]
fn record_marked_in_use_behind_a_clear_bit_is_corruption() {
    let (_device, volume) = fresh_volume();
    let mut record = volume.checkout_record(FIRST_USER_RECORD).expect("checkout");
    let mut header = record.header().expect("header");
    header.flags = header.flags.with(RecordFlags::IN_USE, true);
    header.write(record.bytes_mut()).expect("stamp in use");
    volume.write_record(&record).expect("write");
    drop(record);
    let before = volume.info();

    let err = volume
        .allocate_new_record(false, None)
        .expect_err("conflicting record");
    assert!(err.is_corruption());
    assert!(!volume.record_in_use(FIRST_USER_RECORD));
    assert_eq!(volume.info().records_in_use, before.records_in_use);
    assert!(volume.has_errors());
}

#[test]
fn extension_of_a_stale_base_is_refused() {
    let (_device, volume) = fresh_volume();
    let base = new_file(&volume);
    let before = volume.info();

    let stale = RecordRef::new(base.number.0, base.sequence + 1);
    let err = volume
        .allocate_record(false, Some(stale))
        .expect_err("stale base");
    assert!(err.is_corruption());
    assert_eq!(volume.info().records_in_use, before.records_in_use);
    assert!(!volume.record_in_use(base.number.0 + 1));
    assert!(volume.has_errors());
}

#[test]
fn free_of_extension_whose_base_moved_on_is_refused() {
    let (_device, volume) = fresh_volume();
    let base = new_file(&volume);
    let (ext, record) = volume.allocate_record(false, Some(base)).expect("extension");
    drop(record);

    let mut record = volume.checkout_record(base.number.0).expect("checkout base");
    let mut header = record.header().expect("header");
    header.sequence += 1;
    header.write(record.bytes_mut()).expect("bump sequence");
    volume.write_record(&record).expect("write");
    drop(record);

    let err = volume.free_record(ext).expect_err("base sequence moved");
    assert!(err.is_corruption());
    assert!(volume.record_in_use(ext.number.0));
    let record = volume.checkout_record(ext.number.0).expect("checkout extension");
    let header = record.header().expect("header");
    assert!(header.in_use());
    assert_eq!(header.sequence, ext.sequence);
}

#[test]
fn failed_allocation_rolls_back_table_growth() {
    let (device, volume) = fresh_volume();
    for _ in 0..8 {
        new_file(&volume);
    }
    let before = volume.info();
    assert_eq!(before.initialized_records, 32);
    assert_eq!(before.records_in_use, 32);

    let bitmap = bitmap_device_offset(&volume);
    device.fail_writes_in(bitmap..bitmap + 512);
    let err = volume
        .allocate_record(false, None)
        .expect_err("bitmap write fails");
    assert!(matches!(err, NxfError::Io(_)));

    let after = volume.info();
    assert_eq!(after.initialized_records, before.initialized_records);
    assert_eq!(after.allocated_records, before.allocated_records);
    assert_eq!(after.free_clusters, before.free_clusters);
    assert_eq!(after.mft_runs, before.mft_runs);
    assert!(!volume.record_in_use(32));
    // Clearing the bit on disk failed too; that is flagged, not returned.
    assert!(volume.has_errors());

    device.clear_faults();
    let (reference, record) = volume.allocate_record(false, None).expect("retry");
    drop(record);
    assert_eq!(reference.number.0, 32);
    assert_eq!(volume.initialized_records(), 33);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Any interleaving of extension allocations and frees keeps the bitmap
    /// and the base's extension list in step with what is live.
    #[test]
    fn extension_churn_keeps_bitmap_and_inode_in_step(
        ops in proptest::collection::vec(any::<bool>(), 1..40)
    ) {
        let (_device, volume) = fresh_volume();
        let base = new_file(&volume);
        let inode = volume.open_inode(base).expect("inode");
        let mut live: VecDeque<RecordRef> = VecDeque::new();
        for allocate in ops {
            if allocate {
                let (ext, record) = volume.allocate_record(false, Some(base)).expect("allocate");
                drop(record);
                prop_assert!(live.iter().all(|r| r.number != ext.number));
                live.push_back(ext);
            } else if let Some(ext) = live.pop_front() {
                volume.free_record(ext).expect("free");
                prop_assert!(!volume.record_in_use(ext.number.0));
            }
            let mut expected: Vec<u64> = live.iter().map(|r| r.number.0).collect();
            expected.sort_unstable();
            let mut attached = inode.extension_records();
            attached.sort_unstable();
            prop_assert_eq!(attached, expected);
            prop_assert!(live.iter().all(|r| volume.record_in_use(r.number.0)));
        }
        prop_assert!(!volume.has_errors());
    }
}
