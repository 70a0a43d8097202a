//! Growing attributes: resident to non-resident conversion, cluster
//! allocation, the initialized boundary, and their rollback.

mod common;

use common::{fresh_volume, new_file, options, record_device_offset};
use nxf_alloc::AllocZone;
use nxf_block::{DevicePageCache, PageCache};
use nxf_core::Volume;
use nxf_error::NxfError;
use nxf_ondisk::CaseSensitivity;
use nxf_runlist::{Runlist, RunlistElement};
use nxf_types::{AttrType, Lcn};
use std::sync::Arc;

const VALUE: [u8; 10] = [0xAB; 10];

fn file_with_data(volume: &Volume) -> nxf_types::RecordRef {
    let base = new_file(volume);
    volume
        .add_resident_attribute(base, AttrType::DATA, &[], &VALUE)
        .expect("add data");
    base
}

#[test]
fn resident_value_grows_to_ten_clusters() {
    let (_device, volume) = fresh_volume();
    let base = file_with_data(&volume);
    let data = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup");
    assert!(data.is_resident());
    assert_eq!(data.owner(), base);

    let allocated = volume.ensure_allocated(&data, 5000).expect("allocate");
    assert_eq!(allocated, 5120);
    let runlist = data.runlist();
    assert_eq!(runlist.end_vcn(), 10);
    assert_eq!(runlist.real_clusters(), 10);
    assert!(runlist.is_complete());

    let sizes = data.sizes();
    assert!(!sizes.resident);
    assert_eq!(sizes.allocated, 5120);
    assert_eq!(sizes.data, 10);
    assert_eq!(sizes.initialized, 10);

    let mut buf = vec![0xFF_u8; 5000];
    assert_eq!(volume.read_attribute(&data, 0, &mut buf).expect("read"), 10);
    assert_eq!(&buf[..10], &VALUE);

    volume.ensure_initialized(&data, 5000).expect("initialize");
    assert_eq!(data.sizes().initialized, 5000);
    assert_eq!(data.sizes().data, 5000);
    let mut buf = vec![0xFF_u8; 5000];
    assert_eq!(volume.read_attribute(&data, 0, &mut buf).expect("read"), 5000);
    assert_eq!(&buf[..10], &VALUE);
    assert!(buf[10..].iter().all(|&b| b == 0));
    assert!(!volume.has_errors());
}

#[test]
fn resolve_extent_maps_offsets_to_device_bytes() {
    let (_device, volume) = fresh_volume();
    let base = file_with_data(&volume);
    let data = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup");
    assert!(matches!(
        volume.resolve_extent(&data, 0),
        Err(NxfError::Invalid(_))
    ));
    volume.ensure_allocated(&data, 4096).expect("allocate");

    let first = volume.resolve_extent(&data, 700).expect("resolve");
    assert_eq!(first.vcn, 1);
    let Lcn::Real(lcn) = first.lcn else {
        panic!("vcn 1 should be allocated, got {}", first.lcn);
    };
    assert_eq!(first.device_offset, Some(lcn.unsigned_abs() * 512 + 188));
    assert_eq!(first.lcn, data.runlist().resolve(1));

    let past = volume.resolve_extent(&data, 4096).expect("resolve past end");
    assert_eq!(past.lcn, Lcn::EndOfFile);
    assert_eq!(past.device_offset, None);
}

#[test]
fn repeated_lookups_share_one_attribute() {
    let (_device, volume) = fresh_volume();
    let base = file_with_data(&volume);
    let first = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup");
    let second = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup");
    assert!(Arc::ptr_eq(first.attr(), second.attr()));
    volume.ensure_allocated(&first, 2048).expect("allocate");
    assert_eq!(second.sizes().allocated, 2048);
}

#[test]
fn sizes_survive_a_remount() {
    let (device, volume) = fresh_volume();
    let base = file_with_data(&volume);
    let data = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup");
    volume.ensure_allocated(&data, 5000).expect("allocate");
    volume.ensure_initialized(&data, 3000).expect("initialize");
    let runs: Vec<(i64, i64)> = data.runlist().real_runs().collect();
    let free = volume.cluster_allocator().free_clusters();
    drop(data);
    volume.sync().expect("sync");
    drop(volume);

    let cache: Arc<dyn PageCache> = Arc::new(DevicePageCache::new(device));
    let volume = Volume::mount(cache, &options()).expect("mount");
    assert_eq!(volume.cluster_allocator().free_clusters(), free);
    let data = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup after mount");
    let sizes = data.sizes();
    assert_eq!((sizes.allocated, sizes.data, sizes.initialized), (5120, 3000, 3000));
    assert_eq!(data.runlist().real_runs().collect::<Vec<_>>(), runs);
    let mut buf = [0_u8; 16];
    assert_eq!(volume.read_attribute(&data, 0, &mut buf).expect("read"), 16);
    assert_eq!(&buf[..10], &VALUE);
    assert_eq!(&buf[10..], &[0; 6]);
}

#[test]
fn failed_conversion_leaves_record_and_clusters_untouched() {
    let (device, volume) = fresh_volume();
    let base = file_with_data(&volume);
    let data = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup");
    let offset = record_device_offset(&volume, base.number.0);
    let record_range = usize::try_from(offset).expect("offset")..usize::try_from(offset + 1024).expect("end");
    let record_before = device.snapshot()[record_range.clone()].to_vec();
    let free_before = volume.cluster_allocator().free_clusters();

    device.fail_writes_in(offset..offset + 1024);
    let err = volume.ensure_allocated(&data, 5000).expect_err("record write fails");
    assert!(matches!(err, NxfError::Io(_)));
    device.clear_faults();

    assert!(data.is_resident());
    assert_eq!(data.sizes().data, 10);
    assert_eq!(volume.cluster_allocator().free_clusters(), free_before);
    assert_eq!(device.snapshot()[record_range].to_vec(), record_before);
    let mut buf = [0_u8; 10];
    volume.read_attribute(&data, 0, &mut buf).expect("read");
    assert_eq!(buf, VALUE);

    // A retry after the fault clears behaves as if nothing had happened.
    assert_eq!(volume.ensure_allocated(&data, 5000).expect("retry"), 5120);
    assert!(!volume.has_errors());
}

#[test]
fn failed_extension_returns_its_clusters() {
    let (device, volume) = fresh_volume();
    let base = file_with_data(&volume);
    let data = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup");
    volume.make_non_resident(&data).expect("convert");
    let runlist_before = data.runlist();
    let sizes_before = data.sizes();
    let free_before = volume.cluster_allocator().free_clusters();

    let offset = record_device_offset(&volume, base.number.0);
    device.fail_writes_in(offset..offset + 1024);
    let err = volume.extend_allocation(&data, 8192).expect_err("record write fails");
    assert!(matches!(err, NxfError::Io(_)));
    device.clear_faults();

    assert_eq!(data.runlist(), runlist_before);
    assert_eq!(data.sizes(), sizes_before);
    assert_eq!(volume.cluster_allocator().free_clusters(), free_before);

    assert_eq!(volume.extend_allocation(&data, 8192).expect("retry"), 8192);
    assert_eq!(volume.cluster_allocator().free_clusters(), free_before - 15);
}

#[test]
fn shrinking_frees_the_tail_and_clamps_sizes() {
    let (_device, volume) = fresh_volume();
    let base = file_with_data(&volume);
    let data = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup");
    volume.ensure_allocated(&data, 5000).expect("allocate");
    volume.ensure_initialized(&data, 5000).expect("initialize");
    let free = volume.cluster_allocator().free_clusters();

    assert_eq!(volume.shrink_allocation(&data, 1000).expect("shrink"), 1024);
    assert_eq!(volume.cluster_allocator().free_clusters(), free + 8);
    let sizes = data.sizes();
    assert_eq!((sizes.allocated, sizes.data, sizes.initialized), (1024, 1024, 1024));
    assert_eq!(data.runlist().end_vcn(), 2);

    assert!(matches!(
        volume.ensure_initialized(&data, 2048),
        Err(NxfError::Invalid(_))
    ));
}

#[test]
fn a_full_record_is_unsupported() {
    let (_device, volume) = fresh_volume();
    let base = file_with_data(&volume);
    let big = vec![1_u8; 2000];
    let name = nxf_types::utf16_name("big");
    assert!(matches!(
        volume.add_resident_attribute(base, AttrType::DATA, &name, &big),
        Err(NxfError::Unsupported(_))
    ));

    let data = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup");
    assert!(matches!(
        volume.ensure_initialized(&data, 2000),
        Err(NxfError::Unsupported(_))
    ));
    assert_eq!(data.sizes().data, 10);
    assert!(data.is_resident());
    assert!(!volume.has_errors());
}

/// File whose data is one non-resident cluster.
fn file_with_cluster(volume: &Volume) -> nxf_core::AttrHandle {
    let base = file_with_data(volume);
    let data = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup");
    volume.make_non_resident(&data).expect("convert");
    data
}

/// Leave every other cluster of a `count`-cluster block at `hint` free.
fn fragment_free_space(volume: &Volume, hint: i64, count: i64) {
    let clusters = volume.cluster_allocator();
    let block = clusters
        .allocate(0, count, Some(hint), AllocZone::Data)
        .expect("reserve block");
    let lcns: Vec<i64> = block
        .real_runs()
        .flat_map(|(lcn, len)| lcn..lcn + len)
        .collect();
    for lcn in lcns.into_iter().step_by(2) {
        let single = Runlist::from_elements(vec![
            RunlistElement::new(0, Lcn::Real(lcn), 1),
            RunlistElement::new(1, Lcn::EndOfFile, 0),
        ])
        .expect("single cluster");
        clusters.free(&single).expect("free");
    }
}

#[test]
fn a_nearly_full_record_keeps_what_its_runlist_can_hold() {
    let (_device, volume) = fresh_volume();
    let fill = nxf_types::utf16_name("fill");

    // Largest filler that fits next to one non-resident extent.
    let scratch = file_with_cluster(&volume);
    let fit = (0..1024_usize)
        .rev()
        .find(|&len| {
            volume
                .add_resident_attribute(scratch.owner(), AttrType::DATA, &fill, &vec![0; len])
                .is_ok()
        })
        .expect("some filler fits");

    // Leave room for a handful of mapping pairs and no more.
    let data = file_with_cluster(&volume);
    volume
        .add_resident_attribute(data.owner(), AttrType::DATA, &fill, &vec![0; fit - 16])
        .expect("add filler");
    let hint = data.runlist().next_lcn_hint().expect("data on real clusters");
    fragment_free_space(&volume, hint, 200);

    let free_before = volume.cluster_allocator().free_clusters();
    let requested = 41 * 512;
    let reached = volume.extend_allocation(&data, requested).expect("extend");
    assert!(reached > 512, "no clusters kept: {reached}");
    assert!(reached < requested, "record held every pair: {reached}");

    let kept = reached / 512;
    let runlist = data.runlist();
    assert_eq!(runlist.end_vcn(), kept);
    assert!(runlist.is_complete());
    assert_eq!(runlist.tail(kept).real_clusters(), 0);
    assert_eq!(data.sizes().allocated, reached);
    assert_eq!(
        volume.cluster_allocator().free_clusters(),
        free_before - (kept.unsigned_abs() - 1)
    );
    assert!(!volume.has_errors());
}

#[test]
fn resident_values_grow_in_place() {
    let (_device, volume) = fresh_volume();
    let base = file_with_data(&volume);
    let data = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup");
    volume.ensure_initialized(&data, 40).expect("grow resident");
    assert!(data.is_resident());
    let mut buf = [0xFF_u8; 64];
    assert_eq!(volume.read_attribute(&data, 0, &mut buf).expect("read"), 40);
    assert_eq!(&buf[..10], &VALUE);
    assert!(buf[10..40].iter().all(|&b| b == 0));
}

#[test]
fn duplicate_attributes_are_refused() {
    let (_device, volume) = fresh_volume();
    let base = file_with_data(&volume);
    assert!(matches!(
        volume.add_resident_attribute(base, AttrType::DATA, &[], b"again"),
        Err(NxfError::Invalid(_))
    ));
}
