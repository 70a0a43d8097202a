#![allow(dead_code)]

use nxf_block::{DevicePageCache, MemByteDevice, PageCache};
use nxf_core::{Volume, VolumeOptions};
use nxf_ondisk::CaseSensitivity;
use nxf_types::{AttrType, RecordRef};
use std::sync::Arc;

pub const DEVICE_BYTES: usize = 2 * 1024 * 1024;

/// 512-byte clusters, 1 KiB records, 32 records formatted up front.
pub fn options() -> VolumeOptions {
    VolumeOptions {
        cluster_size: 512,
        record_size: 1024,
        initial_records: 32,
        ..VolumeOptions::default()
    }
}

pub fn fresh_volume() -> (MemByteDevice, Volume) {
    fresh_volume_with(&options())
}

pub fn fresh_volume_with(options: &VolumeOptions) -> (MemByteDevice, Volume) {
    let device = MemByteDevice::new(DEVICE_BYTES);
    let cache: Arc<dyn PageCache> = Arc::new(DevicePageCache::new(device.clone()));
    let geometry = options.geometry(cache.len_bytes()).expect("geometry");
    let clusters = Arc::new(geometry.cluster_allocator().expect("allocator"));
    let volume = Volume::format(cache, clusters, options).expect("format");
    (device, volume)
}

/// Reference of the metadata table's own record.
pub fn table_ref() -> RecordRef {
    RecordRef::new(0, 1)
}

/// Allocate a base record and release the checkout.
pub fn new_file(volume: &Volume) -> RecordRef {
    let (reference, record) = volume.allocate_record(false, None).expect("allocate base record");
    drop(record);
    reference
}

/// Device byte offset of metadata record `number`.
pub fn record_device_offset(volume: &Volume, number: u64) -> u64 {
    let table = volume
        .lookup_attribute(table_ref(), AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("table data");
    let record_size = u64::from(volume.geometry().record_size);
    volume
        .resolve_extent(&table, number * record_size)
        .expect("resolve record")
        .device_offset
        .expect("record on real clusters")
}

/// Device byte offset of the metadata bitmap's first byte.
pub fn bitmap_device_offset(volume: &Volume) -> u64 {
    let bitmap = volume
        .lookup_attribute(table_ref(), AttrType::BITMAP, &[], CaseSensitivity::Sensitive)
        .expect("table bitmap");
    volume
        .resolve_extent(&bitmap, 0)
        .expect("resolve bitmap")
        .device_offset
        .expect("bitmap on real clusters")
}
