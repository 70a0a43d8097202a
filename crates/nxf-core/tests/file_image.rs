//! Volumes on image files: everything written must survive closing the
//! file and mounting it again.

mod common;

use common::{new_file, options};
use nxf_block::{DevicePageCache, FileByteDevice, PageCache};
use nxf_core::Volume;
use nxf_ondisk::CaseSensitivity;
use nxf_types::AttrType;
use std::sync::Arc;

fn file_cache(path: &std::path::Path) -> Arc<dyn PageCache> {
    let device = FileByteDevice::open(path).expect("open image");
    Arc::new(DevicePageCache::new(device))
}

#[test]
fn allocations_persist_across_mounts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("volume.img");
    let device = FileByteDevice::create(&path, common::DEVICE_BYTES as u64).expect("create");
    let cache: Arc<dyn PageCache> = Arc::new(DevicePageCache::new(device));
    let geometry = options().geometry(cache.len_bytes()).expect("geometry");
    let clusters = Arc::new(geometry.cluster_allocator().expect("allocator"));
    let volume = Volume::format(cache, clusters, &options()).expect("format");

    let files: Vec<_> = (0..12).map(|_| new_file(&volume)).collect();
    let base = files[3];
    volume
        .add_resident_attribute(base, AttrType::DATA, &[], b"persisted")
        .expect("add data");
    let data = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup");
    volume.ensure_allocated(&data, 3000).expect("allocate");
    let runs: Vec<(i64, i64)> = data.runlist().real_runs().collect();
    let info = volume.info();
    drop(data);
    volume.sync().expect("sync");
    drop(volume);

    let volume = Volume::mount(file_cache(&path), &options()).expect("mount");
    let reopened = volume.info();
    assert_eq!(reopened.initialized_records, info.initialized_records);
    assert_eq!(reopened.records_in_use, info.records_in_use);
    assert_eq!(reopened.free_clusters, info.free_clusters);
    assert!(files.iter().all(|f| volume.record_in_use(f.number.0)));

    let data = volume
        .lookup_attribute(base, AttrType::DATA, &[], CaseSensitivity::Sensitive)
        .expect("lookup after mount");
    assert_eq!(data.runlist().real_runs().collect::<Vec<_>>(), runs);
    let mut buf = [0_u8; 9];
    assert_eq!(volume.read_attribute(&data, 0, &mut buf).expect("read"), 9);
    assert_eq!(&buf, b"persisted");

    let next = new_file(&volume);
    assert!(files.iter().all(|f| f.number != next.number));
}
