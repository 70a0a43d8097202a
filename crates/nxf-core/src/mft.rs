//! The metadata table: its `$DATA` stream, its in-use bitmap, and the
//! record-number to device-offset translation.

use crate::config::VolumeGeometry;
use crate::inode::NtAttr;
use arc_swap::ArcSwap;
use nxf_error::{NxfError, Result};
use nxf_runlist::Runlist;
use nxf_types::Lcn;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

/// Initialized bytes of the table's `$BITMAP`, one bit per record.
#[derive(Debug, Clone, Default)]
pub(crate) struct MftBitmap {
    pub(crate) bits: Vec<u8>,
}

impl MftBitmap {
    pub(crate) fn initialized_bits(&self) -> u64 {
        self.bits.len() as u64 * 8
    }
}

/// Device offset of record `number` given the table runlist.
///
/// A record larger than a cluster must sit on physically contiguous
/// clusters.
pub(crate) fn record_offset_in(
    runlist: &Runlist,
    geometry: &VolumeGeometry,
    number: u64,
) -> Result<u64> {
    let record_size = u64::from(geometry.record_size);
    let cs = geometry.cluster_bytes();
    let byte = number
        .checked_mul(record_size)
        .ok_or_else(|| NxfError::NotFound(format!("record {number} is out of range")))?;
    let vcn = i64::try_from(byte / cs)
        .map_err(|_| NxfError::NotFound(format!("record {number} is out of range")))?;
    let lcn = match runlist.resolve(vcn) {
        Lcn::Real(lcn) => lcn,
        Lcn::EndOfFile => {
            return Err(NxfError::NotFound(format!(
                "record {number} lies past the metadata table"
            )));
        }
        other => {
            return Err(NxfError::corruption(
                0,
                format!("record {number} maps to {other}"),
            ));
        }
    };
    if record_size > cs {
        let clusters = i64::try_from(record_size / cs).unwrap_or(i64::MAX);
        let last = runlist.resolve(vcn + clusters - 1);
        if last != Lcn::Real(lcn + clusters - 1) {
            return Err(NxfError::Unsupported(format!(
                "record {number} spans non-contiguous clusters"
            )));
        }
    }
    let base = geometry
        .lcn_offset(lcn)
        .ok_or_else(|| NxfError::corruption(0, format!("lcn {lcn} overflows")))?;
    Ok(base + byte % cs)
}

/// State of the metadata table shared by all operations on a volume.
///
/// `bitmap` is the outermost lock of the volume lock order. `snapshot` is a
/// lock-free copy of the `$DATA` runlist used only to translate record
/// numbers; it is republished after every change to that runlist.
pub(crate) struct MftTable {
    pub(crate) bitmap: RwLock<MftBitmap>,
    pub(crate) data: Arc<NtAttr>,
    pub(crate) bitmap_attr: Arc<NtAttr>,
    snapshot: ArcSwap<Runlist>,
    geometry: VolumeGeometry,
}

impl MftTable {
    pub(crate) fn new(
        geometry: VolumeGeometry,
        data: Arc<NtAttr>,
        bitmap_attr: Arc<NtAttr>,
        bits: Vec<u8>,
    ) -> Self {
        let snapshot = ArcSwap::from_pointee(data.runlist());
        Self {
            bitmap: RwLock::new(MftBitmap { bits }),
            data,
            bitmap_attr,
            snapshot,
            geometry,
        }
    }

    /// Device offset of record `number`. Records past the initialized part
    /// of the table do not exist yet.
    pub(crate) fn record_offset(&self, number: u64) -> Result<u64> {
        let initialized = self.initialized_records();
        if number >= initialized {
            return Err(NxfError::NotFound(format!(
                "record {number} is past the {initialized} initialized records"
            )));
        }
        record_offset_in(&self.snapshot.load(), &self.geometry, number)
    }

    /// Device offset of a record that is allocated but not yet initialized.
    pub(crate) fn raw_record_offset(&self, number: u64) -> Result<u64> {
        record_offset_in(&self.snapshot.load(), &self.geometry, number)
    }

    pub(crate) fn initialized_records(&self) -> u64 {
        let initialized = u64::try_from(self.data.sizes().initialized).unwrap_or(0);
        initialized / u64::from(self.geometry.record_size)
    }

    /// Records the current allocation can hold.
    pub(crate) fn allocated_records(&self) -> u64 {
        let allocated = u64::try_from(self.data.sizes().allocated).unwrap_or(0);
        allocated / u64::from(self.geometry.record_size)
    }

    pub(crate) fn is_table_attr(&self, attr: &NtAttr) -> bool {
        std::ptr::eq(attr, Arc::as_ptr(&self.data))
    }

    /// Republish the translation snapshot from the `$DATA` runlist.
    pub(crate) fn publish(&self, runlist: &Runlist) {
        self.snapshot.store(Arc::new(runlist.clone()));
        trace!(end_vcn = runlist.end_vcn(), "mft_snapshot_published");
    }

    /// Current translation snapshot.
    pub(crate) fn runlist(&self) -> Arc<Runlist> {
        self.snapshot.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeOptions;
    use nxf_runlist::RunlistElement;

    fn geometry(cluster: u32, record: u32) -> VolumeGeometry {
        VolumeOptions {
            cluster_size: cluster,
            record_size: record,
            ..VolumeOptions::default()
        }
        .geometry(4 * 1024 * 1024)
        .unwrap()
    }

    fn table_runs() -> Runlist {
        Runlist::from_elements(vec![
            RunlistElement::new(0, Lcn::Real(40), 2),
            RunlistElement::new(2, Lcn::Real(90), 2),
            RunlistElement::new(4, Lcn::EndOfFile, 0),
        ])
        .unwrap()
    }

    #[test]
    fn small_records_share_clusters() {
        let g = geometry(4096, 1024);
        let rl = table_runs();
        assert_eq!(record_offset_in(&rl, &g, 0).unwrap(), 40 * 4096);
        assert_eq!(record_offset_in(&rl, &g, 5).unwrap(), 41 * 4096 + 1024);
        assert_eq!(record_offset_in(&rl, &g, 8).unwrap(), 90 * 4096);
        assert!(matches!(
            record_offset_in(&rl, &g, 16),
            Err(NxfError::NotFound(_))
        ));
    }

    #[test]
    fn large_records_need_contiguous_clusters() {
        let g = geometry(512, 1024);
        let rl = table_runs();
        assert_eq!(record_offset_in(&rl, &g, 0).unwrap(), 40 * 512);
        // Record 1 covers vcn 2..4, which is contiguous at lcn 90.
        assert_eq!(record_offset_in(&rl, &g, 1).unwrap(), 90 * 512);

        let split = Runlist::from_elements(vec![
            RunlistElement::new(0, Lcn::Real(40), 1),
            RunlistElement::new(1, Lcn::Real(90), 1),
            RunlistElement::new(2, Lcn::EndOfFile, 0),
        ])
        .unwrap();
        assert!(matches!(
            record_offset_in(&split, &g, 0),
            Err(NxfError::Unsupported(_))
        ));
    }

    #[test]
    fn unmapped_table_cluster_is_corruption() {
        let g = geometry(4096, 1024);
        let rl = Runlist::from_elements(vec![
            RunlistElement::new(0, Lcn::Hole, 1),
            RunlistElement::new(1, Lcn::EndOfFile, 0),
        ])
        .unwrap();
        assert!(record_offset_in(&rl, &g, 0).unwrap_err().is_corruption());
    }
}
