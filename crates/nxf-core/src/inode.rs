//! In-memory shadows of base records (`NtInode`) and of the attributes
//! opened through them (`NtAttr`).

use crate::record::RecordSlot;
use nxf_alloc::AllocZone;
use nxf_ondisk::{ATTR_FLAG_COMPRESSED, ATTR_FLAG_SPARSE, AttrBody, AttrListEntry, AttrRecord};
use nxf_runlist::Runlist;
use nxf_types::{AttrType, RecordRef, display_name};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ── Attribute sizes ─────────────────────────────────────────────────────────

/// Size fields of one attribute as held by its lowest-VCN extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttrSizes {
    pub resident: bool,
    pub allocated: i64,
    pub data: i64,
    pub initialized: i64,
    pub compressed: Option<i64>,
    pub flags: u16,
    pub compression_unit: u8,
}

impl AttrSizes {
    #[must_use]
    pub fn from_record(attr: &AttrRecord) -> Self {
        match attr.body {
            AttrBody::Resident { value_length, .. } => {
                let len = i64::from(value_length);
                Self {
                    resident: true,
                    allocated: nxf_types::align8(value_length as usize) as i64,
                    data: len,
                    initialized: len,
                    compressed: None,
                    flags: attr.flags,
                    compression_unit: 0,
                }
            }
            AttrBody::NonResident(header) => Self {
                resident: false,
                allocated: header.allocated_size,
                data: header.data_size,
                initialized: header.initialized_size,
                compressed: header.compressed_size,
                flags: attr.flags,
                compression_unit: header.compression_unit,
            },
        }
    }

    /// Whether the on-disk header carries a compressed-size field.
    #[must_use]
    pub fn tracks_compressed_size(&self) -> bool {
        self.flags & (ATTR_FLAG_COMPRESSED | ATTR_FLAG_SPARSE) != 0
    }
}

// ── NtAttr ──────────────────────────────────────────────────────────────────

/// One open attribute: identity, runlist and sizes.
///
/// The runlist lock is the second tier of the volume lock order; the sizes
/// mutex is only held for copies in and out.
pub struct NtAttr {
    base: RecordRef,
    ty: AttrType,
    name: Vec<u16>,
    zone: AllocZone,
    pub(crate) runlist: RwLock<Runlist>,
    sizes: Mutex<AttrSizes>,
}

impl fmt::Debug for NtAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NtAttr")
            .field("base", &self.base)
            .field("ty", &self.ty)
            .field("name", &display_name(&self.name))
            .field("sizes", &self.sizes())
            .finish_non_exhaustive()
    }
}

impl NtAttr {
    pub(crate) fn new(
        base: RecordRef,
        ty: AttrType,
        name: Vec<u16>,
        zone: AllocZone,
        sizes: AttrSizes,
        runlist: Runlist,
    ) -> Self {
        Self {
            base,
            ty,
            name,
            zone,
            runlist: RwLock::new(runlist),
            sizes: Mutex::new(sizes),
        }
    }

    /// Base record of the file this attribute belongs to.
    #[must_use]
    pub fn base(&self) -> RecordRef {
        self.base
    }

    #[must_use]
    pub fn ty(&self) -> AttrType {
        self.ty
    }

    #[must_use]
    pub fn name(&self) -> &[u16] {
        &self.name
    }

    #[must_use]
    pub fn zone(&self) -> AllocZone {
        self.zone
    }

    #[must_use]
    pub fn sizes(&self) -> AttrSizes {
        *self.sizes.lock()
    }

    pub(crate) fn set_sizes(&self, sizes: AttrSizes) {
        *self.sizes.lock() = sizes;
    }

    #[must_use]
    pub fn is_resident(&self) -> bool {
        self.sizes.lock().resident
    }

    /// Copy of the runlist as currently decoded.
    #[must_use]
    pub fn runlist(&self) -> Runlist {
        self.runlist.read().clone()
    }

    pub(crate) fn matches(&self, ty: AttrType, name: &[u16]) -> bool {
        self.ty == ty && self.name == name
    }
}

// ── NtInode ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) enum AttrListState {
    Unknown,
    Absent,
    Present(Arc<Vec<AttrListEntry>>),
}

/// Shadow of one base record.
///
/// Holds the attribute list once loaded, strong handles to the extension
/// records attached to this file, and the attributes opened so far.
/// Extension records only refer back to the base by record number.
pub struct NtInode {
    base: RecordRef,
    attr_list: Mutex<AttrListState>,
    extensions: Mutex<Vec<Arc<RecordSlot>>>,
    attrs: Mutex<Vec<Arc<NtAttr>>>,
}

impl fmt::Debug for NtInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NtInode")
            .field("base", &self.base)
            .field("extensions", &self.extension_records())
            .field("open_attrs", &self.attrs.lock().len())
            .finish_non_exhaustive()
    }
}

impl NtInode {
    pub(crate) fn new(base: RecordRef) -> Self {
        Self {
            base,
            attr_list: Mutex::new(AttrListState::Unknown),
            extensions: Mutex::new(Vec::new()),
            attrs: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn base(&self) -> RecordRef {
        self.base
    }

    /// Record numbers of the attached extension records.
    #[must_use]
    pub fn extension_records(&self) -> Vec<u64> {
        self.extensions.lock().iter().map(|slot| slot.number()).collect()
    }

    pub(crate) fn attach(&self, slot: Arc<RecordSlot>) {
        let mut extensions = self.extensions.lock();
        if !extensions.iter().any(|s| s.number() == slot.number()) {
            extensions.push(slot);
        }
    }

    /// Drop the handle to extension `number`; false if it was not attached.
    pub(crate) fn detach(&self, number: u64) -> bool {
        let mut extensions = self.extensions.lock();
        let before = extensions.len();
        extensions.retain(|slot| slot.number() != number);
        extensions.len() != before
    }

    pub(crate) fn attr_list_state(&self) -> AttrListState {
        self.attr_list.lock().clone()
    }

    pub(crate) fn set_attr_list(&self, state: AttrListState) {
        *self.attr_list.lock() = state;
    }

    /// Whether the attribute list has been loaded and is present.
    #[must_use]
    pub fn has_attr_list(&self) -> bool {
        matches!(*self.attr_list.lock(), AttrListState::Present(_))
    }

    pub(crate) fn cached_attr(&self, ty: AttrType, name: &[u16]) -> Option<Arc<NtAttr>> {
        self.attrs
            .lock()
            .iter()
            .find(|attr| attr.matches(ty, name))
            .cloned()
    }

    /// Cache `attr` unless an equal one raced in first; returns the winner.
    pub(crate) fn insert_attr(&self, attr: Arc<NtAttr>) -> Arc<NtAttr> {
        let mut attrs = self.attrs.lock();
        if let Some(existing) = attrs.iter().find(|a| a.matches(attr.ty, &attr.name)) {
            return Arc::clone(existing);
        }
        attrs.push(Arc::clone(&attr));
        attr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nxf_ondisk::NonResidentHeader;

    fn resident(len: u32) -> AttrRecord {
        AttrRecord {
            offset: 0x38,
            ty: AttrType::DATA,
            length: 0x18 + 16,
            name: Vec::new(),
            flags: 0,
            instance: 1,
            body: AttrBody::Resident {
                value_offset: 0x18,
                value_length: len,
                resident_flags: 0,
            },
        }
    }

    #[test]
    fn sizes_from_resident_and_non_resident() {
        let sizes = AttrSizes::from_record(&resident(10));
        assert!(sizes.resident);
        assert_eq!((sizes.allocated, sizes.data, sizes.initialized), (16, 10, 10));

        let mut record = resident(0);
        record.flags = ATTR_FLAG_SPARSE;
        record.body = AttrBody::NonResident(NonResidentHeader {
            highest_vcn: 9,
            allocated_size: 5120,
            data_size: 5000,
            initialized_size: 10,
            compressed_size: Some(4096),
            ..NonResidentHeader::default()
        });
        let sizes = AttrSizes::from_record(&record);
        assert!(!sizes.resident);
        assert_eq!(sizes.allocated, 5120);
        assert_eq!(sizes.compressed, Some(4096));
        assert!(sizes.tracks_compressed_size());
    }

    #[test]
    fn inode_attach_detach_and_attr_cache() {
        let inode = NtInode::new(RecordRef::new(30, 1));
        let cache = crate::record::RecordCache::default();
        inode.attach(cache.slot(31));
        inode.attach(cache.slot(31));
        inode.attach(cache.slot(32));
        assert_eq!(inode.extension_records(), vec![31, 32]);
        assert!(inode.detach(31));
        assert!(!inode.detach(31));

        let attr = Arc::new(NtAttr::new(
            inode.base(),
            AttrType::DATA,
            Vec::new(),
            AllocZone::Data,
            AttrSizes::default(),
            Runlist::empty(),
        ));
        let first = inode.insert_attr(Arc::clone(&attr));
        let dup = Arc::new(NtAttr::new(
            inode.base(),
            AttrType::DATA,
            Vec::new(),
            AllocZone::Data,
            AttrSizes::default(),
            Runlist::empty(),
        ));
        assert!(Arc::ptr_eq(&inode.insert_attr(dup), &first));
        assert!(inode.cached_attr(AttrType::DATA, &[]).is_some());
        assert!(inode.cached_attr(AttrType::BITMAP, &[]).is_none());
    }
}
