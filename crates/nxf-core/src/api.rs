//! Operations offered to the file layer: attribute lookup, read-path
//! extent resolution, and the write-path size preparation.

use crate::inode::{AttrListState, AttrSizes, NtAttr, NtInode};
use crate::locator::{AttrQuery, find_in_record};
use crate::record::{LockedRecord, RecordPin};
use crate::volume::insert_new_attr;
use crate::Volume;
use nxf_alloc::AllocZone;
use nxf_error::{NxfError, Result};
use nxf_ondisk::{CaseSensitivity, resident_attr_bytes};
use nxf_runlist::{Runlist, decode_mapping_pairs};
use nxf_types::{AttrType, Lcn, MFT_RECORD, RecordRef, display_name};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

/// Where one logical byte of a non-resident attribute lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalExtent {
    /// Cluster of the attribute holding the byte.
    pub vcn: i64,
    /// Mapping of `vcn`: a real cluster, a hole, or end of file.
    pub lcn: Lcn,
    /// Clusters from `vcn` to the end of its run.
    pub clusters: i64,
    /// Device byte offset of the byte, for real clusters only.
    pub device_offset: Option<u64>,
}

/// An open attribute. Pins the record holding its first extent for as long
/// as the handle lives, so that record cannot be freed underneath it.
#[derive(Clone)]
pub struct AttrHandle {
    attr: Arc<NtAttr>,
    owner: RecordRef,
    _pin: RecordPin,
}

impl AttrHandle {
    /// Record holding the first extent.
    #[must_use]
    pub fn owner(&self) -> RecordRef {
        self.owner
    }

    #[must_use]
    pub fn attr(&self) -> &Arc<NtAttr> {
        &self.attr
    }
}

impl Deref for AttrHandle {
    type Target = NtAttr;

    fn deref(&self) -> &NtAttr {
        &self.attr
    }
}

impl fmt::Debug for AttrHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttrHandle")
            .field("attr", &self.attr)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Volume {
    /// Shadow of the file whose base record is `base`, after checking that
    /// the reference is still live.
    pub fn open_inode(&self, base: RecordRef) -> Result<Arc<NtInode>> {
        let record = self.checkout_record(base.number.0)?;
        let header = record.header()?;
        if !header.in_use() || header.sequence != base.sequence || !header.is_base() {
            self.forget_inode(base);
            return Err(NxfError::NotFound(format!(
                "{base} is stale: record holds sequence {}",
                header.sequence
            )));
        }
        drop(record);
        self.inode_entry(base)
    }

    /// Open attribute `ty`/`name` of the file at `base`.
    ///
    /// Only the first extent is decoded here; later extents are mapped on
    /// demand. Repeated lookups share one [`NtAttr`].
    pub fn lookup_attribute(
        &self,
        base: RecordRef,
        ty: AttrType,
        name: &[u16],
        case: CaseSensitivity,
    ) -> Result<AttrHandle> {
        let mut search = self.search(base)?;
        let found = search.find(&AttrQuery::named(ty, name).case(case))?;
        let owner = found.record;
        let inode = Arc::clone(search.inode());
        let attr = match inode.cached_attr(ty, &found.attr.name) {
            Some(attr) => attr,
            None => {
                let record = search
                    .found_bytes()
                    .ok_or_else(|| NxfError::Invalid("search lost its record".into()))?;
                let runlist = self.first_fragment(&found.attr, record, owner.number.0)?;
                let zone = if base.number.0 == MFT_RECORD && ty == AttrType::DATA {
                    AllocZone::Mft
                } else {
                    AllocZone::Data
                };
                let fresh = Arc::new(NtAttr::new(
                    base,
                    ty,
                    found.attr.name.clone(),
                    zone,
                    AttrSizes::from_record(&found.attr),
                    runlist,
                ));
                inode.insert_attr(fresh)
            }
        };
        drop(search);
        debug!(
            base = base.number.0,
            owner = owner.number.0,
            ty = %ty,
            name = %display_name(name),
            "attr_lookup"
        );
        Ok(AttrHandle {
            attr,
            owner,
            _pin: RecordPin::new(self.record_slot(owner.number.0)),
        })
    }

    /// Runlist of a newly opened attribute: its vcn-0 extent decoded, the
    /// rest of the allocation left for on-demand mapping.
    fn first_fragment(
        &self,
        attr: &nxf_ondisk::AttrRecord,
        record: &[u8],
        number: u64,
    ) -> Result<Runlist> {
        let (Some(header), Some(pairs)) = (attr.non_resident(), attr.mapping_pairs(record)) else {
            return Ok(Runlist::empty());
        };
        if header.lowest_vcn != 0 {
            return Err(NxfError::corruption(
                number,
                format!("first {} extent starts at vcn {}", attr.ty, header.lowest_vcn),
            ));
        }
        let mut runlist = decode_mapping_pairs(pairs, 0).map_err(|err| err.into_nxf(number))?;
        let total = self
            .geometry
            .cluster_size
            .bytes_to_clusters_ceil(header.allocated_size);
        runlist.seal(total).map_err(|err| err.into_nxf(number))?;
        Ok(runlist)
    }

    /// Map byte `offset` of non-resident `attr` to its cluster.
    pub fn resolve_extent(&self, attr: &NtAttr, offset: u64) -> Result<PhysicalExtent> {
        let result = self.resolve_inner(attr, offset);
        self.observe(result)
    }

    fn resolve_inner(&self, attr: &NtAttr, offset: u64) -> Result<PhysicalExtent> {
        let sizes = attr.sizes();
        if sizes.resident {
            return Err(NxfError::Invalid(format!(
                "{} of {} is resident",
                attr.ty(),
                attr.base()
            )));
        }
        let cs = self.geometry.cluster_bytes();
        let vcn = i64::try_from(offset / cs)
            .map_err(|_| NxfError::Invalid(format!("offset {offset} overflows")))?;
        let total = self.geometry.cluster_size.bytes_to_clusters_ceil(sizes.allocated);
        if vcn >= total {
            return Ok(PhysicalExtent {
                vcn,
                lcn: Lcn::EndOfFile,
                clusters: 0,
                device_offset: None,
            });
        }
        self.ensure_mapped(attr, vcn, vcn + 1)?;
        let runlist = attr.runlist.read();
        let Some(el) = runlist.find_element(vcn) else {
            return Err(NxfError::corruption(
                attr.base().number.0,
                format!("vcn {vcn} of {} lies past its runlist", attr.ty()),
            ));
        };
        let lcn = el.lcn_at(vcn);
        let device_offset = match lcn {
            Lcn::Real(lcn) => Some(
                self.geometry
                    .lcn_offset(lcn)
                    .ok_or_else(|| NxfError::corruption(attr.base().number.0, "lcn overflows"))?
                    + offset % cs,
            ),
            Lcn::Hole => None,
            other => {
                return Err(NxfError::corruption(
                    attr.base().number.0,
                    format!("vcn {vcn} of {} maps to {other}", attr.ty()),
                ));
            }
        };
        Ok(PhysicalExtent {
            vcn,
            lcn,
            clusters: el.end() - vcn,
            device_offset,
        })
    }

    /// Make `attr` non-resident if it is not already and grow its
    /// allocation to `new_size`. Returns the allocated size reached.
    pub fn ensure_allocated(&self, attr: &NtAttr, new_size: i64) -> Result<i64> {
        if attr.is_resident() {
            self.observe(self.make_non_resident(attr))?;
        }
        self.observe(self.extend_allocation(attr, new_size))
    }

    /// Move the initialized boundary of `attr` up to `new_size`.
    pub fn ensure_initialized(&self, attr: &NtAttr, new_size: i64) -> Result<()> {
        self.observe(self.extend_initialized(attr, new_size))
    }

    /// Allocate a metadata record; see [`Volume::allocate_record`].
    pub fn allocate_new_record(
        &self,
        is_directory: bool,
        extension_of: Option<RecordRef>,
    ) -> Result<(RecordRef, LockedRecord)> {
        self.allocate_record(is_directory, extension_of)
    }

    /// Read from `pos` into `buf`, stopping at the data size. Bytes past the
    /// initialized size read as zero. Returns the number of bytes read.
    pub fn read_attribute(&self, attr: &NtAttr, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let sizes = attr.sizes();
        let data = u64::try_from(sizes.data).unwrap_or(0);
        if pos >= data {
            return Ok(0);
        }
        let len = usize::try_from(data - pos).map_or(buf.len(), |left| left.min(buf.len()));
        let buf = &mut buf[..len];
        if sizes.resident {
            let (found, record) = self.first_extent(attr)?;
            let value = found
                .value(record.bytes())
                .ok_or_else(|| NxfError::corruption(record.number(), "resident value out of bounds"))?;
            let start = usize::try_from(pos).unwrap_or(usize::MAX).min(value.len());
            let end = start.saturating_add(len).min(value.len());
            buf[..end - start].copy_from_slice(&value[start..end]);
            buf[end - start..].fill(0);
            return Ok(len);
        }
        let initialized = u64::try_from(sizes.initialized).unwrap_or(0);
        let stored = usize::try_from(initialized.saturating_sub(pos)).map_or(len, |n| n.min(len));
        if stored > 0 {
            self.read_stream(attr, pos, &mut buf[..stored])?;
        }
        buf[stored..].fill(0);
        Ok(len)
    }

    /// Insert a resident attribute into the base record of `base`. Returns
    /// the attribute instance number.
    ///
    /// A record without room for it yields `Unsupported`; attribute lists
    /// are never created here.
    pub fn add_resident_attribute(
        &self,
        base: RecordRef,
        ty: AttrType,
        name: &[u16],
        value: &[u8],
    ) -> Result<u16> {
        let result = self.add_resident_inner(base, ty, name, value);
        self.observe(result)
    }

    fn add_resident_inner(
        &self,
        base: RecordRef,
        ty: AttrType,
        name: &[u16],
        value: &[u8],
    ) -> Result<u16> {
        let mut search = self.search(base)?;
        let existing = search.find(&AttrQuery::named(ty, name));
        if search.inode().has_attr_list() {
            return Err(NxfError::Unsupported(format!(
                "adding attributes to {base}, which has an attribute list"
            )));
        }
        match existing {
            Ok(_) => {
                return Err(NxfError::Invalid(format!(
                    "{ty} {:?} already exists in {base}",
                    display_name(name)
                )));
            }
            Err(NxfError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        drop(search);

        let number = base.number.0;
        let mut record = self.checkout_record(number)?;
        let header = record.header()?;
        if !header.in_use() || header.sequence != base.sequence || !header.is_base() {
            return Err(NxfError::NotFound(format!("{base} is stale")));
        }
        // Recheck under this checkout; the search released its own.
        let query = AttrQuery::named(ty, name);
        if find_in_record(record.bytes(), number, None, &query, &*self.collation)?.is_some() {
            return Err(NxfError::Invalid(format!("{ty} already exists in {base}")));
        }
        let saved = record.bytes().to_vec();
        let instance = insert_new_attr(record.bytes_mut(), number, &*self.collation, ty, name, |i| {
            resident_attr_bytes(ty, name, i, value)
        })
        .and_then(|instance| self.write_record(&record).map(|()| instance));
        match instance {
            Ok(instance) => {
                drop(record);
                if ty == AttrType::ATTRIBUTE_LIST {
                    self.inode_entry(base)?.set_attr_list(AttrListState::Unknown);
                }
                debug!(record = number, ty = %ty, instance, len = value.len(), "attr_add_resident");
                Ok(instance)
            }
            Err(err) => {
                record.restore(&saved);
                Err(err)
            }
        }
    }
}
