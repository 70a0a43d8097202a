//! Volume lifecycle: format, open, mount, and volume-wide accessors.

use crate::config::{VolumeGeometry, VolumeOptions};
use crate::inode::{AttrSizes, NtAttr, NtInode};
use crate::locator::{AttrQuery, find_in_record};
use crate::mft::MftTable;
use crate::record::RecordCache;
use crate::state::VolumeState;
use crate::stream::{read_runs, write_runs, zero_runs};
use crate::{parse_error, record_error};
use nxf_alloc::{AllocZone, ClusterAllocator, bitmap_count_free, bitmap_get, bitmap_set};
use nxf_block::{MappedBuffer, PageCache};
use nxf_error::{NxfError, Result};
use nxf_ondisk::{
    BOOT_SECTOR_SIZE, BootSector, NameCollation, NonResidentHeader, RecordFlags, RecordHeader,
    UpcaseTable, attrs, find_insert_offset, format_record, insert_attr, non_resident_attr_bytes,
    resident_attr_bytes, take_next_instance,
};
use nxf_runlist::{Runlist, decode_mapping_pairs};
use nxf_types::{AttrType, FIRST_USER_RECORD, MFT_RECORD, ParseError, RecordRef};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Size of the zeroed standard-information value written at format time.
const STANDARD_INFORMATION_SIZE: usize = 0x48;

/// Mixed into the total cluster count to derive a volume serial.
const SERIAL_SEED: u64 = u64::from_le_bytes(*b"NXFVOLUM");

/// One open volume.
///
/// Everything mutable lives here, so two volumes in one process share
/// nothing. Locks are taken in this order: metadata bitmap, an attribute's
/// runlist, then record checkouts.
pub struct Volume {
    pub(crate) geometry: VolumeGeometry,
    pub(crate) cache: Arc<dyn PageCache>,
    pub(crate) clusters: Arc<dyn ClusterAllocator>,
    pub(crate) collation: Arc<dyn NameCollation>,
    pub(crate) state: VolumeState,
    pub(crate) mft: MftTable,
    pub(crate) records: RecordCache,
    /// File shadows by base record number. An entry lives until its base
    /// record is freed or replaced by a newer sequence, so every handle on
    /// a file shares one attribute set.
    inodes: Mutex<HashMap<u64, Arc<NtInode>>>,
}

impl fmt::Debug for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Volume")
            .field("geometry", &self.geometry)
            .field("initialized_records", &self.mft.initialized_records())
            .field("has_errors", &self.state.has_errors())
            .finish_non_exhaustive()
    }
}

/// Summary of a volume for inspection tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub geometry: VolumeGeometry,
    pub initialized_records: u64,
    pub allocated_records: u64,
    pub records_in_use: u64,
    pub free_clusters: u64,
    pub has_errors: bool,
    /// `(lcn, clusters)` of every run of the metadata table.
    pub mft_runs: Vec<(i64, i64)>,
}

impl Volume {
    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Lay out a fresh volume on `cache` and open it.
    ///
    /// `clusters` must start out empty apart from the boot area.
    pub fn format(
        cache: Arc<dyn PageCache>,
        clusters: Arc<dyn ClusterAllocator>,
        options: &VolumeOptions,
    ) -> Result<Self> {
        let geometry = options.geometry(cache.len_bytes())?;
        let cs = geometry.cluster_size;
        let record_size = u64::from(geometry.record_size);

        let mut sector = vec![0_u8; BOOT_SECTOR_SIZE];
        geometry
            .boot_sector(SERIAL_SEED ^ geometry.total_clusters)
            .write(&mut sector)
            .map_err(|err| NxfError::Format(err.to_string()))?;
        cache.mark_dirty(&MappedBuffer::new(0, sector))?;

        let table_bytes = geometry.initial_records * record_size;
        let table_clusters = to_i64(table_bytes.div_ceil(geometry.cluster_bytes()))?;
        let mft_lcn = to_i64(geometry.mft_lcn)?;
        let table_runs = clusters.allocate(0, table_clusters, Some(mft_lcn), AllocZone::Mft)?;
        if table_runs.resolve(0) != nxf_types::Lcn::Real(mft_lcn) {
            clusters.free(&table_runs)?;
            return Err(NxfError::Format(format!(
                "cluster {mft_lcn} for the metadata table is already in use"
            )));
        }
        let bitmap_bytes = nxf_types::align_up(geometry.initial_records.div_ceil(8), 8)
            .ok_or_else(|| NxfError::Invalid("bitmap size overflows".into()))?;
        let bitmap_clusters = to_i64(bitmap_bytes.div_ceil(geometry.cluster_bytes()))?;
        let bitmap_runs = clusters.allocate(0, bitmap_clusters, None, AllocZone::Data)?;
        zero_runs(&*cache, &geometry, &table_runs)?;
        zero_runs(&*cache, &geometry, &bitmap_runs)?;

        let collation = UpcaseTable::default_table();
        let rs = usize::try_from(record_size)
            .map_err(|_| NxfError::Invalid("record size overflows".into()))?;
        let mut table = vec![0_u8; usize::try_from(table_bytes)
            .map_err(|_| NxfError::Invalid("table size overflows".into()))?];
        for (number, record) in (0_u64..).zip(table.chunks_exact_mut(rs)) {
            if number == MFT_RECORD {
                let header = NonResidentHeader {
                    highest_vcn: table_runs.end_vcn() - 1,
                    allocated_size: clusters_bytes(cs, table_runs.end_vcn())?,
                    data_size: to_i64(table_bytes)?,
                    initialized_size: to_i64(table_bytes)?,
                    ..NonResidentHeader::default()
                };
                let bitmap_header = NonResidentHeader {
                    highest_vcn: bitmap_runs.end_vcn() - 1,
                    allocated_size: clusters_bytes(cs, bitmap_runs.end_vcn())?,
                    data_size: to_i64(bitmap_bytes)?,
                    initialized_size: to_i64(bitmap_bytes)?,
                    ..NonResidentHeader::default()
                };
                table_record(record, &collation, &table_runs, &header, &bitmap_runs, &bitmap_header)?;
            } else {
                // System records are in use with sequence equal to their
                // number; the rest are free with sequence zero.
                let system = number < FIRST_USER_RECORD;
                let sequence = if system { u16::try_from(number).unwrap_or(1) } else { 0 };
                format_record(record, number, sequence).map_err(|err| record_error(number, err))?;
                if system {
                    set_flags(record, number, RecordFlags::IN_USE, 1)?;
                }
            }
        }
        write_runs(&*cache, &geometry, &table_runs, 0, &table)?;

        let mut bits = vec![0_u8; usize::try_from(bitmap_bytes)
            .map_err(|_| NxfError::Invalid("bitmap size overflows".into()))?];
        for number in 0..FIRST_USER_RECORD {
            bitmap_set(&mut bits, number);
        }
        write_runs(&*cache, &geometry, &bitmap_runs, 0, &bits)?;
        cache.sync()?;
        info!(
            total_clusters = geometry.total_clusters,
            cluster_size = cs.get(),
            records = geometry.initial_records,
            mft_lcn,
            "volume_formatted"
        );
        Self::open(cache, clusters, options)
    }

    /// Open the volume on `cache`. `clusters` must already account for
    /// every cluster in use on it.
    pub fn open(
        cache: Arc<dyn PageCache>,
        clusters: Arc<dyn ClusterAllocator>,
        options: &VolumeOptions,
    ) -> Result<Self> {
        let geometry = read_geometry(&*cache, options)?;
        let offset = geometry
            .lcn_offset(to_i64(geometry.mft_lcn)?)
            .ok_or_else(|| NxfError::Format("metadata table offset overflows".into()))?;
        let record = cache.map_bytes(offset, geometry.record_size as usize)?;
        let bytes = record.as_slice();
        let header = RecordHeader::parse(bytes).map_err(|err| parse_error(MFT_RECORD, err))?;
        if !header.in_use() || !header.is_base() {
            return Err(NxfError::corruption(
                MFT_RECORD,
                "metadata table record is not an in-use base record",
            ));
        }
        let collation: Arc<dyn NameCollation> = Arc::new(UpcaseTable::default_table());
        let list = AttrQuery::new(AttrType::ATTRIBUTE_LIST);
        if find_in_record(bytes, MFT_RECORD, None, &list, &*collation)?.is_some() {
            return Err(NxfError::Unsupported(
                "metadata table with an attribute list".into(),
            ));
        }
        let reference = header.reference();
        let data = table_attr(&geometry, bytes, &*collation, reference, AttrType::DATA, AllocZone::Mft)?;
        let bitmap_attr =
            table_attr(&geometry, bytes, &*collation, reference, AttrType::BITMAP, AllocZone::Data)?;
        let bitmap_len = usize::try_from(bitmap_attr.sizes().initialized)
            .map_err(|_| NxfError::corruption(MFT_RECORD, "bitmap size"))?;
        let mut bits = vec![0_u8; bitmap_len];
        read_runs(&*cache, &geometry, &bitmap_attr.runlist(), 0, &mut bits)?;

        let mft = MftTable::new(geometry.clone(), Arc::clone(&data), Arc::clone(&bitmap_attr), bits);
        if mft.initialized_records() < FIRST_USER_RECORD {
            return Err(NxfError::Format(format!(
                "metadata table holds {} records, fewer than the {FIRST_USER_RECORD} reserved",
                mft.initialized_records()
            )));
        }
        let volume = Self {
            geometry,
            cache,
            clusters,
            collation,
            state: VolumeState::default(),
            mft,
            records: RecordCache::default(),
            inodes: Mutex::new(HashMap::new()),
        };
        let inode = volume.inode_entry(reference)?;
        inode.insert_attr(data);
        inode.insert_attr(bitmap_attr);
        debug!(
            records = volume.mft.initialized_records(),
            allocated_records = volume.mft.allocated_records(),
            "volume_open"
        );
        Ok(volume)
    }

    /// Open the volume on `cache` with an in-memory cluster allocator built
    /// from the extents its in-use records describe.
    pub fn mount(cache: Arc<dyn PageCache>, options: &VolumeOptions) -> Result<Self> {
        let geometry = read_geometry(&*cache, options)?;
        let allocator = Arc::new(geometry.cluster_allocator()?);
        let volume = Self::open(cache, Arc::clone(&allocator) as Arc<dyn ClusterAllocator>, options)?;
        for (lcn, clusters) in volume.scan_cluster_usage()? {
            allocator.reserve(lcn.unsigned_abs(), clusters.unsigned_abs())?;
        }
        debug!(free_clusters = allocator.free_clusters(), "volume_mount");
        Ok(volume)
    }

    /// Use a different name collation, such as one built from the volume's
    /// own upcase table.
    #[must_use]
    pub fn with_collation(mut self, collation: Arc<dyn NameCollation>) -> Self {
        self.collation = collation;
        self
    }

    /// Flush every dirty page to the device.
    pub fn sync(&self) -> Result<()> {
        self.cache.sync()
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    #[must_use]
    pub fn state(&self) -> &VolumeState {
        &self.state
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.state.has_errors()
    }

    #[must_use]
    pub fn cluster_allocator(&self) -> &Arc<dyn ClusterAllocator> {
        &self.clusters
    }

    #[must_use]
    pub fn initialized_records(&self) -> u64 {
        self.mft.initialized_records()
    }

    /// Whether record `number` is marked in use in the metadata bitmap.
    #[must_use]
    pub fn record_in_use(&self, number: u64) -> bool {
        let bitmap = self.mft.bitmap.read();
        number < bitmap.initialized_bits() && bitmap_get(&bitmap.bits, number)
    }

    /// Copy of the initialized metadata bitmap.
    #[must_use]
    pub fn mft_bitmap(&self) -> Vec<u8> {
        self.mft.bitmap.read().bits.clone()
    }

    /// Copy of the metadata table's runlist.
    #[must_use]
    pub fn mft_runlist(&self) -> Runlist {
        (*self.mft.runlist()).clone()
    }

    #[must_use]
    pub fn info(&self) -> VolumeInfo {
        let records_in_use = {
            let bitmap = self.mft.bitmap.read();
            let initialized = bitmap.initialized_bits();
            initialized - bitmap_count_free(&bitmap.bits, initialized)
        };
        VolumeInfo {
            geometry: self.geometry.clone(),
            initialized_records: self.mft.initialized_records(),
            allocated_records: self.mft.allocated_records(),
            records_in_use,
            free_clusters: self.clusters.free_clusters(),
            has_errors: self.state.has_errors(),
            mft_runs: self.mft.runlist().real_runs().collect(),
        }
    }

    /// Real `(lcn, clusters)` runs of every non-resident extent in every
    /// in-use record.
    pub fn scan_cluster_usage(&self) -> Result<Vec<(i64, i64)>> {
        let mut runs = Vec::new();
        for number in 0..self.mft.initialized_records() {
            if !self.record_in_use(number) {
                continue;
            }
            let record = self.checkout_record(number)?;
            if !record.header()?.in_use() {
                continue;
            }
            let bytes = record.bytes();
            for attr in attrs(bytes, None).map_err(|err| parse_error(number, err))? {
                let attr = attr.map_err(|err| parse_error(number, err))?;
                let (Some(header), Some(pairs)) = (attr.non_resident(), attr.mapping_pairs(bytes))
                else {
                    continue;
                };
                let fragment = decode_mapping_pairs(pairs, header.lowest_vcn)
                    .map_err(|err| err.into_nxf(number))?;
                runs.extend(fragment.real_runs());
            }
        }
        debug!(runs = runs.len(), "cluster_usage_scanned");
        Ok(runs)
    }

    // ── Internal ────────────────────────────────────────────────────────

    /// Flag the volume when `result` reports corruption.
    pub(crate) fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_corruption() {
                self.state.mark_errors(&err.to_string());
            }
        }
        result
    }

    /// Shadow of the file whose base record is `base`, created on first
    /// use. A shadow for an older sequence number is replaced.
    pub(crate) fn inode_entry(&self, base: RecordRef) -> Result<Arc<NtInode>> {
        if base.is_none() {
            return Err(NxfError::Invalid("null record reference".into()));
        }
        let mut inodes = self.inodes.lock();
        let entry = inodes
            .entry(base.number.0)
            .or_insert_with(|| Arc::new(NtInode::new(base)));
        if entry.base() != base {
            *entry = Arc::new(NtInode::new(base));
        }
        Ok(Arc::clone(entry))
    }

    /// Drop the shadow of `base` if it is the current one.
    pub(crate) fn forget_inode(&self, base: RecordRef) {
        let mut inodes = self.inodes.lock();
        if inodes.get(&base.number.0).is_some_and(|inode| inode.base() == base) {
            inodes.remove(&base.number.0);
        }
    }

    /// Shadow of `base` if one exists.
    pub(crate) fn cached_inode(&self, number: u64) -> Option<Arc<NtInode>> {
        self.inodes.lock().get(&number).cloned()
    }
}

/// Geometry from the boot sector at the start of `cache`.
pub fn read_geometry(cache: &dyn PageCache, options: &VolumeOptions) -> Result<VolumeGeometry> {
    let sector = cache.map_bytes(0, BOOT_SECTOR_SIZE)?;
    let boot = BootSector::parse(sector.as_slice()).map_err(|err| NxfError::Format(err.to_string()))?;
    VolumeGeometry::from_boot(&boot, options)
}

/// Give the next instance number to an attribute built by `build` and
/// insert it at its sorted position.
pub(crate) fn insert_new_attr(
    record: &mut [u8],
    number: u64,
    collation: &dyn NameCollation,
    ty: AttrType,
    name: &[u16],
    build: impl FnOnce(u16) -> std::result::Result<Vec<u8>, ParseError>,
) -> Result<u16> {
    let instance = take_next_instance(record).map_err(|err| parse_error(number, err))?;
    let bytes = build(instance).map_err(|err| NxfError::Invalid(err.to_string()))?;
    let at = find_insert_offset(record, ty, name, collation).map_err(|err| parse_error(number, err))?;
    insert_attr(record, at, &bytes).map_err(|err| record_error(number, err))?;
    Ok(instance)
}

fn set_flags(record: &mut [u8], number: u64, flag: RecordFlags, link_count: u16) -> Result<()> {
    let mut header = RecordHeader::parse(record).map_err(|err| parse_error(number, err))?;
    header.flags = header.flags.with(flag, true);
    header.link_count = link_count;
    header.write(record).map_err(|err| parse_error(number, err))
}

/// Record 0: the table's own standard information, `$DATA` and `$BITMAP`.
fn table_record(
    record: &mut [u8],
    collation: &dyn NameCollation,
    table_runs: &Runlist,
    table_header: &NonResidentHeader,
    bitmap_runs: &Runlist,
    bitmap_header: &NonResidentHeader,
) -> Result<()> {
    format_record(record, MFT_RECORD, 1).map_err(|err| record_error(MFT_RECORD, err))?;
    set_flags(record, MFT_RECORD, RecordFlags::IN_USE, 1)?;
    let info = [0_u8; STANDARD_INFORMATION_SIZE];
    insert_new_attr(record, MFT_RECORD, collation, AttrType::STANDARD_INFORMATION, &[], |i| {
        resident_attr_bytes(AttrType::STANDARD_INFORMATION, &[], i, &info)
    })?;
    let pairs = table_runs.encode_to_vec(0, None).map_err(|err| err.into_nxf(MFT_RECORD))?;
    insert_new_attr(record, MFT_RECORD, collation, AttrType::DATA, &[], |i| {
        non_resident_attr_bytes(AttrType::DATA, &[], i, 0, table_header, &pairs)
    })?;
    let pairs = bitmap_runs.encode_to_vec(0, None).map_err(|err| err.into_nxf(MFT_RECORD))?;
    insert_new_attr(record, MFT_RECORD, collation, AttrType::BITMAP, &[], |i| {
        non_resident_attr_bytes(AttrType::BITMAP, &[], i, 0, bitmap_header, &pairs)
    })?;
    Ok(())
}

/// A single-extent non-resident attribute of record 0.
fn table_attr(
    geometry: &VolumeGeometry,
    record: &[u8],
    collation: &dyn NameCollation,
    base: RecordRef,
    ty: AttrType,
    zone: AllocZone,
) -> Result<Arc<NtAttr>> {
    let attr = find_in_record(record, MFT_RECORD, None, &AttrQuery::new(ty), collation)?
        .ok_or_else(|| NxfError::Format(format!("metadata table record has no {ty}")))?;
    let (Some(header), Some(pairs)) = (attr.non_resident(), attr.mapping_pairs(record)) else {
        return Err(NxfError::Format(format!("metadata table {ty} is resident")));
    };
    if header.lowest_vcn != 0 {
        return Err(NxfError::corruption(
            MFT_RECORD,
            format!("first {ty} extent starts at vcn {}", header.lowest_vcn),
        ));
    }
    let mut runlist = decode_mapping_pairs(pairs, 0).map_err(|err| err.into_nxf(MFT_RECORD))?;
    let total = geometry.cluster_size.bytes_to_clusters_ceil(header.allocated_size);
    runlist.seal(total).map_err(|err| err.into_nxf(MFT_RECORD))?;
    if runlist.first_unmapped_vcn().is_some() {
        return Err(NxfError::Unsupported(format!(
            "metadata table {ty} spans several extents"
        )));
    }
    Ok(Arc::new(NtAttr::new(
        base,
        ty,
        Vec::new(),
        zone,
        AttrSizes::from_record(&attr),
        runlist,
    )))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| NxfError::Invalid(format!("{value} overflows i64")))
}

fn clusters_bytes(cs: nxf_types::ClusterSize, clusters: i64) -> Result<i64> {
    cs.clusters_to_bytes(clusters)
        .ok_or_else(|| NxfError::Invalid(format!("{clusters} clusters overflow")))
}
