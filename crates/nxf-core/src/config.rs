//! Volume configuration and the geometry derived from it.

use nxf_alloc::BitmapClusterAllocator;
use nxf_error::{NxfError, Result};
use nxf_ondisk::{BOOT_SECTOR_SIZE, BootSector};
use nxf_types::{ClusterSize, DEFAULT_BITMAP_GROWTH_BYTES, FIRST_USER_RECORD};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Bytes kept in front of the metadata table when `mft_lcn` is not given.
const DEFAULT_MFT_OFFSET_BYTES: u64 = 16 * 1024;

/// Options for formatting and opening a volume.
///
/// `cluster_size`, `record_size`, `initial_records`, `mft_lcn` and
/// `mft_zone_clusters` only matter to [`crate::Volume::format`]; an opened
/// volume takes them from its boot sector. The growth quanta apply to both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeOptions {
    pub cluster_size: u32,
    pub record_size: u32,
    /// Records formatted up front; at least the reserved system records.
    pub initial_records: u64,
    /// First cluster of the metadata table. Defaults to 16 KiB in.
    pub mft_lcn: Option<u64>,
    /// Clusters reserved for metadata-table growth. Defaults to an eighth of
    /// the volume.
    pub mft_zone_clusters: Option<u64>,
    /// Bytes the metadata bitmap's initialized size grows by when full.
    pub bitmap_growth_bytes: u64,
    /// Records the metadata table's allocation grows by at a time.
    pub mft_growth_records: u64,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            cluster_size: 4096,
            record_size: 1024,
            initial_records: 64,
            mft_lcn: None,
            mft_zone_clusters: None,
            bitmap_growth_bytes: DEFAULT_BITMAP_GROWTH_BYTES,
            mft_growth_records: 16,
        }
    }
}

impl VolumeOptions {
    /// Options with a given cluster size and defaults elsewhere.
    #[must_use]
    pub fn with_cluster_size(cluster_size: u32) -> Self {
        Self {
            cluster_size,
            ..Self::default()
        }
    }

    fn check_growth(&self) -> Result<()> {
        if self.bitmap_growth_bytes == 0 || self.bitmap_growth_bytes % 8 != 0 {
            return Err(NxfError::Invalid(format!(
                "bitmap_growth_bytes {} must be a non-zero multiple of 8",
                self.bitmap_growth_bytes
            )));
        }
        if self.mft_growth_records == 0 {
            return Err(NxfError::Invalid("mft_growth_records must be non-zero".into()));
        }
        Ok(())
    }

    /// Validate against a device of `device_len` bytes and compute the
    /// layout a fresh format would produce.
    pub fn geometry(&self, device_len: u64) -> Result<VolumeGeometry> {
        self.check_growth()?;
        let cluster_size = ClusterSize::new(self.cluster_size)
            .map_err(|err| NxfError::Format(err.to_string()))?;
        check_record_size(self.record_size)?;
        if self.initial_records < FIRST_USER_RECORD {
            return Err(NxfError::Invalid(format!(
                "initial_records {} must cover the {FIRST_USER_RECORD} reserved records",
                self.initial_records
            )));
        }

        let cs = u64::from(cluster_size.get());
        let total_clusters = device_len / cs;
        let boot_clusters = (BOOT_SECTOR_SIZE as u64).div_ceil(cs);
        let mft_lcn = self
            .mft_lcn
            .unwrap_or_else(|| DEFAULT_MFT_OFFSET_BYTES.div_ceil(cs).max(boot_clusters));
        if mft_lcn < boot_clusters {
            return Err(NxfError::Invalid(format!(
                "mft_lcn {mft_lcn} overlaps the boot sector"
            )));
        }
        let mft_bytes = self
            .initial_records
            .checked_mul(u64::from(self.record_size))
            .ok_or_else(|| NxfError::Invalid("initial_records overflows".into()))?;
        let mft_clusters = mft_bytes.div_ceil(cs);
        // Table, plus one cluster for its bitmap.
        let needed = mft_lcn.saturating_add(mft_clusters).saturating_add(1);
        if needed > total_clusters {
            return Err(NxfError::Format(format!(
                "device of {device_len} bytes too small: need {needed} clusters of {cs}"
            )));
        }
        let zone_clusters = self
            .mft_zone_clusters
            .unwrap_or(total_clusters / 8)
            .max(mft_clusters);
        let zone_end = mft_lcn.saturating_add(zone_clusters).min(total_clusters);

        Ok(VolumeGeometry {
            cluster_size,
            record_size: self.record_size,
            total_clusters,
            boot_clusters,
            mft_lcn,
            mft_zone: mft_lcn..zone_end,
            initial_records: self.initial_records,
            bitmap_growth_bytes: self.bitmap_growth_bytes,
            mft_growth_records: self.mft_growth_records,
        })
    }
}

fn check_record_size(record_size: u32) -> Result<()> {
    if !record_size.is_power_of_two() || !(256..=4096).contains(&record_size) {
        return Err(NxfError::Invalid(format!(
            "record_size {record_size} must be a power of two in 256..=4096"
        )));
    }
    Ok(())
}

/// Resolved layout of one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    pub cluster_size: ClusterSize,
    pub record_size: u32,
    pub total_clusters: u64,
    pub boot_clusters: u64,
    pub mft_lcn: u64,
    pub mft_zone: Range<u64>,
    pub initial_records: u64,
    pub bitmap_growth_bytes: u64,
    pub mft_growth_records: u64,
}

impl VolumeGeometry {
    /// Geometry of an existing volume from its boot sector, with growth
    /// quanta from `options`.
    pub fn from_boot(boot: &BootSector, options: &VolumeOptions) -> Result<Self> {
        options.check_growth()?;
        let cluster_size = ClusterSize::new(boot.cluster_size())
            .map_err(|err| NxfError::Format(err.to_string()))?;
        check_record_size(boot.record_size).map_err(|err| NxfError::Format(err.to_string()))?;
        let cs = u64::from(cluster_size.get());
        let total_clusters = boot.total_clusters();
        if boot.mft_lcn >= total_clusters {
            return Err(NxfError::Format(format!(
                "mft_lcn {} past end of volume ({total_clusters} clusters)",
                boot.mft_lcn
            )));
        }
        let zone_clusters = options.mft_zone_clusters.unwrap_or(total_clusters / 8);
        Ok(Self {
            cluster_size,
            record_size: boot.record_size,
            total_clusters,
            boot_clusters: (BOOT_SECTOR_SIZE as u64).div_ceil(cs),
            mft_lcn: boot.mft_lcn,
            mft_zone: boot.mft_lcn..boot.mft_lcn.saturating_add(zone_clusters).min(total_clusters),
            initial_records: FIRST_USER_RECORD,
            bitmap_growth_bytes: options.bitmap_growth_bytes,
            mft_growth_records: options.mft_growth_records,
        })
    }

    /// Boot sector describing this geometry.
    #[must_use]
    pub fn boot_sector(&self, serial: u64) -> BootSector {
        let sectors_per_cluster = self.cluster_size.get() / u32::from(nxf_ondisk::boot::SECTOR_SIZE);
        BootSector {
            bytes_per_sector: nxf_ondisk::boot::SECTOR_SIZE,
            sectors_per_cluster: u8::try_from(sectors_per_cluster).unwrap_or(u8::MAX),
            total_sectors: self.total_clusters * u64::from(sectors_per_cluster),
            mft_lcn: self.mft_lcn,
            mft_mirror_lcn: 0,
            record_size: self.record_size,
            serial,
        }
    }

    #[must_use]
    pub fn cluster_bytes(&self) -> u64 {
        u64::from(self.cluster_size.get())
    }

    /// Device byte offset of cluster `lcn`.
    #[must_use]
    pub fn lcn_offset(&self, lcn: i64) -> Option<u64> {
        u64::try_from(lcn).ok()?.checked_mul(self.cluster_bytes())
    }

    /// In-memory cluster allocator for this volume with the boot area taken.
    pub fn cluster_allocator(&self) -> Result<BitmapClusterAllocator> {
        let allocator = BitmapClusterAllocator::new(self.total_clusters, self.mft_zone.clone());
        allocator.reserve(0, self.boot_clusters)?;
        Ok(allocator)
    }
}
