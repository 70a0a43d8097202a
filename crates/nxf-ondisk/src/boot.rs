//! Boot sector: the fixed 512-byte block at offset 0 that tells an opener
//! where the metadata table lives and how big clusters and records are.
//!
//! Only the fields the volume core reads are modelled. Everything else in
//! the sector is written as zero.

use nxf_types::{
    ParseError, read_fixed, read_le_u16, read_le_u64, read_u8, write_le_u16, write_le_u64,
};
use serde::{Deserialize, Serialize};

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const SECTOR_SIZE: u16 = 512;
pub const OEM_ID: [u8; 8] = *b"NTFS    ";
pub const BOOT_SIGNATURE: u16 = 0xAA55;

const OFF_OEM_ID: usize = 0x03;
const OFF_BYTES_PER_SECTOR: usize = 0x0B;
const OFF_SECTORS_PER_CLUSTER: usize = 0x0D;
const OFF_TOTAL_SECTORS: usize = 0x28;
const OFF_MFT_LCN: usize = 0x30;
const OFF_MFT_MIRROR_LCN: usize = 0x38;
const OFF_CLUSTERS_PER_RECORD: usize = 0x40;
const OFF_CLUSTERS_PER_INDEX: usize = 0x44;
const OFF_SERIAL: usize = 0x48;
const OFF_SIGNATURE: usize = 0x1FE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    pub record_size: u32,
    pub serial: u64,
}

impl BootSector {
    #[must_use]
    pub fn cluster_size(&self) -> u32 {
        u32::from(self.bytes_per_sector) * u32::from(self.sectors_per_cluster)
    }

    #[must_use]
    pub fn total_clusters(&self) -> u64 {
        self.total_sectors / u64::from(self.sectors_per_cluster.max(1))
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let oem = read_fixed::<8>(data, OFF_OEM_ID)?;
        if oem != OEM_ID {
            return Err(ParseError::InvalidMagic {
                expected: u64::from_le_bytes(OEM_ID),
                actual: u64::from_le_bytes(oem),
            });
        }
        let signature = read_le_u16(data, OFF_SIGNATURE)?;
        if signature != BOOT_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(BOOT_SIGNATURE),
                actual: u64::from(signature),
            });
        }
        let bytes_per_sector = read_le_u16(data, OFF_BYTES_PER_SECTOR)?;
        if bytes_per_sector != SECTOR_SIZE {
            return Err(ParseError::InvalidField {
                field: "bytes_per_sector",
                reason: "only 512-byte sectors are supported",
            });
        }
        let sectors_per_cluster = read_u8(data, OFF_SECTORS_PER_CLUSTER)?;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "sectors_per_cluster",
                reason: "must be a non-zero power of two",
            });
        }
        let cluster_size = u32::from(bytes_per_sector) * u32::from(sectors_per_cluster);
        let record_size = decode_record_size(read_u8(data, OFF_CLUSTERS_PER_RECORD)?, cluster_size)?;
        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors: read_le_u64(data, OFF_TOTAL_SECTORS)?,
            mft_lcn: read_le_u64(data, OFF_MFT_LCN)?,
            mft_mirror_lcn: read_le_u64(data, OFF_MFT_MIRROR_LCN)?,
            record_size,
            serial: read_le_u64(data, OFF_SERIAL)?,
        })
    }

    /// Serialize into a zeroed 512-byte sector.
    pub fn write(&self, data: &mut [u8]) -> Result<(), ParseError> {
        nxf_types::ensure_slice_mut(data, 0, BOOT_SECTOR_SIZE)?.fill(0);
        data[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        data[OFF_OEM_ID..OFF_OEM_ID + 8].copy_from_slice(&OEM_ID);
        write_le_u16(data, OFF_BYTES_PER_SECTOR, self.bytes_per_sector)?;
        data[OFF_SECTORS_PER_CLUSTER] = self.sectors_per_cluster;
        write_le_u64(data, OFF_TOTAL_SECTORS, self.total_sectors)?;
        write_le_u64(data, OFF_MFT_LCN, self.mft_lcn)?;
        write_le_u64(data, OFF_MFT_MIRROR_LCN, self.mft_mirror_lcn)?;
        data[OFF_CLUSTERS_PER_RECORD] = encode_record_size(self.record_size, self.cluster_size())?;
        data[OFF_CLUSTERS_PER_INDEX] = 1;
        write_le_u64(data, OFF_SERIAL, self.serial)?;
        write_le_u16(data, OFF_SIGNATURE, BOOT_SIGNATURE)?;
        Ok(())
    }
}

/// Positive: clusters per record. Negative (as i8): record is `2^-n` bytes.
fn decode_record_size(raw: u8, cluster_size: u32) -> Result<u32, ParseError> {
    let signed = i8::from_le_bytes([raw]);
    let size = if signed > 0 {
        cluster_size.checked_mul(u32::from(signed.unsigned_abs()))
    } else {
        1_u32.checked_shl(u32::from(signed.unsigned_abs()))
    };
    size.filter(|s| *s >= 256).ok_or(ParseError::InvalidField {
        field: "clusters_per_record",
        reason: "record size out of range",
    })
}

fn encode_record_size(record_size: u32, cluster_size: u32) -> Result<u8, ParseError> {
    let invalid = ParseError::InvalidField {
        field: "record_size",
        reason: "must be a power of two",
    };
    if !record_size.is_power_of_two() {
        return Err(invalid);
    }
    if record_size >= cluster_size {
        return u8::try_from(record_size / cluster_size).map_err(|_| invalid);
    }
    let shift = i8::try_from(record_size.trailing_zeros()).map_err(|_| invalid)?;
    Ok((-shift).to_le_bytes()[0])
}
