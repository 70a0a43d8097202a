#![forbid(unsafe_code)]
//! Shared identifiers, on-disk constants, and byte helpers for NXF.
//!
//! Everything here is format-level vocabulary with no I/O: unit-carrying
//! record and cluster identifiers, the [`Lcn`] sum type that replaces the
//! negative sentinel LCN values used on disk, and [`ParseError`] for byte
//! level parsing failures.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Magic at offset 0 of every metadata record.
pub const RECORD_MAGIC: [u8; 4] = *b"FILE";

/// Records 0..=23 are reserved for system files and never handed out.
pub const FIRST_USER_RECORD: u64 = 24;

/// Record number of the metadata table itself.
pub const MFT_RECORD: u64 = 0;

/// Largest record number representable in a 48-bit record reference.
pub const MAX_RECORD_NUMBER: u64 = (1 << 48) - 1;

/// Default number of bytes the metadata bitmap grows by when it runs out of
/// initialized bits (64 records).
pub const DEFAULT_BITMAP_GROWTH_BYTES: u64 = 8;

// ── Record and attribute identifiers ────────────────────────────────────────

/// 0-based index of a slot in the metadata table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordNumber(pub u64);

impl RecordNumber {
    pub const MFT: Self = Self(MFT_RECORD);

    /// Byte offset of this record inside the metadata table stream.
    #[must_use]
    pub fn table_offset(self, record_size: u32) -> Option<u64> {
        self.0.checked_mul(u64::from(record_size))
    }

    #[must_use]
    pub fn is_reserved(self) -> bool {
        self.0 < FIRST_USER_RECORD
    }
}

impl fmt::Display for RecordNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a metadata record: index plus the generation (sequence
/// number) the referrer expects to find there.
///
/// On disk this is a little-endian `u64` with the index in the low 48 bits
/// and the sequence number in the high 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub number: RecordNumber,
    pub sequence: u16,
}

impl RecordRef {
    /// The all-zero reference, used as "no base record".
    pub const NONE: Self = Self {
        number: RecordNumber(0),
        sequence: 0,
    };

    #[must_use]
    pub fn new(number: u64, sequence: u16) -> Self {
        Self {
            number: RecordNumber(number & MAX_RECORD_NUMBER),
            sequence,
        }
    }

    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        #[expect(clippy::cast_possible_truncation)]
        let sequence = (raw >> 48) as u16;
        Self::new(raw & MAX_RECORD_NUMBER, sequence)
    }

    #[must_use]
    pub fn to_raw(self) -> u64 {
        (self.number.0 & MAX_RECORD_NUMBER) | (u64::from(self.sequence) << 48)
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        self.to_raw() == 0
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.number.0, self.sequence)
    }
}

/// Attribute type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttrType(pub u32);

impl AttrType {
    pub const STANDARD_INFORMATION: Self = Self(0x10);
    pub const ATTRIBUTE_LIST: Self = Self(0x20);
    pub const FILE_NAME: Self = Self(0x30);
    pub const OBJECT_ID: Self = Self(0x40);
    pub const SECURITY_DESCRIPTOR: Self = Self(0x50);
    pub const VOLUME_NAME: Self = Self(0x60);
    pub const VOLUME_INFORMATION: Self = Self(0x70);
    pub const DATA: Self = Self(0x80);
    pub const INDEX_ROOT: Self = Self(0x90);
    pub const INDEX_ALLOCATION: Self = Self(0xA0);
    pub const BITMAP: Self = Self(0xB0);
    pub const REPARSE_POINT: Self = Self(0xC0);
    pub const EA_INFORMATION: Self = Self(0xD0);
    pub const EA: Self = Self(0xE0);
    pub const LOGGED_UTILITY_STREAM: Self = Self(0x100);
    /// Terminates the attribute sequence inside a record.
    pub const END: Self = Self(0xFFFF_FFFF);

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::STANDARD_INFORMATION => "$STANDARD_INFORMATION",
            Self::ATTRIBUTE_LIST => "$ATTRIBUTE_LIST",
            Self::FILE_NAME => "$FILE_NAME",
            Self::OBJECT_ID => "$OBJECT_ID",
            Self::SECURITY_DESCRIPTOR => "$SECURITY_DESCRIPTOR",
            Self::VOLUME_NAME => "$VOLUME_NAME",
            Self::VOLUME_INFORMATION => "$VOLUME_INFORMATION",
            Self::DATA => "$DATA",
            Self::INDEX_ROOT => "$INDEX_ROOT",
            Self::INDEX_ALLOCATION => "$INDEX_ALLOCATION",
            Self::BITMAP => "$BITMAP",
            Self::REPARSE_POINT => "$REPARSE_POINT",
            Self::EA_INFORMATION => "$EA_INFORMATION",
            Self::EA => "$EA",
            Self::LOGGED_UTILITY_STREAM => "$LOGGED_UTILITY_STREAM",
            Self::END => "$END",
            _ => "$UNKNOWN",
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:x})", self.name(), self.0)
    }
}

// ── Cluster geometry ────────────────────────────────────────────────────────

/// Validated cluster size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterSize(u32);

impl ClusterSize {
    /// Create a `ClusterSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "cluster_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Cluster containing byte `offset` (truncating).
    #[must_use]
    pub fn bytes_to_clusters_floor(self, bytes: i64) -> i64 {
        bytes >> self.shift()
    }

    /// Number of clusters needed to hold `bytes` bytes.
    #[must_use]
    pub fn bytes_to_clusters_ceil(self, bytes: i64) -> i64 {
        let mask = i64::from(self.0) - 1;
        bytes.saturating_add(mask) >> self.shift()
    }

    #[must_use]
    pub fn clusters_to_bytes(self, clusters: i64) -> Option<i64> {
        clusters.checked_mul(i64::from(self.0))
    }

    /// Round `bytes` up to cluster granularity.
    #[must_use]
    pub fn round_up(self, bytes: i64) -> Option<i64> {
        self.clusters_to_bytes(self.bytes_to_clusters_ceil(bytes))
    }
}

impl fmt::Display for ClusterSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── LCN sum type ────────────────────────────────────────────────────────────

/// Result of mapping a VCN: a physical cluster or one of the sentinel states
/// that the on-disk format encodes as negative numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lcn {
    /// Physical cluster number on the volume.
    Real(i64),
    /// Sparse region; reads as zeros and owns no clusters.
    Hole,
    /// Mapping exists on disk but has not been decoded into memory yet.
    NotMapped,
    /// The VCN lies past the end of the attribute.
    EndOfFile,
    /// The lookup itself was invalid (e.g. negative VCN).
    Error,
}

impl Lcn {
    #[must_use]
    pub fn is_real(self) -> bool {
        matches!(self, Self::Real(_))
    }

    #[must_use]
    pub fn real(self) -> Option<i64> {
        match self {
            Self::Real(lcn) => Some(lcn),
            _ => None,
        }
    }

    /// Whether the run is backed by a definitive mapping (real or sparse).
    #[must_use]
    pub fn is_mapped(self) -> bool {
        matches!(self, Self::Real(_) | Self::Hole)
    }

    /// Advance a real LCN by `delta` clusters; sentinels are unchanged.
    #[must_use]
    pub fn offset(self, delta: i64) -> Self {
        match self {
            Self::Real(lcn) => Self::Real(lcn + delta),
            other => other,
        }
    }

    /// The legacy negative encoding, used only for diagnostics output.
    #[must_use]
    pub fn to_raw(self) -> i64 {
        match self {
            Self::Real(lcn) => lcn,
            Self::Hole => -1,
            Self::NotMapped => -2,
            Self::EndOfFile => -3,
            Self::Error => -5,
        }
    }
}

impl fmt::Display for Lcn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real(lcn) => write!(f, "{lcn}"),
            Self::Hole => f.write_str("hole"),
            Self::NotMapped => f.write_str("not-mapped"),
            Self::EndOfFile => f.write_str("end"),
            Self::Error => f.write_str("error"),
        }
    }
}

// ── Parse errors and byte helpers ───────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    Ok(i64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_i64(data: &mut [u8], offset: usize, value: i64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Round `value` up to the next multiple of 8 (attribute alignment).
#[must_use]
pub fn align8(value: usize) -> usize {
    (value + 7) & !7
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Encode a `&str` as the UTF-16 code units used for attribute names.
#[must_use]
pub fn utf16_name(name: &str) -> Vec<u16> {
    name.encode_utf16().collect()
}

/// Lossy decode of a UTF-16 attribute name for display.
#[must_use]
pub fn display_name(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}
