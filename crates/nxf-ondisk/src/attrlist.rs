//! Attribute-list entries: the index from a base record to the records that
//! hold each attribute extent.

use crate::collate::{CaseSensitivity, NameCollation};
use nxf_types::{
    AttrType, ParseError, RecordRef, align8, ensure_slice, read_le_i64, read_le_u16, read_le_u32,
    read_le_u64, read_u8,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const OFF_TYPE: usize = 0x00;
const OFF_LENGTH: usize = 0x04;
const OFF_NAME_LENGTH: usize = 0x06;
const OFF_NAME_OFFSET: usize = 0x07;
const OFF_LOWEST_VCN: usize = 0x08;
const OFF_RECORD: usize = 0x10;
const OFF_INSTANCE: usize = 0x18;
/// Names start right after the fixed part.
pub const ATTR_LIST_ENTRY_HEADER: usize = 0x1A;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrListEntry {
    pub ty: AttrType,
    pub lowest_vcn: i64,
    pub record: RecordRef,
    pub instance: u16,
    pub name: Vec<u16>,
}

impl AttrListEntry {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        align8(ATTR_LIST_ENTRY_HEADER + self.name.len() * 2)
    }

    /// Sort key comparison: `(type, name, lowest_vcn)`.
    pub fn cmp_key(&self, other: &Self, collation: &dyn NameCollation) -> Ordering {
        self.ty
            .cmp(&other.ty)
            .then_with(|| collation.compare_names(&self.name, &other.name, CaseSensitivity::Sensitive))
            .then_with(|| self.lowest_vcn.cmp(&other.lowest_vcn))
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), ParseError> {
        let len = self.encoded_len();
        let start = out.len();
        out.resize(start + len, 0);
        let buf = &mut out[start..];
        buf[OFF_TYPE..OFF_TYPE + 4].copy_from_slice(&self.ty.0.to_le_bytes());
        let len16 = u16::try_from(len).map_err(|_| ParseError::IntegerConversion {
            field: "attr_list.length",
        })?;
        buf[OFF_LENGTH..OFF_LENGTH + 2].copy_from_slice(&len16.to_le_bytes());
        buf[OFF_NAME_LENGTH] = u8::try_from(self.name.len()).map_err(|_| {
            ParseError::IntegerConversion {
                field: "attr_list.name_length",
            }
        })?;
        #[expect(clippy::cast_possible_truncation)]
        {
            buf[OFF_NAME_OFFSET] = ATTR_LIST_ENTRY_HEADER as u8;
        }
        buf[OFF_LOWEST_VCN..OFF_LOWEST_VCN + 8].copy_from_slice(&self.lowest_vcn.to_le_bytes());
        buf[OFF_RECORD..OFF_RECORD + 8].copy_from_slice(&self.record.to_raw().to_le_bytes());
        buf[OFF_INSTANCE..OFF_INSTANCE + 2].copy_from_slice(&self.instance.to_le_bytes());
        for (i, unit) in self.name.iter().enumerate() {
            let at = ATTR_LIST_ENTRY_HEADER + i * 2;
            buf[at..at + 2].copy_from_slice(&unit.to_le_bytes());
        }
        Ok(())
    }
}

/// Parse a complete attribute-list value.
pub fn parse_attr_list(bytes: &[u8]) -> Result<Vec<AttrListEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let length = usize::from(read_le_u16(bytes, pos + OFF_LENGTH)?);
        if length < ATTR_LIST_ENTRY_HEADER || length % 8 != 0 {
            return Err(ParseError::InvalidField {
                field: "attr_list.length",
                reason: "too short or misaligned",
            });
        }
        let entry = ensure_slice(bytes, pos, length)?;
        let name_length = usize::from(read_u8(entry, OFF_NAME_LENGTH)?);
        let name_offset = usize::from(read_u8(entry, OFF_NAME_OFFSET)?);
        let name = ensure_slice(entry, name_offset, name_length * 2)?
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        entries.push(AttrListEntry {
            ty: AttrType(read_le_u32(entry, OFF_TYPE)?),
            lowest_vcn: read_le_i64(entry, OFF_LOWEST_VCN)?,
            record: RecordRef::from_raw(read_le_u64(entry, OFF_RECORD)?),
            instance: read_le_u16(entry, OFF_INSTANCE)?,
            name,
        });
        pos += length;
    }
    Ok(entries)
}

/// Serialize entries back into an attribute-list value.
pub fn serialize_attr_list(entries: &[AttrListEntry]) -> Result<Vec<u8>, ParseError> {
    let mut out = Vec::with_capacity(entries.iter().map(AttrListEntry::encoded_len).sum());
    for entry in entries {
        entry.write(&mut out)?;
    }
    Ok(out)
}

/// Check the `(type, name, lowest_vcn)` order; returns the index of the
/// first entry that sorts before its predecessor.
pub fn first_out_of_order(entries: &[AttrListEntry], collation: &dyn NameCollation) -> Option<usize> {
    entries
        .windows(2)
        .position(|pair| pair[0].cmp_key(&pair[1], collation) == Ordering::Greater)
        .map(|idx| idx + 1)
}
