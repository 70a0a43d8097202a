//! Attribute records inside a metadata record, and the in-place editing
//! primitives that move them around.
//!
//! All editing functions take the whole record buffer, keep the attribute
//! sequence packed and terminated, and update `bytes_in_use`. They never
//! grow a record past `bytes_allocated`; that case is
//! [`RecordError::NoRoom`].

use crate::collate::{CaseSensitivity, NameCollation};
use crate::record::{ATTR_END, END_MARKER_SIZE, RecordHeader};
use crate::RecordError;
use nxf_types::{
    AttrType, ParseError, align8, ensure_slice, read_le_i64, read_le_u16, read_le_u32, read_u8,
    write_le_i64, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const ATTR_FLAG_COMPRESSED: u16 = 0x0001;
pub const ATTR_FLAG_ENCRYPTED: u16 = 0x4000;
pub const ATTR_FLAG_SPARSE: u16 = 0x8000;

pub const RESIDENT_HEADER_SIZE: usize = 0x18;
pub const NON_RESIDENT_HEADER_SIZE: usize = 0x40;
pub const NON_RESIDENT_COMPRESSED_HEADER_SIZE: usize = 0x48;

const OFF_TYPE: usize = 0x00;
const OFF_LENGTH: usize = 0x04;
const OFF_NON_RESIDENT: usize = 0x08;
const OFF_NAME_LENGTH: usize = 0x09;
const OFF_NAME_OFFSET: usize = 0x0A;
const OFF_FLAGS: usize = 0x0C;
const OFF_INSTANCE: usize = 0x0E;
const OFF_VALUE_LENGTH: usize = 0x10;
const OFF_VALUE_OFFSET: usize = 0x14;
const OFF_RESIDENT_FLAGS: usize = 0x16;
const OFF_LOWEST_VCN: usize = 0x10;
const OFF_HIGHEST_VCN: usize = 0x18;
const OFF_MAPPING_PAIRS: usize = 0x20;
const OFF_COMPRESSION_UNIT: usize = 0x22;
const OFF_ALLOCATED_SIZE: usize = 0x28;
const OFF_DATA_SIZE: usize = 0x30;
const OFF_INITIALIZED_SIZE: usize = 0x38;
const OFF_COMPRESSED_SIZE: usize = 0x40;

/// Header of a non-resident attribute extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NonResidentHeader {
    pub lowest_vcn: i64,
    pub highest_vcn: i64,
    pub mapping_pairs_offset: u16,
    pub compression_unit: u8,
    pub allocated_size: i64,
    pub data_size: i64,
    pub initialized_size: i64,
    pub compressed_size: Option<i64>,
}

impl NonResidentHeader {
    /// Whether the size fields are all zero, as in most non-base extents.
    #[must_use]
    pub fn sizes_are_zero(&self) -> bool {
        self.allocated_size == 0 && self.data_size == 0 && self.initialized_size == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrBody {
    Resident {
        value_offset: u16,
        value_length: u32,
        resident_flags: u8,
    },
    NonResident(NonResidentHeader),
}

/// One parsed attribute record and its position in the metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrRecord {
    pub offset: usize,
    pub ty: AttrType,
    pub length: u32,
    pub name: Vec<u16>,
    pub flags: u16,
    pub instance: u16,
    pub body: AttrBody,
}

impl AttrRecord {
    /// Parse the attribute at `offset`. `record` must already be limited to
    /// `bytes_in_use`.
    pub fn parse(record: &[u8], offset: usize) -> Result<Self, ParseError> {
        let ty = AttrType(read_le_u32(record, offset + OFF_TYPE)?);
        let length = read_le_u32(record, offset + OFF_LENGTH)?;
        let len = length as usize;
        if len < RESIDENT_HEADER_SIZE || len % 8 != 0 {
            return Err(ParseError::InvalidField {
                field: "attr.length",
                reason: "too short or misaligned",
            });
        }
        let attr = ensure_slice(record, offset, len)?;

        let non_resident = read_u8(attr, OFF_NON_RESIDENT)?;
        let name_length = usize::from(read_u8(attr, OFF_NAME_LENGTH)?);
        let name_offset = usize::from(read_le_u16(attr, OFF_NAME_OFFSET)?);
        let flags = read_le_u16(attr, OFF_FLAGS)?;
        let instance = read_le_u16(attr, OFF_INSTANCE)?;

        let name_bytes = ensure_slice(attr, name_offset, name_length * 2)?;
        let name = name_bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        let body = match non_resident {
            0 => {
                let value_length = read_le_u32(attr, OFF_VALUE_LENGTH)?;
                let value_offset = read_le_u16(attr, OFF_VALUE_OFFSET)?;
                let resident_flags = read_u8(attr, OFF_RESIDENT_FLAGS)?;
                ensure_slice(attr, usize::from(value_offset), value_length as usize)?;
                AttrBody::Resident {
                    value_offset,
                    value_length,
                    resident_flags,
                }
            }
            1 => {
                let compressed = flags & (ATTR_FLAG_COMPRESSED | ATTR_FLAG_SPARSE) != 0;
                let header_len = if compressed {
                    NON_RESIDENT_COMPRESSED_HEADER_SIZE
                } else {
                    NON_RESIDENT_HEADER_SIZE
                };
                ensure_slice(attr, 0, header_len)?;
                let header = NonResidentHeader {
                    lowest_vcn: read_le_i64(attr, OFF_LOWEST_VCN)?,
                    highest_vcn: read_le_i64(attr, OFF_HIGHEST_VCN)?,
                    mapping_pairs_offset: read_le_u16(attr, OFF_MAPPING_PAIRS)?,
                    compression_unit: read_u8(attr, OFF_COMPRESSION_UNIT)?,
                    allocated_size: read_le_i64(attr, OFF_ALLOCATED_SIZE)?,
                    data_size: read_le_i64(attr, OFF_DATA_SIZE)?,
                    initialized_size: read_le_i64(attr, OFF_INITIALIZED_SIZE)?,
                    compressed_size: if compressed {
                        Some(read_le_i64(attr, OFF_COMPRESSED_SIZE)?)
                    } else {
                        None
                    },
                };
                let mp = usize::from(header.mapping_pairs_offset);
                if mp < header_len || mp > len {
                    return Err(ParseError::InvalidField {
                        field: "attr.mapping_pairs_offset",
                        reason: "outside attribute",
                    });
                }
                if header.lowest_vcn < 0 || header.highest_vcn < header.lowest_vcn - 1 {
                    return Err(ParseError::InvalidField {
                        field: "attr.vcn_bounds",
                        reason: "inverted",
                    });
                }
                if header.initialized_size > header.allocated_size
                    || header.data_size > header.allocated_size
                    || header.allocated_size < 0
                    || header.initialized_size < 0
                {
                    return Err(ParseError::InvalidField {
                        field: "attr.sizes",
                        reason: "size exceeds allocation",
                    });
                }
                AttrBody::NonResident(header)
            }
            _ => {
                return Err(ParseError::InvalidField {
                    field: "attr.non_resident",
                    reason: "not 0 or 1",
                });
            }
        };

        Ok(Self {
            offset,
            ty,
            length,
            name,
            flags,
            instance,
            body,
        })
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.length as usize
    }

    #[must_use]
    pub fn is_resident(&self) -> bool {
        matches!(self.body, AttrBody::Resident { .. })
    }

    #[must_use]
    pub fn non_resident(&self) -> Option<&NonResidentHeader> {
        match &self.body {
            AttrBody::NonResident(header) => Some(header),
            AttrBody::Resident { .. } => None,
        }
    }

    /// Inline value bytes of a resident attribute.
    #[must_use]
    pub fn value<'a>(&self, record: &'a [u8]) -> Option<&'a [u8]> {
        match self.body {
            AttrBody::Resident {
                value_offset,
                value_length,
                ..
            } => {
                let start = self.offset + usize::from(value_offset);
                record.get(start..start + value_length as usize)
            }
            AttrBody::NonResident(_) => None,
        }
    }

    /// Mapping-pairs bytes of a non-resident extent (to the end of the
    /// attribute; the array carries its own terminator).
    #[must_use]
    pub fn mapping_pairs<'a>(&self, record: &'a [u8]) -> Option<&'a [u8]> {
        let header = self.non_resident()?;
        record.get(self.offset + usize::from(header.mapping_pairs_offset)..self.end())
    }

    /// Whether `vcn` falls within this extent's `[lowest_vcn, highest_vcn]`.
    #[must_use]
    pub fn covers_vcn(&self, vcn: i64) -> bool {
        match self.non_resident() {
            Some(header) => header.lowest_vcn <= vcn && vcn <= header.highest_vcn,
            None => vcn == 0,
        }
    }
}

/// Iterator over the attributes of one record, in on-disk order.
#[derive(Debug)]
pub struct AttrIter<'a> {
    record: &'a [u8],
    pos: usize,
    done: bool,
}

impl Iterator for AttrIter<'_> {
    type Item = Result<AttrRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let ty = match read_le_u32(self.record, self.pos) {
            Ok(ty) => ty,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };
        if ty == ATTR_END {
            self.done = true;
            return None;
        }
        match AttrRecord::parse(self.record, self.pos) {
            Ok(attr) => {
                self.pos = attr.end();
                Some(Ok(attr))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Iterate the attributes of `record` starting at byte `from` (or at the
/// first attribute when `from` is `None`).
pub fn attrs(record: &[u8], from: Option<usize>) -> Result<AttrIter<'_>, ParseError> {
    let header = RecordHeader::parse(record)?;
    let in_use = &record[..header.bytes_in_use as usize];
    Ok(AttrIter {
        record: in_use,
        pos: from.unwrap_or(usize::from(header.attrs_offset)),
        done: false,
    })
}

/// Offset of the end marker in `record`.
pub fn end_marker_offset(record: &[u8]) -> Result<usize, ParseError> {
    let header = RecordHeader::parse(record)?;
    let mut pos = usize::from(header.attrs_offset);
    for attr in attrs(record, None)? {
        pos = attr?.end();
    }
    if pos + END_MARKER_SIZE != header.bytes_in_use as usize {
        return Err(ParseError::InvalidField {
            field: "bytes_in_use",
            reason: "does not match end marker",
        });
    }
    Ok(pos)
}

// ── Builders ────────────────────────────────────────────────────────────────

fn put_name(buf: &mut [u8], at: usize, name: &[u16]) {
    for (i, unit) in name.iter().enumerate() {
        buf[at + i * 2..at + i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
    }
}

fn name_len_u8(name: &[u16]) -> Result<u8, ParseError> {
    u8::try_from(name.len()).map_err(|_| ParseError::IntegerConversion {
        field: "attr.name_length",
    })
}

/// Bytes of a resident attribute record holding `value`.
pub fn resident_attr_bytes(
    ty: AttrType,
    name: &[u16],
    instance: u16,
    value: &[u8],
) -> Result<Vec<u8>, ParseError> {
    let name_length = name_len_u8(name)?;
    let value_offset = align8(RESIDENT_HEADER_SIZE + name.len() * 2);
    let length = align8(value_offset + value.len());
    let mut buf = vec![0_u8; length];
    write_le_u32(&mut buf, OFF_TYPE, ty.0)?;
    write_le_u32(&mut buf, OFF_LENGTH, u32_of(length, "attr.length")?)?;
    buf[OFF_NON_RESIDENT] = 0;
    buf[OFF_NAME_LENGTH] = name_length;
    write_le_u16(&mut buf, OFF_NAME_OFFSET, u16_of(RESIDENT_HEADER_SIZE, "attr.name_offset")?)?;
    write_le_u16(&mut buf, OFF_INSTANCE, instance)?;
    write_le_u32(&mut buf, OFF_VALUE_LENGTH, u32_of(value.len(), "attr.value_length")?)?;
    write_le_u16(&mut buf, OFF_VALUE_OFFSET, u16_of(value_offset, "attr.value_offset")?)?;
    put_name(&mut buf, RESIDENT_HEADER_SIZE, name);
    buf[value_offset..value_offset + value.len()].copy_from_slice(value);
    Ok(buf)
}

/// Bytes of a non-resident attribute extent with the given header and
/// mapping pairs. `header.mapping_pairs_offset` is computed here.
pub fn non_resident_attr_bytes(
    ty: AttrType,
    name: &[u16],
    instance: u16,
    flags: u16,
    header: &NonResidentHeader,
    mapping_pairs: &[u8],
) -> Result<Vec<u8>, ParseError> {
    let name_length = name_len_u8(name)?;
    let header_len = if header.compressed_size.is_some() {
        NON_RESIDENT_COMPRESSED_HEADER_SIZE
    } else {
        NON_RESIDENT_HEADER_SIZE
    };
    let mp_offset = align8(header_len + name.len() * 2);
    let length = align8(mp_offset + mapping_pairs.len());
    let mut buf = vec![0_u8; length];
    write_le_u32(&mut buf, OFF_TYPE, ty.0)?;
    write_le_u32(&mut buf, OFF_LENGTH, u32_of(length, "attr.length")?)?;
    buf[OFF_NON_RESIDENT] = 1;
    buf[OFF_NAME_LENGTH] = name_length;
    write_le_u16(&mut buf, OFF_NAME_OFFSET, u16_of(header_len, "attr.name_offset")?)?;
    write_le_u16(&mut buf, OFF_FLAGS, flags)?;
    write_le_u16(&mut buf, OFF_INSTANCE, instance)?;
    write_le_i64(&mut buf, OFF_LOWEST_VCN, header.lowest_vcn)?;
    write_le_i64(&mut buf, OFF_HIGHEST_VCN, header.highest_vcn)?;
    write_le_u16(&mut buf, OFF_MAPPING_PAIRS, u16_of(mp_offset, "attr.mapping_pairs_offset")?)?;
    buf[OFF_COMPRESSION_UNIT] = header.compression_unit;
    write_le_i64(&mut buf, OFF_ALLOCATED_SIZE, header.allocated_size)?;
    write_le_i64(&mut buf, OFF_DATA_SIZE, header.data_size)?;
    write_le_i64(&mut buf, OFF_INITIALIZED_SIZE, header.initialized_size)?;
    if let Some(compressed) = header.compressed_size {
        write_le_i64(&mut buf, OFF_COMPRESSED_SIZE, compressed)?;
    }
    put_name(&mut buf, header_len, name);
    buf[mp_offset..mp_offset + mapping_pairs.len()].copy_from_slice(mapping_pairs);
    Ok(buf)
}

/// Size of a non-resident attribute record with `name_len` name units and
/// `mp_len` bytes of mapping pairs.
#[must_use]
pub fn non_resident_attr_len(name_len: usize, compressed: bool, mp_len: usize) -> usize {
    let header_len = if compressed {
        NON_RESIDENT_COMPRESSED_HEADER_SIZE
    } else {
        NON_RESIDENT_HEADER_SIZE
    };
    align8(align8(header_len + name_len * 2) + mp_len)
}

fn u32_of(value: usize, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

fn u16_of(value: usize, field: &'static str) -> Result<u16, ParseError> {
    u16::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

// ── In-record editing ───────────────────────────────────────────────────────

fn set_bytes_in_use(record: &mut [u8], header: &RecordHeader, in_use: usize) -> Result<(), ParseError> {
    let mut header = header.clone();
    header.bytes_in_use = u32_of(in_use, "bytes_in_use")?;
    header.write(record)
}

/// Free bytes left in `record`.
pub fn free_space(record: &[u8]) -> Result<usize, ParseError> {
    let header = RecordHeader::parse(record)?;
    Ok((header.bytes_allocated - header.bytes_in_use) as usize)
}

/// Where an attribute of `ty`/`name` belongs in the ascending order.
pub fn find_insert_offset(
    record: &[u8],
    ty: AttrType,
    name: &[u16],
    collation: &dyn NameCollation,
) -> Result<usize, ParseError> {
    let mut pos = end_marker_offset(record)?;
    for attr in attrs(record, None)? {
        let attr = attr?;
        let order = attr.ty.cmp(&ty).then_with(|| {
            collation.compare_names(&attr.name, name, CaseSensitivity::Sensitive)
        });
        if order == Ordering::Greater {
            pos = attr.offset;
            break;
        }
    }
    Ok(pos)
}

/// Insert pre-built attribute bytes at `offset`, shifting later attributes.
pub fn insert_attr(record: &mut [u8], offset: usize, attr: &[u8]) -> Result<(), RecordError> {
    let header = RecordHeader::parse(record)?;
    let in_use = header.bytes_in_use as usize;
    let allocated = header.bytes_allocated as usize;
    if in_use + attr.len() > allocated {
        return Err(RecordError::NoRoom {
            needed: attr.len(),
            available: allocated - in_use,
        });
    }
    if offset < usize::from(header.attrs_offset) || offset + END_MARKER_SIZE > in_use {
        return Err(ParseError::InvalidField {
            field: "attr.offset",
            reason: "insert outside attribute area",
        }
        .into());
    }
    record.copy_within(offset..in_use, offset + attr.len());
    record[offset..offset + attr.len()].copy_from_slice(attr);
    set_bytes_in_use(record, &header, in_use + attr.len())?;
    Ok(())
}

/// Remove the attribute at `offset`, returning its bytes.
pub fn remove_attr(record: &mut [u8], offset: usize) -> Result<Vec<u8>, RecordError> {
    let header = RecordHeader::parse(record)?;
    let in_use = header.bytes_in_use as usize;
    let attr = AttrRecord::parse(&record[..in_use], offset)?;
    let removed = record[offset..attr.end()].to_vec();
    record.copy_within(attr.end()..in_use, offset);
    let new_in_use = in_use - removed.len();
    record[new_in_use..in_use].fill(0);
    set_bytes_in_use(record, &header, new_in_use)?;
    Ok(removed)
}

/// Change the length of the attribute at `offset` to `new_length` (rounded
/// up to 8), moving later attributes. Grown space is zeroed.
pub fn resize_attr(record: &mut [u8], offset: usize, new_length: usize) -> Result<(), RecordError> {
    let new_length = align8(new_length);
    let header = RecordHeader::parse(record)?;
    let in_use = header.bytes_in_use as usize;
    let allocated = header.bytes_allocated as usize;
    let attr = AttrRecord::parse(&record[..in_use], offset)?;
    let old_length = attr.length as usize;
    if new_length == old_length {
        return Ok(());
    }
    let new_in_use = in_use - old_length + new_length;
    if new_in_use > allocated {
        return Err(RecordError::NoRoom {
            needed: new_length - old_length,
            available: allocated - in_use,
        });
    }
    let old_end = offset + old_length;
    let new_end = offset + new_length;
    record.copy_within(old_end..in_use, new_end);
    if new_end > old_end {
        record[old_end..new_end].fill(0);
    } else {
        record[new_in_use..in_use].fill(0);
    }
    write_le_u32(record, offset + OFF_LENGTH, u32_of(new_length, "attr.length")?)?;
    set_bytes_in_use(record, &header, new_in_use)?;
    Ok(())
}

/// Resize the inline value of the resident attribute at `offset`. Bytes past
/// the old value length are zero-filled.
pub fn resize_resident_value(
    record: &mut [u8],
    offset: usize,
    new_value_length: usize,
) -> Result<(), RecordError> {
    let header = RecordHeader::parse(record)?;
    let attr = AttrRecord::parse(&record[..header.bytes_in_use as usize], offset)?;
    let AttrBody::Resident {
        value_offset,
        value_length,
        ..
    } = attr.body
    else {
        return Err(ParseError::InvalidField {
            field: "attr.non_resident",
            reason: "expected resident attribute",
        }
        .into());
    };
    let value_start = offset + usize::from(value_offset);
    resize_attr(record, offset, usize::from(value_offset) + new_value_length)?;
    let old = value_length as usize;
    if new_value_length > old {
        record[value_start + old..value_start + new_value_length].fill(0);
    } else {
        let attr_end = offset + align8(usize::from(value_offset) + new_value_length);
        record[value_start + new_value_length..attr_end].fill(0);
    }
    write_le_u32(
        record,
        offset + OFF_VALUE_LENGTH,
        u32_of(new_value_length, "attr.value_length")?,
    )?;
    Ok(())
}

/// Overwrite part of a resident value in place.
pub fn write_resident_value(
    record: &mut [u8],
    offset: usize,
    at: usize,
    bytes: &[u8],
) -> Result<(), ParseError> {
    let attr = AttrRecord::parse(record, offset)?;
    let AttrBody::Resident {
        value_offset,
        value_length,
        ..
    } = attr.body
    else {
        return Err(ParseError::InvalidField {
            field: "attr.non_resident",
            reason: "expected resident attribute",
        });
    };
    let short = ParseError::InsufficientData {
        needed: bytes.len(),
        offset: at,
        actual: (value_length as usize).saturating_sub(at),
    };
    if at
        .checked_add(bytes.len())
        .is_none_or(|end| end > value_length as usize)
    {
        return Err(short);
    }
    let start = offset + usize::from(value_offset) + at;
    record
        .get_mut(start..start + bytes.len())
        .ok_or(short)?
        .copy_from_slice(bytes);
    Ok(())
}

/// Replace the mapping pairs of the non-resident extent at `offset`,
/// resizing the attribute to fit.
pub fn resize_mapping_pairs(
    record: &mut [u8],
    offset: usize,
    mapping_pairs: &[u8],
) -> Result<(), RecordError> {
    let header = RecordHeader::parse(record)?;
    let attr = AttrRecord::parse(&record[..header.bytes_in_use as usize], offset)?;
    let Some(nr) = attr.non_resident() else {
        return Err(ParseError::InvalidField {
            field: "attr.non_resident",
            reason: "expected non-resident attribute",
        }
        .into());
    };
    let mp_offset = usize::from(nr.mapping_pairs_offset);
    resize_attr(record, offset, mp_offset + mapping_pairs.len())?;
    let start = offset + mp_offset;
    let end = offset + align8(mp_offset + mapping_pairs.len());
    record[start..end].fill(0);
    record[start..start + mapping_pairs.len()].copy_from_slice(mapping_pairs);
    Ok(())
}

/// Bytes available to the mapping pairs of the extent at `offset` if the
/// attribute grew to consume all free space in the record.
pub fn mapping_pairs_capacity(record: &[u8], offset: usize) -> Result<usize, ParseError> {
    let header = RecordHeader::parse(record)?;
    let attr = AttrRecord::parse(&record[..header.bytes_in_use as usize], offset)?;
    let Some(nr) = attr.non_resident() else {
        return Err(ParseError::InvalidField {
            field: "attr.non_resident",
            reason: "expected non-resident attribute",
        });
    };
    let free = (header.bytes_allocated - header.bytes_in_use) as usize;
    Ok(attr.length as usize + free - usize::from(nr.mapping_pairs_offset))
}

/// Overwrite the size fields of the non-resident extent at `offset`.
pub fn write_non_resident_sizes(
    record: &mut [u8],
    offset: usize,
    allocated_size: i64,
    data_size: i64,
    initialized_size: i64,
) -> Result<(), ParseError> {
    write_le_i64(record, offset + OFF_ALLOCATED_SIZE, allocated_size)?;
    write_le_i64(record, offset + OFF_DATA_SIZE, data_size)?;
    write_le_i64(record, offset + OFF_INITIALIZED_SIZE, initialized_size)?;
    Ok(())
}

/// Overwrite the compressed size of a sparse or compressed extent.
pub fn write_compressed_size(record: &mut [u8], offset: usize, size: i64) -> Result<(), ParseError> {
    write_le_i64(record, offset + OFF_COMPRESSED_SIZE, size)
}

/// Overwrite the VCN bounds of the non-resident extent at `offset`.
pub fn write_vcn_bounds(
    record: &mut [u8],
    offset: usize,
    lowest_vcn: i64,
    highest_vcn: i64,
) -> Result<(), ParseError> {
    write_le_i64(record, offset + OFF_LOWEST_VCN, lowest_vcn)?;
    write_le_i64(record, offset + OFF_HIGHEST_VCN, highest_vcn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collate::UpcaseTable;
    use crate::record::format_record;

    fn blank() -> Vec<u8> {
        let mut buf = vec![0_u8; 1024];
        format_record(&mut buf, 30, 1).unwrap();
        buf
    }

    fn types(record: &[u8]) -> Vec<u32> {
        attrs(record, None)
            .unwrap()
            .map(|a| a.unwrap().ty.0)
            .collect()
    }

    #[test]
    fn resident_attr_round_trip() {
        let mut rec = blank();
        let name: Vec<u16> = "$I30".encode_utf16().collect();
        let bytes = resident_attr_bytes(AttrType::DATA, &name, 4, b"hello").unwrap();
        assert_eq!(bytes.len() % 8, 0);
        insert_attr(&mut rec, 0x38, &bytes).unwrap();

        let attr = attrs(&rec, None).unwrap().next().unwrap().unwrap();
        assert_eq!(attr.ty, AttrType::DATA);
        assert_eq!(attr.name, name);
        assert_eq!(attr.instance, 4);
        assert_eq!(attr.value(&rec), Some(&b"hello"[..]));
        assert!(attr.covers_vcn(0));
        assert_eq!(end_marker_offset(&rec).unwrap(), 0x38 + bytes.len());
    }

    #[test]
    fn non_resident_attr_round_trip() {
        let mut rec = blank();
        let header = NonResidentHeader {
            lowest_vcn: 0,
            highest_vcn: 9,
            allocated_size: 5120,
            data_size: 5000,
            initialized_size: 10,
            ..NonResidentHeader::default()
        };
        let mp = [0x11, 0x0A, 0x40, 0x00];
        let bytes = non_resident_attr_bytes(AttrType::DATA, &[], 0, 0, &header, &mp).unwrap();
        assert_eq!(bytes.len(), non_resident_attr_len(0, false, mp.len()));
        insert_attr(&mut rec, 0x38, &bytes).unwrap();

        let attr = attrs(&rec, None).unwrap().next().unwrap().unwrap();
        let nr = attr.non_resident().unwrap();
        assert_eq!(nr.data_size, 5000);
        assert_eq!(nr.initialized_size, 10);
        assert_eq!(usize::from(nr.mapping_pairs_offset), NON_RESIDENT_HEADER_SIZE);
        assert_eq!(&attr.mapping_pairs(&rec).unwrap()[..4], &mp);
        assert!(attr.covers_vcn(9));
        assert!(!attr.covers_vcn(10));
    }

    #[test]
    fn sparse_attr_carries_compressed_size() {
        let header = NonResidentHeader {
            highest_vcn: 0,
            allocated_size: 512,
            compressed_size: Some(0),
            ..NonResidentHeader::default()
        };
        let bytes =
            non_resident_attr_bytes(AttrType::DATA, &[], 0, ATTR_FLAG_SPARSE, &header, &[0x01, 0x01, 0x00])
                .unwrap();
        let mut rec = blank();
        insert_attr(&mut rec, 0x38, &bytes).unwrap();
        let attr = attrs(&rec, None).unwrap().next().unwrap().unwrap();
        let nr = attr.non_resident().unwrap();
        assert_eq!(nr.compressed_size, Some(0));
        assert_eq!(usize::from(nr.mapping_pairs_offset), NON_RESIDENT_COMPRESSED_HEADER_SIZE);
    }

    #[test]
    fn insert_keeps_type_order_and_remove_restores() {
        let up = UpcaseTable::default_table();
        let mut rec = blank();
        for ty in [AttrType::DATA, AttrType::STANDARD_INFORMATION, AttrType::FILE_NAME] {
            let bytes = resident_attr_bytes(ty, &[], 0, &[1, 2, 3]).unwrap();
            let at = find_insert_offset(&rec, ty, &[], &up).unwrap();
            insert_attr(&mut rec, at, &bytes).unwrap();
        }
        assert_eq!(types(&rec), vec![0x10, 0x30, 0x80]);

        let second = attrs(&rec, None).unwrap().nth(1).unwrap().unwrap();
        let before = RecordHeader::parse(&rec).unwrap().bytes_in_use;
        let removed = remove_attr(&mut rec, second.offset).unwrap();
        assert_eq!(removed.len(), second.length as usize);
        assert_eq!(types(&rec), vec![0x10, 0x80]);
        assert_eq!(
            RecordHeader::parse(&rec).unwrap().bytes_in_use,
            before - second.length
        );
    }

    #[test]
    fn insert_reports_no_room() {
        let mut rec = blank();
        let big = resident_attr_bytes(AttrType::DATA, &[], 0, &[0_u8; 2000]).unwrap();
        assert!(matches!(
            insert_attr(&mut rec, 0x38, &big),
            Err(RecordError::NoRoom { .. })
        ));
        assert_eq!(types(&rec), Vec::<u32>::new());
    }

    #[test]
    fn resident_value_grows_with_zero_fill() {
        let mut rec = blank();
        let si = resident_attr_bytes(AttrType::STANDARD_INFORMATION, &[], 0, &[9; 8]).unwrap();
        let data = resident_attr_bytes(AttrType::DATA, &[], 1, b"0123456789").unwrap();
        insert_attr(&mut rec, 0x38, &si).unwrap();
        insert_attr(&mut rec, 0x38 + si.len(), &data).unwrap();

        let off = 0x38 + si.len();
        resize_resident_value(&mut rec, off, 100).unwrap();
        let attr = AttrRecord::parse(&rec, off).unwrap();
        let value = attr.value(&rec).unwrap();
        assert_eq!(value.len(), 100);
        assert_eq!(&value[..10], b"0123456789");
        assert!(value[10..].iter().all(|b| *b == 0));
        end_marker_offset(&rec).expect("record still terminated");

        resize_resident_value(&mut rec, off, 4).unwrap();
        let attr = AttrRecord::parse(&rec, off).unwrap();
        assert_eq!(attr.value(&rec).unwrap(), b"0123");
        assert_eq!(types(&rec), vec![0x10, 0x80]);

        write_resident_value(&mut rec, off, 1, b"xy").unwrap();
        let attr = AttrRecord::parse(&rec, off).unwrap();
        assert_eq!(attr.value(&rec).unwrap(), b"0xy3");
        assert!(write_resident_value(&mut rec, off, 3, b"zz").is_err());
        assert!(matches!(
            write_resident_value(&mut rec, off, usize::MAX, b"x"),
            Err(ParseError::InsufficientData { .. })
        ));
        let attr = AttrRecord::parse(&rec, off).unwrap();
        assert_eq!(attr.value(&rec).unwrap(), b"0xy3");
    }

    #[test]
    fn mapping_pairs_resize_moves_followers() {
        let mut rec = blank();
        let header = NonResidentHeader {
            highest_vcn: 0,
            allocated_size: 512,
            ..NonResidentHeader::default()
        };
        let nr = non_resident_attr_bytes(AttrType::DATA, &[], 0, 0, &header, &[0x11, 0x01, 0x05, 0x00]).unwrap();
        let bm = resident_attr_bytes(AttrType::BITMAP, &[], 1, &[0xFF; 8]).unwrap();
        insert_attr(&mut rec, 0x38, &nr).unwrap();
        insert_attr(&mut rec, 0x38 + nr.len(), &bm).unwrap();

        let capacity = mapping_pairs_capacity(&rec, 0x38).unwrap();
        let long_mp = vec![0x11, 0x01, 0x05, 0x11, 0x01, 0x09, 0x11, 0x01, 0x03, 0x00];
        assert!(capacity >= long_mp.len());
        resize_mapping_pairs(&mut rec, 0x38, &long_mp).unwrap();

        let attr = AttrRecord::parse(&rec, 0x38).unwrap();
        assert_eq!(&attr.mapping_pairs(&rec).unwrap()[..long_mp.len()], &long_mp[..]);
        let bitmap = AttrRecord::parse(&rec, attr.end()).unwrap();
        assert_eq!(bitmap.ty, AttrType::BITMAP);
        assert_eq!(bitmap.value(&rec).unwrap(), &[0xFF; 8]);

        write_non_resident_sizes(&mut rec, 0x38, 1536, 1000, 700).unwrap();
        write_vcn_bounds(&mut rec, 0x38, 0, 2).unwrap();
        let attr = AttrRecord::parse(&rec, 0x38).unwrap();
        let nr = attr.non_resident().unwrap();
        assert_eq!((nr.allocated_size, nr.data_size, nr.initialized_size), (1536, 1000, 700));
        assert_eq!(nr.highest_vcn, 2);
    }

    #[test]
    fn resize_attr_refuses_to_overflow_record() {
        let mut rec = blank();
        let data = resident_attr_bytes(AttrType::DATA, &[], 0, &[1; 16]).unwrap();
        insert_attr(&mut rec, 0x38, &data).unwrap();
        let free = free_space(&rec).unwrap();
        assert!(matches!(
            resize_attr(&mut rec, 0x38, data.len() + free + 8),
            Err(RecordError::NoRoom { .. })
        ));
        resize_attr(&mut rec, 0x38, data.len() + free).expect("exact fit");
        assert_eq!(free_space(&rec).unwrap(), 0);
    }

    #[test]
    fn parse_rejects_misaligned_length() {
        let mut rec = blank();
        let data = resident_attr_bytes(AttrType::DATA, &[], 0, &[1; 16]).unwrap();
        insert_attr(&mut rec, 0x38, &data).unwrap();
        write_le_u32(&mut rec, 0x38 + OFF_LENGTH, 0x1D).unwrap();
        assert!(attrs(&rec, None).unwrap().next().unwrap().is_err());
    }
}
