#![forbid(unsafe_code)]

use crate::RecordError;
use nxf_types::{
    AttrType, ParseError, RECORD_MAGIC, RecordRef, read_fixed, read_le_u16, read_le_u32,
    read_le_u64, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};

/// Offset of the first attribute in every record this crate formats.
pub const FIRST_ATTR_OFFSET: usize = 0x38;

/// Type code that terminates the attribute sequence.
pub const ATTR_END: u32 = AttrType::END.0;

/// Bytes reserved for the end marker (type plus padding).
pub const END_MARKER_SIZE: usize = 8;

const OFF_MAGIC: usize = 0x00;
const OFF_SEQUENCE: usize = 0x10;
const OFF_LINK_COUNT: usize = 0x12;
const OFF_ATTRS: usize = 0x14;
const OFF_FLAGS: usize = 0x16;
const OFF_BYTES_IN_USE: usize = 0x18;
const OFF_BYTES_ALLOCATED: usize = 0x1C;
const OFF_BASE_RECORD: usize = 0x20;
const OFF_NEXT_INSTANCE: usize = 0x28;
const OFF_RECORD_NUMBER: usize = 0x2C;

/// Record header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordFlags(pub u16);

impl RecordFlags {
    pub const IN_USE: Self = Self(0x0001);
    pub const DIRECTORY: Self = Self(0x0002);

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn with(self, flag: Self, on: bool) -> Self {
        if on {
            Self(self.0 | flag.0)
        } else {
            Self(self.0 & !flag.0)
        }
    }
}

/// Parsed metadata record header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub sequence: u16,
    pub link_count: u16,
    pub attrs_offset: u16,
    pub flags: RecordFlags,
    pub bytes_in_use: u32,
    pub bytes_allocated: u32,
    pub base_record: RecordRef,
    pub next_instance: u16,
    pub record_number: u32,
}

impl RecordHeader {
    /// Parse and bounds-check the header of a full record buffer.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_fixed::<4>(data, OFF_MAGIC)?;
        if magic != RECORD_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(u32::from_le_bytes(RECORD_MAGIC)),
                actual: u64::from(u32::from_le_bytes(magic)),
            });
        }
        let header = Self {
            sequence: read_le_u16(data, OFF_SEQUENCE)?,
            link_count: read_le_u16(data, OFF_LINK_COUNT)?,
            attrs_offset: read_le_u16(data, OFF_ATTRS)?,
            flags: RecordFlags(read_le_u16(data, OFF_FLAGS)?),
            bytes_in_use: read_le_u32(data, OFF_BYTES_IN_USE)?,
            bytes_allocated: read_le_u32(data, OFF_BYTES_ALLOCATED)?,
            base_record: RecordRef::from_raw(read_le_u64(data, OFF_BASE_RECORD)?),
            next_instance: read_le_u16(data, OFF_NEXT_INSTANCE)?,
            record_number: read_le_u32(data, OFF_RECORD_NUMBER)?,
        };

        let attrs = usize::from(header.attrs_offset);
        let in_use = header.bytes_in_use as usize;
        let allocated = header.bytes_allocated as usize;
        if attrs < FIRST_ATTR_OFFSET || attrs % 8 != 0 {
            return Err(ParseError::InvalidField {
                field: "attrs_offset",
                reason: "misaligned or inside header",
            });
        }
        if allocated != data.len() {
            return Err(ParseError::InvalidField {
                field: "bytes_allocated",
                reason: "does not match record size",
            });
        }
        if in_use > allocated || in_use < attrs + END_MARKER_SIZE || in_use % 8 != 0 {
            return Err(ParseError::InvalidField {
                field: "bytes_in_use",
                reason: "out of bounds",
            });
        }
        Ok(header)
    }

    /// Write every header field back into `data`.
    pub fn write(&self, data: &mut [u8]) -> Result<(), ParseError> {
        nxf_types::ensure_slice_mut(data, OFF_MAGIC, 4)?.copy_from_slice(&RECORD_MAGIC);
        write_le_u16(data, OFF_SEQUENCE, self.sequence)?;
        write_le_u16(data, OFF_LINK_COUNT, self.link_count)?;
        write_le_u16(data, OFF_ATTRS, self.attrs_offset)?;
        write_le_u16(data, OFF_FLAGS, self.flags.0)?;
        write_le_u32(data, OFF_BYTES_IN_USE, self.bytes_in_use)?;
        write_le_u32(data, OFF_BYTES_ALLOCATED, self.bytes_allocated)?;
        write_le_u64(data, OFF_BASE_RECORD, self.base_record.to_raw())?;
        write_le_u16(data, OFF_NEXT_INSTANCE, self.next_instance)?;
        write_le_u32(data, OFF_RECORD_NUMBER, self.record_number)?;
        Ok(())
    }

    #[must_use]
    pub fn in_use(&self) -> bool {
        self.flags.contains(RecordFlags::IN_USE)
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.flags.contains(RecordFlags::DIRECTORY)
    }

    /// Base records carry an all-zero base reference.
    #[must_use]
    pub fn is_base(&self) -> bool {
        self.base_record.is_none()
    }

    /// Reference to this record at its current sequence number.
    #[must_use]
    pub fn reference(&self) -> RecordRef {
        RecordRef::new(u64::from(self.record_number), self.sequence)
    }
}

/// Lay out an empty, not-in-use record: header, end marker, zeroed tail.
pub fn format_record(buf: &mut [u8], number: u64, sequence: u16) -> Result<(), RecordError> {
    let allocated = u32::try_from(buf.len()).map_err(|_| ParseError::IntegerConversion {
        field: "bytes_allocated",
    })?;
    let record_number = u32::try_from(number).map_err(|_| ParseError::IntegerConversion {
        field: "record_number",
    })?;
    if buf.len() < FIRST_ATTR_OFFSET + END_MARKER_SIZE {
        return Err(RecordError::NoRoom {
            needed: FIRST_ATTR_OFFSET + END_MARKER_SIZE,
            available: buf.len(),
        });
    }
    buf.fill(0);
    #[expect(clippy::cast_possible_truncation)]
    let header = RecordHeader {
        sequence,
        link_count: 0,
        attrs_offset: FIRST_ATTR_OFFSET as u16,
        flags: RecordFlags::default(),
        bytes_in_use: (FIRST_ATTR_OFFSET + END_MARKER_SIZE) as u32,
        bytes_allocated: allocated,
        base_record: RecordRef::NONE,
        next_instance: 0,
        record_number,
    };
    header.write(buf)?;
    write_le_u32(buf, FIRST_ATTR_OFFSET, ATTR_END)?;
    Ok(())
}

/// Hand out the next attribute instance number and advance the counter.
pub fn take_next_instance(record: &mut [u8]) -> Result<u16, ParseError> {
    let instance = read_le_u16(record, OFF_NEXT_INSTANCE)?;
    write_le_u16(record, OFF_NEXT_INSTANCE, instance.wrapping_add(1))?;
    Ok(instance)
}
