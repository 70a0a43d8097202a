#![forbid(unsafe_code)]
//! On-disk layout of NXF metadata records.
//!
//! Pure parsing and editing crate: no I/O, no side effects. Works on byte
//! slices holding one metadata record: the record header, the packed
//! sequence of resident and non-resident attribute records, attribute-list
//! entries, and the name collation used to order them.

pub mod attr;
pub mod attrlist;
pub mod boot;
pub mod collate;
pub mod record;

pub use attr::{
    ATTR_FLAG_COMPRESSED, ATTR_FLAG_ENCRYPTED, ATTR_FLAG_SPARSE, AttrBody, AttrIter, AttrRecord,
    NonResidentHeader, attrs, end_marker_offset, find_insert_offset, free_space, insert_attr,
    mapping_pairs_capacity, non_resident_attr_bytes, non_resident_attr_len, remove_attr,
    resident_attr_bytes, resize_attr, resize_mapping_pairs, resize_resident_value,
    write_compressed_size, write_non_resident_sizes, write_resident_value, write_vcn_bounds,
};
pub use boot::{BOOT_SECTOR_SIZE, BootSector};
pub use attrlist::{AttrListEntry, first_out_of_order, parse_attr_list, serialize_attr_list};
pub use collate::{CaseSensitivity, NameCollation, UpcaseTable};
pub use record::{
    ATTR_END, FIRST_ATTR_OFFSET, RecordFlags, RecordHeader, format_record, take_next_instance,
};

use nxf_types::ParseError;
use thiserror::Error;

/// Failure of an in-record edit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("record full: need {needed} more bytes, {available} free")]
    NoRoom { needed: usize, available: usize },
}
