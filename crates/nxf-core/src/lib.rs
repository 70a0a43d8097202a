#![forbid(unsafe_code)]
//! The NXF volume core.
//!
//! A [`Volume`] ties the on-disk structures of `nxf-ondisk` to a page cache
//! and a cluster allocator. On top of it sit the attribute locator
//! ([`AttrSearch`]), the metadata-record allocator
//! ([`Volume::allocate_record`], [`Volume::free_record`]) and the
//! non-resident attribute resizer ([`Volume::extend_allocation`],
//! [`Volume::extend_initialized`], [`Volume::make_non_resident`]).
//!
//! Lock order, outermost first: the metadata bitmap, one attribute's
//! runlist, record checkouts. The published snapshot of the metadata
//! table's runlist is read without locks.

pub mod api;
pub mod config;
pub mod inode;
pub mod locator;
mod mft;
mod mft_alloc;
pub mod record;
mod resize;
pub mod state;
mod stream;
pub mod upgrade;
pub mod volume;

pub use api::{AttrHandle, PhysicalExtent};
pub use config::{VolumeGeometry, VolumeOptions};
pub use inode::{AttrSizes, NtAttr, NtInode};
pub use locator::{AttrQuery, AttrSearch, FoundAttr, SearchState, find_in_record};
pub use record::{LockedRecord, RecordPin, RecordSlot};
pub use state::VolumeState;
pub use upgrade::{LockPhase, read_or_upgrade};
pub use volume::{Volume, VolumeInfo, read_geometry};

use nxf_error::NxfError;
use nxf_ondisk::RecordError;
use nxf_types::ParseError;

/// An in-record edit that failed. A full record is a layout this core does
/// not handle; anything else means the record bytes are damaged.
pub(crate) fn record_error(number: u64, err: RecordError) -> NxfError {
    match err {
        RecordError::NoRoom { needed, available } => NxfError::Unsupported(format!(
            "record {number} needs {needed} more bytes, has {available}"
        )),
        RecordError::Parse(err) => parse_error(number, err),
    }
}

pub(crate) fn parse_error(number: u64, err: ParseError) -> NxfError {
    NxfError::corruption(number, err.to_string())
}
