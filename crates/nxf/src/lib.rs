#![forbid(unsafe_code)]
//! NXF public API facade.
//!
//! Re-exports the volume core from `nxf-core` along with the handful of
//! types a caller needs to name when opening a volume and looking up
//! attributes. The CLI depends on this crate rather than on the internals.

pub use nxf_core::*;

pub use nxf_block::{ByteDevice, DevicePageCache, FileByteDevice, MemByteDevice, PageCache};
pub use nxf_error::{NxfError, Result};
pub use nxf_ondisk::CaseSensitivity;
pub use nxf_types::{AttrType, FIRST_USER_RECORD, Lcn, RecordRef, utf16_name};
