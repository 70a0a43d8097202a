#![forbid(unsafe_code)]
//! Error types for NXF.
//!
//! # Error Taxonomy
//!
//! NXF uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError`, `RunlistError`, `RecordError` | `nxf-types`, `nxf-runlist`, `nxf-ondisk` | Byte-level format violations |
//! | Runtime | `NxfError` | `nxf-error` (this crate) | Errors returned by the volume API and the CLI |
//!
//! `nxf-error` does not depend on the parsing crates. Each of them converts
//! its own error into `NxfError` at its crate boundary, attaching the record
//! number when it is known.
//!
//! ## errno Mapping
//!
//! Every `NxfError` variant maps to exactly one POSIX errno via
//! [`NxfError::to_errno`]. The match is exhaustive so adding a variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | `EIO` (or the wrapped OS error) |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `Invalid` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `Busy` | `EBUSY` |
//! | `Unsupported` | `EOPNOTSUPP` |
//! | `OutOfMemory` | `ENOMEM` |
//! | `NotFound` | `ENOENT` |
//! | `EndOfAttributes` | `ENOENT` |
//! | `ReadOnly` | `EROFS` |

use thiserror::Error;

/// Unified error type for all NXF operations.
#[derive(Debug, Error)]
pub enum NxfError {
    /// Device read/write failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata violates an invariant (ordering, bounds, stale
    /// sequence number). Never repaired in place; the volume is flagged.
    #[error("corrupt metadata in record {record}: {detail}")]
    Corruption { record: u64, detail: String },

    /// The image is not a volume this build understands.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without record context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Device space or allocation quantum exhausted.
    #[error("no space left on device")]
    NoSpace,

    /// A reference-counted record still has other users attached.
    #[error("record {record} is busy")]
    Busy { record: u64 },

    /// A structurally valid case this design does not handle, such as an
    /// attribute that would have to move to an extension record to grow.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A working buffer could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// The requested attribute or record is not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// Attribute enumeration reached the end marker.
    #[error("end of attributes")]
    EndOfAttributes,

    /// Caller passed an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// A write was attempted on a volume opened read-only.
    #[error("read-only volume")]
    ReadOnly,
}

impl NxfError {
    /// Convert this error into a POSIX errno.
    ///
    /// `EndOfAttributes` shares `ENOENT` with `NotFound`; callers that need to
    /// tell them apart match on the variant.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::Invalid(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::Busy { .. } => libc::EBUSY,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::OutOfMemory => libc::ENOMEM,
            Self::NotFound(_) | Self::EndOfAttributes => libc::ENOENT,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// Shorthand for a corruption error in `record`.
    #[must_use]
    pub fn corruption(record: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            record,
            detail: detail.into(),
        }
    }

    /// Whether this error should set the volume's sticky error flag.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result alias using `NxfError`.
pub type Result<T> = std::result::Result<T, NxfError>;
