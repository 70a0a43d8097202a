//! Attribute-name collation.
//!
//! Names are UTF-16 code units. The volume carries an upcase table; the
//! default one is derived from Unicode simple uppercase mappings of the
//! Basic Multilingual Plane.

use nxf_types::{ParseError, read_le_u16};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CaseSensitivity {
    #[default]
    Sensitive,
    Insensitive,
}

/// Total, consistent ordering predicate over attribute names.
pub trait NameCollation: Send + Sync {
    fn compare_names(&self, a: &[u16], b: &[u16], case: CaseSensitivity) -> Ordering;

    fn names_equal(&self, a: &[u16], b: &[u16], case: CaseSensitivity) -> bool {
        self.compare_names(a, b, case) == Ordering::Equal
    }
}

/// 64K-entry code-unit upcase table.
#[derive(Clone, PartialEq, Eq)]
pub struct UpcaseTable {
    table: Vec<u16>,
}

impl std::fmt::Debug for UpcaseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpcaseTable")
            .field("entries", &self.table.len())
            .finish()
    }
}

impl UpcaseTable {
    pub const ENTRIES: usize = 0x1_0000;

    #[must_use]
    pub fn default_table() -> Self {
        let table = (0..=u16::MAX)
            .map(|unit| {
                let Some(ch) = char::from_u32(u32::from(unit)) else {
                    return unit;
                };
                let mut upper = ch.to_uppercase();
                match (upper.next(), upper.next()) {
                    (Some(up), None) => u16::try_from(u32::from(up)).unwrap_or(unit),
                    _ => unit,
                }
            })
            .collect();
        Self { table }
    }

    /// Load a table stored as 65536 little-endian code units.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() != Self::ENTRIES * 2 {
            return Err(ParseError::InvalidField {
                field: "upcase",
                reason: "table must hold 65536 entries",
            });
        }
        let table = (0..Self::ENTRIES)
            .map(|i| read_le_u16(bytes, i * 2))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { table })
    }

    #[must_use]
    pub fn upcase(&self, unit: u16) -> u16 {
        self.table[usize::from(unit)]
    }
}

impl NameCollation for UpcaseTable {
    /// Upcased comparison first; case-sensitive lookups break ties on the
    /// raw code units so the order stays total.
    fn compare_names(&self, a: &[u16], b: &[u16], case: CaseSensitivity) -> Ordering {
        let folded = a
            .iter()
            .map(|u| self.upcase(*u))
            .cmp(b.iter().map(|u| self.upcase(*u)));
        match (folded, case) {
            (Ordering::Equal, CaseSensitivity::Sensitive) => a.cmp(b),
            (order, _) => order,
        }
    }
}
