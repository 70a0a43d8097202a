#![forbid(unsafe_code)]
//! Run lists: the sparse VCN → LCN map of one non-resident attribute.
//!
//! A [`Runlist`] always starts at VCN 0, is contiguous, and ends with a
//! zero-length terminator whose LCN is [`Lcn::EndOfFile`] (the attribute ends
//! there) or [`Lcn::NotMapped`] (more extents exist on disk but have not been
//! decoded yet). Gaps are never omitted: sparse ranges are explicit
//! [`Lcn::Hole`] runs and undecoded ranges are explicit [`Lcn::NotMapped`]
//! runs.
//!
//! Encoding and decoding of the on-disk mapping-pairs array live in
//! [`codec`]; structural edits (merge, truncate, punch) live in [`edit`].

pub mod codec;
pub mod edit;

pub use codec::decode_mapping_pairs;
use nxf_error::NxfError;
use nxf_types::Lcn;
use thiserror::Error;
use tracing::error;

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RunlistError {
    #[error("corrupt mapping pairs: {detail}")]
    Corrupt { detail: String },
    #[error("mapping pairs do not fit; stopped at vcn {stop_vcn}")]
    BufferTooSmall { stop_vcn: i64 },
    #[error("vcn {vcn} is not mapped")]
    NotMapped { vcn: i64 },
    #[error("runlists disagree at vcn {vcn}")]
    Contradiction { vcn: i64 },
    #[error("vcn range {start}..{end} outside runlist ending at {limit}")]
    OutOfRange { start: i64, end: i64, limit: i64 },
}

impl RunlistError {
    pub(crate) fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Convert into the runtime error, attributing it to `record`.
    ///
    /// Undecodable or inconsistent mappings are metadata corruption; a range
    /// outside the runlist is a caller error; an encoding that does not fit
    /// its record is a case the volume does not handle.
    #[must_use]
    pub fn into_nxf(self, record: u64) -> NxfError {
        match self {
            Self::Corrupt { .. } | Self::NotMapped { .. } | Self::Contradiction { .. } => {
                NxfError::Corruption {
                    record,
                    detail: self.to_string(),
                }
            }
            Self::BufferTooSmall { .. } => NxfError::Unsupported(self.to_string()),
            Self::OutOfRange { .. } => NxfError::Invalid(self.to_string()),
        }
    }
}

// ── Elements ────────────────────────────────────────────────────────────────

/// One run: `length` clusters starting at `vcn`, mapped to `lcn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunlistElement {
    pub vcn: i64,
    pub lcn: Lcn,
    pub length: i64,
}

impl RunlistElement {
    #[must_use]
    pub fn new(vcn: i64, lcn: Lcn, length: i64) -> Self {
        Self { vcn, lcn, length }
    }

    /// First VCN past this run.
    #[must_use]
    pub fn end(&self) -> i64 {
        self.vcn + self.length
    }

    #[must_use]
    pub fn contains(&self, vcn: i64) -> bool {
        self.vcn <= vcn && vcn < self.end()
    }

    /// LCN backing `vcn`, which must lie inside this run.
    #[must_use]
    pub fn lcn_at(&self, vcn: i64) -> Lcn {
        self.lcn.offset(vcn - self.vcn)
    }

    /// Whether `next` continues this run without a break.
    #[must_use]
    pub fn joins(&self, next: &Self) -> bool {
        if self.end() != next.vcn {
            return false;
        }
        match (self.lcn, next.lcn) {
            (Lcn::Real(a), Lcn::Real(b)) => a + self.length == b,
            (Lcn::Hole, Lcn::Hole) | (Lcn::NotMapped, Lcn::NotMapped) => true,
            _ => false,
        }
    }
}

// ── Runlist ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runlist {
    elements: Vec<RunlistElement>,
}

impl Default for Runlist {
    fn default() -> Self {
        Self::empty()
    }
}

impl Runlist {
    /// Runlist of an attribute with no clusters.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            elements: vec![RunlistElement::new(0, Lcn::EndOfFile, 0)],
        }
    }

    /// Runlist whose first `clusters` VCNs are all undecoded.
    #[must_use]
    pub fn unmapped(clusters: i64) -> Self {
        if clusters <= 0 {
            return Self::empty();
        }
        Self {
            elements: vec![
                RunlistElement::new(0, Lcn::NotMapped, clusters),
                RunlistElement::new(clusters, Lcn::NotMapped, 0),
            ],
        }
    }

    /// Build from explicit elements, checking every structural invariant.
    pub fn from_elements(elements: Vec<RunlistElement>) -> Result<Self, RunlistError> {
        let rl = Self { elements };
        rl.validate()?;
        Ok(rl)
    }

    /// Build without validation. The caller guarantees the invariants.
    pub(crate) fn from_elements_unchecked(elements: Vec<RunlistElement>) -> Self {
        debug_assert!(Self::check(&elements).is_ok());
        Self { elements }
    }

    /// All elements including the terminator.
    #[must_use]
    pub fn elements(&self) -> &[RunlistElement] {
        &self.elements
    }

    /// All elements except the terminator.
    #[must_use]
    pub fn runs(&self) -> &[RunlistElement] {
        &self.elements[..self.elements.len() - 1]
    }

    #[must_use]
    pub fn terminator(&self) -> &RunlistElement {
        &self.elements[self.elements.len() - 1]
    }

    /// VCN of the terminator: one past the last described cluster.
    #[must_use]
    pub fn end_vcn(&self) -> i64 {
        self.terminator().vcn
    }

    /// Whether the terminator marks the end of the attribute.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.terminator().lcn == Lcn::EndOfFile
    }

    /// Whether any run in `[start, end)` is still undecoded.
    #[must_use]
    pub fn has_unmapped_in(&self, start: i64, end: i64) -> bool {
        self.runs()
            .iter()
            .any(|el| el.lcn == Lcn::NotMapped && el.vcn < end && start < el.end())
    }

    /// First VCN covered by an undecoded run.
    #[must_use]
    pub fn first_unmapped_vcn(&self) -> Option<i64> {
        self.runs()
            .iter()
            .find(|el| el.lcn == Lcn::NotMapped)
            .map(|el| el.vcn)
    }

    /// Map `vcn` to its LCN or to the sentinel describing why there is none.
    #[must_use]
    pub fn resolve(&self, vcn: i64) -> Lcn {
        if vcn < 0 {
            return Lcn::Error;
        }
        match self.find_element(vcn) {
            Some(el) => el.lcn_at(vcn),
            None => self.terminator().lcn,
        }
    }

    /// The run containing `vcn`, or `None` when `vcn` is at or past the end.
    #[must_use]
    pub fn find_element(&self, vcn: i64) -> Option<&RunlistElement> {
        self.find_index(vcn).map(|idx| &self.elements[idx])
    }

    pub(crate) fn find_index(&self, vcn: i64) -> Option<usize> {
        if vcn < 0 || vcn >= self.end_vcn() {
            return None;
        }
        let runs = self.runs();
        let idx = runs.partition_point(|el| el.vcn <= vcn).checked_sub(1)?;
        runs[idx].contains(vcn).then_some(idx)
    }

    /// LCN just past the last real cluster, as an allocation locality hint.
    #[must_use]
    pub fn next_lcn_hint(&self) -> Option<i64> {
        self.runs()
            .iter()
            .rev()
            .find_map(|el| el.lcn.real().map(|lcn| lcn + el.length))
    }

    /// Total clusters backed by real LCNs.
    #[must_use]
    pub fn real_clusters(&self) -> i64 {
        self.runs()
            .iter()
            .filter(|el| el.lcn.is_real())
            .map(|el| el.length)
            .sum()
    }

    /// Iterate `(lcn, length)` of every real run.
    pub fn real_runs(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.runs()
            .iter()
            .filter_map(|el| el.lcn.real().map(|lcn| (lcn, el.length)))
    }

    /// Fragment describing `[from_vcn, end)` of this runlist, with everything
    /// before `from_vcn` undecoded. Used to hand a tail of clusters to a
    /// cluster allocator for freeing.
    #[must_use]
    pub fn tail(&self, from_vcn: i64) -> Self {
        let end = self.end_vcn();
        let from_vcn = from_vcn.clamp(0, end);
        let mut elements = Vec::new();
        if from_vcn > 0 {
            elements.push(RunlistElement::new(0, Lcn::NotMapped, from_vcn));
        }
        for el in self.runs() {
            if el.end() <= from_vcn {
                continue;
            }
            let start = el.vcn.max(from_vcn);
            elements.push(RunlistElement::new(start, el.lcn_at(start), el.end() - start));
        }
        elements.push(RunlistElement::new(end, self.terminator().lcn, 0));
        Self::from_elements_unchecked(coalesce(elements))
    }

    /// Turn the terminator into an end-of-file marker at `total_clusters`,
    /// inserting an undecoded run for any extents not loaded yet.
    pub fn seal(&mut self, total_clusters: i64) -> Result<(), RunlistError> {
        let end = self.end_vcn();
        if end > total_clusters {
            error!(
                invariant = "runlist.end<=allocated_clusters",
                end,
                total_clusters,
                "runlist_invariant_violation"
            );
            return Err(RunlistError::corrupt(format!(
                "runlist ends at vcn {end} past allocation of {total_clusters} clusters"
            )));
        }
        self.elements.pop();
        if end < total_clusters {
            match self.elements.last_mut() {
                Some(last) if last.lcn == Lcn::NotMapped => last.length += total_clusters - end,
                _ => self.elements.push(RunlistElement::new(
                    end,
                    Lcn::NotMapped,
                    total_clusters - end,
                )),
            }
        }
        self.elements
            .push(RunlistElement::new(total_clusters, Lcn::EndOfFile, 0));
        Ok(())
    }

    /// Check every structural invariant.
    pub fn validate(&self) -> Result<(), RunlistError> {
        Self::check(&self.elements)
    }

    fn check(elements: &[RunlistElement]) -> Result<(), RunlistError> {
        let Some((last, runs)) = elements.split_last() else {
            return Err(RunlistError::corrupt("runlist has no terminator"));
        };
        if last.length != 0 || !matches!(last.lcn, Lcn::EndOfFile | Lcn::NotMapped) {
            return Err(RunlistError::corrupt("runlist terminator malformed"));
        }
        let mut expected = 0_i64;
        for el in runs {
            if el.vcn != expected {
                return Err(RunlistError::corrupt(format!(
                    "gap or overlap at vcn {} (expected {expected})",
                    el.vcn
                )));
            }
            if el.length <= 0 {
                return Err(RunlistError::corrupt(format!(
                    "non-positive run length at vcn {}",
                    el.vcn
                )));
            }
            match el.lcn {
                Lcn::Real(lcn) if lcn < 0 => {
                    return Err(RunlistError::corrupt(format!(
                        "negative lcn at vcn {}",
                        el.vcn
                    )));
                }
                Lcn::Real(_) | Lcn::Hole | Lcn::NotMapped => {}
                Lcn::EndOfFile | Lcn::Error => {
                    return Err(RunlistError::corrupt(format!(
                        "sentinel {} inside runlist at vcn {}",
                        el.lcn, el.vcn
                    )));
                }
            }
            expected = el
                .vcn
                .checked_add(el.length)
                .ok_or_else(|| RunlistError::corrupt("vcn overflow"))?;
        }
        if last.vcn != expected {
            return Err(RunlistError::corrupt(format!(
                "terminator at vcn {} (expected {expected})",
                last.vcn
            )));
        }
        Ok(())
    }
}

/// Join adjacent runs that continue each other.
pub(crate) fn coalesce(elements: Vec<RunlistElement>) -> Vec<RunlistElement> {
    let mut out: Vec<RunlistElement> = Vec::with_capacity(elements.len());
    for el in elements {
        if el.length == 0 {
            out.push(el);
            continue;
        }
        match out.last_mut() {
            Some(prev) if prev.length > 0 && prev.joins(&el) => prev.length += el.length,
            _ => out.push(el),
        }
    }
    out
}
