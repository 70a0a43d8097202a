//! Attribute lookup inside a file's base and extension records.
//!
//! A file whose attributes fit in its base record is searched directly.
//! Otherwise the base record carries an attribute list naming, for every
//! attribute extent, the record that holds it; the search walks that list
//! and checks out one extension record at a time.

use crate::Volume;
use crate::inode::{AttrListState, NtAttr, NtInode};
use crate::record::LockedRecord;
use crate::stream::read_runs;
use crate::upgrade::read_or_upgrade;
use nxf_error::{NxfError, Result};
use nxf_ondisk::{
    AttrListEntry, AttrRecord, CaseSensitivity, NameCollation, attrs, first_out_of_order,
    parse_attr_list,
};
use nxf_runlist::{Runlist, decode_mapping_pairs};
use nxf_types::{AttrType, RecordRef, display_name};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, trace};

// ── Queries ─────────────────────────────────────────────────────────────────

/// What to look for: an attribute by type and name, the extent covering
/// `vcn`, and optionally one specific instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrQuery {
    pub ty: AttrType,
    pub name: Vec<u16>,
    pub case: CaseSensitivity,
    pub vcn: i64,
    pub instance: Option<u16>,
}

impl AttrQuery {
    /// Unnamed attribute of `ty`, first extent.
    #[must_use]
    pub fn new(ty: AttrType) -> Self {
        Self::named(ty, &[])
    }

    #[must_use]
    pub fn named(ty: AttrType, name: &[u16]) -> Self {
        Self {
            ty,
            name: name.to_vec(),
            case: CaseSensitivity::Sensitive,
            vcn: 0,
            instance: None,
        }
    }

    #[must_use]
    pub fn case(mut self, case: CaseSensitivity) -> Self {
        self.case = case;
        self
    }

    #[must_use]
    pub fn at_vcn(mut self, vcn: i64) -> Self {
        self.vcn = vcn;
        self
    }

    #[must_use]
    pub fn instance(mut self, instance: u16) -> Self {
        self.instance = Some(instance);
        self
    }
}

/// Search one record's attributes for `query`.
///
/// Attributes are sorted by type, so the scan stops at the first larger
/// type. A type smaller than its predecessor means the record is corrupt.
pub fn find_in_record(
    record: &[u8],
    record_number: u64,
    from: Option<usize>,
    query: &AttrQuery,
    collation: &dyn NameCollation,
) -> Result<Option<AttrRecord>> {
    let parse = |err: nxf_types::ParseError| NxfError::corruption(record_number, err.to_string());
    let mut previous = AttrType(0);
    for attr in attrs(record, from).map_err(parse)? {
        let attr = attr.map_err(parse)?;
        if attr.ty < previous {
            error!(
                invariant = "record.attrs_ascending",
                record = record_number,
                offset = attr.offset,
                ty = %attr.ty,
                previous = %previous,
                "record_invariant_violation"
            );
            return Err(NxfError::corruption(
                record_number,
                format!("attribute {} at {:#x} follows {}", attr.ty, attr.offset, previous),
            ));
        }
        previous = attr.ty;
        if attr.ty > query.ty {
            return Ok(None);
        }
        if attr.ty != query.ty || !collation.names_equal(&attr.name, &query.name, query.case) {
            continue;
        }
        if query.instance.is_some_and(|instance| instance != attr.instance) {
            continue;
        }
        if extent_covers(&attr, query.vcn) {
            return Ok(Some(attr));
        }
    }
    Ok(None)
}

/// Like [`AttrRecord::covers_vcn`], but an empty extent (highest below
/// lowest) still answers for its lowest VCN.
fn extent_covers(attr: &AttrRecord, vcn: i64) -> bool {
    match attr.non_resident() {
        Some(header) if header.highest_vcn < header.lowest_vcn => vcn == header.lowest_vcn,
        _ => attr.covers_vcn(vcn),
    }
}

// ── Stateful search ─────────────────────────────────────────────────────────

/// Progress of an [`AttrSearch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchState {
    NotStarted,
    ScanningBaseRecord,
    ScanningExtensionRecord(RecordRef),
    Found,
    NotFound,
    End,
}

/// An attribute located by a search, and the record holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundAttr {
    pub record: RecordRef,
    pub attr: AttrRecord,
}

/// Search context over one file.
///
/// Keeps the base record checked out for its whole life and at most one
/// extension record besides; moving to another extension releases the
/// previous one first.
pub struct AttrSearch<'v> {
    volume: &'v Volume,
    inode: Arc<NtInode>,
    state: SearchState,
    base: Option<LockedRecord>,
    extension: Option<LockedRecord>,
    found_in_extension: bool,
    next_entry: usize,
    next_offset: Option<usize>,
}

impl std::fmt::Debug for AttrSearch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttrSearch")
            .field("inode", &self.inode.base())
            .field("state", &self.state)
            .field("extension", &self.extension.as_ref().map(LockedRecord::number))
            .finish_non_exhaustive()
    }
}

impl<'v> AttrSearch<'v> {
    fn new(volume: &'v Volume, inode: Arc<NtInode>) -> Self {
        Self {
            volume,
            inode,
            state: SearchState::NotStarted,
            base: None,
            extension: None,
            found_in_extension: false,
            next_entry: 0,
            next_offset: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SearchState {
        self.state
    }

    #[must_use]
    pub fn inode(&self) -> &Arc<NtInode> {
        &self.inode
    }

    /// Restart enumeration from the first attribute.
    pub fn rewind(&mut self) {
        self.state = SearchState::NotStarted;
        self.next_entry = 0;
        self.next_offset = None;
        self.found_in_extension = false;
    }

    /// Find the attribute extent matching `query`.
    pub fn find(&mut self, query: &AttrQuery) -> Result<FoundAttr> {
        let result = self.find_inner(query);
        if matches!(result, Err(NxfError::NotFound(_))) {
            self.state = SearchState::NotFound;
        }
        self.volume.observe(result)
    }

    /// Next attribute in record order (or attribute-list order), or
    /// `EndOfAttributes` once every attribute has been visited.
    pub fn next_attribute(&mut self) -> Result<FoundAttr> {
        let result = self.next_inner();
        self.volume.observe(result)
    }

    /// Record holding the attribute last found, checked out. Ends the search.
    pub fn into_found_record(mut self) -> Result<LockedRecord> {
        if self.state != SearchState::Found {
            return Err(NxfError::Invalid(format!(
                "no attribute found; search is {:?}",
                self.state
            )));
        }
        let record = if self.found_in_extension {
            self.extension.take()
        } else {
            self.base.take()
        };
        record.ok_or_else(|| NxfError::Invalid("search holds no record".into()))
    }

    /// Bytes of the record holding the attribute last found.
    #[must_use]
    pub fn found_bytes(&self) -> Option<&[u8]> {
        if self.state != SearchState::Found {
            return None;
        }
        let record = if self.found_in_extension {
            self.extension.as_ref()
        } else {
            self.base.as_ref()
        };
        record.map(LockedRecord::bytes)
    }

    fn find_inner(&mut self, query: &AttrQuery) -> Result<FoundAttr> {
        self.state = SearchState::ScanningBaseRecord;
        match self.attr_list()? {
            None => {
                let volume = self.volume;
                let reference = self.inode.base();
                let base = self.base_record()?;
                let found = find_in_record(
                    base.bytes(),
                    reference.number.0,
                    None,
                    query,
                    &*volume.collation,
                )?;
                match found {
                    Some(attr) => {
                        self.release_extension();
                        self.found(reference, attr, false)
                    }
                    None => Err(not_found(query, reference)),
                }
            }
            Some(list) => self.find_via_list(&list, query),
        }
    }

    fn found(&mut self, record: RecordRef, attr: AttrRecord, in_extension: bool) -> Result<FoundAttr> {
        self.state = SearchState::Found;
        self.found_in_extension = in_extension;
        trace!(
            base = self.inode.base().number.0,
            record = record.number.0,
            ty = %attr.ty,
            instance = attr.instance,
            "attr_found"
        );
        Ok(FoundAttr { record, attr })
    }

    /// Walk the attribute list for the extent covering `query.vcn`.
    fn find_via_list(&mut self, list: &[AttrListEntry], query: &AttrQuery) -> Result<FoundAttr> {
        let collation = Arc::clone(&self.volume.collation);
        let base = self.inode.base();
        for (idx, entry) in list.iter().enumerate() {
            if entry.ty > query.ty {
                break;
            }
            if entry.ty != query.ty || !collation.names_equal(&entry.name, &query.name, query.case)
            {
                continue;
            }
            if query.instance.is_some_and(|instance| instance != entry.instance) {
                continue;
            }
            // A later extent of the same attribute that starts at or before
            // the wanted vcn is a better candidate.
            if let Some(next) = list.get(idx + 1) {
                if next.ty == entry.ty && next.name == entry.name && next.lowest_vcn <= query.vcn {
                    continue;
                }
            }
            if entry.lowest_vcn > query.vcn {
                break;
            }
            let found = self.read_entry(entry)?;
            if !extent_covers(&found.attr, query.vcn) {
                return Err(not_found(query, base));
            }
            return Ok(found);
        }
        Err(not_found(query, base))
    }

    /// Check out the record named by `entry` and find its attribute by
    /// instance, revalidating the reference first.
    fn read_entry(&mut self, entry: &AttrListEntry) -> Result<FoundAttr> {
        let volume = self.volume;
        let base = self.inode.base();
        let number = entry.record.number.0;
        let in_extension = number != base.number.0;
        let record = if in_extension {
            self.state = SearchState::ScanningExtensionRecord(entry.record);
            self.extension_record(number)?
        } else {
            self.state = SearchState::ScanningBaseRecord;
            self.base_record()?
        };
        let header = record.header()?;
        let stale = !header.in_use()
            || header.sequence != entry.record.sequence
            || (in_extension && header.base_record.number != base.number);
        if stale {
            error!(
                invariant = "attr_list.entry_matches_record",
                base = base.number.0,
                record = number,
                expected_sequence = entry.record.sequence,
                actual_sequence = header.sequence,
                in_use = header.in_use(),
                owner = header.base_record.number.0,
                "attr_list_stale_entry"
            );
            return Err(NxfError::corruption(
                number,
                format!(
                    "attribute list of {base} names {}, record holds sequence {} owned by {}",
                    entry.record, header.sequence, header.base_record
                ),
            ));
        }
        let exact = AttrQuery {
            ty: entry.ty,
            name: entry.name.clone(),
            case: CaseSensitivity::Sensitive,
            vcn: entry.lowest_vcn,
            instance: Some(entry.instance),
        };
        let Some(attr) =
            find_in_record(record.bytes(), number, None, &exact, &*volume.collation)?
        else {
            error!(
                invariant = "attr_list.entry_has_attribute",
                base = base.number.0,
                record = number,
                ty = %entry.ty,
                instance = entry.instance,
                "attr_list_dangling_entry"
            );
            return Err(NxfError::corruption(
                number,
                format!(
                    "no {} instance {} at vcn {} for list entry of {base}",
                    entry.ty, entry.instance, entry.lowest_vcn
                ),
            ));
        };
        let reference = RecordRef::new(number, header.sequence);
        self.found(reference, attr, in_extension)
    }

    fn next_inner(&mut self) -> Result<FoundAttr> {
        if self.state == SearchState::End {
            return Err(NxfError::EndOfAttributes);
        }
        match self.attr_list()? {
            None => {
                self.state = SearchState::ScanningBaseRecord;
                let from = self.next_offset;
                let base = self.base_record()?;
                let number = base.number();
                let next = attrs(base.bytes(), from)
                    .map_err(|err| NxfError::corruption(number, err.to_string()))?
                    .next();
                match next {
                    Some(Ok(attr)) => {
                        self.next_offset = Some(attr.end());
                        let reference = self.inode.base();
                        self.release_extension();
                        self.found(reference, attr, false)
                    }
                    Some(Err(err)) => Err(NxfError::corruption(number, err.to_string())),
                    None => {
                        self.state = SearchState::End;
                        Err(NxfError::EndOfAttributes)
                    }
                }
            }
            Some(list) => {
                let Some(entry) = list.get(self.next_entry) else {
                    self.release_extension();
                    self.state = SearchState::End;
                    return Err(NxfError::EndOfAttributes);
                };
                self.next_entry += 1;
                self.read_entry(entry)
            }
        }
    }

    // ── Record management ───────────────────────────────────────────────

    fn base_record(&mut self) -> Result<&LockedRecord> {
        if self.base.is_none() {
            let reference = self.inode.base();
            let record = self.volume.checkout_record(reference.number.0)?;
            let header = record.header()?;
            if !header.in_use() || header.sequence != reference.sequence || !header.is_base() {
                return Err(NxfError::NotFound(format!(
                    "{reference} is stale: record holds sequence {}",
                    header.sequence
                )));
            }
            self.base = Some(record);
        }
        self.base
            .as_ref()
            .ok_or_else(|| NxfError::Invalid("base record not held".into()))
    }

    fn extension_record(&mut self, number: u64) -> Result<&LockedRecord> {
        if self.extension.as_ref().is_some_and(|r| r.number() != number) {
            self.release_extension();
        }
        if self.extension.is_none() {
            self.extension = Some(self.volume.checkout_record(number)?);
        }
        self.extension
            .as_ref()
            .ok_or_else(|| NxfError::Invalid("extension record not held".into()))
    }

    fn release_extension(&mut self) {
        if let Some(record) = self.extension.take() {
            trace!(record = record.number(), "extension_released");
        }
    }

    /// The file's attribute list, loaded from the base record on first use.
    fn attr_list(&mut self) -> Result<Option<Arc<Vec<AttrListEntry>>>> {
        match self.inode.attr_list_state() {
            AttrListState::Absent => return Ok(None),
            AttrListState::Present(list) => return Ok(Some(list)),
            AttrListState::Unknown => {}
        }
        let volume = self.volume;
        let base = self.base_record()?;
        let number = base.number();
        let query = AttrQuery::new(AttrType::ATTRIBUTE_LIST);
        let Some(attr) = find_in_record(base.bytes(), number, None, &query, &*volume.collation)?
        else {
            self.inode.set_attr_list(AttrListState::Absent);
            return Ok(None);
        };
        let bytes = match attr.value(base.bytes()) {
            Some(value) => value.to_vec(),
            None => volume.read_non_resident_list(&attr, base.bytes(), number)?,
        };
        let entries =
            parse_attr_list(&bytes).map_err(|err| NxfError::corruption(number, err.to_string()))?;
        if let Some(idx) = first_out_of_order(&entries, &*volume.collation) {
            error!(
                invariant = "attr_list.sorted",
                record = number,
                entry = idx,
                "attr_list_out_of_order"
            );
            return Err(NxfError::corruption(
                number,
                format!("attribute list entry {idx} is out of order"),
            ));
        }
        debug!(record = number, entries = entries.len(), "attr_list_loaded");
        let list = Arc::new(entries);
        self.inode
            .set_attr_list(AttrListState::Present(Arc::clone(&list)));
        Ok(Some(list))
    }
}

fn not_found(query: &AttrQuery, base: RecordRef) -> NxfError {
    NxfError::NotFound(format!(
        "{} {:?} at vcn {} in {base}",
        query.ty,
        display_name(&query.name),
        query.vcn
    ))
}

// ── Extent mapping ──────────────────────────────────────────────────────────

impl Volume {
    /// Start a search over the file whose base record is `base`.
    pub fn search(&self, base: RecordRef) -> Result<AttrSearch<'_>> {
        let inode = self.inode_entry(base)?;
        Ok(AttrSearch::new(self, inode))
    }

    /// Value of a non-resident attribute list. Lists are never split across
    /// extents.
    fn read_non_resident_list(&self, attr: &AttrRecord, record: &[u8], number: u64) -> Result<Vec<u8>> {
        let (Some(header), Some(pairs)) = (attr.non_resident(), attr.mapping_pairs(record)) else {
            return Err(NxfError::corruption(number, "attribute list header"));
        };
        let mut runlist =
            decode_mapping_pairs(pairs, header.lowest_vcn).map_err(|err| err.into_nxf(number))?;
        let total = self.geometry.cluster_size.bytes_to_clusters_ceil(header.allocated_size);
        runlist.seal(total).map_err(|err| err.into_nxf(number))?;
        if runlist.first_unmapped_vcn().is_some() {
            return Err(NxfError::Unsupported(format!(
                "attribute list of record {number} spans several extents"
            )));
        }
        let len = usize::try_from(header.data_size)
            .map_err(|_| NxfError::corruption(number, "attribute list size"))?;
        let mut buf = vec![0_u8; len];
        read_runs(&*self.cache, &self.geometry, &runlist, 0, &mut buf)?;
        Ok(buf)
    }

    /// Decode whatever extents are needed so `[start_vcn, end_vcn)` of
    /// `attr` has no undecoded runs.
    pub(crate) fn ensure_mapped(&self, attr: &NtAttr, start_vcn: i64, end_vcn: i64) -> Result<()> {
        read_or_upgrade(
            &attr.runlist,
            |rl| (!rl.has_unmapped_in(start_vcn, end_vcn)).then_some(()),
            |rl| self.map_while(attr, rl, |rl| first_unmapped_in(rl, start_vcn, end_vcn)),
        )
    }

    /// Decode every extent of `attr`. Caller holds the runlist write lock.
    pub(crate) fn map_all(&self, attr: &NtAttr, runlist: &mut Runlist) -> Result<()> {
        self.map_while(attr, runlist, Runlist::first_unmapped_vcn)
    }

    fn map_while(
        &self,
        attr: &NtAttr,
        runlist: &mut Runlist,
        next: impl Fn(&Runlist) -> Option<i64>,
    ) -> Result<()> {
        while let Some(vcn) = next(runlist) {
            let before = runlist.clone();
            self.map_vcn(attr, runlist, vcn)?;
            if *runlist == before {
                return Err(NxfError::corruption(
                    attr.base().number.0,
                    format!("extent for vcn {vcn} of {} adds no mapping", attr.ty()),
                ));
            }
        }
        Ok(())
    }

    /// Find the extent of `attr` holding `vcn`, decode its mapping pairs
    /// and merge them into `runlist`.
    pub(crate) fn map_vcn(&self, attr: &NtAttr, runlist: &mut Runlist, vcn: i64) -> Result<()> {
        let mut search = self.search(attr.base())?;
        let query = AttrQuery::named(attr.ty(), attr.name()).at_vcn(vcn);
        let found = search.find(&query).map_err(|err| match err {
            NxfError::NotFound(detail) => NxfError::corruption(
                attr.base().number.0,
                format!("no extent maps allocated vcn {vcn}: {detail}"),
            ),
            other => other,
        })?;
        let number = found.record.number.0;
        let record = search
            .found_bytes()
            .ok_or_else(|| NxfError::Invalid("search lost its record".into()))?;
        let (Some(header), Some(pairs)) = (found.attr.non_resident(), found.attr.mapping_pairs(record))
        else {
            return Err(NxfError::corruption(
                number,
                format!("resident extent of non-resident {}", attr.ty()),
            ));
        };
        if header.lowest_vcn != 0 && !header.sizes_are_zero() {
            let sizes = attr.sizes();
            if header.allocated_size != sizes.allocated
                || header.data_size != sizes.data
                || header.initialized_size != sizes.initialized
            {
                error!(
                    invariant = "extent.sizes_match_first_extent",
                    record = number,
                    lowest_vcn = header.lowest_vcn,
                    "extent_size_mismatch"
                );
                return Err(NxfError::corruption(
                    number,
                    format!(
                        "extent at vcn {} carries sizes that differ from the first extent",
                        header.lowest_vcn
                    ),
                ));
            }
        }
        let fragment =
            decode_mapping_pairs(pairs, header.lowest_vcn).map_err(|err| err.into_nxf(number))?;
        if fragment.end_vcn() != header.highest_vcn + 1 {
            return Err(NxfError::corruption(
                number,
                format!(
                    "mapping pairs end at vcn {}, extent claims {}",
                    fragment.end_vcn(),
                    header.highest_vcn + 1
                ),
            ));
        }
        *runlist = runlist.merge(&fragment).map_err(|err| err.into_nxf(number))?;
        trace!(
            record = number,
            lowest_vcn = header.lowest_vcn,
            highest_vcn = header.highest_vcn,
            "extent_mapped"
        );
        Ok(())
    }
}

fn first_unmapped_in(runlist: &Runlist, start: i64, end: i64) -> Option<i64> {
    runlist
        .runs()
        .iter()
        .find(|el| el.lcn == nxf_types::Lcn::NotMapped && el.vcn < end && start < el.end())
        .map(|el| el.vcn.max(start))
}
