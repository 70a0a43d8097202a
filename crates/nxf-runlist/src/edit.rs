//! Structural edits: merge a decoded or freshly allocated fragment, truncate,
//! and punch holes.
//!
//! Every edit returns a runlist that still starts at VCN 0 and covers its
//! whole range with explicit runs, so coverage holds after any successful
//! call.

use crate::{Runlist, RunlistElement, RunlistError, coalesce};
use nxf_types::Lcn;
use std::cmp::Ordering;
use tracing::{debug, error, trace};

impl Runlist {
    /// LCN at `vcn` for overlay purposes: anything this list does not
    /// describe counts as undecoded.
    fn overlay_lcn(&self, vcn: i64) -> Lcn {
        self.find_element(vcn)
            .map_or(Lcn::NotMapped, |el| el.lcn_at(vcn))
    }

    /// Overlay `fragment` onto this runlist.
    ///
    /// A VCN takes the fragment's mapping where this list has it undecoded or
    /// does not reach it, and keeps its own mapping where the fragment is
    /// undecoded. Two definitive mappings that differ are a contradiction.
    pub fn merge(&self, fragment: &Runlist) -> Result<Runlist, RunlistError> {
        let end = self.end_vcn().max(fragment.end_vcn());
        let mut cuts: Vec<i64> = self
            .elements()
            .iter()
            .chain(fragment.elements())
            .map(|el| el.vcn)
            .collect();
        cuts.push(end);
        cuts.sort_unstable();
        cuts.dedup();

        let mut merged = Vec::with_capacity(cuts.len());
        for window in cuts.windows(2) {
            let (start, stop) = (window[0], window[1]);
            let lcn = match (self.overlay_lcn(start), fragment.overlay_lcn(start)) {
                (Lcn::NotMapped, theirs) => theirs,
                (ours, Lcn::NotMapped) => ours,
                (ours, theirs) if ours == theirs => ours,
                (ours, theirs) => {
                    error!(
                        invariant = "merge.no_conflicting_mapping",
                        vcn = start,
                        existing = %ours,
                        incoming = %theirs,
                        "runlist_invariant_violation"
                    );
                    return Err(RunlistError::Contradiction { vcn: start });
                }
            };
            merged.push(RunlistElement::new(start, lcn, stop - start));
        }

        let terminator = match self.end_vcn().cmp(&fragment.end_vcn()) {
            Ordering::Greater => self.terminator().lcn,
            Ordering::Less => fragment.terminator().lcn,
            Ordering::Equal if self.is_complete() || fragment.is_complete() => Lcn::EndOfFile,
            Ordering::Equal => Lcn::NotMapped,
        };
        merged.push(RunlistElement::new(end, terminator, 0));

        let merged = coalesce(merged);
        debug!(
            runs = merged.len() - 1,
            end_vcn = end,
            complete = terminator == Lcn::EndOfFile,
            "runlist_merge"
        );
        Ok(Runlist::from_elements_unchecked(merged))
    }

    /// Drop everything at or after `end_vcn`, splitting a straddling run.
    /// Growing past the current end appends a hole. The terminator becomes
    /// end-of-file.
    pub fn truncate(&mut self, end_vcn: i64) -> Result<(), RunlistError> {
        let current = self.end_vcn();
        if end_vcn < 0 {
            return Err(RunlistError::OutOfRange {
                start: end_vcn,
                end: end_vcn,
                limit: current,
            });
        }
        if end_vcn > current && !self.is_complete() {
            return Err(RunlistError::NotMapped { vcn: current });
        }

        let mut kept: Vec<RunlistElement> = self
            .runs()
            .iter()
            .take_while(|el| el.vcn < end_vcn)
            .map(|el| RunlistElement::new(el.vcn, el.lcn, el.end().min(end_vcn) - el.vcn))
            .collect();
        if end_vcn > current {
            kept.push(RunlistElement::new(current, Lcn::Hole, end_vcn - current));
        }
        kept.push(RunlistElement::new(end_vcn, Lcn::EndOfFile, 0));
        trace!(from = current, to = end_vcn, "runlist_truncate");
        *self = Runlist::from_elements_unchecked(coalesce(kept));
        Ok(())
    }

    /// Replace `count` clusters starting at `vcn` with a sparse run.
    ///
    /// The range must lie inside the runlist and be fully decoded.
    pub fn punch_hole(&mut self, vcn: i64, count: i64) -> Result<(), RunlistError> {
        if count == 0 {
            return Ok(());
        }
        let end = vcn.checked_add(count).unwrap_or(i64::MAX);
        let limit = self.end_vcn();
        if vcn < 0 || count < 0 || end > limit {
            return Err(RunlistError::OutOfRange {
                start: vcn,
                end,
                limit,
            });
        }
        if let Some(el) = self
            .runs()
            .iter()
            .find(|el| el.lcn == Lcn::NotMapped && el.vcn < end && vcn < el.end())
        {
            return Err(RunlistError::NotMapped {
                vcn: el.vcn.max(vcn),
            });
        }

        let mut out = Vec::with_capacity(self.elements().len() + 2);
        let mut punched = false;
        for el in self.runs() {
            if el.end() <= vcn || el.vcn >= end {
                out.push(*el);
                continue;
            }
            if !punched {
                if el.vcn < vcn {
                    out.push(RunlistElement::new(el.vcn, el.lcn, vcn - el.vcn));
                }
                out.push(RunlistElement::new(vcn, Lcn::Hole, count));
                punched = true;
            }
            if el.end() > end {
                out.push(RunlistElement::new(end, el.lcn_at(end), el.end() - end));
            }
        }
        out.push(*self.terminator());
        trace!(vcn, count, "runlist_punch_hole");
        *self = Runlist::from_elements_unchecked(coalesce(out));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::rl;
    use proptest::prelude::*;

    #[test]
    fn merge_fills_unmapped_placeholder() {
        let old = rl(&[
            (0, Lcn::Real(100), 4),
            (4, Lcn::NotMapped, 6),
            (10, Lcn::EndOfFile, 0),
        ]);
        let fragment = rl(&[
            (0, Lcn::NotMapped, 4),
            (4, Lcn::Real(300), 6),
            (10, Lcn::NotMapped, 0),
        ]);
        let merged = old.merge(&fragment).expect("merge");
        assert_eq!(merged.resolve(3), Lcn::Real(103));
        assert_eq!(merged.resolve(4), Lcn::Real(300));
        assert_eq!(merged.resolve(9), Lcn::Real(305));
        assert!(merged.is_complete());
        merged.validate().expect("valid");
    }

    #[test]
    fn merge_appends_past_end_and_coalesces() {
        let old = rl(&[(0, Lcn::Real(100), 4), (4, Lcn::EndOfFile, 0)]);
        let fragment = rl(&[
            (0, Lcn::NotMapped, 4),
            (4, Lcn::Real(104), 6),
            (10, Lcn::EndOfFile, 0),
        ]);
        let merged = old.merge(&fragment).expect("merge");
        assert_eq!(
            merged.elements(),
            &[
                RunlistElement::new(0, Lcn::Real(100), 10),
                RunlistElement::new(10, Lcn::EndOfFile, 0),
            ]
        );
    }

    #[test]
    fn merge_detects_contradiction() {
        let old = rl(&[(0, Lcn::Real(100), 4), (4, Lcn::EndOfFile, 0)]);
        let conflicting = rl(&[
            (0, Lcn::NotMapped, 2),
            (2, Lcn::Real(700), 2),
            (4, Lcn::EndOfFile, 0),
        ]);
        assert_eq!(
            old.merge(&conflicting),
            Err(RunlistError::Contradiction { vcn: 2 })
        );

        let hole_vs_real = rl(&[(0, Lcn::Hole, 4), (4, Lcn::EndOfFile, 0)]);
        assert_eq!(
            old.merge(&hole_vs_real),
            Err(RunlistError::Contradiction { vcn: 0 })
        );
    }

    #[test]
    fn merge_accepts_identical_overlap() {
        let old = rl(&[(0, Lcn::Real(100), 4), (4, Lcn::NotMapped, 0)]);
        let same = rl(&[
            (0, Lcn::NotMapped, 2),
            (2, Lcn::Real(102), 4),
            (6, Lcn::EndOfFile, 0),
        ]);
        let merged = old.merge(&same).expect("merge");
        assert_eq!(merged.resolve(5), Lcn::Real(105));
        assert_eq!(merged.end_vcn(), 6);
        assert!(merged.is_complete());
    }

    #[test]
    fn truncate_splits_straddling_run() {
        let mut list = rl(&[
            (0, Lcn::Real(100), 4),
            (4, Lcn::Real(500), 4),
            (8, Lcn::EndOfFile, 0),
        ]);
        list.truncate(6).expect("truncate");
        assert_eq!(list.end_vcn(), 6);
        assert_eq!(list.resolve(5), Lcn::Real(501));
        assert_eq!(list.resolve(6), Lcn::EndOfFile);
        assert_eq!(list.real_clusters(), 6);
    }

    #[test]
    fn truncate_extends_with_hole() {
        let mut list = rl(&[(0, Lcn::Real(100), 4), (4, Lcn::EndOfFile, 0)]);
        list.truncate(9).expect("extend");
        assert_eq!(list.resolve(8), Lcn::Hole);
        assert_eq!(list.end_vcn(), 9);

        let mut undecoded = rl(&[(0, Lcn::Real(100), 4), (4, Lcn::NotMapped, 0)]);
        assert!(undecoded.truncate(9).is_err());
        undecoded.truncate(2).expect("shrink is fine");
        assert!(undecoded.is_complete());
    }

    #[test]
    fn punch_hole_splits_neighbours() {
        let mut list = rl(&[(0, Lcn::Real(100), 10), (10, Lcn::EndOfFile, 0)]);
        list.punch_hole(3, 4).expect("punch");
        assert_eq!(
            list.elements(),
            &[
                RunlistElement::new(0, Lcn::Real(100), 3),
                RunlistElement::new(3, Lcn::Hole, 4),
                RunlistElement::new(7, Lcn::Real(107), 3),
                RunlistElement::new(10, Lcn::EndOfFile, 0),
            ]
        );
    }

    #[test]
    fn punch_hole_rejects_bad_ranges() {
        let mut list = rl(&[
            (0, Lcn::Real(100), 4),
            (4, Lcn::NotMapped, 4),
            (8, Lcn::EndOfFile, 0),
        ]);
        assert_eq!(
            list.punch_hole(2, 4),
            Err(RunlistError::NotMapped { vcn: 4 })
        );
        assert!(matches!(
            list.punch_hole(6, 10),
            Err(RunlistError::OutOfRange { .. })
        ));
        assert!(list.punch_hole(-1, 2).is_err());
        list.punch_hole(0, 0).expect("empty punch is a no-op");
    }

    fn model(list: &Runlist) -> Vec<Lcn> {
        (0..list.end_vcn()).map(|vcn| list.resolve(vcn)).collect()
    }

    fn arb_small_runlist() -> impl Strategy<Value = Runlist> {
        proptest::collection::vec((1_i64..8, prop::option::of(0_i64..64)), 0..12).prop_map(
            |runs| {
                let mut elements = Vec::new();
                let mut vcn = 0;
                for (length, lcn) in runs {
                    elements.push(RunlistElement::new(
                        vcn,
                        lcn.map_or(Lcn::Hole, |lcn| Lcn::Real(lcn * 1000)),
                        length,
                    ));
                    vcn += length;
                }
                elements.push(RunlistElement::new(vcn, Lcn::EndOfFile, 0));
                Runlist::from_elements(elements).expect("generated runlist")
            },
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn punch_and_truncate_match_model(
            list in arb_small_runlist(),
            punches in proptest::collection::vec((0_i64..100, 1_i64..10), 0..6),
            new_end in 0_i64..120,
        ) {
            let mut list = list;
            let mut expected = model(&list);
            for (vcn, count) in punches {
                let end = vcn + count;
                if end > list.end_vcn() {
                    prop_assert!(list.punch_hole(vcn, count).is_err());
                    continue;
                }
                list.punch_hole(vcn, count).unwrap();
                for slot in &mut expected[usize::try_from(vcn).unwrap()..usize::try_from(end).unwrap()] {
                    *slot = Lcn::Hole;
                }
                list.validate().unwrap();
                prop_assert_eq!(model(&list), expected.clone());
            }

            list.truncate(new_end).unwrap();
            expected.resize(usize::try_from(new_end).unwrap(), Lcn::Hole);
            list.validate().unwrap();
            prop_assert_eq!(model(&list), expected);
            prop_assert!(list.is_complete());
        }

        #[test]
        fn merge_with_disjoint_tail_preserves_both(
            list in arb_small_runlist(),
            tail_len in 1_i64..20,
            lcn in 0_i64..1_000,
        ) {
            let end = list.end_vcn();
            let fragment = Runlist::from_elements(vec![
                RunlistElement::new(0, Lcn::NotMapped, end.max(1)),
                RunlistElement::new(end.max(1), Lcn::Real(lcn + 100_000), tail_len),
                RunlistElement::new(end.max(1) + tail_len, Lcn::EndOfFile, 0),
            ]).unwrap();
            let mut head = list.clone();
            if end == 0 {
                head.truncate(1).unwrap();
            }
            let merged = head.merge(&fragment).unwrap();
            merged.validate().unwrap();
            for vcn in 0..head.end_vcn() {
                prop_assert_eq!(merged.resolve(vcn), head.resolve(vcn));
            }
            for offset in 0..tail_len {
                prop_assert_eq!(
                    merged.resolve(end.max(1) + offset),
                    Lcn::Real(lcn + 100_000 + offset)
                );
            }
            prop_assert!(merged.is_complete());
        }
    }
}
