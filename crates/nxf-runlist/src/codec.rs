//! Mapping-pairs codec.
//!
//! Each pair starts with a control byte: the low nibble is the byte count of
//! the run length that follows, the high nibble the byte count of the signed
//! LCN delta after it. Both fields are little-endian two's complement. A delta
//! width of zero marks a sparse run. The LCN delta is relative to the previous
//! real LCN, so holes do not move the baseline. A zero control byte ends the
//! array.

use crate::{Runlist, RunlistElement, RunlistError};
use nxf_types::Lcn;

/// Decode a mapping-pairs array describing clusters from `lowest_vcn`.
///
/// VCNs below `lowest_vcn` come back as a leading [`Lcn::NotMapped`] run and
/// the terminator is `NotMapped`; call [`Runlist::seal`] once the total
/// attribute length is known.
pub fn decode_mapping_pairs(bytes: &[u8], lowest_vcn: i64) -> Result<Runlist, RunlistError> {
    if lowest_vcn < 0 {
        return Err(RunlistError::corrupt(format!(
            "negative lowest vcn {lowest_vcn}"
        )));
    }
    let mut elements = Vec::new();
    if lowest_vcn > 0 {
        elements.push(RunlistElement::new(0, Lcn::NotMapped, lowest_vcn));
    }

    let mut vcn = lowest_vcn;
    let mut lcn = 0_i64;
    let mut pos = 0_usize;
    loop {
        let Some(&control) = bytes.get(pos) else {
            return Err(RunlistError::corrupt(format!(
                "missing terminator after {} bytes",
                bytes.len()
            )));
        };
        if control == 0 {
            break;
        }
        let length_width = usize::from(control & 0x0F);
        let delta_width = usize::from(control >> 4);
        if length_width == 0 || length_width > 8 {
            return Err(RunlistError::corrupt(format!(
                "length field width {length_width} at byte {pos}"
            )));
        }
        if delta_width > 8 {
            return Err(RunlistError::corrupt(format!(
                "lcn field width {delta_width} at byte {pos}"
            )));
        }
        pos += 1;

        let length = read_signed(bytes, pos, length_width)?;
        pos += length_width;
        if length <= 0 {
            return Err(RunlistError::corrupt(format!(
                "non-positive run length {length} at vcn {vcn}"
            )));
        }

        let run_lcn = if delta_width == 0 {
            Lcn::Hole
        } else {
            let delta = read_signed(bytes, pos, delta_width)?;
            pos += delta_width;
            lcn = lcn
                .checked_add(delta)
                .filter(|next| *next >= 0)
                .ok_or_else(|| {
                    RunlistError::corrupt(format!("lcn delta {delta} underflows at vcn {vcn}"))
                })?;
            Lcn::Real(lcn)
        };

        elements.push(RunlistElement::new(vcn, run_lcn, length));
        vcn = vcn
            .checked_add(length)
            .ok_or_else(|| RunlistError::corrupt(format!("vcn overflow after {vcn}")))?;
    }
    elements.push(RunlistElement::new(vcn, Lcn::NotMapped, 0));
    Ok(Runlist::from_elements_unchecked(elements))
}

fn read_signed(bytes: &[u8], pos: usize, width: usize) -> Result<i64, RunlistError> {
    let field = pos
        .checked_add(width)
        .and_then(|end| bytes.get(pos..end))
        .ok_or_else(|| RunlistError::corrupt(format!("truncated {width}-byte field at {pos}")))?;
    let fill = if field[width - 1] & 0x80 != 0 { 0xFF } else { 0 };
    let mut raw = [fill; 8];
    raw[..width].copy_from_slice(field);
    Ok(i64::from_le_bytes(raw))
}

/// Fewest bytes that hold `value` as two's complement.
fn signed_width(value: i64) -> usize {
    let mut width = 1;
    while width < 8 {
        let bits = width * 8;
        let min = -(1_i64 << (bits - 1));
        let max = (1_i64 << (bits - 1)) - 1;
        if (min..=max).contains(&value) {
            break;
        }
        width += 1;
    }
    width
}

fn put_signed(out: &mut [u8], value: i64, width: usize) {
    out[..width].copy_from_slice(&value.to_le_bytes()[..width]);
}

/// One encoded pair: control byte plus fields.
struct Pair {
    vcn: i64,
    length: i64,
    delta: Option<i64>,
}

impl Pair {
    fn size(&self) -> usize {
        1 + signed_width(self.length) + self.delta.map_or(0, signed_width)
    }

    #[expect(clippy::cast_possible_truncation)]
    fn write(&self, out: &mut [u8]) -> usize {
        let length_width = signed_width(self.length);
        let delta_width = self.delta.map_or(0, signed_width);
        out[0] = (length_width as u8) | ((delta_width as u8) << 4);
        put_signed(&mut out[1..], self.length, length_width);
        if let Some(delta) = self.delta {
            put_signed(&mut out[1 + length_width..], delta, delta_width);
        }
        1 + length_width + delta_width
    }
}

impl Runlist {
    /// Pairs covering `[start_vcn, end_vcn)`, or up to the terminator when
    /// `end_vcn` is `None`. The delta baseline starts at zero for every
    /// extent.
    fn pairs(&self, start_vcn: i64, end_vcn: Option<i64>) -> Result<Vec<Pair>, RunlistError> {
        let limit = self.end_vcn();
        let end = end_vcn.unwrap_or(limit);
        if start_vcn < 0 || start_vcn > end || end > limit {
            return Err(RunlistError::OutOfRange {
                start: start_vcn,
                end,
                limit,
            });
        }
        let mut pairs = Vec::new();
        let mut prev_lcn = 0_i64;
        for el in self.runs() {
            if el.end() <= start_vcn {
                continue;
            }
            if el.vcn >= end {
                break;
            }
            let vcn = el.vcn.max(start_vcn);
            let length = el.end().min(end) - vcn;
            let delta = match el.lcn_at(vcn) {
                Lcn::Real(lcn) => {
                    let delta = lcn - prev_lcn;
                    prev_lcn = lcn;
                    Some(delta)
                }
                Lcn::Hole => None,
                Lcn::NotMapped | Lcn::EndOfFile | Lcn::Error => {
                    return Err(RunlistError::NotMapped { vcn });
                }
            };
            pairs.push(Pair { vcn, length, delta });
        }
        Ok(pairs)
    }

    /// Bytes needed to encode `[start_vcn, end_vcn)`, terminator included.
    pub fn encoded_size(&self, start_vcn: i64, end_vcn: Option<i64>) -> Result<usize, RunlistError> {
        Ok(self
            .pairs(start_vcn, end_vcn)?
            .iter()
            .map(Pair::size)
            .sum::<usize>()
            + 1)
    }

    /// Encode `[start_vcn, end_vcn)` into `out`, returning the bytes written
    /// (terminator included).
    ///
    /// When the pairs do not all fit, `out` still receives a valid terminated
    /// prefix and the error carries the first VCN that was left out.
    pub fn encode(
        &self,
        start_vcn: i64,
        end_vcn: Option<i64>,
        out: &mut [u8],
    ) -> Result<usize, RunlistError> {
        let pairs = self.pairs(start_vcn, end_vcn)?;
        if out.is_empty() {
            return Err(RunlistError::BufferTooSmall {
                stop_vcn: start_vcn,
            });
        }
        let mut pos = 0;
        for pair in &pairs {
            if pos + pair.size() + 1 > out.len() {
                out[pos] = 0;
                return Err(RunlistError::BufferTooSmall { stop_vcn: pair.vcn });
            }
            pos += pair.write(&mut out[pos..]);
        }
        out[pos] = 0;
        Ok(pos + 1)
    }

    /// Encode into a freshly sized buffer.
    pub fn encode_to_vec(&self, start_vcn: i64, end_vcn: Option<i64>) -> Result<Vec<u8>, RunlistError> {
        let mut out = vec![0_u8; self.encoded_size(start_vcn, end_vcn)?];
        let written = self.encode(start_vcn, end_vcn, &mut out)?;
        out.truncate(written);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::rl;
    use proptest::prelude::*;

    #[test]
    fn decodes_simple_runs() {
        // 4 clusters at lcn 0x100, 2 sparse, 3 at lcn 0x100 - 0x10.
        let bytes = [0x21, 0x04, 0x00, 0x01, 0x01, 0x02, 0x11, 0x03, 0xF0, 0x00];
        let list = decode_mapping_pairs(&bytes, 0).expect("decode");
        assert_eq!(
            list.elements(),
            &[
                RunlistElement::new(0, Lcn::Real(0x100), 4),
                RunlistElement::new(4, Lcn::Hole, 2),
                RunlistElement::new(6, Lcn::Real(0xF0), 3),
                RunlistElement::new(9, Lcn::NotMapped, 0),
            ]
        );
    }

    #[test]
    fn holes_do_not_move_the_delta_baseline() {
        let list = rl(&[
            (0, Lcn::Real(1000), 1),
            (1, Lcn::Hole, 5),
            (6, Lcn::Real(1001), 1),
            (7, Lcn::EndOfFile, 0),
        ]);
        let bytes = list.encode_to_vec(0, None).expect("encode");
        // Second real run is delta +1 from 1000, not from the hole.
        assert_eq!(bytes, vec![0x21, 0x01, 0xE8, 0x03, 0x01, 0x05, 0x11, 0x01, 0x01, 0x00]);
    }

    #[test]
    fn lowest_vcn_produces_leading_unmapped_run() {
        let bytes = [0x11, 0x02, 0x20, 0x00];
        let list = decode_mapping_pairs(&bytes, 100).expect("decode");
        assert_eq!(list.resolve(99), Lcn::NotMapped);
        assert_eq!(list.resolve(100), Lcn::Real(0x20));
        assert_eq!(list.resolve(101), Lcn::Real(0x21));
        assert_eq!(list.end_vcn(), 102);
    }

    #[test]
    fn rejects_corrupt_arrays() {
        let cases: &[&[u8]] = &[
            &[],                   // no terminator
            &[0x11, 0x04, 0x10],   // run without terminator
            &[0x10, 0x05, 0x00],   // zero-width length
            &[0x19, 0x00],         // 9-byte length
            &[0x91, 0x01, 0x00],   // 9-byte lcn delta
            &[0x11, 0x00, 0x05, 0x00], // zero length
            &[0x11, 0xFF, 0x05, 0x00], // negative length
            &[0x11, 0x01, 0xFF, 0x00], // lcn goes negative
            &[0x21, 0x01, 0x05],   // truncated lcn field
        ];
        for bytes in cases {
            assert!(
                matches!(decode_mapping_pairs(bytes, 0), Err(RunlistError::Corrupt { .. })),
                "expected corrupt for {bytes:02x?}"
            );
        }
        assert!(decode_mapping_pairs(&[0x00], -1).is_err());
    }

    #[test]
    fn delta_of_zero_keeps_a_one_byte_field() {
        let list = rl(&[
            (0, Lcn::Real(7), 1),
            (1, Lcn::Real(7), 1),
            (2, Lcn::EndOfFile, 0),
        ]);
        let bytes = list.encode_to_vec(0, None).expect("encode");
        assert_eq!(bytes, vec![0x11, 0x01, 0x07, 0x11, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn encoded_size_includes_terminator() {
        let list = Runlist::empty();
        assert_eq!(list.encoded_size(0, None).unwrap(), 1);
        let list = rl(&[(0, Lcn::Real(0x80), 0x80), (0x80, Lcn::EndOfFile, 0)]);
        // length 0x80 and lcn 0x80 both need two signed bytes.
        assert_eq!(list.encoded_size(0, None).unwrap(), 1 + 2 + 2 + 1);
    }

    #[test]
    fn encode_range_starts_a_fresh_delta_baseline() {
        let list = rl(&[
            (0, Lcn::Real(500), 100),
            (100, Lcn::Real(900), 50),
            (150, Lcn::EndOfFile, 0),
        ]);
        let bytes = list.encode_to_vec(120, None).expect("encode");
        let decoded = decode_mapping_pairs(&bytes, 120).expect("decode");
        assert_eq!(decoded.resolve(120), Lcn::Real(920));
        assert_eq!(decoded.end_vcn(), 150);

        let head = list.encode_to_vec(0, Some(100)).expect("encode");
        let decoded = decode_mapping_pairs(&head, 0).expect("decode");
        assert_eq!(decoded.end_vcn(), 100);
    }

    #[test]
    fn encode_refuses_unmapped_ranges() {
        let list = rl(&[
            (0, Lcn::Real(5), 2),
            (2, Lcn::NotMapped, 2),
            (4, Lcn::EndOfFile, 0),
        ]);
        assert_eq!(
            list.encoded_size(0, None),
            Err(RunlistError::NotMapped { vcn: 2 })
        );
        assert!(list.encoded_size(0, Some(2)).is_ok());
        assert!(matches!(
            list.encoded_size(0, Some(9)),
            Err(RunlistError::OutOfRange { .. })
        ));
    }

    #[test]
    fn buffer_too_small_reports_stop_vcn_and_leaves_valid_prefix() {
        let list = rl(&[
            (0, Lcn::Real(10), 2),
            (2, Lcn::Real(40), 3),
            (5, Lcn::Real(90), 4),
            (9, Lcn::EndOfFile, 0),
        ]);
        // Each pair is 3 bytes; room for two pairs plus terminator.
        let mut out = [0xAA_u8; 7];
        let err = list.encode(0, None, &mut out).unwrap_err();
        assert_eq!(err, RunlistError::BufferTooSmall { stop_vcn: 5 });
        let prefix = decode_mapping_pairs(&out, 0).expect("prefix decodes");
        assert_eq!(prefix.end_vcn(), 5);
        assert_eq!(prefix.resolve(4), Lcn::Real(42));
    }

    fn arb_runlist() -> impl Strategy<Value = Runlist> {
        proptest::collection::vec((1_i64..5_000, prop::option::of(0_i64..1_000_000)), 0..24)
            .prop_map(|runs| {
                let mut elements = Vec::new();
                let mut vcn = 0;
                for (length, lcn) in runs {
                    let lcn = lcn.map_or(Lcn::Hole, Lcn::Real);
                    elements.push(RunlistElement::new(vcn, lcn, length));
                    vcn += length;
                }
                elements.push(RunlistElement::new(vcn, Lcn::EndOfFile, 0));
                Runlist::from_elements(elements).expect("generated runlist")
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn decode_inverts_encode(list in arb_runlist()) {
            let bytes = list.encode_to_vec(0, None).unwrap();
            prop_assert_eq!(bytes.len(), list.encoded_size(0, None).unwrap());
            let mut decoded = decode_mapping_pairs(&bytes, 0).unwrap();
            decoded.seal(list.end_vcn()).unwrap();
            prop_assert_eq!(decoded, list);
        }

        #[test]
        fn split_encoding_reassembles(list in arb_runlist(), cut in 0_i64..100_000) {
            let end = list.end_vcn();
            let cut = cut.min(end);
            let head = decode_mapping_pairs(&list.encode_to_vec(0, Some(cut)).unwrap(), 0).unwrap();
            let tail = decode_mapping_pairs(&list.encode_to_vec(cut, None).unwrap(), cut).unwrap();
            let mut merged = head.merge(&tail).unwrap();
            merged.seal(end).unwrap();
            for vcn in (0..end).step_by(97) {
                prop_assert_eq!(merged.resolve(vcn), list.resolve(vcn));
            }
        }
    }
}
