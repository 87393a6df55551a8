//! Inclusive interval algebra over block numbers and datetimes.
//!
//! Every range in the importer is inclusive on both ends: a block range
//! `[from, to]` covers `to - from + 1` blocks. Block ranges and date ranges
//! share the same shape and operations; only the notion of adjacency differs
//! and is supplied by the [`RangePoint`] impl. Dates are treated at
//! millisecond granularity so that set subtraction stays exact at boundaries.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A point type usable as a range endpoint.
pub trait RangePoint: Copy + Ord + std::fmt::Debug {
    /// The length measure of an inclusive range of this point type.
    type Len: Copy + PartialOrd;

    /// The next representable point.
    fn succ(self) -> Self;
    /// The previous representable point.
    fn pred(self) -> Self;
    /// Inclusive length of `[from, to]`.
    fn span(from: Self, to: Self) -> Self::Len;
    /// The last point of a chunk of length `len` starting at `from`.
    fn chunk_end(from: Self, len: Self::Len) -> Self;
    /// The first point of a chunk of length `len` ending at `to`.
    fn chunk_start(to: Self, len: Self::Len) -> Self;
}

impl RangePoint for u64 {
    type Len = u64;

    fn succ(self) -> Self {
        self.saturating_add(1)
    }
    fn pred(self) -> Self {
        self.saturating_sub(1)
    }
    fn span(from: Self, to: Self) -> u64 {
        to - from + 1
    }
    fn chunk_end(from: Self, len: u64) -> Self {
        from.saturating_add(len.saturating_sub(1))
    }
    fn chunk_start(to: Self, len: u64) -> Self {
        to.saturating_sub(len.saturating_sub(1))
    }
}

impl RangePoint for DateTime<Utc> {
    type Len = Duration;

    fn succ(self) -> Self {
        self + Duration::milliseconds(1)
    }
    fn pred(self) -> Self {
        self - Duration::milliseconds(1)
    }
    fn span(from: Self, to: Self) -> Duration {
        to - from
    }
    fn chunk_end(from: Self, len: Duration) -> Self {
        from + len
    }
    fn chunk_start(to: Self, len: Duration) -> Self {
        to - len
    }
}

/// An inclusive interval `[from, to]` with `from <= to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range<T> {
    pub from: T,
    pub to: T,
}

impl<T: RangePoint> Range<T> {
    pub fn new(from: T, to: T) -> Self {
        debug_assert!(from <= to, "range endpoints out of order");
        Self { from, to }
    }

    pub fn contains(&self, v: T) -> bool {
        self.from <= v && v <= self.to
    }

    pub fn length(&self) -> T::Len {
        T::span(self.from, self.to)
    }

    fn overlaps(&self, other: &Range<T>) -> bool {
        self.from <= other.to && other.from <= self.to
    }
}

/// True if any range in the list contains `v`.
pub fn range_list_contains<T: RangePoint>(ranges: &[Range<T>], v: T) -> bool {
    ranges.iter().any(|r| r.contains(v))
}

/// Sort ranges by `from` ascending. The sort is stable: equal keys keep
/// their input order.
pub fn range_sort<T: RangePoint>(ranges: &[Range<T>]) -> Vec<Range<T>> {
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|r| r.from);
    sorted
}

/// Collapse overlapping and adjacent ranges into a sorted, disjoint,
/// non-adjacent list.
pub fn range_merge<T: RangePoint>(ranges: &[Range<T>]) -> Vec<Range<T>> {
    if ranges.is_empty() {
        return Vec::new();
    }
    let sorted = range_sort(ranges);
    let mut merged: Vec<Range<T>> = Vec::with_capacity(sorted.len());
    let mut current = sorted[0];
    for r in &sorted[1..] {
        if r.from <= current.to.succ() {
            if r.to > current.to {
                current.to = r.to;
            }
        } else {
            merged.push(current);
            current = *r;
        }
    }
    merged.push(current);
    merged
}

/// Set subtraction: every point of `source` that is not in `exclude`.
pub fn range_exclude<T: RangePoint>(source: &[Range<T>], exclude: &[Range<T>]) -> Vec<Range<T>> {
    let exclude = range_merge(exclude);
    let mut result = Vec::new();
    for r in source {
        let mut pieces = vec![*r];
        for e in &exclude {
            let mut next = Vec::with_capacity(pieces.len());
            for p in pieces {
                if !p.overlaps(e) {
                    next.push(p);
                    continue;
                }
                if p.from < e.from {
                    next.push(Range::new(p.from, e.from.pred()));
                }
                if e.to < p.to {
                    next.push(Range::new(e.to.succ(), p.to));
                }
            }
            pieces = next;
            if pieces.is_empty() {
                break;
            }
        }
        result.extend(pieces);
    }
    result
}

/// Split one range into a chain of adjacent ranges of length <= `max_len`.
pub fn range_split_to_max_length<T: RangePoint>(r: &Range<T>, max_len: T::Len) -> Vec<Range<T>> {
    let mut parts = Vec::new();
    let mut from = r.from;
    loop {
        let end = T::chunk_end(from, max_len);
        if end >= r.to {
            parts.push(Range::new(from, r.to));
            return parts;
        }
        parts.push(Range::new(from, end));
        from = end.succ();
    }
}

/// [`range_split_to_max_length`] over a list.
pub fn range_list_split_to_max_length<T: RangePoint>(
    ranges: &[Range<T>],
    max_len: T::Len,
) -> Vec<Range<T>> {
    ranges
        .iter()
        .flat_map(|r| range_split_to_max_length(r, max_len))
        .collect()
}

/// Split one range into adjacent chunks of length <= `max_len`, aligned to
/// the range END and emitted newest-first. Historical planning uses this so
/// the head-adjacent chunk is always full-sized and first in line.
pub fn range_split_to_max_length_from_end<T: RangePoint>(
    r: &Range<T>,
    max_len: T::Len,
) -> Vec<Range<T>> {
    let mut parts = Vec::new();
    let mut to = r.to;
    loop {
        let start = T::chunk_start(to, max_len);
        if start <= r.from {
            parts.push(Range::new(r.from, to));
            return parts;
        }
        parts.push(Range::new(start, to));
        to = start.pred();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn r(from: u64, to: u64) -> Range<u64> {
        Range::new(from, to)
    }

    #[test]
    fn merge_collapses_overlapping_and_adjacent() {
        assert_eq!(
            range_merge(&[r(1, 5), r(6, 10), r(20, 30), r(25, 27)]),
            vec![r(1, 10), r(20, 30)]
        );
    }

    #[test]
    fn merge_keeps_disjoint_ranges_apart() {
        assert_eq!(
            range_merge(&[r(10, 12), r(1, 2), r(5, 7)]),
            vec![r(1, 2), r(5, 7), r(10, 12)]
        );
    }

    #[test]
    fn exclude_cuts_holes() {
        assert_eq!(
            range_exclude(&[r(1, 100)], &[r(10, 20), r(50, 60)]),
            vec![r(1, 9), r(21, 49), r(61, 100)]
        );
    }

    #[test]
    fn exclude_handles_edge_overlap() {
        assert_eq!(range_exclude(&[r(10, 20)], &[r(1, 10)]), vec![r(11, 20)]);
        assert_eq!(range_exclude(&[r(10, 20)], &[r(20, 30)]), vec![r(10, 19)]);
        assert_eq!(range_exclude(&[r(10, 20)], &[r(1, 30)]), vec![]);
    }

    #[test]
    fn split_respects_max_length() {
        assert_eq!(
            range_split_to_max_length(&r(900, 1000), 40),
            vec![r(900, 939), r(940, 979), r(980, 1000)]
        );
        assert_eq!(range_split_to_max_length(&r(5, 5), 40), vec![r(5, 5)]);
    }

    #[test]
    fn split_from_end_aligns_to_the_head() {
        assert_eq!(
            range_split_to_max_length_from_end(&r(951, 995), 40),
            vec![r(956, 995), r(951, 955)]
        );
        assert_eq!(
            range_split_to_max_length_from_end(&r(900, 995), 40),
            vec![r(956, 995), r(916, 955), r(900, 915)]
        );
    }

    #[test]
    fn date_ranges_merge_on_equal_endpoints() {
        let d = |h: u32| Utc.with_ymd_and_hms(2022, 1, 1, h, 0, 0).unwrap();
        let merged = range_merge(&[Range::new(d(0), d(6)), Range::new(d(6), d(12))]);
        assert_eq!(merged, vec![Range::new(d(0), d(12))]);
    }

    #[test]
    fn date_split_chains_cover_input() {
        let d0 = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let d1 = Utc.with_ymd_and_hms(2022, 1, 1, 10, 0, 0).unwrap();
        let parts = range_split_to_max_length(&Range::new(d0, d1), Duration::hours(4));
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].from, d0);
        assert_eq!(parts[2].to, d1);
        for w in parts.windows(2) {
            assert_eq!(w[0].to.succ(), w[1].from);
        }
    }

    fn arb_ranges() -> impl Strategy<Value = Vec<Range<u64>>> {
        prop::collection::vec((0u64..5_000, 0u64..200), 0..20)
            .prop_map(|v| v.into_iter().map(|(f, len)| r(f, f + len)).collect())
    }

    proptest! {
        #[test]
        fn merge_output_is_sorted_and_disjoint(ranges in arb_ranges()) {
            let merged = range_merge(&ranges);
            for w in merged.windows(2) {
                // strictly increasing with a gap (no adjacency left behind)
                prop_assert!(w[0].to.succ() < w[1].from);
            }
        }

        #[test]
        fn excluding_a_set_from_itself_is_empty(ranges in arb_ranges()) {
            let merged = range_merge(&ranges);
            prop_assert!(range_exclude(&merged, &merged).is_empty());
        }

        #[test]
        fn exclude_matches_pointwise_membership(
            ranges in arb_ranges(),
            cut in arb_ranges(),
            probe in 0u64..6_000,
        ) {
            let result = range_exclude(&ranges, &cut);
            let expected = range_list_contains(&ranges, probe) && !range_list_contains(&cut, probe);
            prop_assert_eq!(range_list_contains(&result, probe), expected);
        }

        #[test]
        fn split_union_equals_input(from in 0u64..10_000, len in 0u64..500, max in 1u64..64) {
            let input = r(from, from + len);
            let parts = range_split_to_max_length(&input, max);
            for p in &parts {
                prop_assert!(p.length() <= max);
            }
            prop_assert_eq!(range_merge(&parts), vec![input]);
        }
    }
}
