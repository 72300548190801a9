//! Half-open interval algebra over 64-bit indices.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A half-open interval `[begin, end)` of logical indices.
///
/// `begin == end` denotes an empty range; empty *point* ranges are used as
/// search keys for [`find_containing`]-style lookups. The derived [`Ord`] is
/// the strict `(begin, end)` lexicographic order, which is a total order and
/// is the only ordering ranges carry. Point lookup against a set of disjoint
/// ranges is an explicit search (see
/// [`OwnershipDirectory::find_containing`](crate::dist::OwnershipDirectory::find_containing)),
/// never a comparator trick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LongRange {
    /// First index in the range.
    pub begin: i64,
    /// One past the last index in the range.
    pub end: i64,
}

impl LongRange {
    /// Creates the range `[begin, end)`.
    ///
    /// # Panics
    ///
    /// Panics if `begin > end`.
    pub fn new(begin: i64, end: i64) -> Self {
        assert!(begin <= end, "invalid range [{begin}, {end})");
        LongRange { begin, end }
    }

    /// Creates the empty point range `[p, p)`, used as a search key.
    pub fn point(p: i64) -> Self {
        LongRange { begin: p, end: p }
    }

    /// Number of indices in the range.
    pub fn len(&self) -> u64 {
        (self.end - self.begin) as u64
    }

    /// Whether the range contains no indices.
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Whether `index` falls inside the range.
    pub fn contains(&self, index: i64) -> bool {
        self.begin <= index && index < self.end
    }

    /// Whether `other` lies entirely inside the range.
    ///
    /// An empty `other` is contained iff its position does not fall outside
    /// the bounds.
    pub fn contains_range(&self, other: &LongRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    /// Whether the intersection with `other` is non-empty.
    ///
    /// An empty range overlaps nothing, including ranges that contain its
    /// position.
    pub fn overlaps(&self, other: &LongRange) -> bool {
        self.intersection(other).is_some()
    }

    /// The intersection with `other`, or `None` when the ranges are disjoint.
    pub fn intersection(&self, other: &LongRange) -> Option<LongRange> {
        let begin = self.begin.max(other.begin);
        let end = self.end.min(other.end);
        (begin < end).then(|| LongRange { begin, end })
    }

    /// Splits the range into `n` contiguous sub-ranges whose sizes differ by
    /// at most one, the remainder going to the first sub-ranges.
    ///
    /// The sub-ranges are returned in index order and partition `self`
    /// exactly. When `n` exceeds the range length the trailing sub-ranges
    /// are empty.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn split(&self, n: usize) -> Vec<LongRange> {
        assert!(n > 0, "cannot split into zero parts");
        let each = self.len() / n as u64;
        let remainder = self.len() % n as u64;
        let mut parts = Vec::with_capacity(n);
        let mut cursor = self.begin;
        for i in 0..n as u64 {
            let size = each + u64::from(i < remainder);
            parts.push(LongRange::new(cursor, cursor + size as i64));
            cursor += size as i64;
        }
        parts
    }

    /// Cuts a list of disjoint ranges into `n` contiguous groups balanced by
    /// total element count, splitting individual ranges at group boundaries
    /// as needed.
    ///
    /// The concatenation of the groups, in order, covers exactly the indices
    /// of `ranges` in order. Group sizes differ by at most one element.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn split_list(n: usize, ranges: &[LongRange]) -> Vec<Vec<LongRange>> {
        assert!(n > 0, "cannot split into zero groups");
        let total: u64 = ranges.iter().map(LongRange::len).sum();
        let each = total / n as u64;
        let remainder = total % n as u64;

        let mut groups: Vec<Vec<LongRange>> = Vec::with_capacity(n);
        let mut source = ranges.iter().copied().filter(|r| !r.is_empty());
        let mut pending: Option<LongRange> = None;
        for i in 0..n as u64 {
            let mut budget = each + u64::from(i < remainder);
            let mut group = Vec::new();
            while budget > 0 {
                let Some(r) = pending.take().or_else(|| source.next()) else {
                    break;
                };
                if r.len() <= budget {
                    budget -= r.len();
                    group.push(r);
                } else {
                    let cut = r.begin + budget as i64;
                    group.push(LongRange::new(r.begin, cut));
                    pending = Some(LongRange::new(cut, r.end));
                    budget = 0;
                }
            }
            groups.push(group);
        }
        groups
    }
}

impl fmt::Display for LongRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

impl From<std::ops::Range<i64>> for LongRange {
    fn from(r: std::ops::Range<i64>) -> Self {
        LongRange::new(r.start, r.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_and_overlap() {
        let r = LongRange::new(10, 20);
        assert!(r.contains(10));
        assert!(r.contains(19));
        assert!(!r.contains(20));
        assert!(!r.contains(9));
        assert!(r.contains_range(&LongRange::new(10, 20)));
        assert!(r.contains_range(&LongRange::new(12, 15)));
        assert!(!r.contains_range(&LongRange::new(5, 15)));
        assert!(r.overlaps(&LongRange::new(19, 30)));
        assert!(!r.overlaps(&LongRange::new(20, 30)));
        assert!(!r.overlaps(&LongRange::new(0, 10)));
        assert!(!LongRange::point(15).overlaps(&r));
        assert!(!r.overlaps(&LongRange::point(15)));
        assert!(!LongRange::point(15).overlaps(&LongRange::point(15)));
    }

    #[test]
    fn intersection() {
        let r = LongRange::new(10, 20);
        assert_eq!(
            r.intersection(&LongRange::new(15, 30)),
            Some(LongRange::new(15, 20))
        );
        assert_eq!(r.intersection(&LongRange::new(20, 30)), None);
        assert_eq!(
            r.intersection(&LongRange::new(0, 100)),
            Some(LongRange::new(10, 20))
        );
    }

    #[test]
    fn split_remainder_goes_first() {
        let r = LongRange::new(0, 10);
        let parts = r.split(3);
        assert_eq!(
            parts,
            vec![
                LongRange::new(0, 4),
                LongRange::new(4, 7),
                LongRange::new(7, 10)
            ]
        );
        // partitions exactly
        assert_eq!(parts.iter().map(LongRange::len).sum::<u64>(), r.len());
    }

    #[test]
    fn split_more_parts_than_elements() {
        let parts = LongRange::new(0, 2).split(4);
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], LongRange::new(0, 1));
        assert_eq!(parts[1], LongRange::new(1, 2));
        assert!(parts[2].is_empty());
        assert!(parts[3].is_empty());
    }

    #[test]
    fn split_list_crosses_range_boundaries() {
        let ranges = [
            LongRange::new(0, 4),
            LongRange::new(10, 14),
            LongRange::new(20, 24),
        ];
        let groups = LongRange::split_list(2, &ranges);
        assert_eq!(groups.len(), 2);
        // 12 elements total, 6 per group: the second range is cut in half.
        assert_eq!(
            groups[0],
            vec![LongRange::new(0, 4), LongRange::new(10, 12)]
        );
        assert_eq!(
            groups[1],
            vec![LongRange::new(12, 14), LongRange::new(20, 24)]
        );
    }

    #[test]
    fn split_list_uneven() {
        let ranges = [LongRange::new(0, 10)];
        let groups = LongRange::split_list(3, &ranges);
        let sizes: Vec<u64> = groups
            .iter()
            .map(|g| g.iter().map(LongRange::len).sum())
            .collect();
        assert_eq!(sizes, vec![4, 3, 3]);
    }

    #[test]
    fn ordering_is_lexicographic() {
        let mut v = vec![
            LongRange::new(10, 20),
            LongRange::new(0, 5),
            LongRange::new(10, 15),
        ];
        v.sort();
        assert_eq!(
            v,
            vec![
                LongRange::new(0, 5),
                LongRange::new(10, 15),
                LongRange::new(10, 20)
            ]
        );
    }
}
