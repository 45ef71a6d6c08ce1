// gallium/gpu/src/ranges.rs
//
// Copyright © 2020 The Gallium Project Developers.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Bounded lists of dirty byte ranges.

use std::ops::Range;

/// A sorted list of disjoint, non-adjacent byte ranges.
///
/// The list never holds more than `max_ranges` entries. Once it is full, a range that touches
/// nothing already present is folded into its nearest neighbor, which widens what is uploaded
/// but never loses a byte.
#[derive(Clone, Debug)]
pub struct DirtyRanges {
    ranges: Vec<Range<usize>>,
    max_ranges: usize,
}

impl DirtyRanges {
    pub fn new(max_ranges: usize) -> DirtyRanges {
        let max_ranges = max_ranges.max(1);
        DirtyRanges { ranges: Vec::with_capacity(max_ranges), max_ranges }
    }

    #[inline]
    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[inline]
    pub fn max_ranges(&self) -> usize {
        self.max_ranges
    }

    pub fn total_bytes(&self) -> usize {
        self.ranges.iter().map(|range| range.end - range.start).sum()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Removes and returns every range, in ascending order.
    pub fn take(&mut self) -> Vec<Range<usize>> {
        let mut ranges = Vec::with_capacity(self.max_ranges);
        ranges.append(&mut self.ranges);
        ranges
    }

    /// Records `[start, end)` as needing upload.
    pub fn mark_dirty(&mut self, start: usize, end: usize) {
        if start >= end {
            return;
        }

        // Everything overlapping or adjacent to the new range collapses into it.
        let first = self.ranges.iter().position(|range| range.end >= start);
        let first = match first {
            Some(first) if self.ranges[first].start <= end => first,
            Some(insert_at) => return self.insert_disjoint(insert_at, start..end),
            None => return self.insert_disjoint(self.ranges.len(), start..end),
        };
        let mut last = first;
        while last + 1 < self.ranges.len() && self.ranges[last + 1].start <= end {
            last += 1;
        }

        let merged = self.ranges[first].start.min(start)..self.ranges[last].end.max(end);
        self.ranges.drain((first + 1)..=last);
        self.ranges[first] = merged;
    }

    fn insert_disjoint(&mut self, index: usize, range: Range<usize>) {
        if self.ranges.len() < self.max_ranges {
            self.ranges.insert(index, range);
            return;
        }

        // Full: widen whichever neighbor leaves the smallest gap.
        let before_gap = if index > 0 {
            Some(range.start - self.ranges[index - 1].end)
        } else {
            None
        };
        let after_gap = self.ranges.get(index).map(|next| next.start - range.end);
        let neighbor = match (before_gap, after_gap) {
            (Some(before), Some(after)) if after < before => index,
            (Some(_), _) => index - 1,
            (None, _) => index,
        };

        debug!("dirty range table full ({} entries): folding {:?} into {:?}",
               self.max_ranges,
               range,
               self.ranges[neighbor]);

        let widened = self.ranges[neighbor].start.min(range.start)..
            self.ranges[neighbor].end.max(range.end);
        self.ranges[neighbor] = widened;
    }
}

#[cfg(test)]
mod test {
    use quickcheck;
    use std::ops::Range;
    use super::DirtyRanges;

    #[test]
    fn test_overlapping_marks_merge() {
        let mut ranges = DirtyRanges::new(32);
        ranges.mark_dirty(0, 100);
        ranges.mark_dirty(200, 300);
        assert_eq!(ranges.ranges(), &[0..100, 200..300]);
        ranges.mark_dirty(90, 210);
        assert_eq!(ranges.ranges(), &[0..300]);
    }

    #[test]
    fn test_adjacent_marks_merge() {
        let mut ranges = DirtyRanges::new(4);
        ranges.mark_dirty(10, 20);
        ranges.mark_dirty(20, 30);
        ranges.mark_dirty(0, 10);
        assert_eq!(ranges.ranges(), &[0..30]);
    }

    #[test]
    fn test_full_table_folds_into_nearest() {
        let mut ranges = DirtyRanges::new(2);
        ranges.mark_dirty(0, 10);
        ranges.mark_dirty(100, 110);
        ranges.mark_dirty(80, 90);
        assert_eq!(ranges.ranges(), &[0..10, 80..110]);
        ranges.mark_dirty(20, 25);
        assert_eq!(ranges.ranges(), &[0..25, 80..110]);
        ranges.mark_dirty(500, 501);
        assert_eq!(ranges.ranges(), &[0..25, 80..501]);
    }

    #[test]
    fn test_coalescing_never_loses_coverage() {
        quickcheck::quickcheck(prop_coverage_is_superset as fn(u8, Vec<(u16, u16)>) -> bool);

        fn prop_coverage_is_superset(max_ranges: u8, marks: Vec<(u16, u16)>) -> bool {
            let mut ranges = DirtyRanges::new(max_ranges as usize % 8 + 1);
            let mut marked: Vec<Range<usize>> = vec![];
            for (a, b) in marks {
                let (a, b) = (a as usize % 1024, b as usize % 1024);
                let (start, end) = (a.min(b), a.max(b));
                ranges.mark_dirty(start, end);
                marked.push(start..end);
            }

            let covered = |byte: usize| ranges.ranges().iter().any(|range| range.contains(&byte));
            let superset = marked.iter().all(|range| range.clone().all(|byte| covered(byte)));
            let bounded = ranges.len() <= ranges.max_ranges();
            let sorted_disjoint =
                ranges.ranges().windows(2).all(|pair| pair[0].end < pair[1].start);
            superset && bounded && sorted_disjoint
        }
    }
}
