//! An ordered set of non-overlapping half-open ranges, each carrying a value.
//!
//! `Seg` and `Gap` are lightweight cursors: they record the key of the element
//! they point at and of its neighbours, and stay valid only until the set is
//! next mutated.

use std::{collections::BTreeMap, ops::Bound::*};

use utils::Range;

type MaybeRange<K> = Range<Option<K>>;

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Gap<K: num::Integer + num::Bounded> {
    range: MaybeRange<K>,
    prev_key: Option<Range<K>>,
}

impl<K: num::Integer + num::Bounded + Copy> Gap<K> {
    fn new(range: MaybeRange<K>, prev_key: Option<Range<K>>) -> Self {
        Gap { range, prev_key }
    }

    fn maybe_end(&self) -> Option<K> {
        self.range.end
    }

    pub fn range(&self) -> Range<K> {
        Range {
            start: self.start(),
            end: self.end(),
        }
    }

    pub fn start(&self) -> K {
        self.range.start.unwrap_or_else(K::min_value)
    }

    pub fn end(&self) -> K {
        self.range.end.unwrap_or_else(K::max_value)
    }

    fn is_superset_of(&self, r: &Range<K>) -> bool {
        self.range().is_superset_of(r)
    }

    pub fn is_empty(&self) -> bool {
        self.start() == self.end()
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Seg<K: num::Integer + num::Bounded + Copy> {
    range: Range<K>,
    prev_key: Option<Range<K>>,
    next_key: Option<Range<K>>,
}

impl<K: num::Integer + num::Bounded + Copy> Seg<K> {
    fn new(range: Range<K>, prev_key: Option<Range<K>>, next_key: Option<Range<K>>) -> Self {
        Seg {
            range,
            prev_key,
            next_key,
        }
    }

    #[inline]
    pub fn start(&self) -> K {
        self.range.start
    }

    #[inline]
    pub fn end(&self) -> K {
        self.range.end
    }

    #[inline]
    pub fn range(&self) -> Range<K> {
        self.range
    }
}

#[derive(Debug)]
pub enum SegOrGap<K: num::Integer + num::Bounded + Copy> {
    Segment(Seg<K>),
    Gap(Gap<K>),
}

/// Policy used by `Set` when two segments touch or when one has to be cut.
pub trait SetOperations {
    type K;
    type V;
    fn merge(
        &self,
        r1: Range<Self::K>,
        v1: &Self::V,
        r2: Range<Self::K>,
        v2: &Self::V,
    ) -> Option<Self::V>;
    fn split(&self, r: Range<Self::K>, v: &Self::V, split: Self::K) -> (Self::V, Self::V);
}

pub struct Set<K: num::Integer + num::Bounded, V> {
    map: BTreeMap<Range<K>, V>,
    operations: Box<dyn SetOperations<K = K, V = V> + Send + Sync>,
}

impl<K: num::Integer + num::Bounded + std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug
    for Set<K, V>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("").field(&self.map).finish()
    }
}

impl<
        K: num::Integer
            + num::Bounded
            + num::ToPrimitive
            + std::ops::AddAssign
            + std::fmt::Display
            + std::fmt::Debug
            + Copy
            + Clone,
        V: std::cmp::PartialEq + Clone,
    > Set<K, V>
{
    pub fn new(operations: Box<dyn SetOperations<K = K, V = V> + Send + Sync>) -> Self {
        Self {
            map: BTreeMap::new(),
            operations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Iterates over every segment in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (&Range<K>, &V)> {
        self.map.iter()
    }

    /// Total length covered by all segments.
    pub fn find_gap(&self, key: K) -> Option<Gap<K>> {
        let r = Range {
            start: key,
            end: key,
        };
        let mut before = self.map.range(..r).rev();
        let mut after = self.map.range(r..);
        let prev_seg = before.next().map(|(k, _)| *k);
        let next_seg = after.next().map(|(k, _)| *k);
        let start = match prev_seg {
            Some(prev_seg) => {
                if prev_seg.end > key {
                    return None;
                } else {
                    Some(prev_seg.end)
                }
            }
            None => None,
        };
        let end = match next_seg {
            Some(next_seg) => {
                if key < next_seg.start {
                    Some(next_seg.start)
                } else {
                    return None;
                }
            }
            None => None,
        };
        Some(Gap::new(MaybeRange { start, end }, prev_seg))
    }

    /// Returns the first segment whose end is greater than `min`.
    pub fn lower_bound_segment(&self, min: K) -> Option<Seg<K>> {
        match self.find_segment(min) {
            Some(seg) => Some(seg),
            None => {
                let gap = self
                    .find_gap(min)
                    .unwrap_or_else(|| panic!("seg and gap for key {} are both None.", min));
                self.next_segment_of_gap(&gap)
            }
        }
    }

    pub fn find_segment(&self, key: K) -> Option<Seg<K>> {
        let r = Range {
            start: key,
            end: key,
        };
        let mut it = self.map.range(..r).rev();
        if let Some(back) = it.next().map(|(k, _)| *k) {
            if back.contains(key) {
                let prev_key = it.next().map(|(k, _)| *k);
                let next_key = {
                    let mut it = self.map.range((Excluded(back), Unbounded));
                    it.next().map(|(k, _)| *k)
                };
                return Some(Seg::new(back, prev_key, next_key));
            }
        }

        let mut it = self.map.range(r..);
        if let Some(next) = it.next().map(|(k, _)| *k) {
            if next.contains(key) {
                let next_key = it.next().map(|(k, _)| *k);
                let prev_key = {
                    let mut it = self.map.range(..next).rev();
                    it.next().map(|(k, _)| *k)
                };
                return Some(Seg::new(next, prev_key, next_key));
            }
        }

        None
    }

    pub fn add(&mut self, range: Range<K>, val: V) -> bool {
        let start = range.start;
        let end = range.end;
        if end <= start {
            panic!("invalid segment range: ({}, {})", start, end);
        }
        let gap = match self.find_gap(start) {
            Some(gap) => gap,
            None => return false,
        };
        if end > gap.end() {
            false
        } else {
            self.insert(range, val);
            true
        }
    }

    pub fn add_without_merging(&mut self, range: Range<K>, val: V) -> bool {
        let start = range.start;
        let end = range.end;
        if end <= start {
            panic!("invalid segment range: ({}, {})", start, end);
        }
        let gap = match self.find_gap(start) {
            Some(gap) => gap,
            None => return false,
        };
        if end > gap.end() {
            false
        } else {
            self.insert_without_merging(&gap, range, val);
            true
        }
    }

    /// Inserts `range`, merging it with its neighbours whenever the set
    /// operations allow it.
    pub fn insert(&mut self, range: Range<K>, val: V) -> Seg<K> {
        let start = range.start;
        let end = range.end;
        if end < start {
            panic!("invalid segment range: ({}, {})", start, end);
        }
        let (prev, second_prev) = {
            let mut it = self.map.range(..Range { start, end: start }).rev();
            let prev = it.next().map(|(k, _)| *k);
            let second_prev = it.next().map(|(k, _)| *k);
            (prev, second_prev)
        };
        let (next, second_next) = {
            let mut it = self.map.range(Range { start: end, end }..);
            let next = it.next().map(|(k, _)| *k);
            let second_next = it.next().map(|(k, _)| *k);
            (next, second_next)
        };
        if prev.as_ref().map_or(false, |p| p.end > range.start) {
            panic!("new segment {:?} overlaps predecessor {:?}", range, prev);
        }
        if next.as_ref().map_or(false, |n| n.start < range.end) {
            panic!("new segment {:?} overlaps successor {:?}", range, next);
        }

        if let Some(prev) = prev.filter(|p| p.end == start) {
            let prev_value = &self.map[&prev];
            if let Some(mval) = self.operations.merge(prev, prev_value, range, &val) {
                let new_key = Range {
                    start: prev.start,
                    end,
                };
                self.map.remove(&prev);
                if let Some(next) = next.filter(|n| n.start == end) {
                    let next_val = &self.map[&next];
                    if let Some(mval) = self.operations.merge(new_key, &mval, next, next_val) {
                        self.map.remove(&next);
                        let new_key = Range {
                            start: prev.start,
                            end: next.end,
                        };
                        self.map.insert(new_key, mval);
                        return Seg::new(new_key, second_prev, second_next);
                    }
                }
                self.map.insert(new_key, mval);
                return Seg::new(new_key, second_prev, next);
            }
        }
        if let Some(next) = next.filter(|n| n.start == end) {
            let next_val = &self.map[&next];
            if let Some(mval) = self.operations.merge(range, &val, next, next_val) {
                self.map.remove(&next);
                let new_key = Range {
                    start,
                    end: next.end,
                };
                self.map.insert(new_key, mval);
                return Seg::new(new_key, prev, second_next);
            }
        }
        self.map.insert(range, val);
        Seg::new(range, prev, next)
    }

    pub fn insert_without_merging(&mut self, gap: &Gap<K>, range: Range<K>, val: V) -> Seg<K> {
        if range.end <= range.start {
            panic!("invalid segment range {:?}", range);
        }
        if !gap.is_superset_of(&range) {
            panic!(
                "cannot insert segment range {:?} into gap range {:?}",
                range, gap.range
            );
        }
        self.map.insert(range, val);
        self.segment_at(range)
    }

    /// Moves the segment keyed by `old` to `new`, keeping its value. `new`
    /// may overlap `old` but no other segment.
    pub fn set_range(&mut self, old: Range<K>, new: Range<K>) -> Seg<K> {
        if new.end <= new.start {
            panic!("invalid segment range {:?}", new);
        }
        let val = self
            .map
            .remove(&old)
            .unwrap_or_else(|| panic!("no segment keyed {:?}", old));
        if let Some((prev, _)) = self.map.range(..new).next_back() {
            if prev.end > new.start {
                panic!("segment {:?} moved over predecessor {:?}", new, prev);
            }
        }
        if let Some((next, _)) = self.map.range(new..).next() {
            if next.start < new.end {
                panic!("segment {:?} moved over successor {:?}", new, next);
            }
        }
        self.map.insert(new, val);
        self.segment_at(new)
    }

    fn segment_at(&self, range: Range<K>) -> Seg<K> {
        let prev_key = self.map.range(..range).next_back().map(|(k, _)| *k);
        let next_key = self
            .map
            .range((Excluded(range), Unbounded))
            .next()
            .map(|(k, _)| *k);
        Seg::new(range, prev_key, next_key)
    }

    fn merge_unchecked(&mut self, first: Seg<K>, second: Seg<K>) -> Option<Seg<K>> {
        if first.end() == second.start() {
            let first_val = self.value(&first);
            let second_val = self.value(&second);
            if let Some(mval) =
                self.operations
                    .merge(first.range, first_val, second.range, second_val)
            {
                let new_key = Range {
                    start: first.start(),
                    end: second.end(),
                };
                self.map.remove(&first.range);
                self.map.remove(&second.range);
                self.map.insert(new_key, mval);
                return Some(self.segment_at(new_key));
            }
        }
        None
    }

    pub fn merge(&mut self, first: Seg<K>, second: Seg<K>) -> Option<Seg<K>> {
        if self.next_segment_of_seg(&first).map(|s| s.range()) != Some(second.range()) {
            panic!(
                "attempt to merge non-neighboring segments {:?}, {:?} (next segment of first is {:?})",
                first, second, self.next_segment_of_seg(&first)
            );
        }
        self.merge_unchecked(first, second)
    }

    /// Tries to merge the segments at both edges of `r` with their outer
    /// neighbours.
    pub fn merge_adjacant(&mut self, r: Range<K>) {
        if let Some(first) = self.find_segment(r.start) {
            if let Some(prev) = self.prev_segment_of_seg(&first) {
                self.merge(prev, first);
            }
        }
        if let Some(last) = self.find_segment(r.end - K::one()) {
            if let Some(next) = self.next_segment_of_seg(&last) {
                self.merge(last, next);
            }
        }
    }

    pub fn remove(&mut self, seg: Range<K>) -> Gap<K> {
        self.map
            .remove(&seg)
            .unwrap_or_else(|| panic!("no segment keyed {:?}", seg));
        let prev_key = self.map.range(..seg).next_back().map(|(k, _)| *k);
        Gap::new(
            MaybeRange {
                start: Some(seg.start),
                end: Some(seg.end),
            },
            prev_key,
        )
    }

    pub fn next_non_empty(&self, seg: &Seg<K>) -> Option<SegOrGap<K>> {
        if let Some(gap) = self.next_gap_of_seg(seg) {
            if !gap.is_empty() {
                return Some(SegOrGap::Gap(gap));
            }
        }
        self.next_segment_of_seg(seg).map(SegOrGap::Segment)
    }

    pub fn next_segment_of_seg(&self, seg: &Seg<K>) -> Option<Seg<K>> {
        let mut it = self.map.range((Excluded(seg.range), Unbounded));
        let next_range = it.next().map(|(k, _)| *k)?;
        let next_key = it.next().map(|(k, _)| *k);
        Some(Seg::new(next_range, Some(seg.range), next_key))
    }

    pub fn next_segment_of_gap(&self, gap: &Gap<K>) -> Option<Seg<K>> {
        let gap_end = gap.maybe_end()?;
        let mut it = self.map.range(
            Range {
                start: gap_end,
                end: gap_end,
            }..,
        );
        let next_range = it.next().map(|(k, _)| *k)?;
        let next_key = it.next().map(|(k, _)| *k);
        let prev_key = self.map.range(..next_range).next_back().map(|(k, _)| *k);
        Some(Seg::new(next_range, prev_key, next_key))
    }

    fn next_gap_of_seg(&self, seg: &Seg<K>) -> Option<Gap<K>> {
        let gap_start = seg.end();
        if gap_start == K::max_value() {
            return None;
        }
        let gap_end = {
            let mut it = self.map.range((Excluded(seg.range), Unbounded));
            it.next().map(|(k, _)| k.start)
        };
        Some(Gap::new(
            MaybeRange {
                start: Some(gap_start),
                end: gap_end,
            },
            Some(seg.range),
        ))
    }

    pub fn prev_segment_of_seg(&self, seg: &Seg<K>) -> Option<Seg<K>> {
        let mut it = self.map.range(..seg.range).rev();
        let prev_seg_range = it.next().map(|(k, _)| *k)?;
        let prev_key = it.next().map(|(k, _)| *k);
        Some(Seg::new(prev_seg_range, prev_key, Some(seg.range)))
    }

    // precondition: seg.start < key < seg.end
    fn split_unchecked(&mut self, seg: &Seg<K>, split: K) -> (Seg<K>, Seg<K>) {
        let (val1, val2) = self.operations.split(seg.range(), self.value(seg), split);
        let (key1, key2) = seg.range().split_at(split);
        self.map.remove(&seg.range);
        self.map.insert(key1, val1);
        self.map.insert(key2, val2);
        let prev_key = self.map.range(..key1).next_back().map(|(k, _)| *k);
        let next_key = self
            .map
            .range((Excluded(key2), Unbounded))
            .next()
            .map(|(k, _)| *k);
        (
            Seg::new(key1, prev_key, Some(key2)),
            Seg::new(key2, Some(key1), next_key),
        )
    }

    /// Splits `seg` as needed so that the returned segment lies within
    /// `range`.
    pub fn isolate(&mut self, seg: &Seg<K>, range: Range<K>) -> Seg<K> {
        let mut seg = *seg;
        if seg.range.can_split_at(range.start) {
            seg = self.split_unchecked(&seg, range.start).1;
        }
        if seg.range.can_split_at(range.end) {
            seg = self.split_unchecked(&seg, range.end).0;
        }
        seg
    }

    pub fn value(&self, seg: &Seg<K>) -> &V {
        self.map
            .get(&seg.range)
            .unwrap_or_else(|| panic!("stale segment {:?}", seg.range))
    }

    pub fn value_mut(&mut self, seg: &Seg<K>) -> &mut V {
        self.map
            .get_mut(&seg.range)
            .unwrap_or_else(|| panic!("stale segment {:?}", seg.range))
    }

    #[cfg(test)]
    fn segment_test_check<F: Fn(i32, Range<K>, V) -> anyhow::Result<()>>(
        &self,
        expected_segment: i32,
        seg_fn: Option<F>,
    ) -> anyhow::Result<()> {
        let mut prev: Option<Range<K>> = None;
        let mut nr_segments = 0;
        for (key, val) in self.map.iter() {
            if let Some(prev) = prev {
                if prev.end > key.start {
                    anyhow::bail!(
                        "incorrect order: {:?} (segment {}) overlaps {:?} (segment {})",
                        prev,
                        nr_segments - 1,
                        key,
                        nr_segments,
                    );
                }
            }
            if let Some(ref seg_fn) = seg_fn {
                seg_fn(nr_segments, *key, val.clone())?;
            }
            prev = Some(*key);
            nr_segments += 1;
        }
        if nr_segments != expected_segment {
            anyhow::bail!(
                "incorrect number of segments: got {}, wanted: {}",
                nr_segments,
                expected_segment
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::prelude::SliceRandom;

    use super::*;

    const TEST_SIZE: i32 = 8000;
    const VALUE_OFFSET: i32 = 100000;

    fn validate<K: std::fmt::Display + num::ToPrimitive>(
        nr: i32,
        range: Range<K>,
        v: i32,
    ) -> anyhow::Result<()> {
        let got = v;
        let want = range.start.to_i32().unwrap() + VALUE_OFFSET;
        if got != want {
            anyhow::bail!(
                "segment {} has key {}, value {} (expected {})",
                nr,
                range.start,
                got,
                want
            );
        }
        Ok(())
    }

    fn shuffle(xs: &mut [i32]) {
        let mut rng = rand::thread_rng();
        xs.shuffle(&mut rng);
    }

    struct Ops;
    impl SetOperations for Ops {
        type K = u64;
        type V = i32;
        fn merge(
            &self,
            _: Range<Self::K>,
            v1: &Self::V,
            _: Range<Self::K>,
            v2: &Self::V,
        ) -> Option<Self::V> {
            if v1 == v2 {
                Some(*v1)
            } else {
                None
            }
        }

        fn split(&self, r: Range<Self::K>, v: &Self::V, split: Self::K) -> (Self::V, Self::V) {
            (*v, *v + (split - r.start) as i32)
        }
    }

    fn collect(s: &Set<u64, i32>) -> Vec<Range<u64>> {
        let mut ranges = Vec::new();
        let mut maybe_seg = s.lower_bound_segment(0);
        while let Some(seg) = maybe_seg {
            ranges.push(seg.range);
            maybe_seg = s.next_segment_of_seg(&seg);
        }
        ranges
    }

    #[test]
    fn add_random() {
        let mut s: Set<u64, i32> = Set::new(Box::new(Ops {}));
        let mut order: Vec<i32> = (0..TEST_SIZE).collect();
        shuffle(&mut order);
        let mut nr_iterations = 0;
        for j in order.iter() {
            assert!(s.add_without_merging(
                Range {
                    start: *j as u64,
                    end: *j as u64 + 1
                },
                j + VALUE_OFFSET
            ));
            nr_iterations += 1;
        }
        assert!(s.segment_test_check(nr_iterations, Some(validate)).is_ok());
        assert_eq!(s.len() as i32, nr_iterations);
        assert_eq!(s.iter().map(|(r, _)| r.len()).sum::<u64>(), TEST_SIZE as u64);
    }

    #[test]
    fn remove_random() {
        let mut s: Set<u64, i32> = Set::new(Box::new(Ops {}));
        for i in 0..TEST_SIZE {
            assert!(s.add_without_merging(
                Range {
                    start: i as u64,
                    end: i as u64 + 1
                },
                i + VALUE_OFFSET
            ));
        }
        let mut order: Vec<i32> = (0..TEST_SIZE).collect();
        shuffle(&mut order);
        let mut nr_removals = 0;
        for j in order.iter() {
            let seg = s.find_segment(*j as u64).unwrap();
            s.remove(seg.range);
            nr_removals += 1;
            if nr_removals % 500 == 0 {
                assert!(s
                    .segment_test_check(TEST_SIZE - nr_removals, Some(validate))
                    .is_ok());
            }
        }
        assert!(s.is_empty());
    }

    #[test]
    fn lower_bound() {
        let mut s: Set<u64, i32> = Set::new(Box::new(Ops {}));
        assert!(s.lower_bound_segment(0).is_none());
        assert!(s.add_without_merging(Range::new(100, 200), 1));
        assert!(s.add_without_merging(Range::new(300, 400), 2));

        assert_eq!(s.lower_bound_segment(0).unwrap().range(), Range::new(100, 200));
        assert_eq!(s.lower_bound_segment(150).unwrap().range(), Range::new(100, 200));
        assert_eq!(s.lower_bound_segment(200).unwrap().range(), Range::new(300, 400));
        assert_eq!(s.lower_bound_segment(399).unwrap().range(), Range::new(300, 400));
        assert!(s.lower_bound_segment(400).is_none());

        let gap = s.find_gap(250).unwrap();
        assert_eq!(gap.range(), Range::new(200, 300));
        assert!(s.find_gap(100).is_none());
        assert_eq!(s.find_gap(500).unwrap().end(), u64::MAX);
    }

    #[test]
    fn set_range() {
        let mut s: Set<u64, i32> = Set::new(Box::new(Ops {}));
        assert!(s.add_without_merging(Range::new(100, 200), 1));
        assert!(s.add_without_merging(Range::new(200, 300), 2));

        // shrink the first segment, then grow the second over the freed space
        s.set_range(Range::new(100, 200), Range::new(100, 150));
        let seg = s.set_range(Range::new(200, 300), Range::new(150, 300));
        assert_eq!(seg.prev_key, Some(Range::new(100, 150)));
        assert_eq!(*s.value(&seg), 2);
        assert_eq!(collect(&s), vec![Range::new(100, 150), Range::new(150, 300)]);
        assert_eq!(s.iter().map(|(r, _)| r.len()).sum::<u64>(), 200);
    }

    #[test]
    #[should_panic]
    fn set_range_rejects_overlap() {
        let mut s: Set<u64, i32> = Set::new(Box::new(Ops {}));
        assert!(s.add_without_merging(Range::new(100, 200), 1));
        assert!(s.add_without_merging(Range::new(200, 300), 2));
        s.set_range(Range::new(100, 200), Range::new(100, 250));
    }

    #[test]
    fn merge_on_insert() {
        #[derive(Default)]
        struct Test {
            _name: String,
            initial: Vec<Range<u64>>,
            result: Vec<Range<u64>>,
        }

        let tests = vec![
            Test {
                _name: "Add merges after existing segment".to_string(),
                initial: vec![Range::new(1000, 1100), Range::new(1100, 1200)],
                result: vec![Range::new(1000, 1200)],
            },
            Test {
                _name: "Add merges before existing segment".to_string(),
                initial: vec![Range::new(1100, 1200), Range::new(1000, 1100)],
                result: vec![Range::new(1000, 1200)],
            },
            Test {
                _name: "Add merges between existing segments".to_string(),
                initial: vec![
                    Range::new(1000, 1100),
                    Range::new(1200, 1300),
                    Range::new(1100, 1200),
                ],
                result: vec![Range::new(1000, 1300)],
            },
            Test {
                _name: "Add keeps a detached segment apart".to_string(),
                initial: vec![Range::new(1000, 1100), Range::new(1200, 1300)],
                result: vec![Range::new(1000, 1100), Range::new(1200, 1300)],
            },
        ];

        for test in tests {
            let mut s: Set<u64, i32> = Set::new(Box::new(Ops {}));
            for r in &test.initial {
                assert!(s.add(*r, 0));
            }
            assert_eq!(collect(&s), test.result);
        }
    }

    #[test]
    fn merge_adjacant_after_split() {
        let mut s: Set<u64, i32> = Set::new(Box::new(Ops {}));
        let seg = s.insert(Range::new(100, 400), 0);
        // Ops::split shifts the value of the upper half, so the pieces differ
        let seg = s.isolate(&seg, Range::new(200, 300));
        assert_eq!(seg.range(), Range::new(200, 300));
        assert_eq!(s.len(), 3);
        *s.value_mut(&seg) = 0;
        let last = s.next_segment_of_seg(&seg).unwrap();
        *s.value_mut(&last) = 0;
        s.merge_adjacant(Range::new(200, 300));
        assert_eq!(collect(&s), vec![Range::new(100, 400)]);
    }

    #[test]
    fn isolate() {
        #[derive(Default, Debug)]
        struct Test<'a> {
            _name: &'a str,
            initial: Range<u64>,
            bounds: Range<u64>,
            result: Vec<Range<u64>>,
        }

        let tests = vec![
            Test {
                _name: "Isolate does not split a segment that falls inside bounds",
                initial: Range::new(100, 200),
                bounds: Range::new(100, 200),
                result: vec![Range::new(100, 200)],
            },
            Test {
                _name: "Isolate splits at beginning of segment",
                initial: Range::new(50, 200),
                bounds: Range::new(100, 200),
                result: vec![Range::new(50, 100), Range::new(100, 200)],
            },
            Test {
                _name: "Isolate splits at end of segment",
                initial: Range::new(100, 250),
                bounds: Range::new(100, 200),
                result: vec![Range::new(100, 200), Range::new(200, 250)],
            },
            Test {
                _name: "Isolate splits at beginning and end of segment",
                initial: Range::new(50, 250),
                bounds: Range::new(100, 200),
                result: vec![
                    Range::new(50, 100),
                    Range::new(100, 200),
                    Range::new(200, 250),
                ],
            },
        ];

        for test in tests {
            let mut s: Set<u64, i32> = Set::new(Box::new(Ops {}));
            let seg = s.insert(test.initial, 0);
            let seg = s.isolate(&seg, test.bounds);
            assert!(test.bounds.is_superset_of(&seg.range));
            assert_eq!(collect(&s), test.result);
        }
    }

    #[test]
    fn next_non_empty() {
        let mut s: Set<u64, i32> = Set::new(Box::new(Ops {}));
        assert!(s.add_without_merging(Range::new(0, 10), 1));
        assert!(s.add_without_merging(Range::new(10, 20), 2));
        assert!(s.add_without_merging(Range::new(30, 40), 3));

        let first = s.lower_bound_segment(0).unwrap();
        match s.next_non_empty(&first) {
            Some(SegOrGap::Segment(seg)) => assert_eq!(seg.range(), Range::new(10, 20)),
            other => panic!("expected segment, got {:?}", other),
        }
        let second = s.next_segment_of_seg(&first).unwrap();
        match s.next_non_empty(&second) {
            Some(SegOrGap::Gap(gap)) => assert_eq!(gap.range(), Range::new(20, 30)),
            other => panic!("expected gap, got {:?}", other),
        }
        let last = s.find_segment(35).unwrap();
        assert_eq!(s.prev_segment_of_seg(&last).unwrap().range(), Range::new(10, 20));
        assert!(matches!(s.next_non_empty(&last), Some(SegOrGap::Gap(_))));
    }
}
