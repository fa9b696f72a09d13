use std::{cmp::Ordering, collections::HashSet, hash::Hash};

use mem::{Addr, AddrRange};
use segment::{SegOrGap, Set, SetOperations};
use utils::Range;

use super::MappableRange;

/// Identifies one region of one address space. Two regions of the same space
/// may map the same object range (e.g. after a split), so the address range
/// alone is not enough to tell their entries apart.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct MappingKey {
    pub space: u64,
    pub region: usize,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MappingOfRange {
    key: MappingKey,
    addr_range: AddrRange,
    writable: bool,
}

impl Ord for MappingOfRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.addr_range.cmp(&other.addr_range))
    }
}

impl PartialOrd for MappingOfRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl MappingOfRange {
    pub fn key(&self) -> MappingKey {
        self.key
    }

    pub fn addr_range(&self) -> AddrRange {
        self.addr_range
    }

    pub fn writable(&self) -> bool {
        self.writable
    }
}

type MappingsOfRange = HashSet<MappingOfRange>;

pub struct MappingSetOperations;
impl SetOperations for MappingSetOperations {
    type K = u64;
    type V = MappingsOfRange;

    fn merge(
        &self,
        _: Range<Self::K>,
        v1: &Self::V,
        r2: Range<Self::K>,
        v2: &Self::V,
    ) -> Option<Self::V> {
        if v1.len() != v2.len() {
            return None;
        }
        let mut merged = MappingsOfRange::new();
        for k1 in v1.iter() {
            let k2 = MappingOfRange {
                key: k1.key,
                addr_range: AddrRange {
                    start: k1.addr_range.end,
                    end: k1.addr_range.end + r2.len(),
                },
                writable: k1.writable,
            };
            if !v2.contains(&k2) {
                return None;
            }
            merged.insert(MappingOfRange {
                key: k1.key,
                addr_range: AddrRange {
                    start: k1.addr_range.start,
                    end: k2.addr_range.end,
                },
                writable: k1.writable,
            });
        }
        Some(merged)
    }

    fn split(&self, r: Range<Self::K>, v: &Self::V, split: Self::K) -> (Self::V, Self::V) {
        if split <= r.start || split >= r.end {
            panic!("split is not within range: {:?}", r);
        }

        let mut m1 = MappingsOfRange::new();
        let mut m2 = MappingsOfRange::new();

        let offset = split - r.start;
        for k in v.iter() {
            let (lo, hi) = k.addr_range.split_at(k.addr_range.start + offset);
            m1.insert(MappingOfRange {
                key: k.key,
                addr_range: lo,
                writable: k.writable,
            });
            m2.insert(MappingOfRange {
                key: k.key,
                addr_range: hi,
                writable: k.writable,
            });
        }
        (m1, m2)
    }
}

/// Reverse map of a backing object: for each object range, the address
/// ranges currently mapping it.
pub type MappingSet = Set<u64, MappingsOfRange>;

pub fn new_mapping_set() -> MappingSet {
    MappingSet::new(Box::new(MappingSetOperations))
}

pub trait SetU64MappingOfRange {
    /// Records that `ar` of region `key` maps the object starting at byte
    /// `offset`. Returns the object ranges that had no mapping before.
    fn add_mapping(
        &mut self,
        key: MappingKey,
        ar: AddrRange,
        offset: u64,
        writable: bool,
    ) -> Vec<MappableRange>;

    /// Inverse of `add_mapping`. Returns the object ranges left unmapped.
    fn remove_mapping(
        &mut self,
        key: MappingKey,
        ar: AddrRange,
        offset: u64,
        writable: bool,
    ) -> Vec<MappableRange>;

    fn is_mapped(&self, key: MappingKey, ar: AddrRange, offset: u64, writable: bool) -> bool;

    /// All mappings overlapping the object range `mr`.
    fn mappings_of(&self, mr: MappableRange) -> Vec<MappingOfRange>;
}

impl SetU64MappingOfRange for MappingSet {
    fn add_mapping(
        &mut self,
        key: MappingKey,
        ar: AddrRange,
        offset: u64,
        writable: bool,
    ) -> Vec<MappableRange> {
        let mr = MappableRange {
            start: offset,
            end: offset + ar.len(),
        };
        let mut mapped = Vec::new();
        let mut seg = self.find_segment(mr.start);
        let mut gap = self.find_gap(mr.start);
        loop {
            if let Some(s) = seg.filter(|s| s.start() < mr.end) {
                let seg_inner = self.isolate(&s, mr);
                let val = self.value_mut(&seg_inner);
                val.insert(subset_mapping(
                    key,
                    mr,
                    seg_inner.range(),
                    Addr(ar.start),
                    writable,
                ));
                match self.next_non_empty(&seg_inner) {
                    Some(SegOrGap::Gap(g)) => {
                        seg = None;
                        gap = Some(g);
                    }
                    Some(SegOrGap::Segment(s)) => {
                        seg = Some(s);
                        gap = None;
                    }
                    None => {
                        seg = None;
                        gap = None;
                    }
                }
            } else if let Some(g) = gap.filter(|g| g.start() < mr.end) {
                let gap_mr = g.range().intersect(&mr);
                mapped.push(gap_mr);
                seg = Some(self.insert(gap_mr, MappingsOfRange::new()));
                gap = None;
            } else {
                return mapped;
            }
        }
    }

    fn remove_mapping(
        &mut self,
        key: MappingKey,
        ar: AddrRange,
        offset: u64,
        writable: bool,
    ) -> Vec<MappableRange> {
        let mr = MappableRange {
            start: offset,
            end: offset + ar.len(),
        };
        let mut seg = self
            .find_segment(mr.start)
            .unwrap_or_else(|| panic!("remove_mapping: {:?} is not mapped", mr));

        let mut unmapped = Vec::new();
        while seg.start() < mr.end {
            seg = self.isolate(&seg, mr);
            let mappings = self.value_mut(&seg);
            mappings.remove(&subset_mapping(
                key,
                mr,
                seg.range(),
                Addr(ar.start),
                writable,
            ));
            seg = if mappings.is_empty() {
                unmapped.push(seg.range());
                let removed = self.remove(seg.range());
                match self.next_segment_of_gap(&removed) {
                    Some(s) => s,
                    None => break,
                }
            } else {
                match self.next_segment_of_seg(&seg) {
                    Some(s) => s,
                    None => break,
                }
            };
        }
        self.merge_adjacant(mr);
        unmapped
    }

    fn is_mapped(&self, key: MappingKey, ar: AddrRange, offset: u64, writable: bool) -> bool {
        let mr = MappableRange {
            start: offset,
            end: offset + ar.len(),
        };
        let mut covered = mr.start;
        let mut seg = self.lower_bound_segment(mr.start);
        while let Some(s) = seg.filter(|s| s.start() < mr.end) {
            if s.start() > covered {
                return false;
            }
            let part = s.range().intersect(&mr);
            let want = subset_mapping(key, mr, part, Addr(ar.start), writable);
            let found = self.value(&s).iter().any(|m| {
                m.key == key
                    && m.writable == writable
                    && m.addr_range.is_superset_of(&want.addr_range)
            });
            if !found {
                return false;
            }
            covered = part.end;
            seg = self.next_segment_of_seg(&s);
        }
        covered >= mr.end
    }

    fn mappings_of(&self, mr: MappableRange) -> Vec<MappingOfRange> {
        let mut out = Vec::new();
        let mut seg = self.lower_bound_segment(mr.start);
        while let Some(s) = seg.filter(|s| s.start() < mr.end) {
            out.extend(self.value(&s).iter().cloned());
            seg = self.next_segment_of_seg(&s);
        }
        out.sort();
        out
    }
}

fn subset_mapping(
    key: MappingKey,
    whole_range: MappableRange,
    subset_range: MappableRange,
    addr: Addr,
    writable: bool,
) -> MappingOfRange {
    if !whole_range.is_superset_of(&subset_range) {
        panic!("invalid range");
    }
    let offset = subset_range.start - whole_range.start;
    let start = addr.0 + offset;
    MappingOfRange {
        key,
        addr_range: AddrRange {
            start,
            end: start + subset_range.len(),
        },
        writable,
    }
}
