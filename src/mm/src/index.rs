use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, ensure};
use mem::AddrRange;
use segment::{Set, SetOperations};
use utils::Range;

use crate::Region;

/// Stable handle of a region inside one address space. Handles of freed
/// regions are recycled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(usize);

impl RegionId {
    pub fn slot(&self) -> usize {
        self.0
    }
}

const NO_CACHE: usize = usize::MAX;

struct RegionTreeOperations;
impl SetOperations for RegionTreeOperations {
    type K = u64;
    type V = RegionId;

    fn merge(&self, _: Range<u64>, _: &RegionId, _: Range<u64>, _: &RegionId) -> Option<RegionId> {
        None
    }

    fn split(&self, r: Range<u64>, _: &RegionId, _: u64) -> (RegionId, RegionId) {
        panic!("region key {:?} cannot be split", r);
    }
}

#[derive(Debug, Default)]
struct Slot {
    region: Option<Region>,
    prev: Option<RegionId>,
    next: Option<RegionId>,
    linked: bool,
}

/// What `prepare_insert` found around an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PreparedInsert {
    pub prev: Option<RegionId>,
    /// First region ending above the address; it overlaps the address if it
    /// starts at or below it.
    pub next: Option<RegionId>,
    next_start: Option<u64>,
}

impl PreparedInsert {
    /// Whether a new region ending at `end` would overlap `next`.
    pub fn collides(&self, end: u64) -> bool {
        self.next_start.map_or(false, |s| s < end)
    }
}

/// Arena of regions, indexed by an interval tree and threaded on a list in
/// address order. Regions may be allocated in the arena before they are
/// linked, and stay allocated after being unlinked until released.
pub(crate) struct RegionIndex {
    slots: Vec<Slot>,
    vacant: Vec<usize>,
    tree: Set<u64, RegionId>,
    head: Option<RegionId>,
    tail: Option<RegionId>,
    linked: usize,
    cache: AtomicUsize,
}

impl std::fmt::Debug for RegionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|(_, r)| (r.range(), r.flags())))
            .finish()
    }
}

impl RegionIndex {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            tree: Set::new(Box::new(RegionTreeOperations)),
            head: None,
            tail: None,
            linked: 0,
            cache: AtomicUsize::new(NO_CACHE),
        }
    }

    pub fn alloc(&mut self, region: Region) -> RegionId {
        let slot = Slot {
            region: Some(region),
            ..Slot::default()
        };
        match self.vacant.pop() {
            Some(i) => {
                self.slots[i] = slot;
                RegionId(i)
            }
            None => {
                self.slots.push(slot);
                RegionId(self.slots.len() - 1)
            }
        }
    }

    pub fn release(&mut self, id: RegionId) -> Region {
        let slot = &mut self.slots[id.0];
        if slot.linked {
            panic!("releasing linked region {:?}", id);
        }
        let region = slot
            .region
            .take()
            .unwrap_or_else(|| panic!("double release of region {:?}", id));
        self.vacant.push(id.0);
        region
    }

    pub fn get(&self, id: RegionId) -> &Region {
        self.slots
            .get(id.0)
            .and_then(|s| s.region.as_ref())
            .unwrap_or_else(|| panic!("stale region handle {:?}", id))
    }

    /// Mutable access to fields that are not index keys. Range changes of a
    /// linked region must go through `set_range`.
    pub fn get_mut(&mut self, id: RegionId) -> &mut Region {
        self.slots
            .get_mut(id.0)
            .and_then(|s| s.region.as_mut())
            .unwrap_or_else(|| panic!("stale region handle {:?}", id))
    }

    pub fn is_linked(&self, id: RegionId) -> bool {
        self.slots.get(id.0).map_or(false, |s| s.linked)
    }

    /// Number of linked regions.
    pub fn len(&self) -> usize {
        self.linked
    }

    pub fn is_empty(&self) -> bool {
        self.linked == 0
    }

    pub fn first(&self) -> Option<RegionId> {
        self.head
    }

    pub fn last(&self) -> Option<RegionId> {
        self.tail
    }

    pub fn next_of(&self, id: RegionId) -> Option<RegionId> {
        self.slots[id.0].next
    }

    pub fn prev_of(&self, id: RegionId) -> Option<RegionId> {
        self.slots[id.0].prev
    }

    /// First region whose end lies above `addr`.
    pub fn find(&self, addr: u64) -> Option<RegionId> {
        let cached = self.cache.load(Ordering::Relaxed);
        if cached != NO_CACHE && self.is_linked(RegionId(cached)) {
            let r = self.get(RegionId(cached)).range();
            if r.start <= addr && addr < r.end {
                return Some(RegionId(cached));
            }
        }
        let seg = self.tree.lower_bound_segment(addr)?;
        let id = *self.tree.value(&seg);
        self.cache.store(id.0, Ordering::Relaxed);
        Some(id)
    }

    /// `find` plus the region preceding the result in address order.
    pub fn find_with_prev(&self, addr: u64) -> (Option<RegionId>, Option<RegionId>) {
        match self.find(addr) {
            Some(id) => (Some(id), self.prev_of(id)),
            None => (None, self.tail),
        }
    }

    pub fn prepare_insert(&self, addr: u64) -> PreparedInsert {
        let (next, prev) = self.find_with_prev(addr);
        PreparedInsert {
            prev,
            next,
            next_start: next.map(|id| self.get(id).start()),
        }
    }

    /// First region overlapping `[start, end)`.
    pub fn find_intersection(&self, start: u64, end: u64) -> Option<RegionId> {
        self.find(start).filter(|&id| self.get(id).start() < end)
    }

    pub fn insert(&mut self, id: RegionId) {
        if self.is_linked(id) {
            panic!("region {:?} is already linked", id);
        }
        let range = self.get(id).range();
        if range.is_empty() {
            panic!("linking empty region {:?}", range);
        }
        if !self.tree.add_without_merging(range, id) {
            panic!("region {:?} overlaps an existing region", range);
        }
        let seg = self
            .tree
            .find_segment(range.start)
            .unwrap_or_else(|| panic!("region {:?} missing right after insert", range));
        let prev = self
            .tree
            .prev_segment_of_seg(&seg)
            .map(|s| *self.tree.value(&s));
        let next = match prev {
            Some(p) => self.slots[p.0].next,
            None => self.head,
        };
        {
            let slot = &mut self.slots[id.0];
            slot.prev = prev;
            slot.next = next;
            slot.linked = true;
        }
        match prev {
            Some(p) => self.slots[p.0].next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(n) => self.slots[n.0].prev = Some(id),
            None => self.tail = Some(id),
        }
        self.linked += 1;
    }

    pub fn remove(&mut self, id: RegionId) {
        if !self.is_linked(id) {
            panic!("region {:?} is not linked", id);
        }
        let range = self.get(id).range();
        self.tree.remove(range);
        let (prev, next) = {
            let slot = &mut self.slots[id.0];
            slot.linked = false;
            (slot.prev.take(), slot.next.take())
        };
        match prev {
            Some(p) => self.slots[p.0].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n.0].prev = prev,
            None => self.tail = prev,
        }
        self.linked -= 1;
        if self.cache.load(Ordering::Relaxed) == id.0 {
            self.cache.store(NO_CACHE, Ordering::Relaxed);
        }
    }

    /// Moves a region's key. The new range may overlap the old one but no
    /// other linked region.
    pub fn set_range(&mut self, id: RegionId, range: AddrRange) {
        let old = self.get(id).range();
        if old == range {
            return;
        }
        if self.is_linked(id) {
            self.tree.set_range(old, range);
        }
        self.get_mut(id).set_range(range);
    }

    /// Unlinks the run of regions starting at `first` and lying below `end`,
    /// returned in address order. They stay allocated.
    pub fn detach_run(&mut self, first: RegionId, end: u64) -> Vec<RegionId> {
        let mut run = Vec::new();
        let mut cur = Some(first);
        while let Some(id) = cur.filter(|&id| self.get(id).start() < end) {
            cur = self.next_of(id);
            run.push(id);
        }
        for &id in &run {
            self.remove(id);
        }
        self.cache.store(NO_CACHE, Ordering::Relaxed);
        run
    }

    /// Linked regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = (RegionId, &Region)> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let id = cur?;
            cur = self.slots[id.0].next;
            Some((id, self.get(id)))
        })
    }

    /// Unlinks and releases every region, in address order.
    pub fn take_all(&mut self) -> Vec<(RegionId, Region)> {
        let ids: Vec<RegionId> = self.iter().map(|(id, _)| id).collect();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            self.remove(id);
            out.push((id, self.release(id)));
        }
        out
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let listed: Vec<(RegionId, AddrRange)> =
            self.iter().map(|(id, r)| (id, r.range())).collect();
        let treed: Vec<(RegionId, AddrRange)> =
            self.tree.iter().map(|(r, id)| (*id, *r)).collect();
        ensure!(
            listed == treed,
            "list {:?} and tree {:?} disagree",
            listed,
            treed
        );
        ensure!(
            listed.len() == self.linked,
            "{} regions listed but {} linked",
            listed.len(),
            self.linked
        );
        let mut prev: Option<(RegionId, AddrRange)> = None;
        for &(id, r) in &listed {
            ensure!(r.start < r.end, "empty region {:?}", r);
            if let Some((pid, pr)) = prev {
                if pr.end > r.start {
                    bail!("regions {:?} and {:?} overlap", pr, r);
                }
                ensure!(
                    self.prev_of(id) == Some(pid),
                    "broken back link at {:?}",
                    r
                );
            } else {
                ensure!(self.prev_of(id).is_none(), "head {:?} has a prev", r);
            }
            prev = Some((id, r));
        }
        ensure!(
            self.tail == prev.map(|(id, _)| id),
            "tail {:?} is not the last listed region",
            self.tail
        );
        let linked_slots = self.slots.iter().filter(|s| s.linked).count();
        ensure!(
            linked_slots == self.linked,
            "{} slots marked linked, expected {}",
            linked_slots,
            self.linked
        );
        Ok(())
    }
}
