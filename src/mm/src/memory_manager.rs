use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::ensure;
use arch::MmapLayout;
use mem::{Addr, AddrRange, PAGE_SHIFT};
use memmap::{BackingObject, FileMappings, MappingKey, RegionFlags};
use utils::{bail_libc, SysResult};

use crate::{
    index::{RegionId, RegionIndex},
    region::same_backing,
    AnonToken, Context, Region,
};

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_space_id() -> u64 {
    NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed)
}

pub const DEFAULT_MAX_MAP_COUNT: usize = 65530;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryManagerConfig {
    /// Upper bound on the number of regions.
    pub max_map_count: usize,
    /// Flags added to every new region, e.g. LOCKED after mlockall.
    pub def_flags: RegionFlags,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            max_map_count: DEFAULT_MAX_MAP_COUNT,
            def_flags: RegionFlags::empty(),
        }
    }
}

/// Per-kind page counters of an address space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub total_vm: u64,
    pub locked_vm: u64,
    pub shared_vm: u64,
    pub exec_vm: u64,
    pub stack_vm: u64,
    pub reserved_vm: u64,
}

impl Stats {
    pub(crate) fn account(&mut self, flags: RegionFlags, file: bool, pages: u64) {
        self.total_vm += pages;
        if flags.contains(RegionFlags::LOCKED) {
            self.locked_vm += pages;
        }
        self.apply(flags, file, |c| *c += pages);
    }

    pub(crate) fn unaccount(&mut self, flags: RegionFlags, file: bool, pages: u64) {
        let sub = |c: &mut u64| {
            *c = c
                .checked_sub(pages)
                .unwrap_or_else(|| panic!("page counter underflow: {} - {}", c, pages))
        };
        sub(&mut self.total_vm);
        if flags.contains(RegionFlags::LOCKED) {
            sub(&mut self.locked_vm);
        }
        self.apply(flags, file, sub);
    }

    fn apply<F: FnMut(&mut u64)>(&mut self, flags: RegionFlags, file: bool, mut f: F) {
        if flags.contains(RegionFlags::HUGETLB) {
            if !flags.contains(RegionFlags::DONTCOPY) {
                f(&mut self.shared_vm);
            }
            return;
        }
        if file {
            f(&mut self.shared_vm);
            if flags & (RegionFlags::EXEC | RegionFlags::WRITE) == RegionFlags::EXEC {
                f(&mut self.exec_vm);
            }
        } else if flags.intersects(RegionFlags::GROWSDOWN | RegionFlags::GROWSUP) {
            f(&mut self.stack_vm);
        }
        if flags.intersects(RegionFlags::RESERVED | RegionFlags::IO) {
            f(&mut self.reserved_vm);
        }
    }
}

/// Outcome of the merge decision for a candidate range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MergePlan {
    Neither,
    Prev,
    PrevAndNext,
    Next,
}

// Indexed by prev_abuts << 3 | prev_mergeable << 2 | next_abuts << 1 | next_mergeable.
const MERGE_TABLE: [MergePlan; 16] = [
    MergePlan::Neither,
    MergePlan::Neither,
    MergePlan::Neither,
    MergePlan::Next,
    MergePlan::Neither,
    MergePlan::Neither,
    MergePlan::Neither,
    MergePlan::Next,
    MergePlan::Neither,
    MergePlan::Neither,
    MergePlan::Neither,
    MergePlan::Next,
    MergePlan::Prev,
    MergePlan::Prev,
    MergePlan::Prev,
    MergePlan::PrevAndNext,
];

impl MergePlan {
    pub(crate) fn decide(
        prev_abuts: bool,
        prev_mergeable: bool,
        next_abuts: bool,
        next_mergeable: bool,
    ) -> Self {
        let i = (usize::from(prev_abuts) << 3)
            | (usize::from(prev_mergeable) << 2)
            | (usize::from(next_abuts) << 1)
            | usize::from(next_mergeable);
        MERGE_TABLE[i]
    }
}

/// The set of regions making up one address space, together with the
/// bookkeeping that must stay consistent with it.
pub struct MemoryManager {
    pub(crate) id: u64,
    pub(crate) ctx: Arc<dyn Context>,
    pub(crate) layout: MmapLayout,
    pub(crate) config: MemoryManagerConfig,
    pub(crate) index: RegionIndex,
    /// Where the next bottom-up gap search starts.
    pub(crate) free_area_cache: u64,
    pub(crate) stats: Stats,
    pub(crate) brk: AddrRange,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("id", &self.id)
            .field("layout", &self.layout)
            .field("config", &self.config)
            .field("regions", &self.index)
            .field("free_area_cache", &Addr(self.free_area_cache))
            .field("stats", &self.stats)
            .field("brk", &self.brk)
            .finish()
    }
}

impl MemoryManager {
    pub fn new(ctx: Arc<dyn Context>, layout: MmapLayout) -> Self {
        Self::with_config(ctx, layout, MemoryManagerConfig::default())
    }

    pub fn with_config(ctx: Arc<dyn Context>, layout: MmapLayout, config: MemoryManagerConfig) -> Self {
        let mm = Self {
            id: next_space_id(),
            ctx,
            layout,
            config,
            index: RegionIndex::new(),
            free_area_cache: layout.mmap_base.0,
            stats: Stats::default(),
            brk: AddrRange::default(),
        };
        logger::debug!("new address space {} with layout {:?}", mm.id, layout);
        mm
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn layout(&self) -> &MmapLayout {
        &self.layout
    }

    pub fn config(&self) -> &MemoryManagerConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: MemoryManagerConfig) {
        self.config = config;
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn map_count(&self) -> usize {
        self.index.len()
    }

    /// `[start_brk, brk)`.
    pub fn brk_range(&self) -> AddrRange {
        self.brk
    }

    pub fn free_area_cache(&self) -> Addr {
        Addr(self.free_area_cache)
    }

    /// The first region whose end lies above `addr`.
    pub fn find(&self, addr: Addr) -> Option<&Region> {
        self.index.find(addr.0).map(|id| self.index.get(id))
    }

    pub fn find_id(&self, addr: Addr) -> Option<RegionId> {
        self.index.find(addr.0)
    }

    /// Like `find`, also returning the region before the result.
    pub fn find_with_prev(&self, addr: Addr) -> (Option<&Region>, Option<&Region>) {
        let (found, prev) = self.index.find_with_prev(addr.0);
        (
            found.map(|id| self.index.get(id)),
            prev.map(|id| self.index.get(id)),
        )
    }

    /// The first region overlapping `ar`.
    pub fn find_intersection(&self, ar: AddrRange) -> Option<&Region> {
        self.index
            .find_intersection(ar.start, ar.end)
            .map(|id| self.index.get(id))
    }

    pub fn region(&self, id: RegionId) -> &Region {
        self.index.get(id)
    }

    pub fn regions(&self) -> impl Iterator<Item = &Region> + '_ {
        self.index.iter().map(|(_, r)| r)
    }

    pub fn region_ids(&self) -> impl Iterator<Item = RegionId> + '_ {
        self.index.iter().map(|(id, _)| id)
    }

    pub(crate) fn key(&self, id: RegionId) -> MappingKey {
        MappingKey {
            space: self.id,
            region: id.slot(),
        }
    }

    /// Checks that the index, the secondary indices and the counters agree.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.index.validate()?;
        let mut expect = Stats::default();
        for (id, r) in self.index.iter() {
            let key = self.key(id);
            ensure!(
                Addr(r.start()).is_page_aligned() && Addr(r.end()).is_page_aligned(),
                "region {:?} is not page aligned",
                r.range()
            );
            ensure!(
                r.start() >= self.layout.min_addr.0 && r.end() <= self.layout.task_size(),
                "region {:?} lies outside the layout",
                r.range()
            );
            if let Some(b) = r.backing() {
                let m = b.lock_mappings();
                if r.flags().contains(RegionFlags::NONLINEAR) {
                    ensure!(m.contains_nonlinear(key), "{:?} missing from nonlinear list", key);
                } else {
                    ensure!(
                        m.contains(key, r.range(), r.pgoff(), r.flags().contains(RegionFlags::SHARED)),
                        "{:?} at {:?} missing from the file index",
                        key,
                        r.range()
                    );
                }
            }
            if let Some(a) = r.anon() {
                ensure!(a.lock().contains(key), "{:?} missing from its anon token", key);
            }
            expect.account(r.flags(), r.backing().is_some(), r.pages());
        }
        ensure!(
            expect == self.stats,
            "counters {:?} do not match regions {:?}",
            self.stats,
            expect
        );
        Ok(())
    }

    pub(crate) fn account(&mut self, flags: RegionFlags, file: bool, pages: u64) {
        self.stats.account(flags, file, pages);
    }

    pub(crate) fn unaccount(&mut self, flags: RegionFlags, file: bool, pages: u64) {
        self.stats.unaccount(flags, file, pages);
    }

    /// Links an allocated region into the tree, the list, its backing
    /// object's file index and its anon token's member list.
    pub(crate) fn link_region(&mut self, id: RegionId) {
        let key = self.key(id);
        let region = self.index.get(id);
        if let Some(b) = region.backing().cloned() {
            let mut m = b.lock_mappings();
            link_file(key, region, &mut m);
        }
        if let Some(a) = region.anon() {
            a.lock().link(key);
        }
        self.index.insert(id);
    }

    fn is_mergeable(
        &self,
        id: RegionId,
        flags: RegionFlags,
        backing: Option<&Arc<BackingObject>>,
    ) -> bool {
        let r = self.index.get(id);
        r.flags() == flags && same_backing(r.backing(), backing) && !r.ops().has_close()
    }

    /// Whether a candidate starting at page offset `pgoff` may be appended
    /// to `id`.
    fn can_merge_after(
        &self,
        id: RegionId,
        flags: RegionFlags,
        anon: Option<&AnonToken>,
        backing: Option<&Arc<BackingObject>>,
        pgoff: u64,
    ) -> bool {
        let r = self.index.get(id);
        self.is_mergeable(id, flags, backing)
            && AnonToken::compatible(r.anon(), anon)
            && r.pgoff() + r.pages() == pgoff
    }

    /// Whether a candidate ending at page offset `end_pgoff` may be
    /// prepended to `id`.
    fn can_merge_before(
        &self,
        id: RegionId,
        flags: RegionFlags,
        anon: Option<&AnonToken>,
        backing: Option<&Arc<BackingObject>>,
        end_pgoff: u64,
    ) -> bool {
        let r = self.index.get(id);
        self.is_mergeable(id, flags, backing)
            && AnonToken::compatible(r.anon(), anon)
            && r.pgoff() == end_pgoff
    }

    /// Tries to cover `[addr, end)` by extending `prev`, the region after
    /// it, or both. `prev` is the region the candidate would follow. Returns
    /// the region now covering the candidate, which carries `flags`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn merge(
        &mut self,
        prev: Option<RegionId>,
        addr: u64,
        end: u64,
        flags: RegionFlags,
        anon: Option<&AnonToken>,
        backing: Option<&Arc<BackingObject>>,
        pgoff: u64,
    ) -> Option<RegionId> {
        if flags.is_special() {
            return None;
        }
        let pglen = (end - addr) >> PAGE_SHIFT;
        let area = match prev {
            Some(p) => self.index.next_of(p),
            None => self.index.first(),
        };
        let next = match area {
            Some(a) if self.index.get(a).end() == end => self.index.next_of(a),
            _ => area,
        };

        let prev_abuts = prev.map_or(false, |p| self.index.get(p).end() == addr);
        let prev_mergeable =
            prev.map_or(false, |p| self.can_merge_after(p, flags, anon, backing, pgoff));
        let next_abuts = next.map_or(false, |n| self.index.get(n).start() == end);
        let next_mergeable = next.map_or(false, |n| {
            self.can_merge_before(n, flags, anon, backing, pgoff + pglen)
        });

        let mut plan = MergePlan::decide(prev_abuts, prev_mergeable, next_abuts, next_mergeable);
        if plan == MergePlan::PrevAndNext {
            if let (Some(p), Some(n)) = (prev, next) {
                if !AnonToken::compatible(self.index.get(p).anon(), self.index.get(n).anon()) {
                    plan = MergePlan::Prev;
                }
            }
        }
        logger::trace!(
            "merge {:?} for {:#x}..{:#x}: prev {:?} next {:?}",
            plan,
            addr,
            end,
            prev,
            next
        );

        let merged = match plan {
            MergePlan::Neither => return None,
            MergePlan::Prev | MergePlan::PrevAndNext => {
                let p = prev?;
                let new_end = match (plan, next) {
                    (MergePlan::PrevAndNext, Some(n)) => self.index.get(n).end(),
                    _ => end,
                };
                let (start, pgoff) = {
                    let r = self.index.get(p);
                    (r.start(), r.pgoff())
                };
                self.adjust(p, start, new_end, pgoff, None);
                p
            }
            MergePlan::Next => {
                let n = next?;
                let area = area?;
                match prev {
                    Some(p) if addr < self.index.get(p).end() => {
                        let (start, pgoff) = {
                            let r = self.index.get(p);
                            (r.start(), r.pgoff())
                        };
                        self.adjust(p, start, addr, pgoff, None);
                    }
                    _ => {
                        let (next_end, next_pgoff) = {
                            let r = self.index.get(n);
                            (r.end(), r.pgoff())
                        };
                        self.adjust(area, addr, next_end, next_pgoff - pglen, None);
                    }
                }
                area
            }
        };
        self.index.get_mut(merged).set_flags(flags);
        Some(merged)
    }

    /// Changes the bounds and page offset of `id`, absorbing or trimming the
    /// following region as needed, and links `insert` alongside it. Every
    /// secondary index is updated under its lock so that observers never
    /// see a torn state.
    pub(crate) fn adjust(
        &mut self,
        id: RegionId,
        start: u64,
        end: u64,
        pgoff: u64,
        insert: Option<RegionId>,
    ) {
        let orig_end = end;
        let mut end = end;
        let space = self.id;
        let key = |r: RegionId| MappingKey {
            space,
            region: r.slot(),
        };
        let cur = self.index.get(id).range();

        let mut neighbor = None;
        let mut remove_next = false;
        let mut adjust_next: i64 = 0;
        let mut import = None;
        if let (Some(next), None) = (self.index.next_of(id), insert) {
            let nr = self.index.get(next).range();
            if end >= nr.end {
                remove_next = true;
                end = nr.end;
                import = Some((id, next));
            } else if end > nr.start {
                adjust_next = ((end - nr.start) >> PAGE_SHIFT) as i64;
                import = Some((id, next));
            } else if end < cur.end && nr.start == cur.end {
                adjust_next = -(((cur.end - end) >> PAGE_SHIFT) as i64);
                import = Some((next, id));
            }
            if remove_next || adjust_next != 0 {
                neighbor = Some(next);
            }
        }

        let backing = self.index.get(id).backing().cloned();
        let mut mappings = backing.as_ref().map(|b| b.lock_mappings());
        if let (Some(m), Some(ins)) = (mappings.as_mut(), insert) {
            link_file(key(ins), self.index.get(ins), m);
        }

        let anon = self.index.get(id).anon().cloned().or_else(|| {
            import.and_then(|(_, exporter)| self.index.get(exporter).anon().cloned())
        });
        let mut members = anon.as_ref().map(|a| a.lock());
        if let Some((importer, exporter)) = import {
            if self.index.get(importer).anon().is_none() {
                if let Some(token) = self.index.get(exporter).anon().cloned() {
                    self.index.get_mut(importer).set_anon(Some(token));
                    if let Some(m) = members.as_mut() {
                        m.link(key(importer));
                    }
                }
            }
        }

        let linear = self.index.get(id).in_linear_index();
        if let Some(m) = mappings.as_mut().filter(|_| linear) {
            unindex_file(key(id), self.index.get(id), m);
            if let Some(n) = neighbor.filter(|_| adjust_next != 0) {
                unindex_file(key(n), self.index.get(n), m);
            }
        }

        let new_range = AddrRange::new(start, end);
        match neighbor {
            Some(n) if remove_next => {
                self.index.remove(n);
                self.index.set_range(id, new_range);
            }
            Some(n) if adjust_next > 0 => {
                let delta = (adjust_next as u64) << PAGE_SHIFT;
                let (nr, npgoff) = {
                    let r = self.index.get(n);
                    (r.range(), r.pgoff())
                };
                self.index
                    .set_range(n, AddrRange::new(nr.start + delta, nr.end));
                self.index.get_mut(n).set_pgoff(npgoff + adjust_next as u64);
                self.index.set_range(id, new_range);
            }
            Some(n) if adjust_next < 0 => {
                let pages = adjust_next.unsigned_abs();
                let delta = pages << PAGE_SHIFT;
                let (nr, npgoff) = {
                    let r = self.index.get(n);
                    (r.range(), r.pgoff())
                };
                self.index.set_range(id, new_range);
                self.index
                    .set_range(n, AddrRange::new(nr.start - delta, nr.end));
                self.index.get_mut(n).set_pgoff(npgoff - pages);
            }
            _ => self.index.set_range(id, new_range),
        }
        self.index.get_mut(id).set_pgoff(pgoff);

        if let Some(m) = mappings.as_mut().filter(|_| linear) {
            if let Some(n) = neighbor.filter(|_| adjust_next != 0) {
                index_file(key(n), self.index.get(n), m);
            }
            index_file(key(id), self.index.get(id), m);
        }

        let mut absorbed = None;
        if let Some(n) = neighbor.filter(|_| remove_next) {
            let next = self.index.get(n);
            if next.backing().is_some() {
                if !same_backing(next.backing(), backing.as_ref()) {
                    panic!("absorbed region {:?} has a different backing", next.range());
                }
                if let Some(m) = mappings.as_mut() {
                    unlink_file(key(n), next, m);
                }
            }
            if let Some(token) = next.anon() {
                match (members.as_mut(), anon.as_ref()) {
                    (Some(m), Some(a)) if a.ptr_eq(token) => m.unlink(key(n)),
                    _ => panic!("absorbed region {:?} has a foreign anon token", next.range()),
                }
            }
            absorbed = Some(n);
        } else if let Some(ins) = insert {
            self.index.insert(ins);
            if self.index.get(ins).anon().is_some() {
                if let Some(m) = members.as_mut() {
                    m.link(key(ins));
                }
            }
        }
        drop(members);
        drop(mappings);

        logger::trace!(
            "adjusted {:?} to {:#x}..{:#x} pgoff {:#x} (absorbed {:?}, next moved {} pages)",
            id,
            start,
            end,
            pgoff,
            absorbed,
            adjust_next
        );

        if let Some(n) = absorbed {
            drop(self.index.release(n));
            if orig_end > end {
                self.adjust(id, start, orig_end, pgoff, None);
            }
        }
    }

    /// Splits `id` at `addr`. The original handle keeps the upper part
    /// unless `new_below` is set, in which case the new region is the lower
    /// part.
    pub(crate) fn split(&mut self, id: RegionId, addr: u64, new_below: bool) -> SysResult<()> {
        let region = self.index.get(id);
        if region.is_huge() && !self.ctx.is_huge_aligned(addr, 0) {
            bail_libc!(libc::EINVAL);
        }
        if self.index.len() >= self.config.max_map_count {
            logger::warn!("split of {:?} refused: {} regions", region.range(), self.index.len());
            bail_libc!(libc::ENOMEM);
        }
        let range = region.range();
        if !range.can_split_at(addr) || !Addr(addr).is_page_aligned() {
            bail_libc!(libc::EINVAL);
        }

        let pgoff = region.pgoff();
        let delta = (addr - range.start) >> PAGE_SHIFT;
        let (lo, hi) = range.split_at(addr);
        let mut new = region.clone();
        if new_below {
            new.set_range(lo);
        } else {
            new.set_range(hi);
            new.set_pgoff(pgoff + delta);
        }
        new.ops().open(new.range());
        let new_id = self.index.alloc(new);

        if new_below {
            self.adjust(id, addr, range.end, pgoff + delta, Some(new_id));
        } else {
            self.adjust(id, range.start, addr, pgoff, Some(new_id));
        }
        logger::debug!("split {:?} at {:#x}", range, addr);
        Ok(())
    }

    /// An anon token an adjacent region would share with `id` if the two
    /// differed only in their access bits.
    pub(crate) fn find_mergeable_anon_token(&self, id: RegionId) -> Option<AnonToken> {
        let rwx = RegionFlags::READ | RegionFlags::WRITE | RegionFlags::EXEC;
        let r = self.index.get(id);
        if let Some(near_id) = self.index.next_of(id) {
            let near = self.index.get(near_id);
            let flags = (r.flags() - rwx) | (near.flags() & rwx);
            if near.anon().is_some()
                && r.end() == near.start()
                && self.can_merge_before(near_id, flags, None, r.backing(), r.pgoff() + r.pages())
            {
                return near.anon().cloned();
            }
        }
        if let Some(near_id) = self.index.prev_of(id) {
            let near = self.index.get(near_id);
            let flags = (r.flags() - rwx) | (near.flags() & rwx);
            if near.anon().is_some()
                && near.end() == r.start()
                && self.can_merge_after(near_id, flags, None, r.backing(), r.pgoff())
            {
                return near.anon().cloned();
            }
        }
        None
    }

    /// Makes sure `id` has an anon token, reusing a neighbor's when the two
    /// could later merge.
    pub fn prepare_anon(&mut self, id: RegionId) -> AnonToken {
        if let Some(a) = self.index.get(id).anon() {
            return a.clone();
        }
        let token = self
            .find_mergeable_anon_token(id)
            .unwrap_or_else(|| self.ctx.new_anon_token());
        if self.index.is_linked(id) {
            token.lock().link(self.key(id));
        }
        self.index.get_mut(id).set_anon(Some(token.clone()));
        token
    }
}

fn index_file(key: MappingKey, region: &Region, m: &mut FileMappings) {
    m.insert(
        key,
        region.range(),
        region.pgoff(),
        region.flags().contains(RegionFlags::SHARED),
    );
}

fn unindex_file(key: MappingKey, region: &Region, m: &mut FileMappings) {
    m.remove(
        key,
        region.range(),
        region.pgoff(),
        region.flags().contains(RegionFlags::SHARED),
    );
}

pub(crate) fn link_file(key: MappingKey, region: &Region, m: &mut FileMappings) {
    let backing = match region.backing() {
        Some(b) => b,
        None => return,
    };
    if region.flags().contains(RegionFlags::DENYWRITE) {
        backing.pin_write_denial();
    }
    if region.flags().contains(RegionFlags::SHARED) {
        m.inc_shared_writable();
    }
    if region.flags().contains(RegionFlags::NONLINEAR) {
        m.insert_nonlinear(key);
    } else {
        index_file(key, region, m);
    }
}

pub(crate) fn unlink_file(key: MappingKey, region: &Region, m: &mut FileMappings) {
    let backing = match region.backing() {
        Some(b) => b,
        None => return,
    };
    if region.flags().contains(RegionFlags::DENYWRITE) {
        backing.allow_write_access();
    }
    if region.flags().contains(RegionFlags::SHARED) {
        m.dec_shared_writable();
    }
    if region.flags().contains(RegionFlags::NONLINEAR) {
        m.remove_nonlinear(key);
    } else {
        unindex_file(key, region, m);
    }
}

/// Drops a region that is no longer linked: removes it from its backing
/// object and anon token, then runs its close callback.
pub(crate) fn destroy_region(key: MappingKey, region: Region) {
    if let Some(b) = region.backing().cloned() {
        let mut m = b.lock_mappings();
        unlink_file(key, &region, &mut m);
    }
    region.ops().close(region.range());
    if let Some(a) = region.anon() {
        a.lock().unlink(key);
    }
}
