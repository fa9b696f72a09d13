use std::sync::RwLock;

use arch::FIRST_USER_PGD_NR;
use mem::{Addr, AddrRange};
use memmap::{MappingKey, RegionFlags};
use utils::{bail_libc, SysResult};

use crate::{
    memory_manager::{destroy_region, next_space_id},
    MemoryManager, Region, RegionId, Stats,
};

impl MemoryManager {
    /// Removes every mapping in `[addr, addr+length)`, splitting regions
    /// that straddle either end.
    pub fn remove_mapping(&mut self, addr: Addr, length: u64) -> SysResult<()> {
        let task = self.layout.task_size();
        if !addr.is_page_aligned() || addr.0 > task || length > task - addr.0 {
            bail_libc!(libc::EINVAL);
        }
        let len = Addr(length).round_up().map_or(0, |a| a.0);
        if len == 0 {
            bail_libc!(libc::EINVAL);
        }
        let start = addr.0;
        let end = start + len;

        let (first, mut prev) = self.index.find_with_prev(start);
        let first = match first {
            Some(id) => id,
            None => return Ok(()),
        };
        let region = self.index.get(first);
        if region.start() >= end {
            return Ok(());
        }
        if region.is_huge() && !self.ctx.is_huge_aligned(start, len) {
            bail_libc!(libc::EINVAL);
        }

        let head = region.start() < start;
        let tail = self
            .index
            .find(end)
            .map_or(false, |id| self.index.get(id).start() < end);
        let splits = usize::from(head) + usize::from(tail);
        if splits > 0 && self.index.len() + splits > self.config.max_map_count {
            logger::warn!("unmap of {:?} needs {} more regions", AddrRange::new(start, end), splits);
            bail_libc!(libc::ENOMEM);
        }

        if head {
            self.split(first, start, false)?;
            prev = Some(first);
        }
        if let Some(last) = self.index.find(end) {
            if self.index.get(last).start() < end {
                self.split(last, end, true)?;
            }
        }

        let run_first = match prev {
            Some(p) => self.index.next_of(p),
            None => self.index.first(),
        };
        let run = match run_first {
            Some(id) => self.index.detach_run(id, end),
            None => return Ok(()),
        };
        let accounted = self.unmap_region(&run, prev, start, end);
        self.remove_regions(run);
        if accounted > 0 {
            self.ctx.accountant().release(accounted);
        }
        logger::debug!("unmapped {:#x}..{:#x}", start, end);
        Ok(())
    }

    /// Clears the page tables under the detached regions and frees the
    /// directories nothing else uses. Returns the number of charged pages
    /// the regions held.
    fn unmap_region(&self, run: &[RegionId], prev: Option<RegionId>, start: u64, end: u64) -> u64 {
        let span = AddrRange::new(start, end);
        let mut accounted = 0;
        for &id in run {
            let r = self.index.get(id);
            let ar = r.range().intersect(&span);
            if !ar.is_empty() {
                self.ctx.zap_range(ar);
            }
            if r.flags().contains(RegionFlags::ACCOUNT) {
                accounted += r.pages();
            }
        }
        self.free_pgtables(prev, start, end);
        accounted
    }

    /// Frees the top-level page directories wholly inside the hole left by
    /// unmapping `[start, end)`. `prev` is the region before the hole; the
    /// directories shared with it or with the next region survive.
    pub(crate) fn free_pgtables(&self, prev: Option<RegionId>, start: u64, end: u64) {
        let size = self.layout.pgdir_size();
        let mut first = start & !(size - 1);
        let mut last = end.saturating_add(size - 1);

        let prev = match prev {
            Some(p) => Some(p),
            None => match self.index.first() {
                None => None,
                Some(head) => {
                    let r = self.index.get(head);
                    if r.end() > start {
                        if last > r.start() {
                            last = r.start();
                        }
                        None
                    } else {
                        Some(head)
                    }
                }
            },
        };
        if let Some(mut p) = prev {
            while let Some(n) = self.index.next_of(p) {
                let next = self.index.get(n);
                if next.start() < start {
                    p = n;
                    continue;
                }
                if last > next.start() {
                    last = next.start();
                }
                break;
            }
            let prev_end = self.index.get(p).end();
            if prev_end > first {
                first = prev_end.saturating_add(size - 1);
            }
        }

        if last < first {
            return;
        }
        let start_index = std::cmp::max(self.layout.pgd_index(first), FIRST_USER_PGD_NR);
        let end_index = std::cmp::min(
            self.layout.pgd_index(last),
            FIRST_USER_PGD_NR + self.layout.user_ptrs_per_pgd(),
        );
        if end_index > start_index {
            logger::trace!("freeing page directories {}..{}", start_index, end_index);
            self.ctx.free_page_tables(start_index, end_index);
        }
    }

    /// Accounts, releases and destroys detached regions.
    fn remove_regions(&mut self, run: Vec<RegionId>) {
        for id in run {
            let key = self.key(id);
            let region = self.index.release(id);
            self.unaccount(region.flags(), region.backing().is_some(), region.pages());
            self.unmap_area(region.start());
            destroy_region(key, region);
        }
    }

    /// Lets the gap search reuse the space of a region that started below
    /// the cached position.
    fn unmap_area(&mut self, start: u64) {
        if start >= self.layout.mmap_base.0 && start < self.free_area_cache {
            self.free_area_cache = start;
        }
    }

    /// Tears the whole address space down. The region list is detached
    /// under the write lock; the regions are then destroyed without it.
    pub fn teardown(mm: &RwLock<MemoryManager>) {
        let (space, regions) = {
            let mut mm = mm.write().unwrap_or_else(|e| e.into_inner());
            mm.exit_regions()
        };
        let count = regions.len();
        for (id, region) in regions {
            destroy_region(
                MappingKey {
                    space,
                    region: id.slot(),
                },
                region,
            );
        }
        logger::debug!("address space {} torn down ({} regions)", space, count);
    }

    /// Zaps and unlinks every region and resets the counters. Returns the
    /// old space id with the regions still to be destroyed; the manager
    /// itself moves on to a fresh id so recycled slots never collide with
    /// the old keys.
    fn exit_regions(&mut self) -> (u64, Vec<(RegionId, Region)>) {
        let mut accounted = 0;
        for (_, r) in self.index.iter() {
            self.ctx.zap_range(r.range());
            if r.flags().contains(RegionFlags::ACCOUNT) {
                accounted += r.pages();
            }
        }
        if accounted > 0 {
            self.ctx.accountant().release(accounted);
        }
        self.ctx.free_page_tables(
            FIRST_USER_PGD_NR,
            FIRST_USER_PGD_NR + self.layout.user_ptrs_per_pgd(),
        );
        let regions = self.index.take_all();
        self.stats = Stats::default();
        self.free_area_cache = self.layout.mmap_base.0;
        self.brk = AddrRange::default();
        let space = self.id;
        self.id = next_space_id();
        (space, regions)
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if self.index.is_empty() {
            return;
        }
        let (space, regions) = self.exit_regions();
        for (id, region) in regions {
            destroy_region(
                MappingKey {
                    space,
                    region: id.slot(),
                },
                region,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use mem::{AccessType, PAGE_SIZE};
    use memmap::{MapFlags, MmapOpts, OpenMode};
    use rand::Rng;
    use std::sync::Arc;
    use utils::SysErrorKind;

    #[test]
    fn unmap_middle_of_region() {
        let (ctx, mut mm) = memory_manager();
        mm.create_mapping(&anon_private(0x2000, 0x6000, AccessType::read_write()))
            .unwrap();
        assert_eq!(ctx.committed(), 6);
        mm.remove_mapping(Addr(0x3000), 0x1000).unwrap();
        assert_eq!(
            ranges(&mm),
            vec![AddrRange::new(0x2000, 0x3000), AddrRange::new(0x4000, 0x8000)]
        );
        assert_eq!(ctx.take_zapped(), vec![AddrRange::new(0x3000, 0x4000)]);
        assert_eq!(mm.stats().total_vm, 5);
        assert_eq!(ctx.committed(), 5);
        let upper = mm.find(Addr(0x4000)).unwrap();
        assert_eq!(upper.pgoff(), 0x4);
        mm.validate().unwrap();
    }

    #[test]
    fn unmap_below_huge_region_is_ok() {
        let (_ctx, mut mm) = memory_manager();
        let mut file = TestFile::new(OpenMode::read_write());
        file.huge = true;
        let huge = mem::HUGE_PAGE_SIZE;
        let opts = MmapOpts::backed(
            file.into_object(),
            Addr(2 * huge),
            huge,
            AccessType::read_write(),
            MapFlags::SHARED | MapFlags::FIXED,
            0,
        );
        mm.create_mapping(&opts).unwrap();

        // nothing overlaps, so alignment does not matter
        mm.remove_mapping(Addr(huge), 0x1000).unwrap();
        mm.remove_mapping(Addr(2 * huge - 0x1000), 0x1000).unwrap();
        assert_eq!(ranges(&mm), vec![AddrRange::new(2 * huge, 3 * huge)]);

        assert_eq!(
            mm.remove_mapping(Addr(2 * huge - 0x1000), 0x2000)
                .unwrap_err()
                .kind(),
            SysErrorKind::InvalidArgument
        );
        assert_eq!(mm.map_count(), 1);
        mm.validate().unwrap();
    }

    #[test]
    fn unmap_argument_errors() {
        struct Test {
            _name: &'static str,
            addr: u64,
            len: u64,
        }
        let tests = [
            Test {
                _name: "zero length",
                addr: 0x2000,
                len: 0,
            },
            Test {
                _name: "unaligned",
                addr: 0x2800,
                len: 0x1000,
            },
            Test {
                _name: "past the end",
                addr: TEST_TASK_SIZE - 0x1000,
                len: 0x2000,
            },
            Test {
                _name: "above the address space",
                addr: TEST_TASK_SIZE + 0x1000,
                len: 0x1000,
            },
        ];
        let (_ctx, mut mm) = memory_manager();
        mm.create_mapping(&anon_private(0x2000, 0x2000, AccessType::read()))
            .unwrap();
        for test in &tests {
            let err = mm.remove_mapping(Addr(test.addr), test.len).unwrap_err();
            assert_eq!(err.kind(), SysErrorKind::InvalidArgument, "{}", test._name);
        }
        assert_eq!(ranges(&mm), vec![AddrRange::new(0x2000, 0x4000)]);
    }

    #[test]
    fn unmap_nothing_is_ok() {
        let (ctx, mut mm) = memory_manager();
        mm.remove_mapping(Addr(0x10000), 0x1000).unwrap();
        mm.create_mapping(&anon_private(0x20000, 0x1000, AccessType::read()))
            .unwrap();
        mm.remove_mapping(Addr(0x10000), 0x1000).unwrap();
        mm.remove_mapping(Addr(0x30000), 0x1000).unwrap();
        assert_eq!(mm.map_count(), 1);
        assert!(ctx.take_zapped().is_empty());
        // unaligned lengths are rounded up
        mm.remove_mapping(Addr(0x20000), 1).unwrap();
        assert_eq!(mm.map_count(), 0);
    }

    #[test]
    fn unmap_spanning_several_regions() {
        let (ctx, mut mm) = memory_manager();
        let r = AccessType::read();
        let rw = AccessType::read_write();
        mm.create_mapping(&anon_private(0x10000, 0x3000, r)).unwrap();
        mm.create_mapping(&anon_private(0x13000, 0x3000, rw)).unwrap();
        mm.create_mapping(&anon_private(0x18000, 0x3000, r)).unwrap();
        ctx.take_zapped();

        mm.remove_mapping(Addr(0x11000), 0x9000).unwrap();
        assert_eq!(
            ranges(&mm),
            vec![AddrRange::new(0x10000, 0x11000), AddrRange::new(0x1a000, 0x1b000)]
        );
        assert_eq!(
            ctx.take_zapped(),
            vec![
                AddrRange::new(0x11000, 0x13000),
                AddrRange::new(0x13000, 0x16000),
                AddrRange::new(0x18000, 0x1a000),
            ]
        );
        assert_eq!(ctx.committed(), 0);
        assert_eq!(mm.stats().total_vm, 2);
        mm.validate().unwrap();
    }

    #[test]
    fn split_budget_is_checked_first() {
        let (_ctx, mut mm) = memory_manager();
        mm.create_mapping(&anon_private(0x10000, 0x4000, AccessType::read()))
            .unwrap();
        mm.set_config(crate::MemoryManagerConfig {
            max_map_count: 2,
            ..Default::default()
        });
        let err = mm.remove_mapping(Addr(0x11000), 0x1000).unwrap_err();
        assert_eq!(err.kind(), SysErrorKind::OutOfMemory);
        assert_eq!(ranges(&mm), vec![AddrRange::new(0x10000, 0x14000)]);
        // one split fits
        mm.remove_mapping(Addr(0x10000), 0x1000).unwrap();
        assert_eq!(ranges(&mm), vec![AddrRange::new(0x11000, 0x14000)]);
    }

    #[test]
    fn close_runs_once_per_region() {
        let (_ctx, mut mm) = memory_manager();
        let ops = Arc::new(CountingOps::new(true));
        let mut file = TestFile::new(OpenMode::read_write());
        file.ops = Some(ops.clone());
        let opts = MmapOpts::backed(
            file.into_object(),
            Addr(0x10000),
            0x4000,
            AccessType::read(),
            MapFlags::PRIVATE | MapFlags::FIXED,
            0,
        );
        mm.create_mapping(&opts).unwrap();
        mm.remove_mapping(Addr(0x11000), 0x2000).unwrap();
        assert_eq!(ops.opens(), 2);
        assert_eq!(ops.closes(), 1);
        assert_eq!(mm.map_count(), 2);
        // regions with a close callback never merge back together
        let opts = MmapOpts {
            addr: Addr(0x11000),
            length: 0x2000,
            pgoff: 1,
            ..opts
        };
        mm.create_mapping(&opts).unwrap();
        assert_eq!(mm.map_count(), 3);
        drop(mm);
        assert_eq!(ops.closes(), 4);
    }

    #[test]
    fn free_page_directories() {
        // one directory covers 1 MiB in the test layout
        struct Test {
            _name: &'static str,
            layout: Vec<(u64, u64)>,
            unmap: (u64, u64),
            freed: Vec<(u64, u64)>,
        }
        let mib = 1 << 20;
        let tests = vec![
            Test {
                _name: "lone region",
                layout: vec![(mib, 3 * mib)],
                unmap: (mib, 3 * mib),
                freed: vec![(1, 3)],
            },
            Test {
                _name: "shared with both neighbors",
                layout: vec![(mib, mib + mib / 2), (mib + mib / 2, 2 * mib + mib / 2), (2 * mib + mib / 2, 3 * mib)],
                unmap: (mib + mib / 2, 2 * mib + mib / 2),
                freed: vec![],
            },
            Test {
                _name: "neighbors far away",
                layout: vec![(mib / 2, mib / 2 + 0x1000), (mib, 4 * mib), (6 * mib, 6 * mib + 0x1000)],
                unmap: (mib, 4 * mib),
                freed: vec![(1, 4)],
            },
            Test {
                _name: "next shares the last directory",
                layout: vec![(mib, 3 * mib), (3 * mib + 0x1000, 3 * mib + 0x2000)],
                unmap: (mib, 3 * mib),
                freed: vec![(1, 3)],
            },
            Test {
                _name: "prev shares the first directory",
                layout: vec![(mib, mib + 0x1000), (mib + 0x2000, 3 * mib)],
                unmap: (mib + 0x2000, 3 * mib),
                freed: vec![(2, 3)],
            },
        ];
        for test in &tests {
            let (ctx, mut mm) = memory_manager();
            let choices = [AccessType::read(), AccessType::read_execute()];
            let mut perms = choices.iter().cycle();
            for &(s, e) in &test.layout {
                let p = *perms.next().unwrap();
                mm.create_mapping(&anon_private(s, e - s, p)).unwrap();
            }
            assert_eq!(mm.map_count(), test.layout.len(), "{}", test._name);
            mm.remove_mapping(Addr(test.unmap.0), test.unmap.1 - test.unmap.0)
                .unwrap();
            assert_eq!(ctx.take_freed(), test.freed, "{}", test._name);
        }
    }

    #[test]
    fn gap_cache_moves_down_on_unmap() {
        let (_ctx, mut mm) = memory_manager();
        let opts = MmapOpts::anonymous(Addr(0), 0x2000, AccessType::read(), MapFlags::PRIVATE);
        let a = mm.create_mapping(&opts).unwrap();
        let b = mm.create_mapping(&MmapOpts {
            perms: AccessType::read_write(),
            ..opts.clone()
        })
        .unwrap();
        assert_eq!(b.0, a.0 + 0x2000);
        assert_eq!(mm.free_area_cache().0, b.0 + 0x2000);
        mm.remove_mapping(a, 0x2000).unwrap();
        assert_eq!(mm.free_area_cache(), a);
        assert_eq!(mm.create_mapping(&opts).unwrap(), a);
    }

    #[test]
    fn random_map_unmap_keeps_invariants() {
        let mut rng = rand::thread_rng();
        let (ctx, mut mm) = memory_manager();
        let perms = [AccessType::read(), AccessType::read_write(), AccessType::read_execute()];
        let base = 0x100000u64;
        let mut mapped = vec![false; 128];
        for _ in 0..400 {
            let page = rng.gen_range(0..120u64);
            let pages = rng.gen_range(1..8u64);
            let addr = base + page * PAGE_SIZE;
            if rng.gen_bool(0.6) {
                let p = perms[rng.gen_range(0..perms.len())];
                mm.create_mapping(&anon_private(addr, pages * PAGE_SIZE, p)).unwrap();
                mapped[page as usize..(page + pages) as usize]
                    .iter_mut()
                    .for_each(|m| *m = true);
            } else {
                mm.remove_mapping(Addr(addr), pages * PAGE_SIZE).unwrap();
                mapped[page as usize..(page + pages) as usize]
                    .iter_mut()
                    .for_each(|m| *m = false);
            }
            mm.validate().unwrap();
            for (i, &m) in mapped.iter().enumerate() {
                let a = base + i as u64 * PAGE_SIZE;
                assert_eq!(mm.find_intersection(AddrRange::new(a, a + PAGE_SIZE)).is_some(), m);
            }
            let charged: u64 = mm
                .regions()
                .filter(|r| r.flags().contains(RegionFlags::ACCOUNT))
                .map(|r| r.pages())
                .sum();
            assert_eq!(ctx.committed(), charged);
            // adjacent regions that could merge never coexist
            let regions: Vec<&Region> = mm.regions().collect();
            for w in regions.windows(2) {
                assert!(!(w[0].end() == w[1].start() && w[0].flags() == w[1].flags()));
            }
        }
        mm.remove_mapping(Addr(base), 128 * PAGE_SIZE).unwrap();
        assert_eq!(ctx.committed(), 0);
        assert_eq!(mm.stats(), Stats::default());
    }

    #[test]
    fn teardown_releases_everything() {
        let (ctx, mm) = memory_manager();
        let mm = RwLock::new(mm);
        let ops = Arc::new(CountingOps::new(true));
        let backing = {
            let mut file = TestFile::new(OpenMode::read_write());
            file.ops = Some(ops.clone());
            file.into_object()
        };
        let old_id = {
            let mut mm = mm.write().unwrap();
            mm.create_mapping(&anon_private(0x10000, 0x4000, AccessType::read_write()))
                .unwrap();
            mm.create_mapping(&MmapOpts::backed(
                backing.clone(),
                Addr(0x20000),
                0x2000,
                AccessType::read_write(),
                MapFlags::SHARED | MapFlags::FIXED | MapFlags::DENYWRITE,
                0,
            ))
            .unwrap();
            let id = mm.find_id(Addr(0x10000)).unwrap();
            mm.prepare_anon(id);
            mm.set_brk_base(Addr(0x40000));
            assert_eq!(mm.brk(Addr(0x42000)), Addr(0x42000));
            mm.id()
        };
        assert_eq!(ctx.committed(), 8);
        assert_eq!(backing.write_count(), -1);
        ctx.take_zapped();

        MemoryManager::teardown(&mm);
        let mm = mm.into_inner().unwrap();
        assert_eq!(mm.map_count(), 0);
        assert_ne!(mm.id(), old_id);
        assert_eq!(mm.stats(), Stats::default());
        assert_eq!(ctx.committed(), 0);
        assert_eq!(ops.closes(), 1);
        assert_eq!(backing.write_count(), 0);
        assert!(backing.lock_mappings().is_empty());
        assert_eq!(ctx.take_zapped().len(), 3);
        let top = FIRST_USER_PGD_NR + mm.layout().user_ptrs_per_pgd();
        assert_eq!(ctx.take_freed().last(), Some(&(FIRST_USER_PGD_NR, top)));
        mm.validate().unwrap();
    }

    #[test]
    fn drop_releases_everything() {
        let (ctx, mut mm) = memory_manager();
        let backing = TestFile::new(OpenMode::read_write()).into_object();
        mm.create_mapping(&MmapOpts::backed(
            backing.clone(),
            Addr(0x20000),
            0x2000,
            AccessType::read_write(),
            MapFlags::SHARED | MapFlags::FIXED,
            0,
        ))
        .unwrap();
        assert_eq!(ctx.committed(), 2);
        drop(mm);
        assert_eq!(ctx.committed(), 0);
        assert!(backing.lock_mappings().is_empty());
    }
}
