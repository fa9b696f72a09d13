use std::sync::Arc;

use mem::{Addr, AddrRange, PAGE_SHIFT, PAGE_SIZE};
use memmap::{BackingObject, MapFlags, MapType, MmapOpts, PopulateRequest, RegionFlags};
use utils::{bail_libc, SysError, SysResult};

use crate::{region::RegionOps, MemoryManager, Region, RegionId};

fn einval() -> SysError {
    SysError::new(libc::EINVAL)
}

impl MemoryManager {
    /// Establishes a new mapping and returns its start address.
    pub fn create_mapping(&mut self, opts: &MmapOpts) -> SysResult<Addr> {
        let backing = opts.backing.clone();
        if let Some(b) = &backing {
            if !b.mappable().can_populate() {
                bail_libc!(libc::ENODEV);
            }
        }
        if opts.length == 0 {
            bail_libc!(libc::EINVAL);
        }
        let len = Addr(opts.length)
            .round_up()
            .map(|a| a.0)
            .filter(|&l| l <= self.layout.task_size())
            .ok_or_else(einval)?;
        let pages = len >> PAGE_SHIFT;
        opts.pgoff
            .checked_add(pages)
            .and_then(|e| e.checked_mul(PAGE_SIZE))
            .ok_or_else(einval)?;
        if self.index.len() >= self.config.max_map_count {
            logger::warn!("mapping refused: {} regions", self.index.len());
            return Err(SysError::too_many_mappings());
        }
        let map_type = opts.flags.map_type().ok_or_else(einval)?;

        let addr = self
            .get_unmapped_area(backing.as_ref(), opts.addr, len, opts.pgoff, opts.flags)?
            .0;

        let mut flags = RegionFlags::from_access(opts.perms)
            | RegionFlags::from_map_flags(opts.flags)
            | self.config.def_flags
            | RegionFlags::MAYREAD
            | RegionFlags::MAYWRITE
            | RegionFlags::MAYEXEC;
        if opts.flags.contains(MapFlags::LOCKED) && !self.can_lock() {
            bail_libc!(libc::EPERM);
        }
        if flags.contains(RegionFlags::LOCKED) {
            self.check_lock_limit(len)?;
        }

        let mut pgoff = opts.pgoff;
        match &backing {
            Some(b) => {
                let mode = b.mappable().mode();
                if map_type == MapType::Shared {
                    if opts.perms.write && !mode.write {
                        bail_libc!(libc::EACCES);
                    }
                    // a writable shared mapping of an append-only file
                    // could write anywhere
                    if mode.append_only && mode.write {
                        bail_libc!(libc::EACCES);
                    }
                    if mode.mandatory_locked {
                        bail_libc!(libc::EAGAIN);
                    }
                    flags |= RegionFlags::SHARED | RegionFlags::MAYSHARE;
                    if !mode.write {
                        flags -= RegionFlags::MAYWRITE | RegionFlags::SHARED;
                    }
                }
                if !mode.read {
                    bail_libc!(libc::EACCES);
                }
                if flags.intersects(RegionFlags::GROWSDOWN | RegionFlags::GROWSUP) {
                    bail_libc!(libc::EINVAL);
                }
            }
            None => match map_type {
                MapType::Shared => flags |= RegionFlags::SHARED | RegionFlags::MAYSHARE,
                MapType::Private => pgoff = addr >> PAGE_SHIFT,
            },
        }
        if !self
            .ctx
            .security_mmap(backing.as_deref(), opts.perms, opts.flags)
        {
            logger::warn!("mapping at {:#x} denied by security policy", addr);
            bail_libc!(libc::EACCES);
        }

        self.clear_range(addr, len)?;
        self.check_address_space(pages)?;

        let charged = self.charge_new_mapping(backing.as_ref(), opts.flags, &mut flags, pages)?;

        let mut merged = None;
        if backing.is_none() && map_type == MapType::Private {
            let prev = self.index.prepare_insert(addr).prev;
            merged = self.merge(prev, addr, addr + len, flags, None, None, pgoff);
        }
        let (range, flags, file) = match merged {
            Some(_) => (AddrRange::new(addr, addr + len), flags, false),
            None => {
                let ar = AddrRange::new(addr, addr + len);
                match self.install_region(backing, ar, flags, pgoff) {
                    Ok(r) => r,
                    Err(e) => {
                        if charged > 0 {
                            self.ctx.accountant().release(charged);
                        }
                        return Err(e);
                    }
                }
            }
        };

        self.account(flags, file, pages);
        if flags.contains(RegionFlags::LOCKED) || opts.flags.contains(MapFlags::POPULATE) {
            self.ctx.populate_range(range);
        }
        logger::debug!(
            "mapped {:?} flags {:?} pgoff {:#x} (merged: {})",
            range,
            flags,
            pgoff,
            merged.is_some()
        );
        Ok(Addr(range.start))
    }

    /// Creates, populates and links the region for a mapping that could not
    /// extend a neighbor. Returns the final range and flags, and whether the
    /// region has a backing object.
    fn install_region(
        &mut self,
        backing: Option<Arc<BackingObject>>,
        ar: AddrRange,
        flags: RegionFlags,
        pgoff: u64,
    ) -> SysResult<(AddrRange, RegionFlags, bool)> {
        let mut region = Region::new(ar, flags, None, pgoff);
        let mut denied = None;
        let from_file = backing.is_some();
        match backing {
            Some(b) => {
                if flags.contains(RegionFlags::DENYWRITE) {
                    b.deny_write_access()?;
                    denied = Some(b.clone());
                }
                let mut req = PopulateRequest {
                    range: ar,
                    pgoff,
                    flags,
                    operations: None,
                };
                if let Err(e) = b.mappable().populate(&mut req) {
                    logger::debug!("populate of {:?} failed: {}", ar, e);
                    self.ctx.zap_range(ar);
                    if let Some(d) = denied {
                        d.allow_write_access();
                    }
                    return Err(e);
                }
                region.set_range(req.range);
                region.set_pgoff(req.pgoff);
                region.set_flags(req.flags);
                region.set_ops(RegionOps::from_operations(req.operations));
                region.set_backing(Some(b));
            }
            None if flags.contains(RegionFlags::SHARED) => {
                region.set_backing(Some(self.ctx.shared_anonymous_object(ar.len())?));
            }
            None => {}
        }

        let range = region.range();
        let fits = range.len() == ar.len()
            && Addr(range.start).is_page_aligned()
            && range.start >= self.layout.min_addr.0
            && range.end <= self.layout.task_size();
        let prepared = self.index.prepare_insert(range.start);
        if !fits || prepared.collides(range.end) {
            logger::warn!("populate moved {:?} to unusable {:?}", ar, range);
            self.ctx.zap_range(range);
            if let Some(d) = denied {
                d.allow_write_access();
            }
            bail_libc!(libc::EINVAL);
        }

        if from_file {
            let merged = self.merge(
                prepared.prev,
                range.start,
                range.end,
                region.flags(),
                None,
                region.backing(),
                region.pgoff(),
            );
            if merged.is_some() {
                if let Some(d) = denied {
                    d.allow_write_access();
                }
                return Ok((range, region.flags(), true));
            }
        }

        let flags = region.flags();
        let file = region.backing().is_some();
        let id = self.index.alloc(region);
        self.link_region(id);
        // the region now pins the denial itself
        if let Some(d) = denied {
            d.allow_write_access();
        }
        Ok((range, flags, file))
    }

    /// Unmaps whatever overlaps `[addr, addr+len)`.
    fn clear_range(&mut self, addr: u64, len: u64) -> SysResult<()> {
        while self.index.prepare_insert(addr).collides(addr + len) {
            if self.remove_mapping(Addr(addr), len).is_err() {
                bail_libc!(libc::ENOMEM);
            }
        }
        Ok(())
    }

    fn check_address_space(&self, pages: u64) -> SysResult<()> {
        let limit = self.ctx.limits().get_address_space().cur;
        let total = (self.stats.total_vm + pages).saturating_mul(PAGE_SIZE);
        if total > limit {
            logger::warn!("address space limit {:#x} exceeded: {:#x}", limit, total);
            bail_libc!(libc::ENOMEM);
        }
        Ok(())
    }

    fn can_lock(&self) -> bool {
        self.ctx.capable_ipc_lock() || self.ctx.limits().get_memory_locked().cur != 0
    }

    fn check_lock_limit(&self, len: u64) -> SysResult<()> {
        let limit = self.ctx.limits().get_memory_locked().cur;
        let locked = self.stats.locked_vm.saturating_mul(PAGE_SIZE).saturating_add(len);
        if locked > limit && !self.ctx.capable_ipc_lock() {
            logger::warn!("locked memory limit {:#x} exceeded: {:#x}", limit, locked);
            bail_libc!(libc::EAGAIN);
        }
        Ok(())
    }

    /// Reserves commit for a new mapping that needs it and marks it
    /// ACCOUNT. Returns the number of pages charged.
    fn charge_new_mapping(
        &self,
        backing: Option<&Arc<BackingObject>>,
        map_flags: MapFlags,
        flags: &mut RegionFlags,
        pages: u64,
    ) -> SysResult<u64> {
        if backing.map_or(false, |b| b.mappable().is_huge()) {
            return Ok(0);
        }
        let accountant = self.ctx.accountant();
        if map_flags.contains(MapFlags::NORESERVE) && !accountant.strict() {
            return Ok(0);
        }
        if !flags.intersects(RegionFlags::SHARED | RegionFlags::WRITE) {
            return Ok(0);
        }
        if !accountant.reserve(pages) {
            bail_libc!(libc::ENOMEM);
        }
        *flags |= RegionFlags::ACCOUNT;
        Ok(pages)
    }

    /// Picks the address for a mapping of `len` bytes.
    pub fn get_unmapped_area(
        &mut self,
        backing: Option<&Arc<BackingObject>>,
        addr: Addr,
        len: u64,
        pgoff: u64,
        flags: MapFlags,
    ) -> SysResult<Addr> {
        let task = self.layout.task_size();
        if len > task {
            bail_libc!(libc::ENOMEM);
        }
        let found = if flags.contains(MapFlags::FIXED) {
            if addr.0 < self.layout.min_addr.0 || addr.0 > task - len {
                bail_libc!(libc::ENOMEM);
            }
            if !addr.is_page_aligned() {
                bail_libc!(libc::EINVAL);
            }
            addr.0
        } else {
            match backing.and_then(|b| b.mappable().get_unmapped_area(addr, len, pgoff, flags)) {
                Some(chosen) => {
                    let chosen = chosen?;
                    if !chosen.is_page_aligned() {
                        bail_libc!(libc::EINVAL);
                    }
                    if chosen.0 < self.layout.min_addr.0 || chosen.0 > task - len {
                        bail_libc!(libc::ENOMEM);
                    }
                    chosen.0
                }
                None => self.arch_get_unmapped_area(addr, len)?,
            }
        };
        if backing.map_or(false, |b| b.mappable().is_huge()) && !self.ctx.is_huge_aligned(found, len) {
            bail_libc!(libc::EINVAL);
        }
        Ok(Addr(found))
    }

    fn arch_get_unmapped_area(&mut self, hint: Addr, len: u64) -> SysResult<u64> {
        let task = self.layout.task_size();
        if hint.0 != 0 {
            if let Some(a) = hint.round_up() {
                let a = a.0;
                if a >= self.layout.min_addr.0
                    && a <= task - len
                    && self.index.find_intersection(a, a + len).is_none()
                {
                    return Ok(a);
                }
            }
        }
        self.find_free_gap(len, self.layout.mmap_base.0)
    }

    /// Lowest-address-first search for `len` free bytes at or above the
    /// search cache, falling back to `floor` once.
    pub(crate) fn find_free_gap(&mut self, len: u64, floor: u64) -> SysResult<u64> {
        let task = self.layout.task_size();
        let max = match task.checked_sub(len) {
            Some(m) => m,
            None => bail_libc!(libc::ENOMEM),
        };
        let mut start = if self.free_area_cache >= floor {
            self.free_area_cache
        } else {
            floor
        };
        'search: loop {
            let mut addr = start;
            let mut cur = self.index.find(addr);
            loop {
                if addr > max {
                    if start != floor {
                        logger::trace!("gap search from {:#x} wrapped to {:#x}", start, floor);
                        start = floor;
                        continue 'search;
                    }
                    bail_libc!(libc::ENOMEM);
                }
                match cur {
                    Some(id) if addr + len > self.index.get(id).start() => {
                        addr = self.index.get(id).end();
                        cur = self.index.next_of(id);
                    }
                    _ => {
                        self.free_area_cache = addr + len;
                        logger::trace!("free gap for {:#x} bytes at {:#x}", len, addr);
                        return Ok(addr);
                    }
                }
            }
        }
    }

    /// Moves the break to `addr`, discarding the old heap.
    pub fn set_brk_base(&mut self, addr: Addr) {
        if !self.brk.is_empty() {
            let start = Addr(self.brk.start).round_down();
            let end = Addr(self.brk.end).round_up().unwrap_or(Addr(self.brk.end));
            if end.0 > start.0 {
                if let Err(e) = self.remove_mapping(start, end.0 - start.0) {
                    logger::warn!("failed to unmap old heap {:?}: {}", self.brk, e);
                }
            }
        }
        self.brk = AddrRange::new(addr.0, addr.0);
    }

    /// Sets the program break, returning the new break on success and the
    /// old one on failure.
    pub fn brk(&mut self, addr: Addr) -> Addr {
        let cur = Addr(self.brk.end);
        if addr.0 < self.brk.start {
            return cur;
        }
        let newbrk = match addr.round_up() {
            Some(a) => a.0,
            None => return cur,
        };
        let oldbrk = cur.round_up().unwrap_or(cur).0;
        if oldbrk == newbrk {
            self.brk.end = addr.0;
            return addr;
        }

        if addr.0 <= cur.0 {
            return match self.remove_mapping(Addr(newbrk), oldbrk - newbrk) {
                Ok(()) => {
                    self.brk.end = addr.0;
                    addr
                }
                Err(_) => cur,
            };
        }

        let data = self.ctx.limits().get_data().cur;
        if addr.0 - self.brk.start > data {
            logger::warn!("brk to {} exceeds the data limit {:#x}", addr, data);
            return cur;
        }
        if self
            .index
            .find_intersection(oldbrk, newbrk.saturating_add(PAGE_SIZE))
            .is_some()
        {
            return cur;
        }
        match self.do_brk(oldbrk, newbrk - oldbrk) {
            Ok(_) => {
                self.brk.end = addr.0;
                addr
            }
            Err(e) => {
                logger::debug!("brk to {} failed: {}", addr, e);
                cur
            }
        }
    }

    /// Maps `[addr, addr+len)` as private anonymous heap memory.
    fn do_brk(&mut self, addr: u64, len: u64) -> SysResult<Addr> {
        let len = Addr(len).round_up().ok_or_else(einval)?.0;
        if len == 0 {
            return Ok(Addr(addr));
        }
        let end = addr
            .checked_add(len)
            .filter(|&e| e <= self.layout.task_size())
            .ok_or_else(einval)?;
        if addr < self.layout.min_addr.0 {
            bail_libc!(libc::EINVAL);
        }
        let flags = RegionFlags::DATA_DEFAULT | RegionFlags::ACCOUNT | self.config.def_flags;
        if flags.contains(RegionFlags::LOCKED) {
            self.check_lock_limit(len)?;
        }
        self.clear_range(addr, len)?;
        let pages = len >> PAGE_SHIFT;
        self.check_address_space(pages)?;
        if self.index.len() >= self.config.max_map_count {
            return Err(SysError::too_many_mappings());
        }
        if !self.ctx.accountant().reserve(pages) {
            bail_libc!(libc::ENOMEM);
        }

        let pgoff = addr >> PAGE_SHIFT;
        let prev = self.index.prepare_insert(addr).prev;
        if self.merge(prev, addr, end, flags, None, None, pgoff).is_none() {
            let region = Region::new(AddrRange::new(addr, end), flags, None, pgoff);
            let id = self.index.alloc(region);
            self.link_region(id);
        }
        self.account(flags, false, pages);
        if flags.contains(RegionFlags::LOCKED) {
            self.ctx.populate_range(AddrRange::new(addr, end));
        }
        logger::debug!("heap extended by {:#x}..{:#x}", addr, end);
        Ok(Addr(addr))
    }

    /// Links a caller-built region, e.g. a stack or vsyscall page set up at
    /// exec time.
    pub fn insert_region(&mut self, mut region: Region) -> SysResult<RegionId> {
        let r = region.range();
        if r.is_empty()
            || !Addr(r.start).is_page_aligned()
            || !Addr(r.end).is_page_aligned()
            || r.start < self.layout.min_addr.0
            || r.end > self.layout.task_size()
        {
            bail_libc!(libc::EINVAL);
        }
        match region.backing() {
            // a moving boundary would leave the file index stale
            Some(_) if region.flags().intersects(RegionFlags::GROWSDOWN | RegionFlags::GROWSUP) => {
                bail_libc!(libc::EINVAL);
            }
            Some(_) => {}
            None => region.set_pgoff(r.start >> PAGE_SHIFT),
        }
        if self.index.prepare_insert(r.start).collides(r.end) {
            bail_libc!(libc::ENOMEM);
        }
        let flags = region.flags();
        let file = region.backing().is_some();
        let pages = region.pages();
        let id = self.index.alloc(region);
        self.link_region(id);
        self.account(flags, file, pages);
        logger::debug!("inserted region {:?} flags {:?}", r, flags);
        Ok(id)
    }
}
