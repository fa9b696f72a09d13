use mem::{Addr, AddrRange, PAGE_SHIFT, PAGE_SIZE};
use memmap::RegionFlags;
use utils::{bail_libc, SysResult};

use crate::{MemoryManager, RegionId};

impl MemoryManager {
    /// Grows a stack region in its growth direction so that it covers
    /// `target`.
    pub fn extend_region(&mut self, id: RegionId, target: Addr) -> SysResult<()> {
        let flags = self.index.get(id).flags();
        if flags.contains(RegionFlags::GROWSUP) {
            self.expand_upwards(id, target.0)
        } else if flags.contains(RegionFlags::GROWSDOWN) {
            self.expand_downwards(id, target.0)
        } else {
            bail_libc!(libc::EFAULT);
        }
    }

    fn expand_downwards(&mut self, id: RegionId, target: u64) -> SysResult<()> {
        let address = Addr(target).round_down().0;
        let (range, pgoff) = {
            let r = self.index.get(id);
            (r.range(), r.pgoff())
        };
        if address >= range.start {
            return Ok(());
        }
        if address < self.layout.min_addr.0 {
            bail_libc!(libc::ENOMEM);
        }
        if let Some(p) = self.index.prev_of(id) {
            if self.index.get(p).end() > address {
                bail_libc!(libc::ENOMEM);
            }
        }
        let grow = (range.start - address) >> PAGE_SHIFT;
        let pgoff = match pgoff.checked_sub(grow) {
            Some(p) => p,
            None => bail_libc!(libc::ENOMEM),
        };

        let token = self.prepare_anon(id);
        self.charge_growth(id, range.end - address, grow)?;
        {
            let _members = token.lock();
            self.index.set_range(id, AddrRange::new(address, range.end));
            self.index.get_mut(id).set_pgoff(pgoff);
        }
        self.account_growth(id, grow);
        logger::debug!("stack grew down to {:#x} ({} pages)", address, grow);
        Ok(())
    }

    fn expand_upwards(&mut self, id: RegionId, target: u64) -> SysResult<()> {
        let range = self.index.get(id).range();
        if target < range.end {
            return Ok(());
        }
        let address = match Addr(target).round_down().0.checked_add(PAGE_SIZE) {
            Some(a) if a <= self.layout.task_size() => a,
            _ => bail_libc!(libc::ENOMEM),
        };
        if let Some(n) = self.index.next_of(id) {
            if self.index.get(n).start() < address {
                bail_libc!(libc::ENOMEM);
            }
        }
        let grow = (address - range.end) >> PAGE_SHIFT;

        let token = self.prepare_anon(id);
        self.charge_growth(id, address - range.start, grow)?;
        {
            let _members = token.lock();
            self.index.set_range(id, AddrRange::new(range.start, address));
        }
        self.account_growth(id, grow);
        logger::debug!("stack grew up to {:#x} ({} pages)", address, grow);
        Ok(())
    }

    /// Checks the limits a stack of `size` bytes must respect after
    /// growing by `grow` pages, and reserves commit for the growth.
    fn charge_growth(&self, id: RegionId, size: u64, grow: u64) -> SysResult<()> {
        let flags = self.index.get(id).flags();
        let charge = flags.contains(RegionFlags::ACCOUNT);
        if charge && !self.ctx.accountant().reserve(grow) {
            bail_libc!(libc::ENOMEM);
        }
        let limits = self.ctx.limits();
        let over_stack = size > limits.get_stack().cur;
        let total = (self.stats.total_vm + grow).saturating_mul(PAGE_SIZE);
        let over_as = total > limits.get_address_space().cur;
        let over_lock = flags.contains(RegionFlags::LOCKED)
            && !self.ctx.capable_ipc_lock()
            && (self.stats.locked_vm + grow).saturating_mul(PAGE_SIZE)
                > limits.get_memory_locked().cur;
        if over_stack || over_as || over_lock {
            if charge {
                self.ctx.accountant().release(grow);
            }
            logger::warn!(
                "stack growth of {} pages refused (stack {}, as {}, locked {})",
                grow,
                over_stack,
                over_as,
                over_lock
            );
            bail_libc!(libc::EPERM);
        }
        Ok(())
    }

    fn account_growth(&mut self, id: RegionId, grow: u64) {
        let (flags, file) = {
            let r = self.index.get(id);
            (r.flags(), r.backing().is_some())
        };
        self.account(flags, file, grow);
    }

    /// Finds the region covering `addr`, growing an adjacent stack region
    /// over it if needed.
    pub fn find_extend(&mut self, addr: Addr) -> Option<RegionId> {
        let addr = addr.round_down().0;
        let (found, prev) = self.index.find_with_prev(addr);
        if let Some(id) = found {
            let (start, flags) = {
                let r = self.index.get(id);
                (r.start(), r.flags())
            };
            if start <= addr {
                return Some(id);
            }
            if flags.contains(RegionFlags::GROWSDOWN) {
                self.extend_region(id, Addr(addr)).ok()?;
                if self.index.get(id).is_locked() {
                    self.ctx.populate_range(AddrRange::new(addr, start));
                }
                return Some(id);
            }
        }
        let p = prev?;
        let (end, flags) = {
            let r = self.index.get(p);
            (r.end(), r.flags())
        };
        if !flags.contains(RegionFlags::GROWSUP) {
            return None;
        }
        self.extend_region(p, Addr(addr)).ok()?;
        let r = self.index.get(p);
        if r.is_locked() {
            self.ctx.populate_range(AddrRange::new(end, r.end()));
        }
        Some(p)
    }
}
