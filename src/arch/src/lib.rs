use mem::{Addr, HUGE_PAGE_SIZE, PAGE_SIZE};
use rand::Rng;
use utils::{bail_libc, SysError, SysResult};

/// Highest user address plus one (TASK_SIZE).
pub const MAX_ADDR: Addr = Addr((1 << 47) - PAGE_SIZE);
pub const MAX_MMAP_RAND: u64 = (1 << 28) * PAGE_SIZE;

/// Each top-level page directory entry covers `1 << PGDIR_SHIFT` bytes.
pub const PGDIR_SHIFT: u32 = 39;
pub const FIRST_USER_PGD_NR: u64 = 0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MmapLayout {
    pub min_addr: Addr,
    pub max_addr: Addr,
    /// Floor of the bottom-up free gap search (TASK_UNMAPPED_BASE).
    pub mmap_base: Addr,
    pub pgdir_shift: u32,
}

impl MmapLayout {
    pub fn new(min: Addr, max: Addr, randomize: bool) -> SysResult<MmapLayout> {
        let min = min.round_up().ok_or_else(|| SysError::new(libc::EINVAL))?;
        let max = std::cmp::min(max, MAX_ADDR).round_down();
        if min > max {
            bail_libc!(libc::EINVAL);
        }
        let rnd = if randomize {
            mmap_rand(std::cmp::min(MAX_MMAP_RAND, max.0 / 6))
        } else {
            Addr(0)
        };
        let layout = MmapLayout {
            min_addr: min,
            max_addr: max,
            mmap_base: std::cmp::max(Addr(max.0 / 3 + rnd.0).round_down(), min),
            pgdir_shift: PGDIR_SHIFT,
        };
        logger::info!("mmap base: {}", layout.mmap_base);
        if !layout.is_valid() {
            panic!("invalid MmapLayout: {:?}", layout)
        }
        Ok(layout)
    }

    pub fn new_test(min_addr: Addr, max_addr: Addr, mmap_base: Addr, pgdir_shift: u32) -> Self {
        Self {
            min_addr,
            max_addr,
            mmap_base,
            pgdir_shift,
        }
    }

    pub fn is_valid(&self) -> bool {
        if self.min_addr > self.max_addr {
            false
        } else if self.mmap_base < self.min_addr || self.mmap_base > self.max_addr {
            false
        } else {
            (PAGE_SIZE.trailing_zeros()..64).contains(&self.pgdir_shift)
        }
    }

    #[inline]
    pub fn task_size(&self) -> u64 {
        self.max_addr.0
    }

    #[inline]
    pub fn pgdir_size(&self) -> u64 {
        1 << self.pgdir_shift
    }

    #[inline]
    pub fn pgd_index(&self, addr: u64) -> u64 {
        addr >> self.pgdir_shift
    }

    /// Number of top-level entries needed to cover every user address.
    pub fn user_ptrs_per_pgd(&self) -> u64 {
        let size = self.pgdir_size();
        self.task_size() / size + u64::from(self.task_size() % size != 0)
    }
}

impl Default for MmapLayout {
    fn default() -> Self {
        Self {
            min_addr: Addr(PAGE_SIZE),
            max_addr: MAX_ADDR,
            mmap_base: Addr(MAX_ADDR.0 / 3).round_down(),
            pgdir_shift: PGDIR_SHIFT,
        }
    }
}

/// Whether `[start, start+length)` can be backed by huge pages.
pub fn is_huge_aligned(start: u64, length: u64) -> bool {
    start & (HUGE_PAGE_SIZE - 1) == 0 && length & (HUGE_PAGE_SIZE - 1) == 0
}

fn mmap_rand(max: u64) -> Addr {
    if max == 0 {
        return Addr(0);
    }
    let mut rng = rand::thread_rng();
    Addr(rng.gen_range(0..max)).round_down()
}
