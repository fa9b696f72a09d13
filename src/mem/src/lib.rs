mod access_type;
mod addr;

pub use access_type::AccessType;
pub use addr::*;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const HUGE_PAGE_SHIFT: u32 = 21;
pub const HUGE_PAGE_SIZE: u64 = 1u64 << HUGE_PAGE_SHIFT;

/// Number of pages needed to hold `length` bytes.
#[inline]
pub fn pages(length: u64) -> u64 {
    (length >> PAGE_SHIFT) + u64::from(length & (PAGE_SIZE - 1) != 0)
}
