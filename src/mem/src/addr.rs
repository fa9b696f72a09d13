use super::{PAGE_SHIFT, PAGE_SIZE};
use utils::Range;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(pub u64);

impl Addr {
    #[inline]
    pub fn round_up(&self) -> Option<Self> {
        let addr = self.0.checked_add(PAGE_SIZE - 1)?;
        Some(Addr(addr).round_down())
    }

    pub const fn round_down(&self) -> Self {
        Addr(self.0 & !(PAGE_SIZE - 1))
    }

    /// Rounds up to a multiple of `align`, which must be a power of two.
    #[inline]
    pub fn round_up_to(&self, align: u64) -> Option<Self> {
        debug_assert!(align.is_power_of_two());
        let addr = self.0.checked_add(align - 1)?;
        Some(Addr(addr & !(align - 1)))
    }

    #[inline]
    pub fn to_range(self, length: u64) -> Option<AddrRange> {
        self.add_length(length).map(|end| AddrRange {
            start: self.0,
            end: end.0,
        })
    }

    #[inline]
    pub fn add_length(&self, length: u64) -> Option<Self> {
        let end = self.0.checked_add(length)?;
        Some(Addr(end))
    }

    #[inline]
    pub fn page_offset(&self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    pub fn is_page_aligned(&self) -> bool {
        self.page_offset() == 0
    }

    /// Index of the page containing this address.
    #[inline]
    pub const fn page_index(&self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    pub const fn from_page_index(index: u64) -> Self {
        Addr(index << PAGE_SHIFT)
    }
}

impl std::ops::Add for Addr {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl std::ops::Sub for Addr {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self(self.0 - other.0)
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

pub type AddrRange = Range<u64>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HUGE_PAGE_SIZE;

    #[test]
    fn rounding() {
        assert_eq!(Addr(0x1001).round_up(), Some(Addr(0x2000)));
        assert_eq!(Addr(0x1000).round_up(), Some(Addr(0x1000)));
        assert_eq!(Addr(u64::MAX).round_up(), None);
        assert_eq!(Addr(0x1fff).round_down(), Addr(0x1000));
        assert_eq!(Addr(0x1234).round_up_to(HUGE_PAGE_SIZE), Some(Addr(HUGE_PAGE_SIZE)));
        assert_eq!(Addr(0x3800).page_offset(), 0x800);
        assert!(!Addr(0x3800).is_page_aligned());
        assert_eq!(Addr(0x3800).page_index(), 3);
        assert_eq!(Addr::from_page_index(3), Addr(0x3000));
    }

    #[test]
    fn ranges() {
        assert_eq!(Addr(0x1000).to_range(0x2000), Some(AddrRange::new(0x1000, 0x3000)));
        assert_eq!(Addr(u64::MAX).to_range(1), None);
        assert_eq!(crate::pages(0), 0);
        assert_eq!(crate::pages(1), 1);
        assert_eq!(crate::pages(0x2000), 2);
    }
}
