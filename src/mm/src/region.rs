use std::sync::Arc;

use mem::{AccessType, AddrRange, PAGE_SHIFT};
use memmap::{BackingObject, RegionFlags, RegionOperations};

use crate::AnonToken;

/// Lifecycle callbacks attached to a region.
#[derive(Clone, Debug)]
pub enum RegionOps {
    None,
    Special(Arc<dyn RegionOperations>),
}

impl Default for RegionOps {
    fn default() -> Self {
        RegionOps::None
    }
}

impl RegionOps {
    pub fn from_operations(ops: Option<Arc<dyn RegionOperations>>) -> Self {
        match ops {
            Some(ops) => RegionOps::Special(ops),
            None => RegionOps::None,
        }
    }

    pub fn has_close(&self) -> bool {
        match self {
            RegionOps::None => false,
            RegionOps::Special(ops) => ops.has_close(),
        }
    }

    pub(crate) fn open(&self, ar: AddrRange) {
        if let RegionOps::Special(ops) = self {
            ops.open(ar);
        }
    }

    pub(crate) fn close(&self, ar: AddrRange) {
        if let RegionOps::Special(ops) = self {
            ops.close(ar);
        }
    }
}

impl PartialEq for RegionOps {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RegionOps::None, RegionOps::None) => true,
            (RegionOps::Special(a), RegionOps::Special(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }
}

// Region represents one virtual memory area.
#[derive(Clone, Debug)]
pub struct Region {
    range: AddrRange,
    flags: RegionFlags,
    protection: AccessType,
    backing: Option<Arc<BackingObject>>,
    // in pages
    pgoff: u64,
    anon: Option<AnonToken>,
    ops: RegionOps,
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.range == other.range
            && self.flags == other.flags
            && self.protection == other.protection
            && self.pgoff == other.pgoff
            && same_backing(self.backing.as_ref(), other.backing.as_ref())
            && self.anon == other.anon
            && self.ops == other.ops
    }
}

pub(crate) fn same_backing(a: Option<&Arc<BackingObject>>, b: Option<&Arc<BackingObject>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

impl Region {
    pub fn new(
        range: AddrRange,
        flags: RegionFlags,
        backing: Option<Arc<BackingObject>>,
        pgoff: u64,
    ) -> Self {
        Self {
            range,
            flags,
            protection: flags.protection(),
            backing,
            pgoff,
            anon: None,
            ops: RegionOps::None,
        }
    }

    pub fn with_ops(mut self, ops: RegionOps) -> Self {
        self.ops = ops;
        self
    }

    #[inline]
    pub fn range(&self) -> AddrRange {
        self.range
    }

    #[inline]
    pub fn start(&self) -> u64 {
        self.range.start
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.range.end
    }

    pub fn pages(&self) -> u64 {
        self.range.len() >> PAGE_SHIFT
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn protection(&self) -> AccessType {
        self.protection
    }

    pub fn backing(&self) -> Option<&Arc<BackingObject>> {
        self.backing.as_ref()
    }

    pub fn pgoff(&self) -> u64 {
        self.pgoff
    }

    pub fn anon(&self) -> Option<&AnonToken> {
        self.anon.as_ref()
    }

    pub fn ops(&self) -> &RegionOps {
        &self.ops
    }

    pub fn is_huge(&self) -> bool {
        self.flags.contains(RegionFlags::HUGETLB)
            || self.backing.as_ref().map_or(false, |b| b.mappable().is_huge())
    }

    pub fn is_locked(&self) -> bool {
        self.flags.contains(RegionFlags::LOCKED)
    }

    /// Whether the region sits in its backing object's linear index.
    pub(crate) fn in_linear_index(&self) -> bool {
        self.backing.is_some() && !self.flags.contains(RegionFlags::NONLINEAR)
    }

    // The setters below change index keys or secondary-index state; only
    // the memory manager calls them, with the indices updated alongside.

    pub(crate) fn set_range(&mut self, range: AddrRange) {
        self.range = range;
    }

    pub(crate) fn set_pgoff(&mut self, pgoff: u64) {
        self.pgoff = pgoff;
    }

    pub(crate) fn set_flags(&mut self, flags: RegionFlags) {
        self.flags = flags;
        self.protection = flags.protection();
    }

    pub(crate) fn set_anon(&mut self, anon: Option<AnonToken>) {
        self.anon = anon;
    }

    pub(crate) fn set_backing(&mut self, backing: Option<Arc<BackingObject>>) {
        self.backing = backing;
    }

    pub(crate) fn set_ops(&mut self, ops: RegionOps) {
        self.ops = ops;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingOps;

    #[test]
    fn equality() {
        let flags = RegionFlags::READ | RegionFlags::MAYREAD;
        let a = Region::new(AddrRange::new(0x1000, 0x3000), flags, None, 1);
        let mut b = a.clone();
        assert_eq!(a, b);
        assert_eq!(a.pages(), 2);
        assert_eq!(a.protection(), AccessType::read());

        b.set_anon(Some(AnonToken::new()));
        assert_ne!(a, b);

        let ops: Arc<dyn RegionOperations> = Arc::new(CountingOps::new(true));
        let c = a.clone().with_ops(RegionOps::Special(ops.clone()));
        let d = a.clone().with_ops(RegionOps::Special(ops));
        assert_eq!(c, d);
        assert_ne!(a, c);
        assert!(c.ops().has_close());
        assert!(!a.ops().has_close());
    }
}
