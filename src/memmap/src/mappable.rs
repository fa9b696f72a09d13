use std::sync::Arc;

use mem::{Addr, AddrRange};
use utils::{Range, SysResult};

use super::{MapFlags, RegionFlags};

pub type MappableRange = Range<u64>;

/// How the backing object was opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub append_only: bool,
    pub mandatory_locked: bool,
}

impl OpenMode {
    pub const fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            append_only: false,
            mandatory_locked: false,
        }
    }

    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            append_only: false,
            mandatory_locked: false,
        }
    }
}

/// Callbacks a backing object may attach to the regions it populates.
pub trait RegionOperations: std::fmt::Debug + Send + Sync {
    /// Called when a region is duplicated by a split.
    fn open(&self, _ar: AddrRange) {}

    /// Called once when a region is destroyed.
    fn close(&self, _ar: AddrRange) {}

    /// Regions whose operations need `close` never merge, since merging would
    /// drop one of the two calls.
    fn has_close(&self) -> bool;
}

/// The mutable view of a fresh region handed to `Mappable::populate`. A
/// device may move the range (its length must stay the same), adjust the
/// offset, add flags such as `IO` or `RESERVED`, and install operations.
#[derive(Debug)]
pub struct PopulateRequest {
    pub range: AddrRange,
    pub pgoff: u64,
    pub flags: RegionFlags,
    pub operations: Option<Arc<dyn RegionOperations>>,
}

pub trait Mappable: std::fmt::Debug + Send + Sync {
    fn mode(&self) -> OpenMode;

    /// False for objects that cannot be memory mapped at all.
    fn can_populate(&self) -> bool {
        true
    }

    fn populate(&self, req: &mut PopulateRequest) -> SysResult<()>;

    /// Huge-page backed objects need huge-aligned ranges and are not charged
    /// to the commit accountant.
    fn is_huge(&self) -> bool {
        false
    }

    /// Lets the object choose the address of a non-fixed mapping. `None`
    /// defers to the address space's own search.
    fn get_unmapped_area(
        &self,
        _addr: Addr,
        _length: u64,
        _pgoff: u64,
        _flags: MapFlags,
    ) -> Option<SysResult<Addr>> {
        None
    }
}
