use std::sync::Arc;

use bitflags::bitflags;
use mem::{AccessType, Addr};

use super::BackingObject;

bitflags! {
    /// Flags accepted by `create_mapping`. The values match the host's
    /// `MAP_*` constants.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u32 {
        const SHARED = libc::MAP_SHARED as u32;
        const PRIVATE = libc::MAP_PRIVATE as u32;
        const FIXED = libc::MAP_FIXED as u32;
        const ANONYMOUS = libc::MAP_ANONYMOUS as u32;
        const GROWSDOWN = libc::MAP_GROWSDOWN as u32;
        const DENYWRITE = libc::MAP_DENYWRITE as u32;
        const EXECUTABLE = libc::MAP_EXECUTABLE as u32;
        const LOCKED = libc::MAP_LOCKED as u32;
        const NORESERVE = libc::MAP_NORESERVE as u32;
        const POPULATE = libc::MAP_POPULATE as u32;
    }
}

#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum MapType {
    Shared,
    Private,
}

impl MapFlags {
    /// Exactly one of SHARED and PRIVATE must be present.
    pub fn map_type(&self) -> Option<MapType> {
        match (self.contains(Self::SHARED), self.contains(Self::PRIVATE)) {
            (true, false) => Some(MapType::Shared),
            (false, true) => Some(MapType::Private),
            _ => None,
        }
    }
}

bitflags! {
    /// Per-region flags. Bit values follow the classic `VM_*` layout so that
    /// dumps are easy to compare against a kernel.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct RegionFlags: u64 {
        const READ = 0x0000_0001;
        const WRITE = 0x0000_0002;
        const EXEC = 0x0000_0004;
        const SHARED = 0x0000_0008;

        const MAYREAD = 0x0000_0010;
        const MAYWRITE = 0x0000_0020;
        const MAYEXEC = 0x0000_0040;
        const MAYSHARE = 0x0000_0080;

        const GROWSDOWN = 0x0000_0100;
        const GROWSUP = 0x0000_0200;
        const DENYWRITE = 0x0000_0800;
        const EXECUTABLE = 0x0000_1000;
        const LOCKED = 0x0000_2000;
        const IO = 0x0000_4000;

        const DONTCOPY = 0x0002_0000;
        const DONTEXPAND = 0x0004_0000;
        const RESERVED = 0x0008_0000;
        const ACCOUNT = 0x0010_0000;
        const HUGETLB = 0x0040_0000;
        const NONLINEAR = 0x0080_0000;

        /// Regions carrying any of these never merge.
        const SPECIAL = Self::IO.bits()
            | Self::DONTCOPY.bits()
            | Self::DONTEXPAND.bits()
            | Self::RESERVED.bits();
        const STACK = Self::READ.bits()
            | Self::WRITE.bits()
            | Self::MAYREAD.bits()
            | Self::MAYWRITE.bits()
            | Self::MAYEXEC.bits()
            | Self::GROWSDOWN.bits();
        const DATA_DEFAULT = Self::READ.bits()
            | Self::WRITE.bits()
            | Self::MAYREAD.bits()
            | Self::MAYWRITE.bits()
            | Self::MAYEXEC.bits();
    }
}

impl RegionFlags {
    pub fn from_access(perms: AccessType) -> Self {
        let mut flags = RegionFlags::empty();
        flags.set(RegionFlags::READ, perms.read);
        flags.set(RegionFlags::WRITE, perms.write);
        flags.set(RegionFlags::EXEC, perms.execute);
        flags
    }

    pub fn from_map_flags(map_flags: MapFlags) -> Self {
        let mut flags = RegionFlags::empty();
        flags.set(RegionFlags::GROWSDOWN, map_flags.contains(MapFlags::GROWSDOWN));
        flags.set(RegionFlags::DENYWRITE, map_flags.contains(MapFlags::DENYWRITE));
        flags.set(RegionFlags::EXECUTABLE, map_flags.contains(MapFlags::EXECUTABLE));
        flags.set(RegionFlags::LOCKED, map_flags.contains(MapFlags::LOCKED));
        flags
    }

    /// Hardware protection for pages of a region with these flags. Private
    /// writable regions start read-only so that the first write copies.
    pub fn protection(&self) -> AccessType {
        let shared = self.contains(RegionFlags::SHARED);
        AccessType {
            read: self.contains(RegionFlags::READ),
            write: self.contains(RegionFlags::WRITE) && shared,
            execute: self.contains(RegionFlags::EXEC),
        }
        .effective()
    }

    pub fn is_special(&self) -> bool {
        self.intersects(RegionFlags::SPECIAL)
    }
}

/// Arguments of a single `create_mapping` call.
#[derive(Default, Debug, Clone)]
pub struct MmapOpts {
    pub backing: Option<Arc<BackingObject>>,
    pub addr: Addr,
    pub length: u64,
    pub perms: AccessType,
    pub flags: MapFlags,
    /// Offset into the backing object, in pages.
    pub pgoff: u64,
}

impl MmapOpts {
    pub fn anonymous(addr: Addr, length: u64, perms: AccessType, flags: MapFlags) -> Self {
        Self {
            backing: None,
            addr,
            length,
            perms,
            flags: flags | MapFlags::ANONYMOUS,
            pgoff: 0,
        }
    }

    pub fn backed(
        backing: Arc<BackingObject>,
        addr: Addr,
        length: u64,
        perms: AccessType,
        flags: MapFlags,
        pgoff: u64,
    ) -> Self {
        Self {
            backing: Some(backing),
            addr,
            length,
            perms,
            flags,
            pgoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_type() {
        assert_eq!(MapFlags::SHARED.map_type(), Some(MapType::Shared));
        assert_eq!(
            (MapFlags::PRIVATE | MapFlags::FIXED).map_type(),
            Some(MapType::Private)
        );
        assert_eq!(MapFlags::ANONYMOUS.map_type(), None);
        assert_eq!((MapFlags::SHARED | MapFlags::PRIVATE).map_type(), None);
    }

    #[test]
    fn protection() {
        let private = RegionFlags::from_access(AccessType::read_write());
        assert_eq!(private.protection(), AccessType::read());
        let shared = private | RegionFlags::SHARED;
        assert_eq!(shared.protection(), AccessType::read_write());
        assert!((RegionFlags::READ | RegionFlags::IO).is_special());
        assert!(!RegionFlags::STACK.is_special());
        assert_eq!(
            RegionFlags::from_map_flags(MapFlags::LOCKED | MapFlags::PRIVATE),
            RegionFlags::LOCKED
        );
    }
}
