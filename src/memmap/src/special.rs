use mem::{AddrRange, PAGE_SIZE};
use utils::{bail_libc, SysResult};

use super::{Mappable, OpenMode, PopulateRequest};

/// Zero-filled memory that is not backed by any file. Shared anonymous
/// mappings are given one of these so that every region sharing the pages
/// refers to the same object.
#[derive(Debug)]
pub struct SpecialMappable {
    name: String,
    length: u64,
}

impl SpecialMappable {
    pub fn new_anon(length: u64) -> SysResult<Self> {
        if length == 0 || length % PAGE_SIZE != 0 {
            bail_libc!(libc::EINVAL);
        }
        Ok(Self {
            name: "/dev/zero (deleted)".to_string(),
            length,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn length(&self) -> u64 {
        self.length
    }
}

impl Mappable for SpecialMappable {
    fn mode(&self) -> OpenMode {
        OpenMode::read_write()
    }

    fn populate(&self, req: &mut PopulateRequest) -> SysResult<()> {
        let start = req
            .pgoff
            .checked_mul(PAGE_SIZE)
            .ok_or_else(|| utils::SysError::new(libc::EINVAL))?;
        let end = start
            .checked_add(req.range.len())
            .ok_or_else(|| utils::SysError::new(libc::EINVAL))?;
        if !AddrRange::new(0, self.length).is_superset_of(&AddrRange::new(start, end)) {
            bail_libc!(libc::EINVAL);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RegionFlags;

    fn request(start: u64, end: u64, pgoff: u64) -> PopulateRequest {
        PopulateRequest {
            range: AddrRange::new(start, end),
            pgoff,
            flags: RegionFlags::READ | RegionFlags::SHARED,
            operations: None,
        }
    }

    #[test]
    fn populate_bounds() {
        assert!(SpecialMappable::new_anon(0).is_err());
        assert!(SpecialMappable::new_anon(0x1800).is_err());

        let m = SpecialMappable::new_anon(0x4000).unwrap();
        assert_eq!(m.length(), 0x4000);
        m.populate(&mut request(0x10000, 0x14000, 0)).unwrap();
        m.populate(&mut request(0x10000, 0x12000, 2)).unwrap();
        assert!(m.populate(&mut request(0x10000, 0x12000, 3)).is_err());
        assert!(m.populate(&mut request(0x10000, 0x11000, u64::MAX)).is_err());
    }
}
