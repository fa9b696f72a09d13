use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use mem::{AddrRange, PAGE_SHIFT};
use utils::{bail_libc, SysResult};

use super::{
    mapping_set::{new_mapping_set, MappingSet, SetU64MappingOfRange},
    Mappable, MappingKey,
};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// A mappable object shared by every region that maps it. Besides the
/// object itself it owns the reverse map of those regions and the count
/// that arbitrates between writers and `DENYWRITE` mappings.
#[derive(Debug)]
pub struct BackingObject {
    id: u64,
    mappable: Box<dyn Mappable>,
    mappings: Mutex<FileMappings>,
    // > 0: number of writers. < 0: number of write denials.
    write_count: AtomicI64,
}

impl BackingObject {
    pub fn new(mappable: Box<dyn Mappable>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            mappable,
            mappings: Mutex::new(FileMappings::default()),
            write_count: AtomicI64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mappable(&self) -> &dyn Mappable {
        self.mappable.as_ref()
    }

    pub fn lock_mappings(&self) -> MutexGuard<'_, FileMappings> {
        self.mappings.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuses further writers for as long as the denial is held. Fails with
    /// ETXTBSY while the object is open for writing.
    pub fn deny_write_access(&self) -> SysResult<()> {
        let mut cur = self.write_count.load(Ordering::Acquire);
        loop {
            if cur > 0 {
                bail_libc!(libc::ETXTBSY);
            }
            match self.write_count.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drops one write denial.
    pub fn allow_write_access(&self) {
        self.write_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Takes one write denial without checking for writers. Used when a
    /// region inherits a denial that was already checked for.
    pub fn pin_write_denial(&self) {
        self.write_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn get_write_access(&self) -> SysResult<()> {
        let mut cur = self.write_count.load(Ordering::Acquire);
        loop {
            if cur < 0 {
                bail_libc!(libc::ETXTBSY);
            }
            match self.write_count.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn put_write_access(&self) {
        self.write_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn write_count(&self) -> i64 {
        self.write_count.load(Ordering::Acquire)
    }
}

/// Every region mapping one object. Linear regions are indexed by the
/// object range they cover; nonlinear ones only by identity.
#[derive(Debug)]
pub struct FileMappings {
    linear: MappingSet,
    nonlinear: BTreeSet<MappingKey>,
    shared_writable: u64,
}

impl Default for FileMappings {
    fn default() -> Self {
        Self {
            linear: new_mapping_set(),
            nonlinear: BTreeSet::new(),
            shared_writable: 0,
        }
    }
}

impl FileMappings {
    pub fn insert(&mut self, key: MappingKey, ar: AddrRange, pgoff: u64, shared: bool) {
        self.linear
            .add_mapping(key, ar, pgoff << PAGE_SHIFT, shared);
    }

    pub fn remove(&mut self, key: MappingKey, ar: AddrRange, pgoff: u64, shared: bool) {
        self.linear
            .remove_mapping(key, ar, pgoff << PAGE_SHIFT, shared);
    }

    pub fn contains(&self, key: MappingKey, ar: AddrRange, pgoff: u64, shared: bool) -> bool {
        self.linear
            .is_mapped(key, ar, pgoff << PAGE_SHIFT, shared)
    }

    pub fn insert_nonlinear(&mut self, key: MappingKey) {
        self.nonlinear.insert(key);
    }

    pub fn remove_nonlinear(&mut self, key: MappingKey) {
        self.nonlinear.remove(&key);
    }

    pub fn contains_nonlinear(&self, key: MappingKey) -> bool {
        self.nonlinear.contains(&key)
    }

    pub fn inc_shared_writable(&mut self) {
        self.shared_writable += 1;
    }

    pub fn dec_shared_writable(&mut self) {
        self.shared_writable = self
            .shared_writable
            .checked_sub(1)
            .unwrap_or_else(|| panic!("shared writable count underflow"));
    }

    /// Number of linked regions that may write the object through a shared
    /// mapping.
    pub fn shared_writable(&self) -> u64 {
        self.shared_writable
    }

    pub fn is_empty(&self) -> bool {
        self.linear.is_empty() && self.nonlinear.is_empty()
    }
}
