use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use arch::MmapLayout;
use limit::LimitSet;
use mem::{AccessType, Addr, AddrRange};
use memmap::{
    BackingObject, MapFlags, Mappable, MmapOpts, OpenMode, PopulateRequest, RegionFlags,
    RegionOperations,
};
use usage::{Accountant, CommitAccounting, OvercommitPolicy};
use utils::{SysError, SysResult};

use crate::{Context, MemoryManager};

pub const TEST_MIN_ADDR: u64 = 0x1000;
pub const TEST_TASK_SIZE: u64 = 1 << 32;
pub const TEST_MMAP_BASE: u64 = 0x1000_0000;
// 1 MiB page directories keep directory arithmetic readable.
pub const TEST_PGDIR_SHIFT: u32 = 20;

pub fn test_layout() -> MmapLayout {
    MmapLayout::new_test(
        Addr(TEST_MIN_ADDR),
        Addr(TEST_TASK_SIZE),
        Addr(TEST_MMAP_BASE),
        TEST_PGDIR_SHIFT,
    )
}

/// Records every page-table side effect instead of performing it.
#[derive(Debug)]
pub struct RecordingContext {
    limits: Mutex<LimitSet>,
    accountant: CommitAccounting,
    zapped: Mutex<Vec<AddrRange>>,
    freed: Mutex<Vec<(u64, u64)>>,
    populated: Mutex<Vec<AddrRange>>,
    security_deny: AtomicBool,
    ipc_lock: AtomicBool,
}

impl RecordingContext {
    pub fn new() -> Self {
        Self::with_accounting(CommitAccounting::new(OvercommitPolicy::Guess, 1 << 30))
    }

    pub fn with_accounting(accountant: CommitAccounting) -> Self {
        Self {
            limits: Mutex::new(LimitSet::unlimited()),
            accountant,
            zapped: Mutex::new(Vec::new()),
            freed: Mutex::new(Vec::new()),
            populated: Mutex::new(Vec::new()),
            security_deny: AtomicBool::new(false),
            ipc_lock: AtomicBool::new(false),
        }
    }

    pub fn set_limits(&self, limits: LimitSet) {
        *self.limits.lock().unwrap() = limits;
    }

    pub fn take_zapped(&self) -> Vec<AddrRange> {
        std::mem::take(&mut *self.zapped.lock().unwrap())
    }

    pub fn take_freed(&self) -> Vec<(u64, u64)> {
        std::mem::take(&mut *self.freed.lock().unwrap())
    }

    pub fn populated(&self) -> Vec<AddrRange> {
        self.populated.lock().unwrap().clone()
    }

    pub fn committed(&self) -> u64 {
        self.accountant.committed()
    }

    pub fn deny_security(&self, deny: bool) {
        self.security_deny.store(deny, Ordering::SeqCst);
    }

    pub fn grant_ipc_lock(&self, grant: bool) {
        self.ipc_lock.store(grant, Ordering::SeqCst);
    }
}

impl limit::Context for RecordingContext {
    fn limits(&self) -> LimitSet {
        *self.limits.lock().unwrap()
    }
}

impl usage::Context for RecordingContext {
    fn accountant(&self) -> &dyn Accountant {
        &self.accountant
    }
}

impl Context for RecordingContext {
    fn zap_range(&self, ar: AddrRange) {
        self.zapped.lock().unwrap().push(ar);
    }

    fn free_page_tables(&self, start_index: u64, end_index: u64) {
        self.freed.lock().unwrap().push((start_index, end_index));
    }

    fn populate_range(&self, ar: AddrRange) {
        self.populated.lock().unwrap().push(ar);
    }

    fn security_mmap(&self, _: Option<&BackingObject>, _: AccessType, _: MapFlags) -> bool {
        !self.security_deny.load(Ordering::SeqCst)
    }

    fn capable_ipc_lock(&self) -> bool {
        self.ipc_lock.load(Ordering::SeqCst)
    }
}

/// Counts lifecycle callbacks.
#[derive(Debug, Default)]
pub struct CountingOps {
    opens: AtomicUsize,
    closes: AtomicUsize,
    has_close: bool,
}

impl CountingOps {
    pub fn new(has_close: bool) -> Self {
        Self {
            has_close,
            ..Self::default()
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl RegionOperations for CountingOps {
    fn open(&self, _: AddrRange) {
        self.opens.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self, _: AddrRange) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn has_close(&self) -> bool {
        self.has_close
    }
}

/// A configurable file-like backing object.
#[derive(Debug)]
pub struct TestFile {
    pub mode: OpenMode,
    pub can_populate: bool,
    pub huge: bool,
    pub relocate_to: Option<u64>,
    pub fail_with: Option<i32>,
    pub add_flags: RegionFlags,
    pub ops: Option<Arc<CountingOps>>,
    pub area: Option<Addr>,
}

impl TestFile {
    pub fn new(mode: OpenMode) -> Self {
        Self {
            mode,
            can_populate: true,
            huge: false,
            relocate_to: None,
            fail_with: None,
            add_flags: RegionFlags::empty(),
            ops: None,
            area: None,
        }
    }

    pub fn into_object(self) -> Arc<BackingObject> {
        BackingObject::new(Box::new(self))
    }
}

impl Mappable for TestFile {
    fn mode(&self) -> OpenMode {
        self.mode
    }

    fn can_populate(&self) -> bool {
        self.can_populate
    }

    fn populate(&self, req: &mut PopulateRequest) -> SysResult<()> {
        if let Some(code) = self.fail_with {
            return Err(SysError::new(code));
        }
        if let Some(start) = self.relocate_to {
            req.range = AddrRange::new(start, start + req.range.len());
        }
        req.flags |= self.add_flags;
        if let Some(ops) = &self.ops {
            let ops: Arc<dyn RegionOperations> = ops.clone();
            req.operations = Some(ops);
        }
        Ok(())
    }

    fn is_huge(&self) -> bool {
        self.huge
    }

    fn get_unmapped_area(
        &self,
        _: Addr,
        _: u64,
        _: u64,
        _: MapFlags,
    ) -> Option<SysResult<Addr>> {
        self.area.map(Ok)
    }
}

pub fn memory_manager() -> (Arc<RecordingContext>, MemoryManager) {
    logger::init_for_test();
    let ctx = Arc::new(RecordingContext::new());
    let mm = MemoryManager::new(ctx.clone(), test_layout());
    (ctx, mm)
}

/// Fixed private anonymous mapping arguments.
pub fn anon_private(addr: u64, len: u64, perms: AccessType) -> MmapOpts {
    MmapOpts::anonymous(Addr(addr), len, perms, MapFlags::PRIVATE | MapFlags::FIXED)
}

pub fn ranges(mm: &MemoryManager) -> Vec<AddrRange> {
    mm.regions().map(|r| r.range()).collect()
}
