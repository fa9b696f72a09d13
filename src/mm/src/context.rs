use std::sync::Arc;

use mem::{AccessType, AddrRange};
use memmap::{BackingObject, MapFlags, SpecialMappable};
use utils::SysResult;

use crate::AnonToken;

/// Everything the memory manager needs from its surroundings: page tables,
/// resource limits, commit accounting and the security policy.
pub trait Context: limit::Context + usage::Context + Send + Sync {
    /// Clears every page-table entry in `ar`.
    fn zap_range(&self, ar: AddrRange);

    /// Frees the page-table directories with top-level indices in
    /// `[start_index, end_index)`.
    fn free_page_tables(&self, start_index: u64, end_index: u64);

    /// Makes the pages of `ar` present, for locked or populated mappings.
    fn populate_range(&self, _ar: AddrRange) {}

    fn security_mmap(
        &self,
        _backing: Option<&BackingObject>,
        _prot: AccessType,
        _flags: MapFlags,
    ) -> bool {
        true
    }

    fn capable_ipc_lock(&self) -> bool {
        false
    }

    fn new_anon_token(&self) -> AnonToken {
        AnonToken::new()
    }

    /// Object backing a shared anonymous mapping of `length` bytes.
    fn shared_anonymous_object(&self, length: u64) -> SysResult<Arc<BackingObject>> {
        Ok(BackingObject::new(Box::new(SpecialMappable::new_anon(
            length,
        )?)))
    }

    fn is_huge_aligned(&self, start: u64, length: u64) -> bool {
        arch::is_huge_aligned(start, length)
    }
}
