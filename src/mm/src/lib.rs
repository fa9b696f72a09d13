mod anon;
mod context;
mod index;
mod memory_manager;
mod mmap;
mod munmap;
mod region;
mod stack;
#[cfg(test)]
mod testing;

pub use anon::{AnonMembers, AnonToken};
pub use context::Context;
pub use index::RegionId;
pub use memory_manager::{MemoryManager, MemoryManagerConfig, Stats, DEFAULT_MAX_MAP_COUNT};
pub use region::{Region, RegionOps};
