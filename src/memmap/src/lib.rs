mod mappable;
pub mod mapping_set;
pub mod mmap_opts;
mod object;
mod special;

pub use mappable::*;
pub use mapping_set::MappingKey;
pub use mmap_opts::{MapFlags, MapType, MmapOpts, RegionFlags};
pub use object::*;
pub use special::SpecialMappable;
