mod core;
mod disk_cache;
mod from_cfg;
mod lru;
mod memory_cache;
mod stats;
mod tiered_cache;

pub use crate::cache::{
    core::ResourceCache,
    disk_cache::DiskCache,
    from_cfg::cache_from_cfg,
    lru::LruCache,
    memory_cache::MemoryCache,
    stats::CacheStats,
    tiered_cache::TieredCache,
};
