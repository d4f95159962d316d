use std::sync::Arc;

use crate::{
    cache::{MemoryCache, ResourceCache, TieredCache},
    cfg::{CacheKind, Cfg},
    result::CvResult,
};

/// Creates the cache configured in `cfg`. The returned cache is meant to be shared by all
/// controllers of an application.
pub fn cache_from_cfg(cfg: &Cfg) -> CvResult<Arc<dyn ResourceCache>> {
    Ok(match cfg.cache {
        CacheKind::Memory => Arc::new(MemoryCache::new(cfg.memory_cache_args)),
        CacheKind::Tiered => Arc::new(TieredCache::new(
            cfg.memory_cache_args,
            cfg.disk_cache_args,
            cfg.tmpdir()?,
        )?),
    })
}

#[cfg(test)]
use crate::{
    cfg::get_default_cfg, defer_folder_removal, file_util::DEFAULT_TMPDIR,
    test_helpers::rgb_resource,
};

#[test]
fn test_from_cfg() -> CvResult<()> {
    let folder = DEFAULT_TMPDIR.join("test_cache_from_cfg");
    defer_folder_removal!(&folder);
    let mut cfg = get_default_cfg();
    cfg.set_tmpdir(folder.to_str().map(|s| s.to_string()));
    for kind in [CacheKind::Memory, CacheKind::Tiered] {
        cfg.cache = kind;
        let cache = cache_from_cfg(&cfg)?;
        let res = rgb_resource("https://x/a.png", 2, 2)?;
        cache.put(res.clone());
        assert_eq!(cache.get(res.key()), Some(res));
    }
    Ok(())
}
