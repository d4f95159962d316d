use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    cache::{lru::LruCache, stats::CacheStats, ResourceCache},
    cfg::MemoryCacheArgs,
    result::CvResult,
    types::{Resource, ResourceKey},
};

struct MemoryState {
    lru: LruCache<ResourceKey, Resource>,
    size_bytes: usize,
}

/// In-memory LRU cache bounded by the number of entries and by the total size of the decoded
/// images.
pub struct MemoryCache {
    state: Mutex<MemoryState>,
    max_size_bytes: usize,
    stats: CacheStats,
}

impl MemoryCache {
    pub fn new(args: MemoryCacheArgs) -> Self {
        Self::with_limits(args.max_entries, args.max_size_bytes())
    }
    pub fn with_limits(max_entries: usize, max_size_bytes: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                lru: LruCache::new(max_entries),
                size_bytes: 0,
            }),
            max_size_bytes,
            stats: CacheStats::default(),
        }
    }
    pub fn len(&self) -> usize {
        self.state.lock().lru.len()
    }
    pub fn is_empty(&self) -> bool {
        self.state.lock().lru.is_empty()
    }
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.state.lock().lru.contains(key)
    }
    pub fn size_in_bytes(&self) -> usize {
        self.state.lock().size_bytes
    }
    pub fn size_in_mb(&self) -> f64 {
        self.size_in_bytes() as f64 / (1024.0 * 1024.0)
    }
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
    pub fn remove(&self, key: &ResourceKey) -> Option<Resource> {
        let mut state = self.state.lock();
        let removed = state.lru.remove(key);
        if let Some(r) = &removed {
            state.size_bytes -= r.size_in_bytes();
        }
        removed
    }
}

impl ResourceCache for MemoryCache {
    fn get(&self, key: &ResourceKey) -> Option<Resource> {
        let mut state = self.state.lock();
        match state.lru.get(key) {
            Some(resource) => {
                self.stats.record_hit();
                Some(resource.clone())
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    fn put(&self, resource: Resource) {
        if !resource.has_valid_payload() {
            warn!("refusing to cache invalid resource {}", resource.key());
            return;
        }
        let size = resource.size_in_bytes();
        if size > self.max_size_bytes {
            info!(
                "{} has {size} bytes and does not fit into the memory cache of {} bytes",
                resource.key(),
                self.max_size_bytes
            );
            return;
        }
        let key = resource.key().clone();
        let mut state = self.state.lock();
        if let Some((displaced_key, displaced)) = state.lru.put(key.clone(), resource) {
            state.size_bytes -= displaced.size_in_bytes();
            if displaced_key != key {
                debug!("evicted {displaced_key} from memory cache");
                self.stats.record_eviction();
            }
        }
        state.size_bytes += size;
        while state.size_bytes > self.max_size_bytes {
            match state.lru.pop_lru() {
                Some((evicted_key, evicted)) => {
                    state.size_bytes -= evicted.size_in_bytes();
                    debug!("evicted {evicted_key} from memory cache to free space");
                    self.stats.record_eviction();
                }
                None => break,
            }
        }
        self.stats.record_insert();
    }

    fn clear(&self) -> CvResult<()> {
        let mut state = self.state.lock();
        state.lru.clear();
        state.size_bytes = 0;
        Ok(())
    }
}

#[cfg(test)]
use {
    crate::test_helpers::rgb_resource,
    image::{DynamicImage, ImageBuffer, Rgb},
};

#[test]
fn test_entry_bound() -> CvResult<()> {
    let cache = MemoryCache::with_limits(2, usize::MAX);
    let a = rgb_resource("https://x/a.png", 2, 2)?;
    let b = rgb_resource("https://x/b.png", 2, 2)?;
    let c = rgb_resource("https://x/c.png", 2, 2)?;
    cache.put(a.clone());
    cache.put(b.clone());
    assert!(cache.get(a.key()).is_some());
    cache.put(c.clone());
    assert!(cache.get(b.key()).is_none());
    assert!(cache.get(a.key()).unwrap().ptr_eq(&a));
    assert!(cache.contains(c.key()));
    assert_eq!(cache.stats().evictions(), 1);
    assert_eq!(cache.size_in_bytes(), 2 * 2 * 2 * 3);
    Ok(())
}

#[test]
fn test_size_bound() -> CvResult<()> {
    // each 10x10 rgb image has 300 bytes
    let cache = MemoryCache::with_limits(100, 700);
    for name in ["a", "b", "c"] {
        cache.put(rgb_resource(&format!("https://x/{name}.png"), 10, 10)?);
    }
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.size_in_bytes(), 600);
    assert!(!cache.contains(&ResourceKey::parse("https://x/a.png")?));
    // does not fit at all
    cache.put(rgb_resource("https://x/huge.png", 20, 20)?);
    assert_eq!(cache.len(), 2);
    assert!(!cache.contains(&ResourceKey::parse("https://x/huge.png")?));
    Ok(())
}

#[test]
fn test_replace_and_remove() -> CvResult<()> {
    let cache = MemoryCache::with_limits(10, usize::MAX);
    cache.put(rgb_resource("https://x/a.png", 10, 10)?);
    cache.put(rgb_resource("https://x/a.png", 5, 5)?);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.size_in_bytes(), 75);
    assert_eq!(cache.stats().evictions(), 0);
    let key = ResourceKey::parse("https://x/a.png")?;
    assert_eq!(cache.remove(&key).map(|r| r.dimensions()), Some((5, 5)));
    assert_eq!(cache.size_in_bytes(), 0);
    assert!(cache.is_empty());
    Ok(())
}

#[test]
fn test_invalid_not_cached() -> CvResult<()> {
    let cache = MemoryCache::new(MemoryCacheArgs::default());
    let key = ResourceKey::parse("https://x/empty.png")?;
    let empty = DynamicImage::ImageRgb8(ImageBuffer::<Rgb<u8>, Vec<u8>>::new(0, 0));
    cache.put(Resource::new(key.clone(), empty));
    assert!(cache.get(&key).is_none());
    assert_eq!(cache.stats().misses(), 1);
    cache.put(rgb_resource("https://x/a.png", 1, 1)?);
    cache.clear()?;
    assert!(cache.is_empty());
    assert_eq!(cache.size_in_mb(), 0.0);
    Ok(())
}
