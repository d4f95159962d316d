use std::{
    path::PathBuf,
    sync::{mpsc, Arc},
    time::Duration,
};

use tracing::debug;

use crate::{
    cache::{DiskCache, MemoryCache, ResourceCache},
    cfg::{DiskCacheArgs, MemoryCacheArgs},
    result::{to_cv, CvResult},
    threadpool::WorkerPool,
    types::{Resource, ResourceKey},
};

/// Memory in front of disk. Disk hits are promoted to memory, puts go to memory right away and to
/// disk on a background thread so that the caller never waits for png encoding.
pub struct TieredCache {
    memory: MemoryCache,
    disk: Arc<DiskCache>,
    disk_writer: WorkerPool,
}

impl TieredCache {
    pub fn new(
        memory_args: MemoryCacheArgs,
        disk_args: DiskCacheArgs,
        folder: impl Into<PathBuf>,
    ) -> CvResult<Self> {
        Ok(Self {
            memory: MemoryCache::new(memory_args),
            disk: Arc::new(DiskCache::new(disk_args, folder)?),
            disk_writer: WorkerPool::new(1)?,
        })
    }
    pub fn memory(&self) -> &MemoryCache {
        &self.memory
    }
    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }
}

impl ResourceCache for TieredCache {
    fn get(&self, key: &ResourceKey) -> Option<Resource> {
        if let Some(resource) = self.memory.get(key) {
            return Some(resource);
        }
        let resource = self.disk.get(key)?;
        debug!("promoting {key} from disk to memory");
        self.memory.put(resource.clone());
        Some(resource)
    }

    fn put(&self, resource: Resource) {
        if !resource.has_valid_payload() {
            return;
        }
        self.memory.put(resource.clone());
        let disk = self.disk.clone();
        let key = resource.key().clone();
        if let Err(e) = self.disk_writer.apply(Box::new(move || disk.put(resource))) {
            tracing::warn!("could not queue disk write of {key}, {e:?}");
        }
    }

    fn clear(&self) -> CvResult<()> {
        self.memory.clear()?;
        self.flush(Duration::from_secs(10))?;
        self.disk.clear()
    }

    /// Blocks until all disk writes queued so far are done or the timeout is reached.
    fn flush(&self, timeout: Duration) -> CvResult<()> {
        let (tx, rx) = mpsc::channel();
        self.disk_writer.apply(Box::new(move || {
            tx.send(()).ok();
        }))?;
        rx.recv_timeout(timeout).map_err(to_cv)
    }
}

#[cfg(test)]
use crate::{defer_folder_removal, file_util::DEFAULT_TMPDIR, test_helpers::rgb_resource};

#[test]
fn test_tiered() -> CvResult<()> {
    let folder = DEFAULT_TMPDIR.join("test_tiered");
    defer_folder_removal!(&folder);
    let args = MemoryCacheArgs {
        max_entries: 1,
        max_size_mb: 1,
    };
    let cache = TieredCache::new(args, DiskCacheArgs::default(), &folder)?;
    let a = rgb_resource("https://x/a.png", 3, 3)?;
    let b = rgb_resource("https://x/b.png", 3, 3)?;
    cache.put(a.clone());
    cache.put(b.clone());
    cache.flush(Duration::from_secs(5))?;
    assert!(!cache.memory().contains(a.key()));
    assert!(cache.disk().contains(a.key()));
    assert!(cache.disk().contains(b.key()));
    // a comes back from disk and pushes b out of memory
    assert_eq!(cache.get(a.key()), Some(a.clone()));
    assert!(cache.memory().contains(a.key()));
    assert!(!cache.memory().contains(b.key()));
    cache.clear()?;
    assert!(cache.get(a.key()).is_none());
    assert!(cache.get(b.key()).is_none());
    Ok(())
}

#[test]
fn test_tiered_disk_is_bounded() -> CvResult<()> {
    let folder = DEFAULT_TMPDIR.join("test_tiered_disk_is_bounded");
    defer_folder_removal!(&folder);
    let memory_args = MemoryCacheArgs {
        max_entries: 1,
        max_size_mb: 1,
    };
    // a limit of zero keeps only the entry written last
    let cache = TieredCache::new(memory_args, DiskCacheArgs { max_size_mb: 0 }, &folder)?;
    for i in 0..50 {
        cache.put(rgb_resource(&format!("https://x/{i}.png"), 4, 4)?);
    }
    cache.flush(Duration::from_secs(10))?;
    assert_eq!(cache.memory().len(), 1);
    assert_eq!(cache.disk().len()?, 1);
    assert!(cache.disk().contains(&ResourceKey::parse("https://x/49.png")?));
    assert_eq!(cache.disk().stats().evictions(), 49);
    Ok(())
}
