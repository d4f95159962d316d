use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::SystemTime,
};

use image::ImageFormat;
use tracing::{debug, info, warn};

use crate::{
    cache::{stats::CacheStats, ResourceCache},
    cfg::DiskCacheArgs,
    cverr,
    file_util::{self, calculate_hash, key_to_filename},
    result::{to_cv, trace_ok_warn, CvResult},
    types::{Resource, ResourceKey},
};

const EXTENSION: &str = "png";

fn read_image(path: &Path) -> CvResult<image::DynamicImage> {
    image::io::Reader::open(path)
        .map_err(to_cv)?
        .with_guessed_format()
        .map_err(to_cv)?
        .decode()
        .map_err(|e| cverr!("could not decode image {:?}. {:?}", path, e))
}

struct DiskEntry {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Stores one png per key in a folder. Entries survive restarts. Once the files exceed the size
/// limit, the entries written longest ago are removed.
pub struct DiskCache {
    folder: PathBuf,
    max_size_bytes: u64,
    stats: CacheStats,
}

impl DiskCache {
    pub fn new(args: DiskCacheArgs, folder: impl Into<PathBuf>) -> CvResult<Self> {
        Self::with_limit(folder, args.max_size_bytes())
    }
    pub fn with_limit(folder: impl Into<PathBuf>, max_size_bytes: u64) -> CvResult<Self> {
        let folder = folder.into();
        file_util::create_dir_all(&folder)?;
        info!("disk cache in {folder:?} with at most {max_size_bytes} bytes");
        Ok(Self {
            folder,
            max_size_bytes,
            stats: CacheStats::default(),
        })
    }
    pub fn folder(&self) -> &Path {
        &self.folder
    }
    pub fn path_of(&self, key: &ResourceKey) -> PathBuf {
        self.folder.join(key_to_filename(key.as_str(), EXTENSION))
    }
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.path_of(key).exists()
    }
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
    fn entries(&self) -> CvResult<Vec<DiskEntry>> {
        Ok(fs::read_dir(&self.folder)
            .map_err(to_cv)?
            .flatten()
            .filter(|de| de.path().extension().and_then(|e| e.to_str()) == Some(EXTENSION))
            .filter_map(|de| {
                let meta = de.metadata().ok()?;
                Some(DiskEntry {
                    path: de.path(),
                    size: meta.len(),
                    modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                })
            })
            .collect())
    }
    /// Number of entries on disk.
    pub fn len(&self) -> CvResult<usize> {
        self.entries().map(|entries| entries.len())
    }
    /// Total size of the entries on disk.
    pub fn size_in_bytes(&self) -> CvResult<u64> {
        Ok(self.entries()?.iter().map(|e| e.size).sum())
    }

    /// Removes the oldest entries until the size limit holds again. `keep` is never removed.
    fn evict_to_fit(&self, keep: &Path) -> CvResult<()> {
        let mut entries = self.entries()?;
        let mut total = entries.iter().map(|e| e.size).sum::<u64>();
        if total <= self.max_size_bytes {
            return Ok(());
        }
        entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        for entry in entries {
            if total <= self.max_size_bytes {
                break;
            }
            if entry.path == keep {
                continue;
            }
            match fs::remove_file(&entry.path) {
                Ok(_) => {
                    debug!("evicted {:?} from disk cache", entry.path);
                    total -= entry.size;
                    self.stats.record_eviction();
                }
                Err(e) => warn!("could not evict {:?}, {e:?}", entry.path),
            }
        }
        Ok(())
    }
    pub fn is_empty(&self) -> CvResult<bool> {
        self.len().map(|n| n == 0)
    }

    fn write(&self, resource: &Resource) -> CvResult<()> {
        let dst = self.path_of(resource.key());
        // write to a temporary file first such that readers never see half written images
        let tmp = dst.with_extension(format!(
            "{EXTENSION}.{:x}.tmp",
            calculate_hash(&thread::current().id())
        ));
        resource
            .image()
            .save_with_format(&tmp, ImageFormat::Png)
            .map_err(|e| cverr!("could not save {} to {:?}. {:?}", resource.key(), tmp, e))?;
        fs::rename(&tmp, &dst).map_err(|e| {
            file_util::checked_remove(&tmp, fs::remove_file);
            cverr!("could not move {:?} to {:?}. {:?}", tmp, dst, e)
        })
    }
}

impl ResourceCache for DiskCache {
    fn get(&self, key: &ResourceKey) -> Option<Resource> {
        let path = self.path_of(key);
        if !path.exists() {
            self.stats.record_miss();
            return None;
        }
        match read_image(&path) {
            Ok(im) => {
                self.stats.record_hit();
                Some(Resource::new(key.clone(), im))
            }
            Err(e) => {
                warn!("removing broken disk cache entry of {key}, {e:?}");
                file_util::checked_remove(&path, fs::remove_file);
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
        if self.contains(resource.key()) {
            debug!("{} is already on disk", resource.key());
            return;
        }
        if trace_ok_warn(self.write(&resource)).is_some() {
            debug!("wrote {} to disk cache", resource.key());
            self.stats.record_insert();
            trace_ok_warn(self.evict_to_fit(&self.path_of(resource.key())));
        }
    }

    fn clear(&self) -> CvResult<()> {
        if self.folder.exists() {
            fs::remove_dir_all(&self.folder).map_err(to_cv)?;
        }
        file_util::create_dir_all(&self.folder)
    }
}

#[cfg(test)]
use {
    crate::{defer_folder_removal, file_util::DEFAULT_TMPDIR, test_helpers::rgb_resource},
    image::GenericImageView,
};

#[test]
fn test_disk_roundtrip() -> CvResult<()> {
    let folder = DEFAULT_TMPDIR.join("test_disk_roundtrip");
    defer_folder_removal!(&folder);
    let cache = DiskCache::new(DiskCacheArgs::default(), &folder)?;
    let res = rgb_resource("https://x/img.png", 7, 5)?;
    assert!(cache.get(res.key()).is_none());
    cache.put(res.clone());
    assert!(cache.contains(res.key()));
    assert_eq!(cache.len()?, 1);
    // a fresh instance sees what the previous one wrote
    let cache = DiskCache::new(DiskCacheArgs::default(), &folder)?;
    let from_disk = cache.get(res.key()).ok_or_else(|| cverr!("not on disk"))?;
    assert_eq!(from_disk.dimensions(), (7, 5));
    assert_eq!(from_disk.image().get_pixel(3, 2), res.image().get_pixel(3, 2));
    assert_eq!(&from_disk, &res);
    cache.clear()?;
    assert!(cache.is_empty()?);
    assert!(cache.get(res.key()).is_none());
    Ok(())
}

#[test]
fn test_broken_entry_is_dropped() -> CvResult<()> {
    let folder = DEFAULT_TMPDIR.join("test_broken_entry_is_dropped");
    defer_folder_removal!(&folder);
    let cache = DiskCache::new(DiskCacheArgs::default(), &folder)?;
    let key = ResourceKey::parse("https://x/broken.png")?;
    file_util::write(cache.path_of(&key), b"no png")?;
    assert!(cache.get(&key).is_none());
    assert!(!cache.contains(&key));
    assert_eq!(cache.stats().misses(), 1);
    Ok(())
}

#[test]
fn test_size_limit() -> CvResult<()> {
    let folder = DEFAULT_TMPDIR.join("test_disk_size_limit");
    defer_folder_removal!(&folder);
    // same pixels for all keys, hence the same png size
    let sample = rgb_resource("https://x/size.png", 16, 16)?;
    let measured = DiskCache::new(DiskCacheArgs::default(), folder.join("measure"))?;
    measured.put(sample.clone());
    let entry_size = fs::metadata(measured.path_of(sample.key()))
        .map_err(to_cv)?
        .len();

    let cache = DiskCache::with_limit(folder.join("limited"), entry_size * 5 / 2)?;
    let keys = (0..6)
        .map(|i| format!("https://x/{i}.png"))
        .collect::<Vec<_>>();
    for key in &keys {
        cache.put(rgb_resource(key, 16, 16)?);
        assert!(cache.len()? <= 2);
    }
    assert_eq!(cache.len()?, 2);
    assert!(cache.size_in_bytes()? <= entry_size * 5 / 2);
    assert_eq!(cache.stats().evictions(), 4);
    // the entry written last survives
    let last = ResourceKey::parse(&keys[5])?;
    assert!(cache.contains(&last));
    Ok(())
}
