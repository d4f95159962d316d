use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use cvlib::{
    cache::{cache_from_cfg, ResourceCache},
    cfg::{get_default_cfg, CacheKind, Cfg},
    defer_folder_removal,
    file_util::{self, DEFAULT_TMPDIR},
    result::{to_cv, CvResult, ErrorKind},
    tracing_setup::init_tracing_for_tests,
    FidelityMode, ImageSurface, LoadController, LoadOutcome, Resource, TaskRunner,
};
use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};
use reqwest::Url;

const TIMEOUT: Duration = Duration::from_secs(10);

fn write_png(folder: &Path, name: &str, w: u32, h: u32) -> CvResult<String> {
    let im = DynamicImage::ImageRgb8(ImageBuffer::from_fn(w, h, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }));
    let mut bytes = vec![];
    im.write_to(&mut std::io::Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .map_err(to_cv)?;
    let path = folder.join(name);
    file_util::write(&path, bytes)?;
    file_url(&path)
}

fn file_url(path: &Path) -> CvResult<String> {
    Url::from_file_path(path)
        .map(|url| url.to_string())
        .map_err(|_| cvlib::cverr!("cannot turn {:?} into a url", path))
}

fn setup(name: &str, cache: CacheKind) -> CvResult<(PathBuf, Cfg)> {
    init_tracing_for_tests();
    let folder = DEFAULT_TMPDIR.join(name);
    file_util::create_dir_all(folder.join("origin"))?;
    let mut cfg = get_default_cfg();
    cfg.cache = cache;
    cfg.set_tmpdir(folder.join("cache").to_str().map(|s| s.to_string()));
    Ok((folder, cfg))
}

#[test]
fn test_miss_then_hit() -> CvResult<()> {
    let (folder, cfg) = setup("test_it_miss_then_hit", CacheKind::Memory)?;
    defer_folder_removal!(&folder);
    let url = write_png(&folder.join("origin"), "a.png", 64, 32)?;
    let cache = cache_from_cfg(&cfg)?;
    let runner = Arc::new(TaskRunner::from_cfg(&cfg)?);
    let mut ctrl = LoadController::new(ImageSurface::new(), cache, runner);

    assert_eq!(
        ctrl.request_load(&url, FidelityMode::FullSize)?,
        LoadOutcome::MissAsync
    );
    assert!(!ctrl.surface().is_bound());
    assert!(ctrl.wait_for_completion(TIMEOUT));
    assert_eq!(ctrl.surface().resource().map(Resource::dimensions), Some((64, 32)));

    assert_eq!(
        ctrl.request_load(&url, FidelityMode::FullSize)?,
        LoadOutcome::HitSync
    );
    assert_eq!(ctrl.surface().n_binds(), 3);
    let stats = ctrl.stats();
    assert_eq!((stats.cache_hits, stats.cache_misses), (1, 1));
    Ok(())
}

#[test]
fn test_reduced() -> CvResult<()> {
    let (folder, cfg) = setup("test_it_reduced", CacheKind::Memory)?;
    defer_folder_removal!(&folder);
    let url = write_png(&folder.join("origin"), "odd.png", 201, 3)?;
    let mut ctrl = LoadController::new(
        ImageSurface::new(),
        cache_from_cfg(&cfg)?,
        Arc::new(TaskRunner::from_cfg(&cfg)?),
    );
    ctrl.request_load(&url, FidelityMode::Reduced)?;
    assert!(ctrl.wait_for_completion(TIMEOUT));
    assert_eq!(ctrl.surface().resource().map(Resource::dimensions), Some((100, 1)));
    Ok(())
}

#[test]
fn test_last_request_wins() -> CvResult<()> {
    let (folder, cfg) = setup("test_it_last_request_wins", CacheKind::Memory)?;
    defer_folder_removal!(&folder);
    let origin = folder.join("origin");
    let urls = (0..8)
        .map(|i| write_png(&origin, &format!("{i}.png"), 10 + i, 10))
        .collect::<CvResult<Vec<_>>>()?;
    let mut bound = vec![];
    {
        let surface = |r: Option<Resource>| bound.push(r.map(|r| r.key().to_string()));
        let mut ctrl = LoadController::new(
            surface,
            cache_from_cfg(&cfg)?,
            Arc::new(TaskRunner::from_cfg(&cfg)?),
        );
        for url in &urls {
            ctrl.request_load(url, FidelityMode::FullSize)?;
        }
        assert!(ctrl.wait_for_completion(TIMEOUT));
        // late results of earlier requests must not show up
        std::thread::sleep(Duration::from_millis(100));
        ctrl.process_completions();
    }
    // the last request clears the surface and only its own result follows
    let n = bound.len();
    assert!(n >= 2);
    assert_eq!(bound[n - 2], None);
    assert_eq!(bound[n - 1], urls.last().cloned());
    Ok(())
}

#[test]
fn test_failures_clear_surface() -> CvResult<()> {
    let (folder, cfg) = setup("test_it_failures", CacheKind::Memory)?;
    defer_folder_removal!(&folder);
    let origin = folder.join("origin");
    let ok = write_png(&origin, "ok.png", 4, 4)?;
    file_util::write(origin.join("garbage.png"), "<html>404</html>")?;
    let garbage = file_url(&origin.join("garbage.png"))?;
    let missing = file_url(&origin.join("missing.png"))?;
    let mut ctrl = LoadController::new(
        ImageSurface::new(),
        cache_from_cfg(&cfg)?,
        Arc::new(TaskRunner::from_cfg(&cfg)?),
    );
    for bad in [garbage.as_str(), missing.as_str(), "ftp://x/a.png", "no url"] {
        ctrl.request_load(&ok, FidelityMode::FullSize)?;
        assert!(ctrl.wait_for_completion(TIMEOUT));
        assert!(ctrl.surface().is_bound());
        assert_eq!(
            ctrl.request_load(bad, FidelityMode::FullSize)?,
            LoadOutcome::MissAsync
        );
        assert!(ctrl.wait_for_completion(TIMEOUT));
        assert!(!ctrl.surface().is_bound());
        // failures are not cached, the next try fetches again
        assert_eq!(
            ctrl.request_load(bad, FidelityMode::FullSize)?,
            LoadOutcome::MissAsync
        );
        assert!(ctrl.wait_for_completion(TIMEOUT));
    }
    let err = ctrl.request_load("", FidelityMode::FullSize).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidKey);
    Ok(())
}

#[test]
fn test_tiered_cache_survives_restart() -> CvResult<()> {
    let (folder, cfg) = setup("test_it_tiered_restart", CacheKind::Tiered)?;
    defer_folder_removal!(&folder);
    let url = write_png(&folder.join("origin"), "a.png", 8, 8)?;
    {
        let cache = cache_from_cfg(&cfg)?;
        let mut ctrl = LoadController::new(
            ImageSurface::new(),
            cache.clone(),
            Arc::new(TaskRunner::from_cfg(&cfg)?),
        );
        ctrl.request_load(&url, FidelityMode::FullSize)?;
        assert!(ctrl.wait_for_completion(TIMEOUT));
        cache.flush(TIMEOUT)?;
    }
    // the origin is gone, only the disk cache can deliver
    std::fs::remove_dir_all(folder.join("origin")).map_err(to_cv)?;
    let mut ctrl = LoadController::new(
        ImageSurface::new(),
        cache_from_cfg(&cfg)?,
        Arc::new(TaskRunner::from_cfg(&cfg)?),
    );
    assert_eq!(
        ctrl.request_load(&url, FidelityMode::FullSize)?,
        LoadOutcome::HitSync
    );
    assert_eq!(ctrl.surface().resource().map(Resource::dimensions), Some((8, 8)));
    Ok(())
}
