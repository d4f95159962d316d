use crate::{
    cverr,
    file_util::{self, DEFAULT_HOMEDIR, DEFAULT_TMPDIR},
    result::{to_cv, to_cv_kind, CvError, CvResult, ErrorKind},
};
use serde::{Deserialize, Serialize};
use std::{
    fmt::Debug,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const CFG_DEFAULT: &str = r#"
    cache = "Tiered"  # "Memory" or "Tiered"
    n_threads = 4
    [memory_cache_args]
    max_entries = 256
    max_size_mb = 64
    [disk_cache_args]
    max_size_mb = 1024
    [fetch_args]
    timeout_secs = 30
    # tmpdir =
    "#;

/// # Panics
/// If the embedded default config does not parse.
pub fn get_default_cfg() -> Cfg {
    toml::from_str(CFG_DEFAULT).expect("default config broken")
}

pub fn get_cfg_path() -> CvResult<PathBuf> {
    Ok(dirs::home_dir()
        .ok_or_else(|| cverr!(ErrorKind::Config; "where is your home? cannot load config"))?
        .join(".cvimage")
        .join("cv_cfg.toml"))
}

pub fn get_log_folder(home_folder: &Path) -> PathBuf {
    home_folder.join("logs")
}

pub fn get_default_log_folder() -> PathBuf {
    get_log_folder(&DEFAULT_HOMEDIR)
}

pub fn parse_cfg(toml_str: &str) -> CvResult<Cfg> {
    toml::from_str(toml_str).map_err(to_cv_kind(ErrorKind::Config))
}

/// Reads the config at `cfg_path` and falls back to the default if there is no file.
pub fn read_cfg(cfg_path: &Path) -> CvResult<Cfg> {
    if cfg_path.exists() {
        let toml_str = file_util::read_to_string(cfg_path)?;
        parse_cfg(&toml_str)
    } else {
        Ok(get_default_cfg())
    }
}

pub fn get_cfg() -> CvResult<Cfg> {
    read_cfg(&get_cfg_path()?)
}

pub fn write_cfg_to(cfg_path: &Path, cfg: &Cfg) -> CvResult<()> {
    if let Some(cfg_parent) = cfg_path.parent() {
        fs::create_dir_all(cfg_parent).map_err(to_cv_kind(ErrorKind::Config))?;
    }
    let cfg_str = toml::to_string_pretty(cfg).map_err(to_cv_kind(ErrorKind::Config))?;
    file_util::write(cfg_path, cfg_str)
}

pub fn write_cfg(cfg: &Cfg) -> CvResult<()> {
    write_cfg_to(&get_cfg_path()?, cfg)
}

#[derive(Deserialize, Serialize, Debug, Eq, PartialEq, Clone, Copy, Default)]
pub enum CacheKind {
    Memory,
    #[default]
    Tiered,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCacheArgs {
    pub max_entries: usize,
    pub max_size_mb: usize,
}
impl MemoryCacheArgs {
    pub fn max_size_bytes(&self) -> usize {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}
impl Default for MemoryCacheArgs {
    fn default() -> Self {
        Self {
            max_entries: 256,
            max_size_mb: 64,
        }
    }
}

/// Limit of the png files of the tiered cache.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskCacheArgs {
    pub max_size_mb: u64,
}
impl DiskCacheArgs {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }
}
impl Default for DiskCacheArgs {
    fn default() -> Self {
        Self { max_size_mb: 1024 }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchArgs {
    pub timeout_secs: u64,
}
impl FetchArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
impl Default for FetchArgs {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Cfg {
    pub cache: CacheKind,
    pub n_threads: usize,
    tmpdir: Option<String>,
    #[serde(default)]
    pub memory_cache_args: MemoryCacheArgs,
    #[serde(default)]
    pub disk_cache_args: DiskCacheArgs,
    #[serde(default)]
    pub fetch_args: FetchArgs,
}

impl Cfg {
    /// Folder of the disk cache.
    pub fn tmpdir(&self) -> CvResult<&str> {
        match &self.tmpdir {
            Some(td) => Ok(td.as_str()),
            None => DEFAULT_TMPDIR
                .to_str()
                .ok_or_else(|| CvError::new("could not get tmpdir")),
        }
    }
    pub fn set_tmpdir(&mut self, tmpdir: Option<String>) {
        self.tmpdir = tmpdir;
    }
    pub fn n_threads(&self) -> usize {
        self.n_threads.max(1)
    }
}

#[test]
fn test_default_cfg() -> CvResult<()> {
    let cfg = get_default_cfg();
    assert_eq!(cfg.cache, CacheKind::Tiered);
    assert_eq!(cfg.n_threads(), 4);
    assert_eq!(cfg.memory_cache_args.max_size_bytes(), 64 * 1024 * 1024);
    assert_eq!(cfg.disk_cache_args.max_size_bytes(), 1024 * 1024 * 1024);
    assert_eq!(cfg.fetch_args.timeout(), Duration::from_secs(30));
    assert_eq!(cfg.tmpdir()?, DEFAULT_TMPDIR.to_str().unwrap());
    Ok(())
}

#[test]
fn test_toml() -> CvResult<()> {
    let cfg = parse_cfg(
        r#"
        cache = "Memory"
        n_threads = 0
        tmpdir = "/some/where"
        "#,
    )?;
    assert_eq!(cfg.cache, CacheKind::Memory);
    assert_eq!(cfg.n_threads(), 1);
    assert_eq!(cfg.memory_cache_args, MemoryCacheArgs::default());
    assert_eq!(cfg.disk_cache_args, DiskCacheArgs::default());
    assert_eq!(cfg.tmpdir()?, "/some/where");
    let roundtrip = parse_cfg(&toml::to_string_pretty(&cfg).map_err(to_cv)?)?;
    assert_eq!(roundtrip, cfg);
    assert_eq!(
        parse_cfg("cache = \"Disk\"").unwrap_err().kind(),
        ErrorKind::Config
    );
    Ok(())
}

#[cfg(test)]
use crate::defer_folder_removal;

#[test]
fn test_write_read() -> CvResult<()> {
    let folder = DEFAULT_TMPDIR.join("test_cfg_write_read");
    defer_folder_removal!(&folder);
    let cfg_path = folder.join("home").join("cv_cfg.toml");
    assert_eq!(read_cfg(&cfg_path)?, get_default_cfg());
    let mut cfg = get_default_cfg();
    cfg.cache = CacheKind::Memory;
    cfg.disk_cache_args.max_size_mb = 7;
    cfg.set_tmpdir(Some("/some/where".to_string()));
    write_cfg_to(&cfg_path, &cfg)?;
    assert_eq!(read_cfg(&cfg_path)?, cfg);
    file_util::write(&cfg_path, "n_threads = \"many\"")?;
    assert_eq!(read_cfg(&cfg_path).unwrap_err().kind(), ErrorKind::Config);
    Ok(())
}
