use crate::{
    cverr,
    result::{to_cv, CvResult},
};
use lazy_static::lazy_static;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::{
    collections::hash_map::DefaultHasher,
    fmt::Debug,
    fs,
    hash::{Hash, Hasher},
    io,
    path::{Path, PathBuf},
};
use tracing::{error, info};

lazy_static! {
    pub static ref DEFAULT_TMPDIR: PathBuf = std::env::temp_dir().join("cvimage");
}
lazy_static! {
    pub static ref DEFAULT_HOMEDIR: PathBuf = match dirs::home_dir() {
        Some(p) => p.join(".cvimage"),
        _ => std::env::temp_dir().join("cvimage"),
    };
}

// keep '-', '.' and '_' readable in file names
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_');
const MAX_ENCODED_TAIL_LEN: usize = 100;
const KEY_HASH_LEN: usize = 16;

/// Not stable across Rust releases, do not use for anything that is persisted.
pub fn calculate_hash<T: Hash>(t: &T) -> u64 {
    let mut s = DefaultHasher::new();
    t.hash(&mut s);
    s.finish()
}

/// Hex digest of `s` that stays the same across builds and platforms.
pub fn stable_hash_hex(s: &str) -> String {
    blake3::hash(s.as_bytes()).to_hex().as_str()[..KEY_HASH_LEN].to_string()
}

/// Maps a resource key to a file name that is unique per key and valid on all platforms. The name
/// starts with a stable hash of the exact key, so keys that differ only in case do not collide on
/// case-insensitive file systems. The tail of the encoded key follows for readability.
pub fn key_to_filename(key: &str, extension: &str) -> String {
    let encoded = utf8_percent_encode(key, KEY_ENCODE_SET).to_string();
    let tail_start = encoded.len().saturating_sub(MAX_ENCODED_TAIL_LEN);
    // encoded is ascii, any index is a char boundary
    format!(
        "{}_{}.{extension}",
        stable_hash_hex(key),
        &encoded[tail_start..]
    )
}

pub fn read_to_string<P>(p: P) -> CvResult<String>
where
    P: AsRef<Path> + Debug,
{
    fs::read_to_string(&p).map_err(|e| cverr!("could not read {:?} due to {:?}", p, e))
}

pub fn write<P, C>(path: P, contents: C) -> CvResult<()>
where
    P: AsRef<Path> + Debug,
    C: AsRef<[u8]>,
{
    fs::write(&path, contents).map_err(|e| cverr!("could not write to {:?} since {:?}", path, e))
}

pub fn create_dir_all<P>(path: P) -> CvResult<()>
where
    P: AsRef<Path> + Debug,
{
    fs::create_dir_all(&path).map_err(to_cv)
}

pub struct Defer<F: FnMut()> {
    pub func: F,
}
impl<F: FnMut()> Drop for Defer<F> {
    fn drop(&mut self) {
        (self.func)();
    }
}
#[macro_export]
macro_rules! defer {
    ($f:expr) => {
        let _dfr = $crate::file_util::Defer { func: $f };
    };
}
pub fn checked_remove<'a, P: AsRef<Path> + Debug>(
    path: &'a P,
    func: fn(p: &'a P) -> io::Result<()>,
) {
    match func(path) {
        Ok(_) => info!("removed {path:?}"),
        Err(e) => error!("could not remove {path:?} due to {e:?}"),
    }
}
#[macro_export]
macro_rules! defer_folder_removal {
    ($path:expr) => {
        let func = || $crate::file_util::checked_remove($path, std::fs::remove_dir_all);
        $crate::defer!(func);
    };
}
#[macro_export]
macro_rules! defer_file_removal {
    ($path:expr) => {
        let func = || $crate::file_util::checked_remove($path, std::fs::remove_file);
        $crate::defer!(func);
    };
}

#[test]
fn test_key_to_filename() {
    let name = key_to_filename("https://x/img.png", "png");
    assert!(name.ends_with("_https%3A%2F%2Fx%2Fimg.png.png"));
    assert_eq!(name, key_to_filename("https://x/img.png", "png"));
    assert_ne!(
        key_to_filename("https://x/a.png", "png"),
        key_to_filename("https://x/b.png", "png")
    );
    let long_a = format!("https://x/{}a.png", "y".repeat(400));
    let long_b = format!("https://x/{}b.png", "y".repeat(400));
    let fa = key_to_filename(&long_a, "png");
    let fb = key_to_filename(&long_b, "png");
    assert!(fa.len() < 255);
    assert_ne!(fa, fb);
    assert!(fa.ends_with("a.png.png"));
}
#[test]
fn test_filenames_differ_ignoring_case() {
    let upper = key_to_filename("https://x/Photo.png", "png");
    let lower = key_to_filename("https://x/photo.png", "png");
    assert!(!upper.eq_ignore_ascii_case(&lower));
}
#[test]
fn test_stable_hash() {
    // persisted names must not change between builds
    assert_eq!(stable_hash_hex("abc"), "6437b3ac38465133");
    assert_eq!(stable_hash_hex("abc").len(), 16);
}
#[test]
fn test_defer_removal() -> CvResult<()> {
    let folder = DEFAULT_TMPDIR.join("test_defer_removal");
    create_dir_all(&folder)?;
    {
        defer_folder_removal!(&folder);
        write(folder.join("f.txt"), "content")?;
        assert_eq!(read_to_string(folder.join("f.txt"))?, "content");
    }
    assert!(!folder.exists());
    Ok(())
}
