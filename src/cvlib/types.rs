use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};

use crate::{
    cverr,
    result::{CvResult, ErrorKind},
};

/// Identifies a resource by its origin, typically a URL. Used as cache key and as fetch target.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Rejects empty keys and keys with control characters. Whether the key is a well-formed URL
    /// is up to the fetch transport to decide.
    pub fn parse(key: &str) -> CvResult<Self> {
        let key = key.trim();
        if key.is_empty() {
            return Err(cverr!(ErrorKind::InvalidKey; "resource key is empty"));
        }
        if let Some(c) = key.chars().find(|c| c.is_control()) {
            return Err(cverr!(
                ErrorKind::InvalidKey; "resource key {:?} contains control character {:?}",
                key,
                c
            ));
        }
        Ok(Self(key.to_string()))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl Display for ResourceKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl AsRef<str> for ResourceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A decoded image together with the key it was loaded from. Cloning is cheap, the pixels are
/// shared.
#[derive(Clone, Debug)]
pub struct Resource {
    key: ResourceKey,
    im: Arc<DynamicImage>,
}
impl Resource {
    pub fn new(key: ResourceKey, im: DynamicImage) -> Self {
        Self {
            key,
            im: Arc::new(im),
        }
    }
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }
    pub fn image(&self) -> &DynamicImage {
        &self.im
    }
    pub fn dimensions(&self) -> (u32, u32) {
        self.im.dimensions()
    }
    pub fn has_valid_payload(&self) -> bool {
        let (w, h) = self.dimensions();
        w > 0 && h > 0
    }
    pub fn size_in_bytes(&self) -> usize {
        self.im.as_bytes().len()
    }
    /// Whether both resources share the same pixel buffer.
    pub fn ptr_eq(&self, other: &Resource) -> bool {
        Arc::ptr_eq(&self.im, &other.im)
    }
}
impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && (self.ptr_eq(other) || self.im.as_bytes() == other.im.as_bytes())
    }
}

/// Decode at native resolution or downsampled by [`REDUCED_SAMPLE_FACTOR`](REDUCED_SAMPLE_FACTOR)
/// per dimension.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum FidelityMode {
    #[default]
    FullSize,
    Reduced,
}

pub const REDUCED_SAMPLE_FACTOR: u32 = 2;

impl FidelityMode {
    pub fn sample_factor(&self) -> u32 {
        match self {
            FidelityMode::FullSize => 1,
            FidelityMode::Reduced => REDUCED_SAMPLE_FACTOR,
        }
    }
    /// Target dimensions after sampling, never smaller than 1x1.
    pub fn target_dimensions(&self, w: u32, h: u32) -> (u32, u32) {
        let f = self.sample_factor();
        ((w / f).max(1), (h / f).max(1))
    }
}

/// Tells the caller of a load request whether the surface was bound right away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Served from cache, the surface is bound already.
    HitSync,
    /// A load task is in flight, the surface has been cleared.
    MissAsync,
}

#[cfg(test)]
use image::{ImageBuffer, Rgb};

#[test]
fn test_key() -> CvResult<()> {
    assert!(ResourceKey::parse("").unwrap_err().is_invalid_key());
    assert!(ResourceKey::parse("   ").unwrap_err().is_invalid_key());
    assert!(ResourceKey::parse("https://x/a\nb.png")
        .unwrap_err()
        .is_invalid_key());
    let key = ResourceKey::parse("  https://x/img.png ")?;
    assert_eq!(key.as_str(), "https://x/img.png");
    // not a url but still a key
    assert_eq!(ResourceKey::parse("bad-url")?.as_str(), "bad-url");
    Ok(())
}

#[test]
fn test_resource() -> CvResult<()> {
    let key = ResourceKey::parse("https://x/img.png")?;
    let im = DynamicImage::ImageRgb8(ImageBuffer::<Rgb<u8>, Vec<u8>>::new(4, 3));
    let res = Resource::new(key.clone(), im);
    assert!(res.has_valid_payload());
    assert_eq!(res.size_in_bytes(), 4 * 3 * 3);
    assert_eq!(res.key(), &key);
    assert!(res.ptr_eq(&res.clone()));
    let empty = Resource::new(
        key,
        DynamicImage::ImageRgb8(ImageBuffer::<Rgb<u8>, Vec<u8>>::new(0, 0)),
    );
    assert!(!empty.has_valid_payload());
    Ok(())
}

#[test]
fn test_fidelity() {
    assert_eq!(FidelityMode::Reduced.target_dimensions(200, 200), (100, 100));
    assert_eq!(FidelityMode::Reduced.target_dimensions(201, 1), (100, 1));
    assert_eq!(FidelityMode::FullSize.target_dimensions(201, 1), (201, 1));
}
