use image::{imageops::FilterType, DynamicImage, GenericImageView};
use tracing::warn;

use crate::types::FidelityMode;

/// Turns fetched bytes into an image. Undecodable data is a normal outcome and yields `None`.
pub trait Decode: Send + Sync {
    fn decode(&self, bytes: &[u8], fidelity: FidelityMode) -> Option<DynamicImage>;
}

/// Decodes everything the `image` crate can guess the format of.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageDecoder;

impl Decode for ImageDecoder {
    fn decode(&self, bytes: &[u8], fidelity: FidelityMode) -> Option<DynamicImage> {
        match image::load_from_memory(bytes) {
            Ok(im) => Some(downsample(im, fidelity)),
            Err(e) => {
                warn!("could not decode {} bytes, {e:?}", bytes.len());
                None
            }
        }
    }
}

pub fn downsample(im: DynamicImage, fidelity: FidelityMode) -> DynamicImage {
    let (w, h) = im.dimensions();
    let (w_target, h_target) = fidelity.target_dimensions(w, h);
    if (w, h) == (w_target, h_target) || w == 0 || h == 0 {
        im
    } else {
        im.resize_exact(w_target, h_target, FilterType::Triangle)
    }
}

#[cfg(test)]
use crate::{result::CvResult, test_helpers::png_bytes};

#[test]
fn test_decode() -> CvResult<()> {
    let bytes = png_bytes(200, 200)?;
    let full = ImageDecoder.decode(&bytes, FidelityMode::FullSize);
    assert_eq!(full.map(|im| im.dimensions()), Some((200, 200)));
    let reduced = ImageDecoder.decode(&bytes, FidelityMode::Reduced);
    assert_eq!(reduced.map(|im| im.dimensions()), Some((100, 100)));
    assert!(ImageDecoder
        .decode(b"<html>not found</html>", FidelityMode::FullSize)
        .is_none());
    assert!(ImageDecoder.decode(&[], FidelityMode::Reduced).is_none());
    // truncated payload
    assert!(ImageDecoder
        .decode(&bytes[..bytes.len() / 2], FidelityMode::FullSize)
        .is_none());
    Ok(())
}

#[test]
fn test_downsample_tiny() -> CvResult<()> {
    let im = image::load_from_memory(&png_bytes(1, 3)?).map_err(crate::result::to_cv)?;
    assert_eq!(downsample(im, FidelityMode::Reduced).dimensions(), (1, 1));
    Ok(())
}
