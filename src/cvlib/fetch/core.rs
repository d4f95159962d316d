use std::io::Read;

use reqwest::Url;

use crate::{
    cverr,
    result::{CvResult, ErrorKind},
    types::ResourceKey,
};

pub type ByteStream = Box<dyn Read + Send>;

/// Transport that turns a resource key into a byte stream.
pub trait Fetch: Send + Sync {
    /// Fails with [`ErrorKind::MalformedUrl`] if the key cannot be fetched by this transport and
    /// with [`ErrorKind::Io`] if the connection fails.
    fn open(&self, key: &ResourceKey) -> CvResult<ByteStream>;
}

pub fn parse_url(key: &ResourceKey) -> CvResult<Url> {
    Url::parse(key.as_str())
        .map_err(|e| cverr!(ErrorKind::MalformedUrl; "could not parse url {:?}, {}", key.as_str(), e))
}

pub fn unsupported_scheme(url: &Url) -> crate::result::CvError {
    cverr!(ErrorKind::MalformedUrl; "unsupported scheme {:?} in {}", url.scheme(), url)
}

#[test]
fn test_parse_url() -> CvResult<()> {
    let url = parse_url(&ResourceKey::parse("https://x/img.png")?)?;
    assert_eq!(url.scheme(), "https");
    assert_eq!(url.path(), "/img.png");
    let err = parse_url(&ResourceKey::parse("bad-url")?).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedUrl);
    Ok(())
}
