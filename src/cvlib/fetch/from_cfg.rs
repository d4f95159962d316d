use crate::{
    cfg::Cfg,
    fetch::{
        core::{parse_url, unsupported_scheme, ByteStream, Fetch},
        FileFetcher, HttpFetcher,
    },
    result::CvResult,
    types::ResourceKey,
};

/// Picks the transport based on the scheme of the url.
#[derive(Clone)]
pub struct SchemeFetcher {
    http: HttpFetcher,
    file: FileFetcher,
}

impl SchemeFetcher {
    pub fn new(http: HttpFetcher) -> Self {
        Self {
            http,
            file: FileFetcher,
        }
    }
    pub fn from_cfg(cfg: &Cfg) -> CvResult<Self> {
        Ok(Self::new(HttpFetcher::new(cfg.fetch_args)?))
    }
}

impl Fetch for SchemeFetcher {
    fn open(&self, key: &ResourceKey) -> CvResult<ByteStream> {
        let url = parse_url(key)?;
        match url.scheme() {
            "http" | "https" => self.http.open(key),
            "file" => self.file.open(key),
            _ => Err(unsupported_scheme(&url)),
        }
    }
}

#[cfg(test)]
use crate::{cfg::get_default_cfg, result::ErrorKind};

#[test]
fn test_dispatch() -> CvResult<()> {
    let fetcher = SchemeFetcher::from_cfg(&get_default_cfg())?;
    let kind = |key: &str| -> CvResult<Option<ErrorKind>> {
        Ok(fetcher
            .open(&ResourceKey::parse(key)?)
            .err()
            .map(|e| e.kind()))
    };
    assert_eq!(kind("bad-url")?, Some(ErrorKind::MalformedUrl));
    assert_eq!(kind("ftp://x/img.png")?, Some(ErrorKind::MalformedUrl));
    assert_eq!(kind("file:///definitely/not/here.png")?, Some(ErrorKind::Io));
    Ok(())
}
