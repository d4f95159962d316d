use reqwest::blocking::Client;

use crate::{
    cfg::FetchArgs,
    fetch::core::{parse_url, unsupported_scheme, ByteStream, Fetch},
    result::{to_cv_kind, CvResult, ErrorKind},
    types::ResourceKey,
};

/// Blocking http(s) transport. The response body is streamed, not buffered.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(args: FetchArgs) -> CvResult<Self> {
        let client = Client::builder()
            .timeout(args.timeout())
            .build()
            .map_err(to_cv_kind(ErrorKind::Io))?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    fn open(&self, key: &ResourceKey) -> CvResult<ByteStream> {
        let url = parse_url(key)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(unsupported_scheme(&url));
        }
        tracing::debug!("GET {url}");
        let resp = self
            .client
            .get(url)
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(to_cv_kind(ErrorKind::Io))?;
        Ok(Box::new(resp))
    }
}

#[test]
fn test_http_errors() -> CvResult<()> {
    let fetcher = HttpFetcher::new(FetchArgs { timeout_secs: 2 })?;
    let open_kind = |key: &str| -> CvResult<Option<ErrorKind>> {
        Ok(fetcher
            .open(&ResourceKey::parse(key)?)
            .err()
            .map(|e| e.kind()))
    };
    assert_eq!(open_kind("bad-url")?, Some(ErrorKind::MalformedUrl));
    assert_eq!(open_kind("file:///tmp/x.png")?, Some(ErrorKind::MalformedUrl));
    // nothing listens on port 1
    assert_eq!(open_kind("http://127.0.0.1:1/x.png")?, Some(ErrorKind::Io));
    Ok(())
}
