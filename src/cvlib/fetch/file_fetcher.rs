use std::{fs::File, io::BufReader};

use crate::{
    cverr,
    fetch::core::{parse_url, unsupported_scheme, ByteStream, Fetch},
    result::{CvResult, ErrorKind},
    types::ResourceKey,
};

/// Reads `file://` urls from the local file system.
#[derive(Clone, Debug, Default)]
pub struct FileFetcher;

impl Fetch for FileFetcher {
    fn open(&self, key: &ResourceKey) -> CvResult<ByteStream> {
        let url = parse_url(key)?;
        if url.scheme() != "file" {
            return Err(unsupported_scheme(&url));
        }
        let path = url
            .to_file_path()
            .map_err(|_| cverr!(ErrorKind::MalformedUrl; "{} is not a local file path", url))?;
        let file = File::open(&path)
            .map_err(|e| cverr!(ErrorKind::Io; "could not open {:?}, {:?}", path, e))?;
        Ok(Box::new(BufReader::new(file)))
    }
}

#[cfg(test)]
use {
    crate::{defer_folder_removal, file_util, file_util::DEFAULT_TMPDIR},
    reqwest::Url,
    std::io::Read,
};

#[test]
fn test_file_fetcher() -> CvResult<()> {
    let folder = DEFAULT_TMPDIR.join("test_file_fetcher");
    defer_folder_removal!(&folder);
    file_util::create_dir_all(&folder)?;
    let path = folder.join("some.bin");
    file_util::write(&path, [1u8, 2, 3])?;
    let url = Url::from_file_path(&path).map_err(|_| cverr!("no file url for {:?}", path))?;
    let mut stream = FileFetcher.open(&ResourceKey::parse(url.as_str())?)?;
    let mut bytes = vec![];
    stream
        .read_to_end(&mut bytes)
        .map_err(crate::result::to_cv)?;
    assert_eq!(bytes, vec![1, 2, 3]);

    let missing = Url::from_file_path(folder.join("missing.bin"))
        .map_err(|_| cverr!("no file url"))?;
    let err = FileFetcher
        .open(&ResourceKey::parse(missing.as_str())?)
        .err()
        .map(|e| e.kind());
    assert_eq!(err, Some(ErrorKind::Io));
    let err = FileFetcher
        .open(&ResourceKey::parse("https://x/img.png")?)
        .err()
        .map(|e| e.kind());
    assert_eq!(err, Some(ErrorKind::MalformedUrl));
    Ok(())
}
