mod core;
mod file_fetcher;
mod from_cfg;
mod http_fetcher;

pub use self::{
    core::{parse_url, ByteStream, Fetch},
    file_fetcher::FileFetcher,
    from_cfg::SchemeFetcher,
    http_fetcher::HttpFetcher,
};
