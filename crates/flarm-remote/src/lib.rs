mod http;
mod releases;
mod shortener;

pub use http::{HttpTransport, DEFAULT_FETCH_TIMEOUT_SECS};
pub use releases::{parse_release_assets, GithubReleases};
pub use shortener::{IsGdShortener, DEFAULT_SHORTENER_URL};
