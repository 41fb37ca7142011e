use crate::reference::PackageCoordinate;

pub const DEFAULT_REPO_HOST: &str = "https://github.com";
pub const DEFAULT_RAW_HOST: &str = "https://raw.githubusercontent.com";
pub const DEFAULT_API_HOST: &str = "https://api.github.com";
pub const DEFAULT_DESCRIPTOR_BRANCH: &str = "main";

/// Where package repositories, descriptors and release listings live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    repo_host: String,
    raw_host: String,
    api_host: String,
    branch: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self::new(
            DEFAULT_REPO_HOST,
            DEFAULT_RAW_HOST,
            DEFAULT_API_HOST,
            DEFAULT_DESCRIPTOR_BRANCH,
        )
    }
}

impl Endpoints {
    pub fn new(repo_host: &str, raw_host: &str, api_host: &str, branch: &str) -> Self {
        Self {
            repo_host: normalize_host(repo_host),
            raw_host: normalize_host(raw_host),
            api_host: normalize_host(api_host),
            branch: branch.trim().trim_matches('/').to_string(),
        }
    }

    pub fn repo_host(&self) -> &str {
        &self.repo_host
    }

    pub fn repository_url(&self, owner: &str, repo: &str) -> String {
        format!("{}/{owner}/{repo}", self.repo_host)
    }

    pub fn releases_page_url(&self, coordinate: &PackageCoordinate) -> String {
        format!(
            "{}/releases",
            self.repository_url(coordinate.publisher(), coordinate.app())
        )
    }

    pub fn descriptor_url(&self, coordinate: &PackageCoordinate) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.raw_host,
            coordinate.publisher(),
            coordinate.app(),
            self.branch,
            crate::descriptor::DESCRIPTOR_FILE_NAME
        )
    }

    pub fn releases_api_url(&self, coordinate: &PackageCoordinate) -> String {
        format!(
            "{}/repos/{}/{}/releases",
            self.api_host,
            coordinate.publisher(),
            coordinate.app()
        )
    }
}

/// Exactly one scheme prefix and no trailing slash, however the host was configured.
fn normalize_host(host: &str) -> String {
    let mut rest = host.trim();
    let mut scheme = None;
    loop {
        let lower = rest.to_ascii_lowercase();
        let prefix = if lower.starts_with("https://") {
            "https"
        } else if lower.starts_with("http://") {
            "http"
        } else {
            break;
        };
        scheme.get_or_insert(prefix);
        rest = &rest[prefix.len() + 3..];
    }
    format!(
        "{}://{}",
        scheme.unwrap_or("https"),
        rest.trim_end_matches('/')
    )
}
