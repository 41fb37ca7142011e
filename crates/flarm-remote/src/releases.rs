use std::sync::Arc;

use flarm_core::{
    select_asset, Endpoints, FlarmError, FlarmResult, PackageCoordinate, PackageSource, Platform,
    ReleaseAsset, SelectedAsset, Transport,
};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct ReleaseDto {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<AssetDto>,
}

#[derive(Debug, Deserialize)]
struct AssetDto {
    name: String,
    browser_download_url: String,
}

/// Finds package files among a repository's GitHub releases.
pub struct GithubReleases {
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
}

impl GithubReleases {
    pub fn new(transport: Arc<dyn Transport>, endpoints: Endpoints) -> Self {
        Self {
            transport,
            endpoints,
        }
    }
}

impl PackageSource for GithubReleases {
    fn resolve_asset(
        &self,
        coordinate: &PackageCoordinate,
        running: Platform,
    ) -> FlarmResult<SelectedAsset> {
        let url = self.endpoints.releases_api_url(coordinate);
        let releases_page = self.endpoints.releases_page_url(coordinate);
        debug!(%url, "listing releases");

        let body = match self.transport.fetch_bytes(&url) {
            Ok(body) => body,
            Err(err) if err.is_not_found() => {
                return Err(FlarmError::metadata_unavailable(format!(
                    "could not list releases for {coordinate}: {err}"
                ))
                .with_releases_page(releases_page))
            }
            Err(err) => return Err(err),
        };

        let assets = parse_release_assets(&body)
            .map_err(|err| err.with_releases_page(releases_page.clone()))?;
        let selected = select_asset(&assets, coordinate.app(), running).ok_or_else(|| {
            FlarmError::metadata_unavailable(format!(
                "no package file for {} found in the releases of {coordinate}",
                running.as_str()
            ))
            .with_releases_page(releases_page)
        })?;

        info!(
            package = %coordinate,
            asset = %selected.asset.name,
            release = selected.asset.release_tag.as_deref().unwrap_or("-"),
            "selected release asset"
        );
        Ok(selected)
    }
}

/// Assets of published releases in API order (newest first). Stable releases come
/// before prereleases; drafts are skipped.
pub fn parse_release_assets(body: &[u8]) -> FlarmResult<Vec<ReleaseAsset>> {
    let releases: Vec<ReleaseDto> = serde_json::from_slice(body).map_err(|err| {
        FlarmError::metadata_unavailable(format!("release listing is not valid JSON: {err}"))
    })?;

    let (stable, prerelease): (Vec<_>, Vec<_>) = releases
        .into_iter()
        .filter(|release| !release.draft)
        .partition(|release| !release.prerelease);

    Ok(stable
        .into_iter()
        .chain(prerelease)
        .flat_map(|release| {
            let tag = release.tag_name;
            release.assets.into_iter().map(move |asset| ReleaseAsset {
                name: asset.name,
                download_url: asset.browser_download_url,
                release_tag: Some(tag.clone()),
            })
        })
        .collect())
}
