use crate::error::FlarmResult;
use crate::platform::Platform;
use crate::reference::{PackageCoordinate, PACKAGE_EXTENSION};

/// A downloadable package file published with a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub name: String,
    pub download_url: String,
    pub release_tag: Option<String>,
}

/// `<name>-<version>-<platform>.iflapp`, as release assets and offline files are named.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFileName {
    pub stem: String,
    pub version: String,
    pub platform: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedAsset {
    pub asset: ReleaseAsset,
    pub file_name: PackageFileName,
}

/// Finds the package file to download for a remote package.
pub trait PackageSource: Send + Sync {
    fn resolve_asset(
        &self,
        coordinate: &PackageCoordinate,
        running: Platform,
    ) -> FlarmResult<SelectedAsset>;
}

pub fn parse_package_file_name(file_name: &str) -> Option<PackageFileName> {
    let suffix_len = PACKAGE_EXTENSION.len() + 1;
    if file_name.len() <= suffix_len || !file_name.is_char_boundary(file_name.len() - suffix_len)
    {
        return None;
    }
    let (body, suffix) = file_name.split_at(file_name.len() - suffix_len);
    if !suffix.eq_ignore_ascii_case(&format!(".{PACKAGE_EXTENSION}")) {
        return None;
    }

    // The name is everything up to the first '-' past its first character; the
    // platform follows the last '-'.
    let first_dash = body
        .char_indices()
        .skip(1)
        .find(|(_, ch)| *ch == '-')
        .map(|(index, _)| index)?;
    let stem = &body[..first_dash];
    let rest = &body[first_dash + 1..];
    let (version, platform) = rest.rsplit_once('-')?;

    let allowed = |value: &str| {
        !value.is_empty()
            && value
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'))
    };
    if !allowed(version) || !allowed(platform) {
        return None;
    }

    Some(PackageFileName {
        stem: stem.to_string(),
        version: version.to_string(),
        platform: platform.to_string(),
    })
}

/// Prefers an asset whose platform part names the running platform, then any
/// package file named after `app`.
pub fn select_asset(
    assets: &[ReleaseAsset],
    app: &str,
    running: Platform,
) -> Option<SelectedAsset> {
    let parsed = assets
        .iter()
        .filter_map(|asset| parse_package_file_name(&asset.name).map(|name| (asset, name)))
        .collect::<Vec<_>>();

    let platform_match = parsed.iter().find(|(_, name)| {
        let platform = name.platform.to_ascii_lowercase();
        platform
            .split(|ch: char| !ch.is_ascii_alphanumeric())
            .any(|token| running.asset_aliases().contains(&token))
    });

    let prefix = format!("{}-", app.to_ascii_lowercase());
    let chosen = platform_match.or_else(|| {
        parsed
            .iter()
            .find(|(asset, _)| asset.name.to_ascii_lowercase().starts_with(&prefix))
    })?;

    Some(SelectedAsset {
        asset: chosen.0.clone(),
        file_name: chosen.1.clone(),
    })
}
