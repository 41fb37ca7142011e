use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use flarm_core::{is_valid_token, FlarmError, FlarmResult, PackageMetadata};
use tracing::debug;

use crate::fs_utils::remove_file_if_exists;
use crate::layout::InstallLayout;

pub const UNKNOWN_PLATFORM: &str = "unknown";

const RECEIPT_VERSION: u32 = 1;

const RESERVED_CHARS: &[char] = &['/', '\\', '<', '>', ':', '"', '|', '?', '*'];

/// `(publisher, app, version, platform)` of an installation, rendered on disk as the
/// canonical folder name `{publisher}.{app}.{version}-{platform}`.
///
/// Publisher never contains `.` and the platform never contains `-`. The app and the
/// version may both contain `.`, so the split between them is kept in a receipt written
/// at install time rather than recovered from the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstallIdentity {
    publisher: String,
    app: String,
    version: String,
    platform: String,
}

impl InstallIdentity {
    pub fn new(publisher: &str, app: &str, version: &str, platform: &str) -> FlarmResult<Self> {
        validate_name_token("publisher", publisher, &['.'])?;
        validate_name_token("app", app, &[])?;
        validate_free_token("version", version, &[])?;
        validate_free_token("platform", platform, &['-', '.'])?;
        Ok(Self {
            publisher: publisher.to_string(),
            app: app.to_string(),
            version: version.to_string(),
            platform: platform.to_string(),
        })
    }

    /// An undeclared platform is recorded as `unknown`.
    pub fn from_metadata(metadata: &PackageMetadata) -> FlarmResult<Self> {
        let platform = metadata.platform.trim();
        let platform = if platform.is_empty() {
            UNKNOWN_PLATFORM
        } else {
            platform
        };
        Self::new(
            metadata.publisher.trim(),
            metadata.app.trim(),
            metadata.version.trim(),
            platform,
        )
    }

    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn canonical_folder_name(&self) -> String {
        format!(
            "{}.{}.{}-{}",
            self.publisher, self.app, self.version, self.platform
        )
    }
}

impl fmt::Display for InstallIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_folder_name())
    }
}

pub fn canonical_folder_name(metadata: &PackageMetadata) -> FlarmResult<String> {
    Ok(InstallIdentity::from_metadata(metadata)?.canonical_folder_name())
}

/// Best-effort parse for folders without a receipt: the app is taken to be free of `.`.
pub fn parse_canonical_folder_name(name: &str) -> Option<InstallIdentity> {
    let (publisher, rest) = name.split_once('.')?;
    let (app, rest) = rest.split_once('.')?;
    let (version, platform) = rest.rsplit_once('-')?;
    InstallIdentity::new(publisher, app, version, platform).ok()
}

/// Identity of the installed folder `name`: its receipt when one matches, else the
/// best-effort parse.
pub fn identify_installed(layout: &InstallLayout, name: &str) -> Option<InstallIdentity> {
    match read_receipt(layout, name) {
        Ok(Some(identity)) if identity.canonical_folder_name() == name => return Some(identity),
        Ok(_) => {}
        Err(err) => debug!(name, error = %err, "ignoring unreadable receipt"),
    }
    parse_canonical_folder_name(name)
}

pub fn write_receipt(layout: &InstallLayout, identity: &InstallIdentity) -> Result<PathBuf> {
    let path = layout.receipt_path(&identity.canonical_folder_name());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let payload = format!(
        "version={RECEIPT_VERSION}\nidentity={}\t{}\t{}\t{}\n",
        identity.publisher, identity.app, identity.version, identity.platform
    );
    fs::write(&path, payload.as_bytes())
        .with_context(|| format!("failed to write install receipt: {}", path.display()))?;
    Ok(path)
}

pub fn read_receipt(
    layout: &InstallLayout,
    canonical_name: &str,
) -> Result<Option<InstallIdentity>> {
    let path = layout.receipt_path(canonical_name);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read install receipt: {}", path.display()))
        }
    };
    parse_receipt(&raw)
        .map(Some)
        .with_context(|| format!("failed to parse install receipt: {}", path.display()))
}

pub fn remove_receipt(layout: &InstallLayout, canonical_name: &str) -> Result<()> {
    let path = layout.receipt_path(canonical_name);
    remove_file_if_exists(&path)
        .with_context(|| format!("failed to remove install receipt: {}", path.display()))
}

fn parse_receipt(raw: &str) -> Result<InstallIdentity> {
    let mut identity = None;
    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((key, value)) = line.split_once('=') else {
            return Err(anyhow!("invalid receipt row format: {line}"));
        };
        match key {
            "version" => {
                let version = value
                    .parse::<u32>()
                    .context("receipt version must be u32")?;
                if version != RECEIPT_VERSION {
                    return Err(anyhow!("unsupported receipt version: {version}"));
                }
            }
            "identity" => {
                let parts = value.split('\t').collect::<Vec<_>>();
                let [publisher, app, version, platform] = parts.as_slice() else {
                    return Err(anyhow!("invalid receipt identity row"));
                };
                identity = Some(
                    InstallIdentity::new(publisher, app, version, platform)
                        .map_err(|err| anyhow!("{err}"))?,
                );
            }
            _ => {}
        }
    }
    identity.ok_or_else(|| anyhow!("receipt has no identity row"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub identity: InstallIdentity,
    pub path: PathBuf,
}

/// Exact-name lookup among the immediate subdirectories of the install root. Names that
/// merely start with or contain the canonical name never match.
pub fn find_installed(
    layout: &InstallLayout,
    identity: &InstallIdentity,
) -> FlarmResult<Option<PathBuf>> {
    let wanted = identity.canonical_folder_name();
    for (name, path) in installed_dirs(layout)? {
        if name == wanted {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

pub fn list_installed(layout: &InstallLayout) -> FlarmResult<Vec<InstalledPackage>> {
    let mut packages = installed_dirs(layout)?
        .into_iter()
        .filter_map(|(name, path)| {
            identify_installed(layout, &name).map(|identity| InstalledPackage { identity, path })
        })
        .collect::<Vec<_>>();
    packages.sort_by(|left, right| left.identity.cmp(&right.identity));
    Ok(packages)
}

fn installed_dirs(layout: &InstallLayout) -> FlarmResult<Vec<(String, PathBuf)>> {
    let root = layout.root();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(FlarmError::io(
                format!("failed to list install root {}", root.display()),
                err,
            ))
        }
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| {
            FlarmError::io(format!("failed to list install root {}", root.display()), err)
        })?;
        let is_dir = entry
            .file_type()
            .map(|file_type| file_type.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        dirs.push((name, entry.path()));
    }
    Ok(dirs)
}

fn validate_name_token(field: &str, value: &str, forbidden: &[char]) -> FlarmResult<()> {
    if !is_valid_token(value) || value.contains(forbidden) {
        return Err(FlarmError::metadata_unavailable(format!(
            "{field} '{value}' cannot be used in an install folder name"
        )));
    }
    Ok(())
}

fn validate_free_token(field: &str, value: &str, forbidden: &[char]) -> FlarmResult<()> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && value.trim() == value
        && !value
            .chars()
            .any(|ch| ch.is_control() || RESERVED_CHARS.contains(&ch) || forbidden.contains(&ch));
    if !valid {
        return Err(FlarmError::metadata_unavailable(format!(
            "{field} '{value}' cannot be used in an install folder name"
        )));
    }
    Ok(())
}
