use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use flarm_core::{
    Endpoints, ReferenceParser, DEFAULT_API_HOST, DEFAULT_DESCRIPTOR_BRANCH, DEFAULT_RAW_HOST,
    DEFAULT_REPO_HOST, DEFAULT_SCHEME, PACKAGE_EXTENSION,
};
use flarm_installer::default_install_root;
use flarm_remote::{DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_SHORTENER_URL};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub(crate) const CONFIG_ENV_VAR: &str = "FLARM_CONFIG";
const CONFIG_DIR_NAME: &str = "flarm";
const CONFIG_FILE_NAME: &str = "config.toml";

/// User settings read from `config.toml`. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct FlarmConfig {
    pub install_root: Option<PathBuf>,
    pub scheme: String,
    pub package_extension: String,
    pub repo_host: String,
    pub raw_host: String,
    pub api_host: String,
    pub descriptor_branch: String,
    pub shortener_url: String,
    pub fetch_timeout_secs: u64,
    pub create_shortcuts: bool,
    pub icon_path: Option<PathBuf>,
}

impl Default for FlarmConfig {
    fn default() -> Self {
        Self {
            install_root: None,
            scheme: DEFAULT_SCHEME.to_string(),
            package_extension: PACKAGE_EXTENSION.to_string(),
            repo_host: DEFAULT_REPO_HOST.to_string(),
            raw_host: DEFAULT_RAW_HOST.to_string(),
            api_host: DEFAULT_API_HOST.to_string(),
            descriptor_branch: DEFAULT_DESCRIPTOR_BRANCH.to_string(),
            shortener_url: DEFAULT_SHORTENER_URL.to_string(),
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            create_shortcuts: true,
            icon_path: None,
        }
    }
}

impl FlarmConfig {
    pub(crate) fn endpoints(&self) -> Endpoints {
        Endpoints::new(
            &self.repo_host,
            &self.raw_host,
            &self.api_host,
            &self.descriptor_branch,
        )
    }

    pub(crate) fn parser(&self) -> ReferenceParser {
        ReferenceParser::new(&self.scheme, &self.package_extension)
    }

    pub(crate) fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs.max(1))
    }

    /// The command-line override wins over the configured root, which wins over
    /// `Documents/FLARM Apps`.
    pub(crate) fn resolve_install_root(&self, cli_override: Option<&Path>) -> Result<PathBuf> {
        if let Some(root) = cli_override {
            return Ok(root.to_path_buf());
        }
        if let Some(root) = &self.install_root {
            return Ok(root.clone());
        }
        default_install_root()
    }
}

pub(crate) fn parse_config(raw: &str) -> Result<FlarmConfig> {
    toml::from_str(raw).context("failed to parse flarm config")
}

/// `--config`, then `$FLARM_CONFIG`, then the per-user config directory.
pub(crate) fn resolve_config_path(
    explicit: Option<&Path>,
    env_value: Option<OsString>,
) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(value));
    }
    default_config_path()
}

pub(crate) fn default_config_path() -> Option<PathBuf> {
    config_home().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn config_home() -> Option<PathBuf> {
    if cfg!(windows) {
        return std::env::var_os("APPDATA").map(PathBuf::from);
    }
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME").filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config"))
}

/// Reads the config at `path`. A missing file means defaults.
pub(crate) fn load_config(path: Option<&Path>) -> Result<FlarmConfig> {
    let Some(path) = path else {
        return Ok(FlarmConfig::default());
    };
    if !path.exists() {
        debug!(path = %path.display(), "no config file; using defaults");
        return Ok(FlarmConfig::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&raw).with_context(|| format!("invalid config {}", path.display()))
}
