use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const INSTALL_ROOT_DIR_NAME: &str = "FLARM Apps";

/// Directory under the install root that holds flarm's own bookkeeping. Its leading dot
/// keeps it from ever parsing as a canonical folder name.
pub const BOOKKEEPING_DIR_NAME: &str = ".flarm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    root: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bookkeeping_dir(&self) -> PathBuf {
        self.root.join(BOOKKEEPING_DIR_NAME)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.bookkeeping_dir().join("staging")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.bookkeeping_dir().join("locks")
    }

    pub fn registrations_dir(&self) -> PathBuf {
        self.bookkeeping_dir().join("registrations")
    }

    pub fn receipts_dir(&self) -> PathBuf {
        self.bookkeeping_dir().join("receipts")
    }

    pub fn package_dir(&self, canonical_name: &str) -> PathBuf {
        self.root.join(canonical_name)
    }

    pub fn lock_path(&self, canonical_name: &str) -> PathBuf {
        self.locks_dir().join(format!("{canonical_name}.lock"))
    }

    pub fn registration_path(&self, canonical_name: &str) -> PathBuf {
        self.registrations_dir()
            .join(format!("{canonical_name}.reg"))
    }

    pub fn receipt_path(&self, canonical_name: &str) -> PathBuf {
        self.receipts_dir().join(format!("{canonical_name}.receipt"))
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.bookkeeping_dir(),
            self.staging_dir(),
            self.locks_dir(),
            self.registrations_dir(),
            self.receipts_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_documents_dir() -> Result<PathBuf> {
    if cfg!(windows) {
        let profile = std::env::var("USERPROFILE")
            .context("USERPROFILE is not set; cannot resolve the Documents folder")?;
        return Ok(PathBuf::from(profile).join("Documents"));
    }

    let home =
        std::env::var("HOME").context("HOME is not set; cannot resolve the Documents folder")?;
    Ok(PathBuf::from(home).join("Documents"))
}

pub fn default_install_root() -> Result<PathBuf> {
    Ok(default_documents_dir()?.join(INSTALL_ROOT_DIR_NAME))
}

pub fn default_desktop_dir() -> Result<PathBuf> {
    let home = if cfg!(windows) {
        std::env::var("USERPROFILE").context("USERPROFILE is not set; cannot resolve the Desktop")?
    } else {
        std::env::var("HOME").context("HOME is not set; cannot resolve the Desktop")?
    };
    Ok(PathBuf::from(home).join("Desktop"))
}
