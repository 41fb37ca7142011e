use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use flarm_core::{FlarmError, FlarmResult};
use tracing::{debug, warn};

use crate::checker::{
    IntegrityConfig, Registration, RegistrationSnapshot, RegistrationStore, SavedEntry,
};
use crate::commands::{CommandRunner, SystemCommands};

/// Handler and association in the user's freedesktop databases: one desktop entry for
/// both, a shared-mime-info package for the file glob, defaults set with `xdg-mime`.
#[derive(Debug, Clone)]
pub struct XdgStore<R = SystemCommands> {
    runner: R,
    data_home: PathBuf,
}

impl<R: CommandRunner> XdgStore<R> {
    pub fn new(runner: R, data_home: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            data_home: data_home.into(),
        }
    }

    pub fn desktop_entry_path(&self, config: &IntegrityConfig) -> PathBuf {
        self.data_home
            .join("applications")
            .join(desktop_entry_name(config))
    }

    pub fn mime_package_path(&self, config: &IntegrityConfig) -> PathBuf {
        self.data_home
            .join("mime")
            .join("packages")
            .join(format!("{}-package.xml", config.scheme))
    }

    fn default_handler(&self, mime_type: &str) -> Option<String> {
        let mut command = Command::new("xdg-mime");
        command.arg("query").arg("default").arg(mime_type);
        match self
            .runner
            .output(&mut command, "failed to query default handler")
        {
            Ok(stdout) => {
                let value = String::from_utf8_lossy(&stdout).trim().to_string();
                (!value.is_empty()).then_some(value)
            }
            Err(err) => {
                debug!(mime_type, error = %err, "no default handler");
                None
            }
        }
    }

    fn is_default_for(&self, mime_type: &str, config: &IntegrityConfig) -> bool {
        self.default_handler(mime_type).as_deref() == Some(desktop_entry_name(config).as_str())
    }

    fn entry_is_current(&self, config: &IntegrityConfig) -> bool {
        fs::read_to_string(self.desktop_entry_path(config))
            .map(|content| content == render_desktop_entry(config))
            .unwrap_or(false)
    }

    fn mime_package_is_current(&self, config: &IntegrityConfig) -> bool {
        fs::read_to_string(self.mime_package_path(config))
            .map(|content| content == render_mime_package(config))
            .unwrap_or(false)
    }

    fn write_desktop_entry(&self, config: &IntegrityConfig) -> Result<()> {
        let path = self.desktop_entry_path(config);
        write_file(&path, &render_desktop_entry(config))?;

        if let Some(dir) = path.parent() {
            let mut refresh = Command::new("update-desktop-database");
            refresh.arg(dir);
            if let Err(err) = self
                .runner
                .run(&mut refresh, "failed to refresh desktop entry database")
            {
                warn!(error = %err, "desktop database refresh skipped");
            }
        }
        Ok(())
    }

    fn set_default(&self, mime_type: &str, config: &IntegrityConfig) -> Result<()> {
        self.set_default_entry(mime_type, &desktop_entry_name(config))
    }

    fn set_default_entry(&self, mime_type: &str, desktop_entry: &str) -> Result<()> {
        let mut command = Command::new("xdg-mime");
        command.arg("default").arg(desktop_entry).arg(mime_type);
        self.runner
            .run(&mut command, "failed to set default handler")
    }

    fn restore_entry(&self, entry: &SavedEntry) -> Result<()> {
        match entry {
            SavedEntry::File { path, previous } => restore_file(path, previous.as_deref()),
            SavedEntry::Value {
                key,
                previous: Some(desktop_entry),
            } => self.set_default_entry(key, desktop_entry),
            SavedEntry::Value {
                key,
                previous: None,
            } => {
                debug!(mime_type = %key, "no previous default handler to restore");
                Ok(())
            }
        }
    }

    fn register_association(&self, config: &IntegrityConfig) -> Result<()> {
        self.write_desktop_entry(config)?;
        let package = self.mime_package_path(config);
        write_file(&package, &render_mime_package(config))?;

        let mime_dir = self.data_home.join("mime");
        let mut update = Command::new("update-mime-database");
        update.arg(&mime_dir);
        self.runner
            .run(&mut update, "failed to update the user MIME database")?;
        self.set_default(&package_mime_type(config), config)
    }
}

impl<R: CommandRunner> RegistrationStore for XdgStore<R> {
    fn is_registered(
        &self,
        registration: Registration,
        config: &IntegrityConfig,
    ) -> FlarmResult<bool> {
        let registered = match registration {
            Registration::Handler => {
                self.entry_is_current(config)
                    && self.is_default_for(&scheme_mime_type(config), config)
            }
            Registration::Association => {
                self.entry_is_current(config)
                    && self.mime_package_is_current(config)
                    && self.is_default_for(&package_mime_type(config), config)
            }
        };
        Ok(registered)
    }

    fn register(&self, registration: Registration, config: &IntegrityConfig) -> FlarmResult<()> {
        let result = match registration {
            Registration::Handler => self
                .write_desktop_entry(config)
                .and_then(|()| self.set_default(&scheme_mime_type(config), config)),
            Registration::Association => self.register_association(config),
        };
        result.map_err(|err| FlarmError::filesystem(&err))
    }

    fn snapshot(
        &self,
        registration: Registration,
        config: &IntegrityConfig,
    ) -> FlarmResult<RegistrationSnapshot> {
        let entry_path = self.desktop_entry_path(config);
        let snapshot = RegistrationSnapshot::new(registration)
            .file(&entry_path, read_existing(&entry_path)?);
        let snapshot = match registration {
            Registration::Handler => {
                let mime_type = scheme_mime_type(config);
                let previous = self.default_handler(&mime_type);
                snapshot.value(mime_type, previous)
            }
            Registration::Association => {
                let package = self.mime_package_path(config);
                let mime_type = package_mime_type(config);
                let previous = self.default_handler(&mime_type);
                snapshot
                    .file(&package, read_existing(&package)?)
                    .value(mime_type, previous)
            }
        };
        Ok(snapshot)
    }

    fn restore(&self, snapshot: &RegistrationSnapshot) -> FlarmResult<()> {
        for entry in snapshot.entries.iter().rev() {
            self.restore_entry(entry)
                .map_err(|err| FlarmError::filesystem(&err))?;
        }
        if snapshot.registration == Registration::Association {
            let mut update = Command::new("update-mime-database");
            update.arg(self.data_home.join("mime"));
            if let Err(err) = self
                .runner
                .run(&mut update, "failed to update the user MIME database")
            {
                warn!(error = %err, "MIME database refresh skipped after rollback");
            }
        }
        Ok(())
    }

    fn requires_elevation(&self) -> bool {
        false
    }

    fn requires_restart(&self) -> bool {
        false
    }
}

/// `$XDG_DATA_HOME`, else `$HOME/.local/share`.
pub fn default_data_home() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME").filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME is not set; cannot resolve XDG data dir")?;
    Ok(PathBuf::from(home).join(".local").join("share"))
}

pub fn desktop_entry_name(config: &IntegrityConfig) -> String {
    format!("{}-handler.desktop", config.scheme)
}

pub fn scheme_mime_type(config: &IntegrityConfig) -> String {
    format!("x-scheme-handler/{}", config.scheme)
}

pub fn package_mime_type(config: &IntegrityConfig) -> String {
    format!("application/x-{}", config.scheme)
}

fn render_desktop_entry(config: &IntegrityConfig) -> String {
    let mut entry = String::new();
    entry.push_str("[Desktop Entry]\n");
    entry.push_str("Type=Application\n");
    entry.push_str("Name=FLARM Installer\n");
    entry.push_str(&format!(
        "Exec=\"{}\" %u\n",
        config.installer_exe.display()
    ));
    if let Some(icon) = &config.icon {
        entry.push_str(&format!("Icon={}\n", icon.display()));
    }
    entry.push_str("Terminal=false\n");
    entry.push_str("NoDisplay=true\n");
    entry.push_str(&format!(
        "MimeType={};{};\n",
        scheme_mime_type(config),
        package_mime_type(config)
    ));
    entry.push_str("Categories=Utility;\n");
    entry
}

fn render_mime_package(config: &IntegrityConfig) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<mime-info xmlns="http://www.freedesktop.org/standards/shared-mime-info">
  <mime-type type="{}">
    <comment>FLARM package</comment>
    <glob pattern="*.{}"/>
  </mime-type>
</mime-info>
"#,
        package_mime_type(config),
        config.package_extension.trim_start_matches('.')
    )
}

pub(crate) fn read_existing(path: &Path) -> FlarmResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(FlarmError::io(
            format!("failed to read {}", path.display()),
            err,
        )),
    }
}

/// Writes `previous` back, or removes the file when it did not exist.
pub(crate) fn restore_file(path: &Path, previous: Option<&str>) -> Result<()> {
    match previous {
        Some(content) => write_file(path, content),
        None => match fs::remove_file(path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                Err(err).with_context(|| format!("failed to remove {}", path.display()))
            }
            _ => Ok(()),
        },
    }
}

pub(crate) fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, content.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))
}
