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
use crate::xdg::{read_existing, restore_file, write_file};

pub const HANDLER_BUNDLE_NAME: &str = "FlarmHandler.app";
pub const HANDLER_BUNDLE_ID: &str = "com.flarm.handler";
pub const LSREGISTER: &str = "/System/Library/Frameworks/CoreServices.framework/Frameworks/\
LaunchServices.framework/Support/lsregister";

const LAUNCHER_NAME: &str = "flarmhandler";

/// Handler and association declared by a small app bundle in the user's Applications
/// folder. Launch Services picks both up from its `Info.plist` once `lsregister` runs.
#[derive(Debug, Clone)]
pub struct LaunchServicesStore<R = SystemCommands> {
    runner: R,
    applications_dir: PathBuf,
}

impl<R: CommandRunner> LaunchServicesStore<R> {
    pub fn new(runner: R, applications_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            applications_dir: applications_dir.into(),
        }
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.applications_dir.join(HANDLER_BUNDLE_NAME)
    }

    pub fn info_plist_path(&self) -> PathBuf {
        self.bundle_dir().join("Contents").join("Info.plist")
    }

    pub fn launcher_path(&self) -> PathBuf {
        self.bundle_dir()
            .join("Contents")
            .join("MacOS")
            .join(LAUNCHER_NAME)
    }

    fn launcher_is_current(&self, config: &IntegrityConfig) -> bool {
        fs::read_to_string(self.launcher_path())
            .map(|content| content == render_launcher(config))
            .unwrap_or(false)
    }

    fn declared(&self, config: &IntegrityConfig) -> (bool, bool) {
        let plist = fs::read_to_string(self.info_plist_path()).unwrap_or_default();
        (
            plist.contains(&url_types_block(config)),
            plist.contains(&document_types_block(config)),
        )
    }

    fn write_bundle(
        &self,
        config: &IntegrityConfig,
        handler: bool,
        association: bool,
    ) -> Result<()> {
        let launcher = self.launcher_path();
        write_file(&launcher, &render_launcher(config))?;
        make_executable(&launcher)?;
        write_file(
            &self.info_plist_path(),
            &render_info_plist(config, handler, association),
        )?;
        self.refresh(&["-f"])
    }

    fn refresh(&self, flags: &[&str]) -> Result<()> {
        let mut command = Command::new(LSREGISTER);
        command.args(flags).arg(self.bundle_dir());
        self.runner
            .run(&mut command, "failed to register the handler bundle")
    }
}

impl<R: CommandRunner> RegistrationStore for LaunchServicesStore<R> {
    fn is_registered(
        &self,
        registration: Registration,
        config: &IntegrityConfig,
    ) -> FlarmResult<bool> {
        if !self.launcher_is_current(config) {
            return Ok(false);
        }
        let (handler, association) = self.declared(config);
        Ok(match registration {
            Registration::Handler => handler,
            Registration::Association => association,
        })
    }

    fn register(&self, registration: Registration, config: &IntegrityConfig) -> FlarmResult<()> {
        let (handler, association) = self.declared(config);
        let (handler, association) = match registration {
            Registration::Handler => (true, association),
            Registration::Association => (handler, true),
        };
        self.write_bundle(config, handler, association)
            .map_err(|err| FlarmError::filesystem(&err))
    }

    fn snapshot(
        &self,
        registration: Registration,
        _config: &IntegrityConfig,
    ) -> FlarmResult<RegistrationSnapshot> {
        let plist = self.info_plist_path();
        let launcher = self.launcher_path();
        Ok(RegistrationSnapshot::new(registration)
            .file(&plist, read_existing(&plist)?)
            .file(&launcher, read_existing(&launcher)?))
    }

    fn restore(&self, snapshot: &RegistrationSnapshot) -> FlarmResult<()> {
        for entry in snapshot.entries.iter().rev() {
            match entry {
                SavedEntry::File { path, previous } => restore_file(path, previous.as_deref())
                    .map_err(|err| FlarmError::filesystem(&err))?,
                SavedEntry::Value { key, .. } => {
                    debug!(key = %key, "launch services store keeps no keyed values");
                }
            }
        }
        let flags: &[&str] = if self.info_plist_path().exists() {
            &["-f"]
        } else {
            &["-u"]
        };
        if let Err(err) = self.refresh(flags) {
            warn!(error = %err, "launch services refresh skipped after rollback");
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

/// `$HOME/Applications`.
pub fn default_applications_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME is not set; cannot resolve ~/Applications")?;
    Ok(PathBuf::from(home).join("Applications"))
}

fn render_launcher(config: &IntegrityConfig) -> String {
    format!(
        "#!/bin/sh\nexec \"{}\" \"$@\"\n",
        config.installer_exe.display()
    )
}

fn url_types_block(config: &IntegrityConfig) -> String {
    format!(
        "  <key>CFBundleURLTypes</key>
  <array>
    <dict>
      <key>CFBundleURLName</key><string>FLARM Store</string>
      <key>CFBundleURLSchemes</key>
      <array>
        <string>{}</string>
      </array>
    </dict>
  </array>
",
        config.scheme
    )
}

fn document_types_block(config: &IntegrityConfig) -> String {
    format!(
        "  <key>CFBundleDocumentTypes</key>
  <array>
    <dict>
      <key>CFBundleTypeName</key><string>FLARM package</string>
      <key>CFBundleTypeRole</key><string>Viewer</string>
      <key>LSHandlerRank</key><string>Owner</string>
      <key>CFBundleTypeExtensions</key>
      <array>
        <string>{}</string>
      </array>
    </dict>
  </array>
",
        config.package_extension.trim_start_matches('.')
    )
}

fn render_info_plist(config: &IntegrityConfig, handler: bool, association: bool) -> String {
    let mut plist = String::new();
    plist.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    plist.push_str(
        "<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \
         \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n",
    );
    plist.push_str("<plist version=\"1.0\">\n<dict>\n");
    plist.push_str("  <key>CFBundleName</key><string>FlarmHandler</string>\n");
    plist.push_str(&format!(
        "  <key>CFBundleIdentifier</key><string>{HANDLER_BUNDLE_ID}</string>\n"
    ));
    plist.push_str(&format!(
        "  <key>CFBundleExecutable</key><string>{LAUNCHER_NAME}</string>\n"
    ));
    plist.push_str("  <key>CFBundlePackageType</key><string>APPL</string>\n");
    plist.push_str("  <key>LSBackgroundOnly</key><true/>\n");
    if handler {
        plist.push_str(&url_types_block(config));
    }
    if association {
        plist.push_str(&document_types_block(config));
    }
    plist.push_str("</dict>\n</plist>\n");
    plist
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("failed to mark {} executable", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
