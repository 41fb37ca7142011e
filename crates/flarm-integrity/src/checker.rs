use std::path::PathBuf;

use flarm_core::{FlarmError, FlarmResult, DEFAULT_SCHEME, PACKAGE_EXTENSION};
use tracing::{debug, info, warn};

/// The two OS-level registrations the installer relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Registration {
    /// The link scheme opens the installer.
    Handler,
    /// Offline package files open the installer.
    Association,
}

impl Registration {
    pub const ALL: [Self; 2] = [Self::Handler, Self::Association];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Handler => "handler",
            Self::Association => "association",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityStatus {
    Ok,
    MissingHandler,
    MissingAssociation,
    Both,
}

impl IntegrityStatus {
    pub fn from_presence(handler: bool, association: bool) -> Self {
        match (handler, association) {
            (true, true) => Self::Ok,
            (false, true) => Self::MissingHandler,
            (true, false) => Self::MissingAssociation,
            (false, false) => Self::Both,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::MissingHandler => "missing-handler",
            Self::MissingAssociation => "missing-association",
            Self::Both => "missing-handler-and-association",
        }
    }

    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    pub fn missing(self) -> Vec<Registration> {
        match self {
            Self::Ok => Vec::new(),
            Self::MissingHandler => vec![Registration::Handler],
            Self::MissingAssociation => vec![Registration::Association],
            Self::Both => Registration::ALL.to_vec(),
        }
    }
}

/// Expected registration values. Resolved once by the caller and passed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityConfig {
    pub scheme: String,
    pub package_extension: String,
    pub installer_exe: PathBuf,
    pub icon: Option<PathBuf>,
}

impl IntegrityConfig {
    pub fn new(installer_exe: impl Into<PathBuf>) -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            package_extension: PACKAGE_EXTENSION.to_string(),
            installer_exe: installer_exe.into(),
            icon: None,
        }
    }

    pub fn with_icon(mut self, icon: impl Into<PathBuf>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// `"<exe>" "%1"`, the open command both registrations point at.
    pub fn open_command(&self) -> String {
        format!("\"{}\" \"%1\"", self.installer_exe.display())
    }

    /// `<icon>,0`, falling back to the installer's own icon.
    pub fn icon_resource(&self) -> String {
        let icon = self.icon.as_ref().unwrap_or(&self.installer_exe);
        format!("{},0", icon.display())
    }
}

/// Reads and writes the OS registrations.
pub trait RegistrationStore: Send + Sync {
    /// True when `registration` exists and points at the configured installer.
    fn is_registered(
        &self,
        registration: Registration,
        config: &IntegrityConfig,
    ) -> FlarmResult<bool>;

    fn register(&self, registration: Registration, config: &IntegrityConfig) -> FlarmResult<()>;

    /// Captures whatever `register` would overwrite for `registration`.
    fn snapshot(
        &self,
        registration: Registration,
        config: &IntegrityConfig,
    ) -> FlarmResult<RegistrationSnapshot>;

    /// Puts back the values captured by `snapshot`.
    fn restore(&self, snapshot: &RegistrationSnapshot) -> FlarmResult<()>;

    fn requires_elevation(&self) -> bool;

    /// Whether the OS only honours a rewritten registration after a restart.
    fn requires_restart(&self) -> bool;
}

/// One value a store writes, with what it held before the write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavedEntry {
    /// A keyed value such as a registry default or a MIME default handler.
    Value { key: String, previous: Option<String> },
    File { path: PathBuf, previous: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSnapshot {
    pub registration: Registration,
    pub entries: Vec<SavedEntry>,
}

impl RegistrationSnapshot {
    pub fn new(registration: Registration) -> Self {
        Self {
            registration,
            entries: Vec::new(),
        }
    }

    pub fn value(mut self, key: impl Into<String>, previous: Option<String>) -> Self {
        self.entries.push(SavedEntry::Value {
            key: key.into(),
            previous,
        });
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>, previous: Option<String>) -> Self {
        self.entries.push(SavedEntry::File {
            path: path.into(),
            previous,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElevationGrant {
    /// This process may now write.
    Granted,
    /// An elevated copy of the installer performed the repair.
    Delegated,
    Denied { reason: String },
}

pub trait PrivilegeBroker: Send + Sync {
    fn is_elevated(&self) -> bool;
    fn request_elevation(&self) -> FlarmResult<ElevationGrant>;
}

pub trait RestartScheduler: Send + Sync {
    fn schedule_restart(&self) -> FlarmResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    AlreadyHealthy,
    Repaired {
        fixed: Vec<Registration>,
        restart_scheduled: bool,
    },
    RepairedElevated,
}

pub struct IntegrityChecker<'a> {
    config: &'a IntegrityConfig,
    store: &'a dyn RegistrationStore,
    broker: &'a dyn PrivilegeBroker,
    restart: &'a dyn RestartScheduler,
}

impl<'a> IntegrityChecker<'a> {
    pub fn new(
        config: &'a IntegrityConfig,
        store: &'a dyn RegistrationStore,
        broker: &'a dyn PrivilegeBroker,
        restart: &'a dyn RestartScheduler,
    ) -> Self {
        Self {
            config,
            store,
            broker,
            restart,
        }
    }

    pub fn check(&self) -> FlarmResult<IntegrityStatus> {
        let handler = self.store.is_registered(Registration::Handler, self.config)?;
        let association = self
            .store
            .is_registered(Registration::Association, self.config)?;
        let status = IntegrityStatus::from_presence(handler, association);
        debug!(status = status.as_str(), "checked system registrations");
        Ok(status)
    }

    /// Rewrites missing registrations. Nothing is written unless the store's privilege
    /// requirement is met first, and a failed write or verification puts back the
    /// values captured before the first write.
    pub fn repair(&self) -> FlarmResult<RepairOutcome> {
        let status = self.check()?;
        if status.is_ok() {
            return Ok(RepairOutcome::AlreadyHealthy);
        }

        if self.store.requires_elevation() && !self.broker.is_elevated() {
            info!(status = status.as_str(), "requesting elevation to repair registrations");
            match self.broker.request_elevation()? {
                ElevationGrant::Granted => {}
                ElevationGrant::Delegated => {
                    let after = self.check()?;
                    if !after.is_ok() {
                        return Err(FlarmError::RepairFailed {
                            reason: format!(
                                "elevated repair finished but registrations still report {}",
                                after.as_str()
                            ),
                        });
                    }
                    return Ok(RepairOutcome::RepairedElevated);
                }
                ElevationGrant::Denied { reason } => {
                    warn!(%reason, "elevation denied; registrations left unchanged");
                    return Err(FlarmError::ElevationDenied { reason });
                }
            }
        }

        let fixed = status.missing();
        let snapshots = fixed
            .iter()
            .map(|registration| self.store.snapshot(*registration, self.config))
            .collect::<FlarmResult<Vec<_>>>()
            .map_err(|err| FlarmError::RepairFailed {
                reason: format!("failed to read current registrations: {err}"),
            })?;

        for registration in &fixed {
            if let Err(err) = self.store.register(*registration, self.config) {
                self.roll_back(&snapshots);
                return Err(FlarmError::RepairFailed {
                    reason: format!("failed to write {}: {err}", registration.as_str()),
                });
            }
            info!(registration = registration.as_str(), "registration written");
        }

        let after = match self.check() {
            Ok(after) => after,
            Err(err) => {
                self.roll_back(&snapshots);
                return Err(err);
            }
        };
        if !after.is_ok() {
            self.roll_back(&snapshots);
            return Err(FlarmError::RepairFailed {
                reason: format!("registrations still report {} after repair", after.as_str()),
            });
        }

        let restart_scheduled = if self.store.requires_restart() {
            self.restart
                .schedule_restart()
                .map_err(|err| FlarmError::RepairFailed {
                    reason: format!(
                        "registrations written but restart could not be scheduled: {err}"
                    ),
                })?;
            info!("restart scheduled so the new registrations take effect");
            true
        } else {
            false
        };

        Ok(RepairOutcome::Repaired {
            fixed,
            restart_scheduled,
        })
    }

    /// Restores every snapshot, newest first. Failures are logged so the original error
    /// still reaches the caller.
    fn roll_back(&self, snapshots: &[RegistrationSnapshot]) {
        for snapshot in snapshots.iter().rev() {
            match self.store.restore(snapshot) {
                Ok(()) => info!(
                    registration = snapshot.registration.as_str(),
                    "registration rolled back"
                ),
                Err(err) => warn!(
                    registration = snapshot.registration.as_str(),
                    error = %err,
                    "failed to roll back registration"
                ),
            }
        }
    }
}
