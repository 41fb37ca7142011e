mod checker;
mod commands;
mod macos;
mod session;
mod windows;
mod xdg;

pub use checker::{
    ElevationGrant, IntegrityChecker, IntegrityConfig, IntegrityStatus, PrivilegeBroker,
    Registration, RegistrationSnapshot, RegistrationStore, RepairOutcome, RestartScheduler,
    SavedEntry,
};
pub use commands::{describe_command, CommandRunner, SystemCommands};
pub use macos::{
    default_applications_dir, LaunchServicesStore, HANDLER_BUNDLE_ID, HANDLER_BUNDLE_NAME,
    LSREGISTER,
};
pub use session::{SystemRestart, UserSession, DEFAULT_RESTART_DELAY_SECS};
pub use windows::{
    interpret_elevated_exit, parse_reg_default_value, RegistryStore, RunAsElevation,
    CLASSES_ROOT, ERROR_CANCELLED, PACKAGE_PROG_ID,
};
pub use xdg::{
    default_data_home, desktop_entry_name, package_mime_type, scheme_mime_type, XdgStore,
};
