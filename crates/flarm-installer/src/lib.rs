mod artifact;
mod fs_utils;
mod layout;
mod locator;
mod machine;
mod registrations;
mod reservation;
mod shortcut;

pub use artifact::{detect_archive_type, PackageArchives};
pub use layout::{
    default_desktop_dir, default_documents_dir, default_install_root, InstallLayout,
    BOOKKEEPING_DIR_NAME, INSTALL_ROOT_DIR_NAME,
};
pub use locator::{
    canonical_folder_name, find_installed, identify_installed, list_installed,
    parse_canonical_folder_name, read_receipt, remove_receipt, write_receipt, InstallIdentity,
    InstalledPackage, UNKNOWN_PLATFORM,
};
pub use machine::{
    CancelToken, Collaborators, InstallEvent, InstallOutcome, InstallState, Installer,
    Inspection, OperationHandle, PackageView, StepProgress,
};
pub use registrations::{
    read_registrations, remove_registrations, write_registrations, RegistrationRecord,
    KIND_DESKTOP_SHORTCUT,
};
pub use reservation::{retire_package_dir, IdentityLock, Reservation};
pub use shortcut::{
    find_executable, find_icon, sanitize_shortcut_name, DesktopShortcuts, ShortcutCreator,
    ShortcutStyle,
};

#[cfg(test)]
mod tests;
