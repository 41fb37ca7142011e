use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use flarm_core::{FlarmError, FlarmResult};
use tracing::{debug, info, warn};

use crate::fs_utils::{remove_file_if_exists, unique_suffix};
use crate::layout::InstallLayout;
use crate::locator::InstallIdentity;

/// Exclusive claim on one canonical identity, held while an install or uninstall of
/// that identity is running. Released on drop.
#[derive(Debug)]
pub struct IdentityLock {
    path: PathBuf,
}

impl IdentityLock {
    pub fn acquire(layout: &InstallLayout, identity: &InstallIdentity) -> FlarmResult<Self> {
        let canonical = identity.canonical_folder_name();
        let path = layout.lock_path(&canonical);
        claim_lock_file(&path).map_err(|err| match err {
            LockError::Held => FlarmError::InstallInProgress {
                identity: canonical.clone(),
            },
            LockError::Io(err) => FlarmError::filesystem(&err),
        })?;
        debug!(identity = %canonical, lock = %path.display(), "claimed identity lock");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IdentityLock {
    fn drop(&mut self) {
        if let Err(err) = remove_file_if_exists(&self.path) {
            warn!(lock = %self.path.display(), error = %err, "failed to release identity lock");
        }
    }
}

enum LockError {
    Held,
    Io(anyhow::Error),
}

/// A lock whose file is still empty after this long lost its writer.
const EMPTY_LOCK_GRACE: Duration = Duration::from_secs(10);

fn claim_lock_file(path: &Path) -> std::result::Result<(), LockError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))
            .map_err(LockError::Io)?;
    }

    match create_lock_file(path) {
        Err(LockError::Held) if reclaim_stale_lock(path) => create_lock_file(path),
        result => result,
    }
}

fn create_lock_file(path: &Path) -> std::result::Result<(), LockError> {
    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Err(LockError::Held),
        Err(err) => {
            return Err(LockError::Io(anyhow::Error::new(err).context(format!(
                "failed to claim identity lock: {}",
                path.display()
            ))))
        }
    };

    file.write_all(format!("{}\n", std::process::id()).as_bytes())
        .and_then(|()| file.flush())
        .with_context(|| format!("failed to write identity lock: {}", path.display()))
        .map_err(LockError::Io)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockOwner {
    Pid(u32),
    /// Created but not yet written.
    Pending,
    Unreadable,
}

fn read_lock_owner(path: &Path) -> LockOwner {
    let Ok(raw) = fs::read_to_string(path) else {
        return LockOwner::Unreadable;
    };
    let raw = raw.trim();
    if raw.is_empty() {
        let fresh = fs::metadata(path)
            .and_then(|metadata| metadata.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age < EMPTY_LOCK_GRACE);
        return if fresh {
            LockOwner::Pending
        } else {
            LockOwner::Unreadable
        };
    }
    raw.parse::<u32>()
        .map(LockOwner::Pid)
        .unwrap_or(LockOwner::Unreadable)
}

/// Moves a lock left behind by a dead process out of the way. The lock is renamed aside
/// first and only discarded if it still names the dead owner, so a lock claimed by a
/// racing process in between is put back.
fn reclaim_stale_lock(path: &Path) -> bool {
    if !path.exists() {
        return true;
    }
    let owner = read_lock_owner(path);
    match owner {
        LockOwner::Pending => return false,
        LockOwner::Pid(pid) if process_is_alive(pid) => return false,
        _ => {}
    }

    let Ok(suffix) = unique_suffix() else {
        return false;
    };
    let aside = path.with_extension(format!("stale-{suffix}"));
    if fs::rename(path, &aside).is_err() {
        return false;
    }
    if read_lock_owner(&aside) != owner {
        let _ = fs::rename(&aside, path);
        return false;
    }
    let _ = fs::remove_file(&aside);
    info!(lock = %path.display(), owner = ?owner, "reclaimed stale identity lock");
    true
}

#[cfg(unix)]
pub(crate) fn process_is_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let proc_root = Path::new("/proc");
    if proc_root.join("self").exists() {
        return proc_root.join(pid.to_string()).exists();
    }
    let mut command = Command::new("kill");
    command.arg("-0").arg(pid.to_string());
    match command.output() {
        Ok(output) => output.status.success(),
        Err(err) => {
            debug!(pid, error = %err, "cannot check process; assuming it is alive");
            true
        }
    }
}

#[cfg(windows)]
pub(crate) fn process_is_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let mut command = Command::new("tasklist");
    command
        .arg("/FI")
        .arg(format!("PID eq {pid}"))
        .arg("/FO")
        .arg("CSV")
        .arg("/NH");
    match flarm_core::command_output(&mut command, "failed to list processes") {
        Ok(stdout) => String::from_utf8_lossy(&stdout).contains(&format!("\"{pid}\"")),
        Err(err) => {
            debug!(pid, error = %err, "cannot check process; assuming it is alive");
            true
        }
    }
}

/// Deletes staging dirs nobody is working in: any left for `canonical` (its lock is
/// held by the caller) and any whose owning process has exited.
fn sweep_orphaned_staging(layout: &InstallLayout, canonical: &str) {
    let Ok(entries) = fs::read_dir(layout.staging_dir()) else {
        return;
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((owner, stem)) = staging_owner(&name) else {
            continue;
        };
        let orphaned = stem == canonical
            || stem.strip_suffix("-removing") == Some(canonical)
            || !process_is_alive(owner);
        if !orphaned {
            continue;
        }
        match fs::remove_dir_all(entry.path()) {
            Ok(()) => info!(staging = %entry.path().display(), "removed orphaned staging dir"),
            Err(err) => warn!(
                staging = %entry.path().display(),
                error = %err,
                "failed to remove orphaned staging dir"
            ),
        }
    }
}

/// Splits `<stem>-<pid>-<nanos>-<counter>` into the pid and the stem.
fn staging_owner(name: &str) -> Option<(u32, &str)> {
    let mut parts = name.rsplitn(4, '-');
    let counter = parts.next()?;
    let nanos = parts.next()?;
    let pid = parts.next()?;
    let stem = parts.next()?;
    if !counter.bytes().all(|b| b.is_ascii_digit()) || !nanos.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    Some((pid.parse().ok()?, stem))
}

/// An identity lock plus a private staging area. The canonical folder only appears when
/// [`Reservation::commit`] renames the populated staging content into place; dropping an
/// uncommitted reservation deletes the staging area.
#[derive(Debug)]
pub struct Reservation {
    lock: IdentityLock,
    identity: InstallIdentity,
    staging_root: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl Reservation {
    pub fn reserve(layout: &InstallLayout, identity: &InstallIdentity) -> FlarmResult<Self> {
        layout
            .ensure_base_dirs()
            .map_err(|err| FlarmError::filesystem(&err))?;
        let lock = IdentityLock::acquire(layout, identity)?;

        let canonical = identity.canonical_folder_name();
        sweep_orphaned_staging(layout, &canonical);
        let target = layout.package_dir(&canonical);
        if target.exists() {
            return Err(FlarmError::InstallCollision {
                path: target,
                reason: "the install folder appeared before the reservation was taken".to_string(),
            });
        }

        let staging_root =
            make_staging_dir(layout, &canonical).map_err(|err| FlarmError::filesystem(&err))?;
        debug!(
            identity = %canonical,
            staging = %staging_root.display(),
            "reserved install identity"
        );
        Ok(Self {
            lock,
            identity: identity.clone(),
            staging_root,
            target,
            committed: false,
        })
    }

    pub fn identity(&self) -> &InstallIdentity {
        &self.identity
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Where downloaded package files are written.
    pub fn download_path(&self, file_name: &str) -> PathBuf {
        let file_name = Path::new(file_name)
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "package.iflapp".into());
        self.staging_root.join("download").join(file_name)
    }

    /// Directory that becomes the canonical folder on commit.
    pub fn content_dir(&self) -> PathBuf {
        self.staging_root.join("content")
    }

    pub fn commit(mut self) -> FlarmResult<PathBuf> {
        let content = self.content_dir();
        if self.target.exists() {
            return Err(FlarmError::InstallCollision {
                path: self.target.clone(),
                reason: "install folder already exists".to_string(),
            });
        }

        fs::rename(&content, &self.target).map_err(|err| {
            FlarmError::io(
                format!(
                    "failed to move {} into place at {}",
                    content.display(),
                    self.target.display()
                ),
                err,
            )
        })?;
        self.committed = true;
        self.cleanup_staging();
        Ok(self.target.clone())
    }

    fn cleanup_staging(&self) {
        if let Err(err) = fs::remove_dir_all(&self.staging_root) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(
                    staging = %self.staging_root.display(),
                    error = %err,
                    "failed to clean staging dir"
                );
            }
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            debug!(
                staging = %self.staging_root.display(),
                "discarding uncommitted staging dir"
            );
            self.cleanup_staging();
        }
    }
}

fn make_staging_dir(layout: &InstallLayout, canonical: &str) -> Result<PathBuf> {
    let dir = layout
        .staging_dir()
        .join(format!("{canonical}-{}", unique_suffix()?));
    for sub in [dir.join("download"), dir.join("content")] {
        fs::create_dir_all(&sub)
            .with_context(|| format!("failed creating staging dir: {}", sub.display()))?;
    }
    Ok(dir)
}

/// Moves an installed folder out of the root in one rename, then deletes it. The folder
/// stops counting as installed as soon as the rename succeeds.
pub fn retire_package_dir(
    layout: &InstallLayout,
    package_dir: &Path,
) -> FlarmResult<Option<String>> {
    layout
        .ensure_base_dirs()
        .map_err(|err| FlarmError::filesystem(&err))?;
    let name = package_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = unique_suffix().map_err(|err| FlarmError::filesystem(&err))?;
    let retired = layout.staging_dir().join(format!("{name}-removing-{suffix}"));

    fs::rename(package_dir, &retired).map_err(|err| {
        FlarmError::io(
            format!("failed to remove install folder {}", package_dir.display()),
            err,
        )
    })?;

    match fs::remove_dir_all(&retired) {
        Ok(()) => Ok(None),
        Err(err) => Ok(Some(format!(
            "install folder was removed but leftovers remain at {}: {err}",
            retired.display()
        ))),
    }
}
