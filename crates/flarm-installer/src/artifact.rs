use std::fmt::Display;
use std::fs::{self, File};
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::path::Path;
use std::process::Command;

use flarm_core::{
    command_output, run_command, ArchiveBackend, ArchiveType, ExtractProgress, FlarmError,
    FlarmResult,
};
use tracing::debug;
use zip::ZipArchive;

/// Reads `.iflapp` packages from disk. Zip is the native container; tar and tar.gz are
/// accepted as a fallback and unpacked with the host `tar`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackageArchives;

impl ArchiveBackend for PackageArchives {
    fn read_file(&self, archive: &Path, inner_path: &str) -> FlarmResult<Vec<u8>> {
        match detect_archive_type(archive)? {
            ArchiveType::Zip => read_zip_file(archive, inner_path),
            ArchiveType::TarGz | ArchiveType::Tar => read_tar_file(archive, inner_path),
        }
    }

    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        on_progress: &mut dyn FnMut(ExtractProgress) -> ControlFlow<()>,
    ) -> FlarmResult<u64> {
        fs::create_dir_all(dest)
            .map_err(|err| FlarmError::io(format!("failed to create {}", dest.display()), err))?;
        let archive_type = detect_archive_type(archive)?;
        debug!(
            archive = %archive.display(),
            kind = archive_type.as_str(),
            dest = %dest.display(),
            "extracting package"
        );
        match archive_type {
            ArchiveType::Zip => extract_zip(archive, dest, on_progress),
            ArchiveType::TarGz | ArchiveType::Tar => extract_tar(archive, dest, on_progress),
        }
    }
}

pub fn detect_archive_type(archive: &Path) -> FlarmResult<ArchiveType> {
    let mut header = Vec::with_capacity(512);
    File::open(archive)
        .and_then(|file| file.take(512).read_to_end(&mut header))
        .map_err(|err| FlarmError::io(format!("failed to open {}", archive.display()), err))?;
    ArchiveType::detect(&header)
        .ok_or_else(|| archive_error(archive, "not a zip or tar package"))
}

fn read_zip_file(archive: &Path, inner_path: &str) -> FlarmResult<Vec<u8>> {
    let file = File::open(archive)
        .map_err(|err| FlarmError::io(format!("failed to open {}", archive.display()), err))?;
    let mut zip = ZipArchive::new(file).map_err(|err| archive_error(archive, err))?;

    let wanted = inner_path.trim_start_matches("./");
    let name = zip
        .file_names()
        .find(|name| name.trim_start_matches("./").eq_ignore_ascii_case(wanted))
        .map(str::to_string)
        .ok_or_else(|| archive_error(archive, format!("{inner_path} is not in the package")))?;

    let mut entry = zip
        .by_name(&name)
        .map_err(|err| archive_error(archive, err))?;
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .map_err(|err| archive_error(archive, err))?;
    Ok(bytes)
}

fn read_tar_file(archive: &Path, inner_path: &str) -> FlarmResult<Vec<u8>> {
    let wanted = inner_path.trim_start_matches("./");
    let mut last_error = None;
    for candidate in [wanted.to_string(), format!("./{wanted}")] {
        let mut command = Command::new("tar");
        command.arg("-xOf").arg(archive).arg(&candidate);
        match command_output(&mut command, "failed to read file from tar package") {
            Ok(bytes) => return Ok(bytes),
            Err(err) => last_error = Some(err),
        }
    }
    let reason = last_error
        .map(|err| format!("{err:#}"))
        .unwrap_or_else(|| format!("{inner_path} is not in the package"));
    Err(archive_error(archive, reason))
}

fn extract_zip(
    archive: &Path,
    dest: &Path,
    on_progress: &mut dyn FnMut(ExtractProgress) -> ControlFlow<()>,
) -> FlarmResult<u64> {
    let file = File::open(archive)
        .map_err(|err| FlarmError::io(format!("failed to open {}", archive.display()), err))?;
    let mut zip = ZipArchive::new(file).map_err(|err| archive_error(archive, err))?;
    let total = zip.len() as u64;

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|err| archive_error(archive, err))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(archive_error(
                archive,
                format!("entry '{}' escapes the extraction directory", entry.name()),
            ));
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|err| {
                FlarmError::io(format!("failed to create {}", out_path.display()), err)
            })?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|err| {
                    FlarmError::io(format!("failed to create {}", parent.display()), err)
                })?;
            }
            let mut writer = File::create(&out_path).map_err(|err| {
                FlarmError::io(format!("failed to create {}", out_path.display()), err)
            })?;
            io::copy(&mut entry, &mut writer).map_err(|err| archive_error(archive, err))?;

            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))
                    .map_err(|err| {
                        FlarmError::io(
                            format!("failed to set permissions on {}", out_path.display()),
                            err,
                        )
                    })?;
            }
        }

        let progress = ExtractProgress {
            entries_done: index as u64 + 1,
            entries_total: Some(total),
        };
        if on_progress(progress).is_break() {
            return Err(FlarmError::Cancelled);
        }
    }

    Ok(total)
}

fn extract_tar(
    archive: &Path,
    dest: &Path,
    on_progress: &mut dyn FnMut(ExtractProgress) -> ControlFlow<()>,
) -> FlarmResult<u64> {
    let started = ExtractProgress {
        entries_done: 0,
        entries_total: None,
    };
    if on_progress(started).is_break() {
        return Err(FlarmError::Cancelled);
    }

    run_command(
        Command::new("tar")
            .arg("-xf")
            .arg(archive)
            .arg("-C")
            .arg(dest),
        "failed to extract tar package",
    )
    .map_err(|err| archive_error(archive, format!("{err:#}")))?;

    let entries = count_entries(dest)
        .map_err(|err| FlarmError::io(format!("failed to read {}", dest.display()), err))?;
    let finished = ExtractProgress {
        entries_done: entries,
        entries_total: Some(entries),
    };
    if on_progress(finished).is_break() {
        return Err(FlarmError::Cancelled);
    }
    Ok(entries)
}

fn count_entries(dir: &Path) -> io::Result<u64> {
    let mut count = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        count += 1;
        if entry.file_type()?.is_dir() {
            count += count_entries(&entry.path())?;
        }
    }
    Ok(count)
}

fn archive_error(archive: &Path, reason: impl Display) -> FlarmError {
    FlarmError::Archive {
        path: archive.to_path_buf(),
        reason: reason.to_string(),
    }
}
