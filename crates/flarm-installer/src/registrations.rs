use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::fs_utils::remove_file_if_exists;
use crate::layout::InstallLayout;

const REGISTRATION_SIDECAR_VERSION: u32 = 1;

pub const KIND_DESKTOP_SHORTCUT: &str = "desktop-shortcut";

/// Something outside the install folder that an install created and uninstall must undo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub key: String,
    pub kind: String,
    pub path: String,
}

pub fn write_registrations(
    layout: &InstallLayout,
    canonical_name: &str,
    records: &[RegistrationRecord],
) -> Result<PathBuf> {
    let path = layout.registration_path(canonical_name);
    if records.is_empty() {
        let _ = remove_file_if_exists(&path);
        return Ok(path);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut payload = String::new();
    payload.push_str(&format!("version={REGISTRATION_SIDECAR_VERSION}\n"));
    for record in records {
        if [&record.key, &record.kind, &record.path]
            .iter()
            .any(|value| value.contains('\n') || value.contains('\t'))
        {
            return Err(anyhow!(
                "registration record values must not contain tabs or newlines"
            ));
        }
        payload.push_str(&format!(
            "registration={}\t{}\t{}\n",
            record.key, record.kind, record.path
        ));
    }

    fs::write(&path, payload.as_bytes())
        .with_context(|| format!("failed to write registration sidecar: {}", path.display()))?;
    Ok(path)
}

pub fn read_registrations(
    layout: &InstallLayout,
    canonical_name: &str,
) -> Result<Vec<RegistrationRecord>> {
    let path = layout.registration_path(canonical_name);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read registration sidecar: {}", path.display()))?;
    parse_registrations(&raw)
        .with_context(|| format!("failed to parse registration sidecar: {}", path.display()))
}

/// Undoes every recorded registration, then drops the sidecar. Returns one warning per
/// record that could not be undone; those records stay in the sidecar.
pub fn remove_registrations(layout: &InstallLayout, canonical_name: &str) -> Result<Vec<String>> {
    let records = read_registrations(layout, canonical_name)?;
    let mut warnings = Vec::new();
    let mut remaining = Vec::new();

    for record in records {
        if let Err(err) = undo_registration(&record) {
            warnings.push(format!(
                "could not remove {} '{}': {err:#}",
                record.kind, record.path
            ));
            remaining.push(record);
        }
    }

    write_registrations(layout, canonical_name, &remaining)?;
    Ok(warnings)
}

pub(crate) fn parse_registrations(raw: &str) -> Result<Vec<RegistrationRecord>> {
    let mut version = None;
    let mut records = Vec::new();

    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((key, value)) = line.split_once('=') else {
            return Err(anyhow!("invalid registration sidecar row format: {line}"));
        };

        match key {
            "version" => {
                let parsed = value
                    .parse::<u32>()
                    .context("registration sidecar version must be u32")?;
                version = Some(parsed);
            }
            "registration" => records.push(parse_record(value)?),
            _ => {}
        }
    }

    if let Some(found_version) = version {
        if found_version != REGISTRATION_SIDECAR_VERSION {
            return Err(anyhow!(
                "unsupported registration sidecar version: {found_version}"
            ));
        }
    }

    Ok(records)
}

fn parse_record(value: &str) -> Result<RegistrationRecord> {
    let parts = value.split('\t').collect::<Vec<_>>();
    if parts.len() != 3 {
        return Err(anyhow!("invalid registration row format"));
    }
    for (field, part) in ["key", "kind", "path"].iter().zip(&parts) {
        if part.trim().is_empty() {
            return Err(anyhow!("registration {field} must not be empty"));
        }
    }
    Ok(RegistrationRecord {
        key: parts[0].to_string(),
        kind: parts[1].to_string(),
        path: parts[2].to_string(),
    })
}

fn undo_registration(record: &RegistrationRecord) -> Result<()> {
    match record.kind.as_str() {
        KIND_DESKTOP_SHORTCUT => {
            let path = Path::new(&record.path);
            remove_file_if_exists(path)
                .with_context(|| format!("failed to remove {}", path.display()))
        }
        other => Err(anyhow!("unsupported registration kind '{other}'")),
    }
}
