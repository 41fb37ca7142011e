use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};

static UNIQUE_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// `<pid>-<nanos>-<counter>`, unique across processes and within one.
pub fn unique_suffix() -> Result<String> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_nanos();
    let sequence = UNIQUE_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(format!("{}-{}-{}", std::process::id(), nanos, sequence))
}
