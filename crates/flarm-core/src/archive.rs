use std::ops::ControlFlow;
use std::path::Path;

use crate::error::FlarmResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
            Self::Tar => "tar",
        }
    }

    /// Package files keep the `.iflapp` extension whatever their container, so the
    /// leading bytes decide.
    pub fn detect(header: &[u8]) -> Option<Self> {
        if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
            return Some(Self::Zip);
        }
        if header.starts_with(&[0x1f, 0x8b]) {
            return Some(Self::TarGz);
        }
        if header.len() >= 262 && &header[257..262] == b"ustar" {
            return Some(Self::Tar);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractProgress {
    pub entries_done: u64,
    pub entries_total: Option<u64>,
}

/// Reads and unpacks offline package archives.
pub trait ArchiveBackend: Send + Sync {
    fn read_file(&self, archive: &Path, inner_path: &str) -> FlarmResult<Vec<u8>>;

    /// Unpacks `archive` into `dest`. Returning `Break` from `on_progress` stops the
    /// extraction with `FlarmError::Cancelled`.
    fn extract(
        &self,
        archive: &Path,
        dest: &Path,
        on_progress: &mut dyn FnMut(ExtractProgress) -> ControlFlow<()>,
    ) -> FlarmResult<u64>;
}
