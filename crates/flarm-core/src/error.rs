use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type FlarmResult<T> = Result<T, FlarmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidReferenceFormat,
    MetadataUnavailable,
    Incompatible,
    Network,
    NetworkTimeout,
    Archive,
    InstallCollision,
    InstallInProgress,
    NotInstalled,
    Cancelled,
    ElevationDenied,
    RepairFailed,
    RegistrationFailed,
    Filesystem,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidReferenceFormat => "invalid-reference-format",
            Self::MetadataUnavailable => "metadata-unavailable",
            Self::Incompatible => "incompatible",
            Self::Network => "network-error",
            Self::NetworkTimeout => "network-timeout",
            Self::Archive => "archive-error",
            Self::InstallCollision => "install-collision",
            Self::InstallInProgress => "install-in-progress",
            Self::NotInstalled => "not-installed",
            Self::Cancelled => "cancelled",
            Self::ElevationDenied => "elevation-denied",
            Self::RepairFailed => "repair-failed",
            Self::RegistrationFailed => "registration-failed",
            Self::Filesystem => "filesystem-error",
        }
    }
}

#[derive(Debug, Error)]
pub enum FlarmError {
    #[error("invalid package reference '{reference}': {reason}")]
    InvalidReferenceFormat { reference: String, reason: String },

    #[error("package metadata unavailable: {reason}")]
    MetadataUnavailable {
        reason: String,
        releases_page: Option<String>,
    },

    #[error("{reason}")]
    Incompatible { reason: String },

    #[error("network request to {url} failed: {reason}")]
    Network { url: String, reason: String },

    #[error("network request to {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("network request to {url} timed out")]
    NetworkTimeout { url: String },

    #[error("archive {} could not be read: {reason}", path.display())]
    Archive { path: PathBuf, reason: String },

    #[error("install collision at {}: {reason}", path.display())]
    InstallCollision { path: PathBuf, reason: String },

    #[error("another operation is already working on '{identity}'")]
    InstallInProgress { identity: String },

    #[error("package '{identity}' is not installed under {}", root.display())]
    NotInstalled { identity: String, root: PathBuf },

    #[error("operation cancelled")]
    Cancelled,

    #[error("elevation denied: {reason}")]
    ElevationDenied { reason: String },

    #[error("integrity repair failed: {reason}")]
    RepairFailed { reason: String },

    #[error("registration failed: {reason}")]
    RegistrationFailed { reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{reason}")]
    Filesystem { reason: String },
}

impl FlarmError {
    pub fn invalid_reference(reference: &str, reason: impl Into<String>) -> Self {
        Self::InvalidReferenceFormat {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }

    pub fn metadata_unavailable(reason: impl Into<String>) -> Self {
        Self::MetadataUnavailable {
            reason: reason.into(),
            releases_page: None,
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Flattens an `anyhow` chain from the filesystem helpers into a typed error.
    pub fn filesystem(err: &anyhow::Error) -> Self {
        Self::Filesystem {
            reason: format!("{err:#}"),
        }
    }

    pub fn with_releases_page(self, page: impl Into<String>) -> Self {
        match self {
            Self::MetadataUnavailable { reason, .. } => Self::MetadataUnavailable {
                reason,
                releases_page: Some(page.into()),
            },
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidReferenceFormat { .. } => ErrorKind::InvalidReferenceFormat,
            Self::MetadataUnavailable { .. } => ErrorKind::MetadataUnavailable,
            Self::Incompatible { .. } => ErrorKind::Incompatible,
            Self::Network { .. } | Self::HttpStatus { .. } => ErrorKind::Network,
            Self::NetworkTimeout { .. } => ErrorKind::NetworkTimeout,
            Self::Archive { .. } => ErrorKind::Archive,
            Self::InstallCollision { .. } => ErrorKind::InstallCollision,
            Self::InstallInProgress { .. } => ErrorKind::InstallInProgress,
            Self::NotInstalled { .. } => ErrorKind::NotInstalled,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ElevationDenied { .. } => ErrorKind::ElevationDenied,
            Self::RepairFailed { .. } => ErrorKind::RepairFailed,
            Self::RegistrationFailed { .. } => ErrorKind::RegistrationFailed,
            Self::Io { .. } | Self::Filesystem { .. } => ErrorKind::Filesystem,
        }
    }

    /// The core never retries; this only tells the caller whether offering a retry makes sense.
    pub fn is_retryable(&self) -> bool {
        if let Self::HttpStatus { status, .. } = self {
            return !(400..500).contains(status) || matches!(status, 408 | 429);
        }
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::NetworkTimeout | ErrorKind::InstallInProgress
        )
    }

    /// The server answered that the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 404 | 410, .. })
    }

    pub fn recovery_hint(&self) -> Option<String> {
        match self {
            Self::InvalidReferenceFormat { .. } => {
                Some("links must look like flarmstore://publisher.app".to_string())
            }
            Self::MetadataUnavailable {
                releases_page: Some(page),
                ..
            } => Some(format!("open the releases page in a browser: {page}")),
            Self::MetadataUnavailable { .. } => {
                Some("check that the package repository publishes a details.xml".to_string())
            }
            Self::Network { .. } | Self::HttpStatus { .. } | Self::NetworkTimeout { .. } => {
                Some("check the network connection and try again".to_string())
            }
            Self::InstallInProgress { .. } => {
                Some("wait for the other operation to finish and try again".to_string())
            }
            Self::NotInstalled { .. } => {
                Some("refresh the package view; the installation folder is gone".to_string())
            }
            Self::ElevationDenied { .. } => Some(
                "accept the elevation prompt or run `flarm integrity repair` as administrator"
                    .to_string(),
            ),
            Self::RepairFailed { .. } => Some(
                "re-run `flarm integrity repair`; registrations were left as they were".to_string(),
            ),
            _ => None,
        }
    }
}
