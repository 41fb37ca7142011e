use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{FlarmError, FlarmResult};

pub const DEFAULT_SCHEME: &str = "flarmstore";
pub const PACKAGE_EXTENSION: &str = "iflapp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    RemoteLink,
    LocalArchive,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RemoteLink => "remote",
            Self::LocalArchive => "local",
        }
    }
}

/// `(publisher, app)` pair naming a package repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageCoordinate {
    publisher: String,
    app: String,
}

impl PackageCoordinate {
    pub fn new(publisher: &str, app: &str) -> FlarmResult<Self> {
        let label = format!("{publisher}.{app}");
        validate_token(&label, "publisher", publisher)?;
        validate_token(&label, "app", app)?;
        Ok(Self {
            publisher: publisher.to_string(),
            app: app.to_string(),
        })
    }

    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    pub fn app(&self) -> &str {
        &self.app
    }
}

impl fmt::Display for PackageCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.publisher, self.app)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageReference {
    Remote(PackageCoordinate),
    /// Identity of a local archive is only known once its descriptor is read.
    Local { path: PathBuf },
}

impl PackageReference {
    pub fn source_kind(&self) -> SourceKind {
        match self {
            Self::Remote(_) => SourceKind::RemoteLink,
            Self::Local { .. } => SourceKind::LocalArchive,
        }
    }

    pub fn coordinate(&self) -> Option<&PackageCoordinate> {
        match self {
            Self::Remote(coordinate) => Some(coordinate),
            Self::Local { .. } => None,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Self::Remote(_) => None,
            Self::Local { path } => Some(path),
        }
    }
}

impl fmt::Display for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(coordinate) => write!(f, "{DEFAULT_SCHEME}://{coordinate}"),
            Self::Local { path } => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceParser {
    scheme: String,
    extension: String,
}

impl Default for ReferenceParser {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEME, PACKAGE_EXTENSION)
    }
}

impl ReferenceParser {
    pub fn new(scheme: &str, extension: &str) -> Self {
        Self {
            scheme: scheme.trim().to_ascii_lowercase(),
            extension: extension.trim().trim_start_matches('.').to_ascii_lowercase(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn is_package_path(&self, input: &str) -> bool {
        input
            .trim()
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", self.extension))
    }

    pub fn parse(&self, input: &str) -> FlarmResult<PackageReference> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(FlarmError::invalid_reference(input, "reference is empty"));
        }

        let Some(remainder) = self.strip_scheme(trimmed) else {
            if self.is_package_path(trimmed) {
                return Ok(PackageReference::Local {
                    path: PathBuf::from(trimmed),
                });
            }
            return Err(FlarmError::invalid_reference(
                input,
                format!(
                    "expected {}://publisher.app or a .{} package file",
                    self.scheme, self.extension
                ),
            ));
        };

        if self.strip_scheme(remainder).is_some() || remainder.contains("://") {
            return Err(FlarmError::invalid_reference(
                input,
                "scheme prefix appears more than once",
            ));
        }

        let remainder = remainder.strip_suffix('/').unwrap_or(remainder);
        let Some((publisher, app)) = remainder.split_once('.') else {
            return Err(FlarmError::invalid_reference(
                input,
                "missing '.' between publisher and app",
            ));
        };

        let label = input.trim();
        validate_token(label, "publisher", publisher)?;
        validate_token(label, "app", app)?;
        Ok(PackageReference::Remote(PackageCoordinate {
            publisher: publisher.to_string(),
            app: app.to_string(),
        }))
    }

    fn strip_scheme<'a>(&self, value: &'a str) -> Option<&'a str> {
        let (scheme, rest) = value.split_once(':')?;
        if !scheme.eq_ignore_ascii_case(&self.scheme) {
            return None;
        }
        Some(rest.strip_prefix("//").unwrap_or(rest))
    }
}

pub fn parse_reference(input: &str) -> FlarmResult<PackageReference> {
    ReferenceParser::default().parse(input)
}

/// Repository owner and name tokens share the same character set.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && !token.starts_with('.')
        && !token.ends_with('.')
        && token
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'))
}

fn validate_token(reference: &str, field: &str, token: &str) -> FlarmResult<()> {
    if token.is_empty() {
        return Err(FlarmError::invalid_reference(
            reference,
            format!("{field} must not be empty"),
        ));
    }
    if !is_valid_token(token) {
        return Err(FlarmError::invalid_reference(
            reference,
            format!("{field} '{token}' contains invalid character(s)"),
        ));
    }
    Ok(())
}
