use std::path::Path;

use tracing::{debug, info};

use crate::archive::ArchiveBackend;
use crate::asset::parse_package_file_name;
use crate::descriptor::{parse_descriptor, DescriptorFields, DESCRIPTOR_FILE_NAME};
use crate::endpoints::Endpoints;
use crate::error::{FlarmError, FlarmResult};
use crate::platform::PlatformRequirement;
use crate::reference::{PackageCoordinate, PackageReference};
use crate::transport::Transport;

pub const DEFAULT_REMOTE_VERSION: &str = "v1";
pub const DEFAULT_LOCAL_VERSION: &str = "local";

/// A package's self-description, produced once per resolution and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageMetadata {
    pub name: String,
    pub publisher: String,
    pub app: String,
    pub version: String,
    /// Declared target platform; empty means universal.
    pub platform: String,
    pub author: Option<String>,
}

impl PackageMetadata {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.app
        } else {
            &self.name
        }
    }

    pub fn platform_requirement(&self) -> PlatformRequirement {
        PlatformRequirement::parse(&self.platform)
    }

    pub fn coordinate(&self) -> FlarmResult<PackageCoordinate> {
        PackageCoordinate::new(&self.publisher, &self.app)
    }

    fn from_fields(fields: DescriptorFields) -> Self {
        Self {
            name: fields.name,
            publisher: fields.publisher,
            app: fields.app,
            version: fields.version,
            platform: fields.platform,
            author: fields.author,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedMetadata {
    pub metadata: PackageMetadata,
    /// Non-fatal findings from a best-effort descriptor parse.
    pub warnings: Vec<String>,
    /// Raw descriptor, persisted next to the installed files.
    pub descriptor: Vec<u8>,
}

pub struct MetadataExtractor<'a> {
    transport: &'a dyn Transport,
    archives: &'a dyn ArchiveBackend,
    endpoints: &'a Endpoints,
}

impl<'a> MetadataExtractor<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        archives: &'a dyn ArchiveBackend,
        endpoints: &'a Endpoints,
    ) -> Self {
        Self {
            transport,
            archives,
            endpoints,
        }
    }

    pub fn extract(&self, reference: &PackageReference) -> FlarmResult<ExtractedMetadata> {
        match reference {
            PackageReference::Remote(coordinate) => self.extract_remote(coordinate),
            PackageReference::Local { path } => self.extract_local(path),
        }
    }

    fn extract_remote(&self, coordinate: &PackageCoordinate) -> FlarmResult<ExtractedMetadata> {
        let url = self.endpoints.descriptor_url(coordinate);
        let releases_page = self.endpoints.releases_page_url(coordinate);
        debug!(%url, "fetching remote descriptor");

        let bytes = match self.transport.fetch_bytes(&url) {
            Ok(bytes) => bytes,
            Err(err) if err.is_not_found() => {
                return Err(FlarmError::metadata_unavailable(format!(
                    "could not fetch the descriptor for {coordinate}: {err}"
                ))
                .with_releases_page(releases_page))
            }
            Err(err) => return Err(err),
        };

        let text = String::from_utf8_lossy(&bytes);
        let (fields, warnings) = parse_descriptor(&text)
            .map_err(|err| err.with_releases_page(releases_page.clone()))?
            .into_parts();

        let mut metadata = PackageMetadata::from_fields(fields);
        if metadata.version.is_empty() {
            metadata.version = DEFAULT_REMOTE_VERSION.to_string();
        }
        info!(
            package = %coordinate,
            version = %metadata.version,
            platform = %metadata.platform,
            "resolved remote package metadata"
        );
        Ok(ExtractedMetadata {
            metadata,
            warnings,
            descriptor: bytes,
        })
    }

    fn extract_local(&self, path: &Path) -> FlarmResult<ExtractedMetadata> {
        debug!(path = %path.display(), "reading descriptor from local archive");
        let bytes = self
            .archives
            .read_file(path, DESCRIPTOR_FILE_NAME)
            .map_err(|err| {
                FlarmError::metadata_unavailable(format!(
                    "could not read {DESCRIPTOR_FILE_NAME} from {}: {err}",
                    path.display()
                ))
            })?;

        let text = String::from_utf8_lossy(&bytes);
        let (fields, warnings) = parse_descriptor(&text)?.into_parts();
        let mut metadata = PackageMetadata::from_fields(fields);

        let hints = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(parse_package_file_name);
        if metadata.version.is_empty() {
            metadata.version = hints
                .as_ref()
                .map(|hint| hint.version.clone())
                .unwrap_or_else(|| DEFAULT_LOCAL_VERSION.to_string());
        }
        if metadata.platform.is_empty() {
            if let Some(hint) = hints.as_ref() {
                metadata.platform = hint.platform.clone();
            }
        }

        info!(
            path = %path.display(),
            package = %format!("{}.{}", metadata.publisher, metadata.app),
            version = %metadata.version,
            "resolved local package metadata"
        );
        Ok(ExtractedMetadata {
            metadata,
            warnings,
            descriptor: bytes,
        })
    }
}
