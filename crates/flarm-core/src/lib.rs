mod archive;
mod asset;
mod descriptor;
mod endpoints;
mod error;
mod metadata;
mod platform;
mod process;
mod reference;
mod share;
mod transport;

pub use archive::{ArchiveBackend, ArchiveType, ExtractProgress};
pub use asset::{
    parse_package_file_name, select_asset, PackageFileName, PackageSource, ReleaseAsset,
    SelectedAsset,
};
pub use descriptor::{
    parse_descriptor, DescriptorField, DescriptorFields, DescriptorParse, DESCRIPTOR_FILE_NAME,
};
pub use endpoints::{
    Endpoints, DEFAULT_API_HOST, DEFAULT_DESCRIPTOR_BRANCH, DEFAULT_RAW_HOST, DEFAULT_REPO_HOST,
};
pub use error::{ErrorKind, FlarmError, FlarmResult};
pub use metadata::{
    ExtractedMetadata, MetadataExtractor, PackageMetadata, DEFAULT_LOCAL_VERSION,
    DEFAULT_REMOTE_VERSION,
};
pub use platform::{check_compatibility, Compatibility, Platform, PlatformRequirement};
pub use process::{command_output, run_command};
pub use reference::{
    is_valid_token, parse_reference, PackageCoordinate, PackageReference, ReferenceParser,
    SourceKind, DEFAULT_SCHEME, PACKAGE_EXTENSION,
};
pub use share::{share_url, shortened_share_url};
pub use transport::{LinkShortener, Transport, TransferProgress};

#[cfg(test)]
mod tests;
