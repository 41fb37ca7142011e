use crate::endpoints::Endpoints;
use crate::error::{FlarmError, FlarmResult};
use crate::metadata::PackageMetadata;
use crate::reference::{is_valid_token, PackageReference};
use crate::transport::LinkShortener;

/// Canonical repository URL for sharing a package.
///
/// Remote packages are shared by their link coordinate. Local archives have no link, so
/// the descriptor's `author` names the repository owner, with `publisher` as the fallback
/// when no author is declared.
pub fn share_url(
    reference: &PackageReference,
    metadata: Option<&PackageMetadata>,
    endpoints: &Endpoints,
) -> FlarmResult<String> {
    match reference {
        PackageReference::Remote(coordinate) => {
            Ok(endpoints.repository_url(coordinate.publisher(), coordinate.app()))
        }
        PackageReference::Local { path } => {
            let metadata = metadata.ok_or_else(|| {
                FlarmError::metadata_unavailable(format!(
                    "{} has not been resolved yet",
                    path.display()
                ))
            })?;

            let owner = metadata
                .author
                .as_deref()
                .map(str::trim)
                .filter(|author| !author.is_empty())
                .or_else(|| Some(metadata.publisher.trim()).filter(|p| !p.is_empty()))
                .ok_or_else(|| {
                    FlarmError::metadata_unavailable(
                        "local package declares neither <author> nor <publisher>",
                    )
                })?;
            let app = metadata.app.trim();

            for (field, value) in [("author", owner), ("app", app)] {
                if !is_valid_token(value) {
                    return Err(FlarmError::metadata_unavailable(format!(
                        "{field} '{value}' cannot form a repository address"
                    )));
                }
            }
            Ok(endpoints.repository_url(owner, app))
        }
    }
}

pub fn shortened_share_url(
    reference: &PackageReference,
    metadata: Option<&PackageMetadata>,
    endpoints: &Endpoints,
    shortener: &dyn LinkShortener,
) -> FlarmResult<String> {
    let long = share_url(reference, metadata, endpoints)?;
    Ok(shortener.shorten(&long))
}
