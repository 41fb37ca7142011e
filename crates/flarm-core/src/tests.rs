use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use super::*;

enum FakeResponse {
    Body(&'static str),
    Timeout,
    NotFound,
    Refused,
}

#[derive(Default)]
struct FakeTransport {
    responses: HashMap<String, FakeResponse>,
}

impl FakeTransport {
    fn with(mut self, url: &str, response: FakeResponse) -> Self {
        self.responses.insert(url.to_string(), response);
        self
    }
}

impl Transport for FakeTransport {
    fn fetch_bytes(&self, url: &str) -> FlarmResult<Vec<u8>> {
        match self.responses.get(url) {
            Some(FakeResponse::Body(body)) => Ok(body.as_bytes().to_vec()),
            Some(FakeResponse::Timeout) => Err(FlarmError::NetworkTimeout {
                url: url.to_string(),
            }),
            Some(FakeResponse::NotFound) | None => Err(FlarmError::HttpStatus {
                url: url.to_string(),
                status: 404,
            }),
            Some(FakeResponse::Refused) => Err(FlarmError::Network {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }

    fn fetch_with_progress(
        &self,
        url: &str,
        _dest: &Path,
        _on_progress: &mut dyn FnMut(TransferProgress) -> ControlFlow<()>,
    ) -> FlarmResult<u64> {
        Err(FlarmError::Network {
            url: url.to_string(),
            reason: "downloads are not faked here".to_string(),
        })
    }
}

#[derive(Default)]
struct FakeArchives {
    files: HashMap<(PathBuf, String), Vec<u8>>,
}

impl FakeArchives {
    fn with(mut self, archive: &str, inner: &str, content: &str) -> Self {
        self.files.insert(
            (PathBuf::from(archive), inner.to_string()),
            content.as_bytes().to_vec(),
        );
        self
    }
}

impl ArchiveBackend for FakeArchives {
    fn read_file(&self, archive: &Path, inner_path: &str) -> FlarmResult<Vec<u8>> {
        self.files
            .get(&(archive.to_path_buf(), inner_path.to_string()))
            .cloned()
            .ok_or_else(|| FlarmError::Archive {
                path: archive.to_path_buf(),
                reason: format!("{inner_path} not found"),
            })
    }

    fn extract(
        &self,
        _archive: &Path,
        _dest: &Path,
        _on_progress: &mut dyn FnMut(ExtractProgress) -> ControlFlow<()>,
    ) -> FlarmResult<u64> {
        Ok(0)
    }
}

struct PrefixShortener;

impl LinkShortener for PrefixShortener {
    fn shorten(&self, url: &str) -> String {
        format!("short:{url}")
    }
}

fn remote(reference: &str) -> PackageCoordinate {
    match parse_reference(reference).expect("reference must parse") {
        PackageReference::Remote(coordinate) => coordinate,
        other => panic!("expected remote reference, got {other:?}"),
    }
}

fn metadata(publisher: &str, app: &str, author: Option<&str>) -> PackageMetadata {
    PackageMetadata {
        name: app.to_string(),
        publisher: publisher.to_string(),
        app: app.to_string(),
        version: "v1".to_string(),
        platform: String::new(),
        author: author.map(ToString::to_string),
    }
}

#[test]
fn parse_scheme_link_yields_publisher_and_app() {
    let coordinate = remote("flarmstore://Alice.Game");
    assert_eq!(coordinate.publisher(), "Alice");
    assert_eq!(coordinate.app(), "Game");

    let custom = ReferenceParser::new("s", PACKAGE_EXTENSION);
    let parsed = custom.parse("s://pub.app").expect("custom scheme must parse");
    let coordinate = parsed.coordinate().expect("remote reference");
    assert_eq!(coordinate.publisher(), "pub");
    assert_eq!(coordinate.app(), "app");
    assert_eq!(parsed.source_kind(), SourceKind::RemoteLink);
}

#[test]
fn parse_accepts_bare_scheme_and_trailing_slash() {
    let coordinate = remote("flarmstore:Alice.Game/");
    assert_eq!(coordinate.publisher(), "Alice");
    assert_eq!(coordinate.app(), "Game");

    let coordinate = remote("FLARMSTORE://Alice.my.game");
    assert_eq!(coordinate.app(), "my.game");
}

#[test]
fn parse_rejects_duplicated_scheme_prefix() {
    for input in [
        "flarmstore://flarmstore://Alice.Game",
        "flarmstore:flarmstore:Alice.Game",
        "flarmstore://flarmstore:Alice.Game",
    ] {
        let err = parse_reference(input).expect_err("double prefix must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidReferenceFormat, "{input}");
    }
}

#[test]
fn parse_rejects_empty_tokens() {
    for input in [
        "",
        "flarmstore://",
        "flarmstore://Alice",
        "flarmstore://.Game",
        "flarmstore://Alice.",
        "flarmstore://Al ice.Game",
        "notes.txt",
    ] {
        let err = parse_reference(input).expect_err("malformed reference must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidReferenceFormat, "{input:?}");
    }
}

#[test]
fn parse_recognizes_local_archive_paths() {
    let parsed =
        parse_reference("C:/Downloads/Game-1.0-Knosthalij.IFLAPP").expect("path must parse");
    assert_eq!(parsed.source_kind(), SourceKind::LocalArchive);
    assert_eq!(
        parsed.local_path(),
        Some(Path::new("C:/Downloads/Game-1.0-Knosthalij.IFLAPP"))
    );
    assert!(parsed.coordinate().is_none());
}

#[test]
fn coordinate_display_round_trips_through_parser() {
    let coordinate = remote("flarmstore://Alice.Game");
    let reparsed = parse_reference(&PackageReference::Remote(coordinate.clone()).to_string())
        .expect("display form must parse");
    assert_eq!(reparsed.coordinate(), Some(&coordinate));
}

#[test]
fn descriptor_structured_parse_handles_nested_tags() {
    let content = r#"<?xml version="1.0" encoding="utf-8"?>
<package>
    <name>
        Space <b>Game</b>
    </name>
    <publisher>Alice</publisher>
    <app>Game</app>
    <version>v2</version>
    <platform>Knosthalij</platform>
    <author>Bob</author>
    <description><name>not a field</name></description>
</package>"#;

    let parsed = parse_descriptor(content).expect("descriptor must parse");
    assert!(matches!(parsed, DescriptorParse::Parsed(_)));
    let fields = parsed.fields();
    assert_eq!(fields.name, "Space Game");
    assert_eq!(fields.publisher, "Alice");
    assert_eq!(fields.app, "Game");
    assert_eq!(fields.version, "v2");
    assert_eq!(fields.platform, "Knosthalij");
    assert_eq!(fields.author.as_deref(), Some("Bob"));

    for value in [
        &fields.name,
        &fields.publisher,
        &fields.app,
        &fields.version,
        &fields.platform,
    ] {
        assert!(!value.contains('<') && !value.contains('>'), "{value}");
    }
}

#[test]
fn descriptor_tags_match_case_insensitively() {
    let content = "<Package><Publisher>Alice</Publisher><APP>Game</APP><Version>1.0</Version><Name>Game</Name></Package>";
    let fields = parse_descriptor(content)
        .expect("descriptor must parse")
        .fields()
        .clone();
    assert_eq!(fields.publisher, "Alice");
    assert_eq!(fields.app, "Game");
    assert_eq!(fields.version, "1.0");
    assert_eq!(fields.author, None);
}

#[test]
fn descriptor_fallback_recovers_identity_from_unclosed_markup() {
    let content = "<package><name>Space Game<publisher>Alice</publisher><app>Game</app>";

    let parsed = parse_descriptor(content).expect("fallback must succeed");
    let DescriptorParse::PartiallyParsed { fields, warnings } = parsed else {
        panic!("expected a partial parse");
    };
    assert_eq!(fields.publisher, "Alice");
    assert_eq!(fields.app, "Game");
    assert_eq!(fields.name, "");
    assert!(warnings.iter().any(|w| w.contains("not well-formed")));
    assert!(warnings.iter().any(|w| w.contains("<name>")));
}

#[test]
fn descriptor_fallback_recovers_fields_around_bad_entities() {
    let content = "<package><publisher>Alice</publisher><app>Game</app><version>1 & 2</version><name>Game <i>Deluxe</i></name></package>";

    let parsed = parse_descriptor(content).expect("fallback must succeed");
    assert!(!parsed.warnings().is_empty());
    let fields = parsed.fields();
    assert_eq!(fields.publisher, "Alice");
    assert_eq!(fields.app, "Game");
    assert_eq!(fields.version, "1 & 2");
    assert_eq!(fields.name, "Game Deluxe");
}

#[test]
fn descriptor_without_identity_is_unavailable() {
    for content in [
        "<package><app>Game</app></package>",
        "<package><publisher>Alice</publisher><app>  </app></package>",
        "this is not a descriptor",
    ] {
        let err = parse_descriptor(content).expect_err("identity is required");
        assert_eq!(err.kind(), ErrorKind::MetadataUnavailable, "{content}");
    }
}

#[test]
fn descriptor_missing_version_is_reported_as_partial() {
    let parsed = parse_descriptor(
        "<package><name>Game</name><publisher>Alice</publisher><app>Game</app></package>",
    )
    .expect("descriptor must parse");
    assert_eq!(
        parsed.warnings(),
        ["descriptor does not declare <version>".to_string()]
    );
}

#[test]
fn compatibility_gate_maps_both_targets() {
    use Platform::{Danenone, Knosthalij};

    assert!(
        check_compatibility(&PlatformRequirement::Only(Knosthalij), Knosthalij).is_compatible()
    );
    assert!(check_compatibility(&PlatformRequirement::Only(Danenone), Danenone).is_compatible());

    let Compatibility::Incompatible { reason } =
        check_compatibility(&PlatformRequirement::Only(Danenone), Knosthalij)
    else {
        panic!("Danenone package must be rejected on Knosthalij");
    };
    assert!(reason.contains("Danenone"));
    assert!(
        !check_compatibility(&PlatformRequirement::Only(Knosthalij), Danenone).is_compatible()
    );

    for running in [Knosthalij, Danenone] {
        assert!(check_compatibility(&PlatformRequirement::Universal, running).is_compatible());
    }
}

#[test]
fn platform_requirement_parsing() {
    assert_eq!(PlatformRequirement::parse(""), PlatformRequirement::Universal);
    assert_eq!(PlatformRequirement::parse(" Any "), PlatformRequirement::Universal);
    assert_eq!(
        PlatformRequirement::parse("knosthalij"),
        PlatformRequirement::Only(Platform::Knosthalij)
    );
    let unknown = PlatformRequirement::parse("amiga");
    assert_eq!(unknown, PlatformRequirement::Unrecognized("amiga".to_string()));
    assert!(check_compatibility(&unknown, Platform::Knosthalij).is_compatible());
}

#[test]
fn package_file_names_split_into_parts() {
    let parsed = parse_package_file_name("Game-1.0.2-Knosthalij.iflapp").expect("must parse");
    assert_eq!(parsed.stem, "Game");
    assert_eq!(parsed.version, "1.0.2");
    assert_eq!(parsed.platform, "Knosthalij");

    let parsed = parse_package_file_name("My-Game-1.0-win.IFLAPP").expect("must parse");
    assert_eq!(parsed.stem, "My");
    assert_eq!(parsed.version, "Game-1.0");
    assert_eq!(parsed.platform, "win");

    assert_eq!(parse_package_file_name("Game.iflapp"), None);
    assert_eq!(parse_package_file_name("Game-1.0.iflapp"), None);
    assert_eq!(parse_package_file_name("Game-1.0-win.zip"), None);
}

fn release_asset(name: &str) -> ReleaseAsset {
    ReleaseAsset {
        name: name.to_string(),
        download_url: format!("https://example.test/{name}"),
        release_tag: Some("v1".to_string()),
    }
}

#[test]
fn select_asset_prefers_running_platform_aliases() {
    let assets = vec![
        release_asset("README.md"),
        release_asset("Game-1.0-linux.iflapp"),
        release_asset("Game-1.0-windows.iflapp"),
    ];

    let windows = select_asset(&assets, "Game", Platform::Knosthalij).expect("asset");
    assert_eq!(windows.asset.name, "Game-1.0-windows.iflapp");
    assert_eq!(windows.file_name.version, "1.0");

    let linux = select_asset(&assets, "Game", Platform::Danenone).expect("asset");
    assert_eq!(linux.asset.name, "Game-1.0-linux.iflapp");
}

#[test]
fn select_asset_does_not_mistake_darwin_for_windows() {
    let assets = vec![release_asset("Tool-1.0-darwin.iflapp")];
    assert_eq!(select_asset(&assets, "Game", Platform::Knosthalij), None);
    assert!(select_asset(&assets, "Game", Platform::Danenone).is_some());
}

#[test]
fn select_asset_falls_back_to_app_prefix() {
    let assets = vec![release_asset("game-2.0-universal.iflapp")];
    let selected = select_asset(&assets, "Game", Platform::Knosthalij).expect("fallback");
    assert_eq!(selected.file_name.platform, "universal");
}

#[test]
fn endpoints_build_repository_urls() {
    let endpoints = Endpoints::default();
    let coordinate = remote("flarmstore://Alice.Game");
    assert_eq!(
        endpoints.descriptor_url(&coordinate),
        "https://raw.githubusercontent.com/Alice/Game/main/details.xml"
    );
    assert_eq!(
        endpoints.releases_api_url(&coordinate),
        "https://api.github.com/repos/Alice/Game/releases"
    );
    assert_eq!(
        endpoints.releases_page_url(&coordinate),
        "https://github.com/Alice/Game/releases"
    );

    let doubled = Endpoints::new(
        "https://https://github.com/",
        "raw.test",
        "http://api.test",
        "dev",
    );
    assert_eq!(doubled.repo_host(), "https://github.com");
    assert_eq!(
        doubled.descriptor_url(&coordinate),
        "https://raw.test/Alice/Game/dev/details.xml"
    );
    assert_eq!(
        doubled.releases_api_url(&coordinate),
        "http://api.test/repos/Alice/Game/releases"
    );
}

#[test]
fn extract_remote_metadata_defaults_version() {
    let transport = FakeTransport::default().with(
        "https://raw.githubusercontent.com/Alice/Game/main/details.xml",
        FakeResponse::Body(
            "<package><name>Game</name><publisher>Alice</publisher><app>Game</app><platform>Knosthalij</platform></package>",
        ),
    );
    let archives = FakeArchives::default();
    let endpoints = Endpoints::default();
    let extractor = MetadataExtractor::new(&transport, &archives, &endpoints);

    let extracted = extractor
        .extract(&parse_reference("flarmstore://Alice.Game").expect("reference"))
        .expect("metadata must resolve");
    assert_eq!(extracted.metadata.version, DEFAULT_REMOTE_VERSION);
    assert_eq!(extracted.metadata.platform, "Knosthalij");
    assert!(extracted.descriptor.starts_with(b"<package>"));
}

#[test]
fn extract_remote_timeout_propagates() {
    let transport = FakeTransport::default().with(
        "https://raw.githubusercontent.com/Alice/Game/main/details.xml",
        FakeResponse::Timeout,
    );
    let archives = FakeArchives::default();
    let endpoints = Endpoints::default();
    let extractor = MetadataExtractor::new(&transport, &archives, &endpoints);

    let err = extractor
        .extract(&parse_reference("flarmstore://Alice.Game").expect("reference"))
        .expect_err("timeout must fail");
    assert_eq!(err.kind(), ErrorKind::NetworkTimeout);
    assert!(err.is_retryable());
}

#[test]
fn extract_remote_missing_descriptor_points_at_releases_page() {
    let transport = FakeTransport::default().with(
        "https://raw.githubusercontent.com/Alice/Game/main/details.xml",
        FakeResponse::NotFound,
    );
    let archives = FakeArchives::default();
    let endpoints = Endpoints::default();
    let extractor = MetadataExtractor::new(&transport, &archives, &endpoints);

    let err = extractor
        .extract(&parse_reference("flarmstore://Alice.Game").expect("reference"))
        .expect_err("missing descriptor must fail");
    assert_eq!(err.kind(), ErrorKind::MetadataUnavailable);
    assert!(!err.is_retryable());
    let hint = err.recovery_hint().expect("hint");
    assert!(hint.contains("https://github.com/Alice/Game/releases"), "{hint}");
}

#[test]
fn escaped_markup_is_stripped_on_both_parse_paths() {
    let structured = parse_descriptor(
        "<package><name>1 &lt;b&gt; 2</name><publisher>Alice</publisher>\
         <app>Game</app></package>",
    )
    .expect("descriptor must parse");
    assert!(matches!(structured, DescriptorParse::Parsed(_)));
    assert_eq!(structured.fields().name, "1 b 2");

    let fallback = parse_descriptor(
        "<package><name>1 &lt;b&gt; 2</name><publisher>Alice</publisher><app>Game</app>",
    )
    .expect("descriptor must parse");
    assert!(matches!(fallback, DescriptorParse::PartiallyParsed { .. }));
    assert_eq!(fallback.fields().name, "1 b 2");
}

#[test]
fn extract_remote_connection_failure_stays_retryable() {
    let transport = FakeTransport::default().with(
        "https://raw.githubusercontent.com/Alice/Game/main/details.xml",
        FakeResponse::Refused,
    );
    let archives = FakeArchives::default();
    let endpoints = Endpoints::default();
    let extractor = MetadataExtractor::new(&transport, &archives, &endpoints);

    let err = extractor
        .extract(&parse_reference("flarmstore://Alice.Game").expect("reference"))
        .expect_err("refused connection must fail");
    assert_eq!(err.kind(), ErrorKind::Network);
    assert!(err.is_retryable());
    assert!(!err.is_not_found());
}

#[test]
fn http_status_errors_classify_by_status() {
    let status = |status| FlarmError::HttpStatus {
        url: "https://example.test".to_string(),
        status,
    };
    assert!(status(404).is_not_found());
    assert!(!status(404).is_retryable());
    assert!(status(503).is_retryable());
    assert!(status(429).is_retryable());
    assert!(!status(403).is_retryable());
    assert_eq!(status(500).kind(), ErrorKind::Network);
}

#[test]
fn extract_local_metadata_uses_file_name_hints() {
    let transport = FakeTransport::default();
    let archives = FakeArchives::default()
        .with(
            "/downloads/Game-2.0-Danenone.iflapp",
            DESCRIPTOR_FILE_NAME,
            "<package><publisher>Alice</publisher><app>Game</app></package>",
        )
        .with(
            "/downloads/game.iflapp",
            DESCRIPTOR_FILE_NAME,
            "<package><publisher>Alice</publisher><app>Game</app></package>",
        );
    let endpoints = Endpoints::default();
    let extractor = MetadataExtractor::new(&transport, &archives, &endpoints);

    let hinted = extractor
        .extract(&parse_reference("/downloads/Game-2.0-Danenone.iflapp").expect("reference"))
        .expect("metadata must resolve");
    assert_eq!(hinted.metadata.version, "2.0");
    assert_eq!(hinted.metadata.platform, "Danenone");

    let plain = extractor
        .extract(&parse_reference("/downloads/game.iflapp").expect("reference"))
        .expect("metadata must resolve");
    assert_eq!(plain.metadata.version, DEFAULT_LOCAL_VERSION);
    assert_eq!(plain.metadata.platform, "");
    assert_eq!(plain.metadata.platform_requirement(), PlatformRequirement::Universal);
}

#[test]
fn extract_local_without_descriptor_is_unavailable() {
    let transport = FakeTransport::default();
    let archives = FakeArchives::default();
    let endpoints = Endpoints::default();
    let extractor = MetadataExtractor::new(&transport, &archives, &endpoints);

    let err = extractor
        .extract(&parse_reference("/downloads/empty.iflapp").expect("reference"))
        .expect_err("descriptor is required");
    assert_eq!(err.kind(), ErrorKind::MetadataUnavailable);
}

#[test]
fn share_url_for_remote_uses_link_coordinate() {
    let reference = parse_reference("flarmstore://Alice.Game").expect("reference");
    let url = share_url(&reference, None, &Endpoints::default()).expect("share url");
    assert_eq!(url, "https://github.com/Alice/Game");
}

#[test]
fn share_url_for_local_uses_author() {
    let reference = parse_reference("/downloads/tool.iflapp").expect("reference");
    let metadata = metadata("", "Tool", Some("Bob"));

    let url = share_url(&reference, Some(&metadata), &Endpoints::default()).expect("share url");
    assert_eq!(url, "https://github.com/Bob/Tool");
    assert!(!url.contains("//Tool") && !url.contains("https://https://"));

    let shortened = shortened_share_url(
        &reference,
        Some(&metadata),
        &Endpoints::new("https://https://github.com", "", "", "main"),
        &PrefixShortener,
    )
    .expect("short url");
    assert_eq!(shortened, "short:https://github.com/Bob/Tool");
}

#[test]
fn share_url_for_local_falls_back_to_publisher() {
    let reference = parse_reference("/downloads/tool.iflapp").expect("reference");
    let url = share_url(
        &reference,
        Some(&metadata("Carol", "Tool", Some("  "))),
        &Endpoints::default(),
    )
    .expect("share url");
    assert_eq!(url, "https://github.com/Carol/Tool");

    let err = share_url(
        &reference,
        Some(&metadata("", "Tool", None)),
        &Endpoints::default(),
    )
    .expect_err("no owner must fail");
    assert_eq!(err.kind(), ErrorKind::MetadataUnavailable);
}

#[test]
fn archive_type_detection_uses_magic_bytes() {
    assert_eq!(ArchiveType::detect(b"PK\x03\x04rest"), Some(ArchiveType::Zip));
    assert_eq!(ArchiveType::detect(&[0x1f, 0x8b, 0x08]), Some(ArchiveType::TarGz));

    let mut tar_header = vec![0_u8; 512];
    tar_header[257..262].copy_from_slice(b"ustar");
    assert_eq!(ArchiveType::detect(&tar_header), Some(ArchiveType::Tar));
    assert_eq!(ArchiveType::detect(b"plain text"), None);
    assert_eq!(ArchiveType::detect(b"PK"), None);
}

#[test]
fn error_hints_and_retryability() {
    let denied = FlarmError::ElevationDenied {
        reason: "user declined".to_string(),
    };
    assert_eq!(denied.kind().as_str(), "elevation-denied");
    assert!(denied.recovery_hint().is_some());
    assert!(!denied.is_retryable());

    let busy = FlarmError::InstallInProgress {
        identity: "Alice.Game.v2-Knosthalij".to_string(),
    };
    assert!(busy.is_retryable());

    let incompatible = FlarmError::Incompatible {
        reason: "built for Danenone".to_string(),
    };
    assert_eq!(incompatible.to_string(), "built for Danenone");
    assert!(!incompatible.is_retryable());
}
