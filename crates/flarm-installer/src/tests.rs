use super::*;
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use flarm_core::{
    Endpoints, FlarmError, FlarmResult, PackageCoordinate, PackageFileName, PackageReference,
    PackageSource, Platform, ReleaseAsset, SelectedAsset, TransferProgress, Transport,
};

use crate::registrations::parse_registrations;

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

const DOWNLOAD_URL: &str = "https://downloads.test/Alice/Game/Game-v2-knosthalij.iflapp";

struct FakeTransport {
    descriptors: HashMap<String, String>,
    payload: Vec<u8>,
    downloads: AtomicUsize,
    cancel_mid_download: Option<CancelToken>,
}

impl Transport for FakeTransport {
    fn fetch_bytes(&self, url: &str) -> FlarmResult<Vec<u8>> {
        self.descriptors
            .get(url)
            .map(|body| body.as_bytes().to_vec())
            .ok_or_else(|| FlarmError::HttpStatus {
                url: url.to_string(),
                status: 404,
            })
    }

    fn fetch_with_progress(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut dyn FnMut(TransferProgress) -> ControlFlow<()>,
    ) -> FlarmResult<u64> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        assert_eq!(url, DOWNLOAD_URL);

        let total = self.payload.len() as u64;
        for step in 1..=3u64 {
            if step == 2 {
                if let Some(cancel) = &self.cancel_mid_download {
                    cancel.cancel();
                }
            }
            let progress = TransferProgress {
                bytes_done: total * step / 3,
                bytes_total: Some(total),
            };
            if on_progress(progress).is_break() {
                return Err(FlarmError::Cancelled);
            }
        }

        fs::write(dest, &self.payload).expect("must write fake download");
        Ok(total)
    }
}

struct FakeSource;

impl PackageSource for FakeSource {
    fn resolve_asset(
        &self,
        coordinate: &PackageCoordinate,
        _running: Platform,
    ) -> FlarmResult<SelectedAsset> {
        assert_eq!(coordinate.publisher(), "Alice");
        Ok(SelectedAsset {
            asset: ReleaseAsset {
                name: "Game-v2-knosthalij.iflapp".to_string(),
                download_url: DOWNLOAD_URL.to_string(),
                release_tag: Some("v2".to_string()),
            },
            file_name: PackageFileName {
                stem: "Game".to_string(),
                version: "v2".to_string(),
                platform: "knosthalij".to_string(),
            },
        })
    }
}

struct Harness {
    base: PathBuf,
    layout: InstallLayout,
    desktop: PathBuf,
    transport: Arc<FakeTransport>,
    installer: Arc<Installer>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.base);
    }
}

fn build_test_layout_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "flarm-installer-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

fn test_base() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    build_test_layout_path(nanos)
}

fn remote_descriptor(platform: &str) -> String {
    format!(
        "<package><name>Space Game</name><publisher>Alice</publisher><app>Game</app>\
         <version>v2</version><platform>{platform}</platform></package>"
    )
}

fn package_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
    for (name, content) in entries {
        writer
            .start_file(*name, options)
            .expect("must start zip entry");
        writer.write_all(content).expect("must write zip entry");
    }
    writer.finish().expect("must finish zip").into_inner()
}

fn game_package() -> Vec<u8> {
    let descriptor = remote_descriptor("Knosthalij");
    package_zip(&[
        ("details.xml", descriptor.as_bytes()),
        ("Game.exe", b"binary"),
        ("data/level1.dat", b"level"),
    ])
}

fn harness_with(descriptor_platform: &str, cancel_mid_download: Option<CancelToken>) -> Harness {
    let base = test_base();
    let layout = InstallLayout::new(base.join("FLARM Apps"));
    let desktop = base.join("Desktop");
    let endpoints = Endpoints::default();
    let coordinate = PackageCoordinate::new("Alice", "Game").expect("must build coordinate");

    let transport = Arc::new(FakeTransport {
        descriptors: HashMap::from([(
            endpoints.descriptor_url(&coordinate),
            remote_descriptor(descriptor_platform),
        )]),
        payload: game_package(),
        downloads: AtomicUsize::new(0),
        cancel_mid_download,
    });
    let installer = Installer::new(
        layout.clone(),
        Platform::Knosthalij,
        Collaborators {
            transport: transport.clone(),
            archives: Arc::new(PackageArchives),
            source: Arc::new(FakeSource),
            shortcuts: Some(Arc::new(DesktopShortcuts::new(
                desktop.clone(),
                ShortcutStyle::DesktopEntry,
            ))),
        },
    )
    .with_endpoints(endpoints);

    Harness {
        base,
        layout,
        desktop,
        transport,
        installer: Arc::new(installer),
    }
}

fn harness(descriptor_platform: &str) -> Harness {
    harness_with(descriptor_platform, None)
}

fn remote_game() -> PackageReference {
    PackageReference::Remote(PackageCoordinate::new("Alice", "Game").expect("must build"))
}

fn game_identity() -> InstallIdentity {
    InstallIdentity::new("Alice", "Game", "v2", "Knosthalij").expect("must build identity")
}

fn states(events: &[InstallEvent]) -> Vec<InstallState> {
    events
        .iter()
        .filter_map(|event| match event {
            InstallEvent::State(state) => Some(*state),
            _ => None,
        })
        .collect()
}

fn staging_entries(layout: &InstallLayout) -> Vec<PathBuf> {
    fs::read_dir(layout.staging_dir())
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

#[test]
fn build_test_layout_path_disambiguates_same_timestamp_calls() {
    let first = build_test_layout_path(42);
    let second = build_test_layout_path(42);
    assert_ne!(first, second);
}

#[test]
fn canonical_folder_name_round_trips() {
    let identity = game_identity();
    assert_eq!(identity.canonical_folder_name(), "Alice.Game.v2-Knosthalij");
    assert_eq!(
        parse_canonical_folder_name("Alice.Game.v2-Knosthalij"),
        Some(identity)
    );

    let dotted_version =
        InstallIdentity::new("Alice", "Game", "1.2.3-beta", "Danenone").expect("must build");
    assert_eq!(
        parse_canonical_folder_name(&dotted_version.canonical_folder_name()),
        Some(dotted_version)
    );

    assert!(parse_canonical_folder_name("Alice.Game").is_none());
    assert!(parse_canonical_folder_name(".flarm").is_none());
}

#[test]
fn identity_rejects_tokens_that_break_the_folder_name() {
    assert!(InstallIdentity::new("Al.ice", "Game", "v1", "Danenone").is_err());
    assert!(InstallIdentity::new("Alice", "Game", "v1", "Dane-none").is_err());
    assert!(InstallIdentity::new("Alice", "Game", "v/1", "Danenone").is_err());
    assert!(InstallIdentity::new("Alice", "", "v1", "Danenone").is_err());
}

#[test]
fn identity_from_metadata_records_unknown_platform() {
    let metadata = flarm_core::PackageMetadata {
        name: "Tool".to_string(),
        publisher: "Bob".to_string(),
        app: "Tool".to_string(),
        version: "local".to_string(),
        platform: String::new(),
        author: None,
    };
    assert_eq!(
        canonical_folder_name(&metadata).expect("must build"),
        "Bob.Tool.local-unknown"
    );
}

#[test]
fn find_installed_requires_exact_folder_name() {
    let base = test_base();
    let layout = InstallLayout::new(&base);
    let identity = InstallIdentity::new("Pub", "App", "v1", "TargetA").expect("must build");

    assert_eq!(find_installed(&layout, &identity).expect("must search"), None);

    fs::create_dir_all(base.join("Pub.App.v1-TargetA-extra")).expect("must create dir");
    fs::create_dir_all(base.join("Pub.App.v1")).expect("must create dir");
    fs::write(base.join("Pub.App.v1-TargetA"), b"not a folder").expect("must write file");
    assert_eq!(find_installed(&layout, &identity).expect("must search"), None);

    fs::remove_file(base.join("Pub.App.v1-TargetA")).expect("must remove file");
    fs::create_dir_all(base.join("Pub.App.v1-TargetA")).expect("must create dir");
    assert_eq!(
        find_installed(&layout, &identity).expect("must search"),
        Some(base.join("Pub.App.v1-TargetA"))
    );

    let listed = list_installed(&layout).expect("must list");
    let names = listed
        .iter()
        .map(|package| package.identity.canonical_folder_name())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["Pub.App.v1-TargetA", "Pub.App.v1-TargetA-extra"]);

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn identity_lock_is_exclusive_until_dropped() {
    let base = test_base();
    let layout = InstallLayout::new(&base);
    let identity = game_identity();

    let lock = IdentityLock::acquire(&layout, &identity).expect("must lock");
    let err = IdentityLock::acquire(&layout, &identity).expect_err("must be held");
    assert!(matches!(err, FlarmError::InstallInProgress { .. }));

    drop(lock);
    assert!(!layout.lock_path("Alice.Game.v2-Knosthalij").exists());
    IdentityLock::acquire(&layout, &identity).expect("must lock again");

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn dropped_reservation_leaves_no_trace() {
    let base = test_base();
    let layout = InstallLayout::new(&base);
    let identity = game_identity();

    let reservation = Reservation::reserve(&layout, &identity).expect("must reserve");
    fs::write(reservation.content_dir().join("file.txt"), b"x").expect("must write");
    let staging = reservation.staging_root().to_path_buf();
    drop(reservation);

    assert!(!staging.exists());
    assert!(!layout.package_dir("Alice.Game.v2-Knosthalij").exists());
    assert!(!layout.lock_path("Alice.Game.v2-Knosthalij").exists());

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn reservation_refuses_existing_folder() {
    let base = test_base();
    let layout = InstallLayout::new(&base);
    fs::create_dir_all(base.join("Alice.Game.v2-Knosthalij")).expect("must create dir");

    let err = Reservation::reserve(&layout, &game_identity()).expect_err("must collide");
    assert!(matches!(err, FlarmError::InstallCollision { .. }));
    assert!(!layout.lock_path("Alice.Game.v2-Knosthalij").exists());

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn remote_install_reaches_installed_and_creates_canonical_folder() {
    let harness = harness("Knosthalij");
    let (sender, receiver) = mpsc::channel();

    let outcome = harness
        .installer
        .install(&remote_game(), &CancelToken::new(), Some(&sender))
        .expect("must install");
    let events = receiver.try_iter().collect::<Vec<_>>();

    let folder = harness.layout.root().join("Alice.Game.v2-Knosthalij");
    assert_eq!(outcome.path(), folder.as_path());
    assert!(matches!(
        outcome,
        InstallOutcome::Installed {
            already_installed: false,
            ..
        }
    ));
    assert!(folder.join("Game.exe").is_file());
    assert!(folder.join("data/level1.dat").is_file());
    assert!(folder.join("details.xml").is_file());
    assert_eq!(
        states(&events),
        vec![
            InstallState::Resolving,
            InstallState::CheckingCompatibility,
            InstallState::CheckingInstalled,
            InstallState::Fetching,
            InstallState::Extracting,
            InstallState::Installing,
            InstallState::Registering,
            InstallState::Installed,
        ]
    );
    assert_eq!(harness.transport.downloads.load(Ordering::SeqCst), 1);
    assert!(staging_entries(&harness.layout).is_empty());
    assert!(!harness.layout.lock_path("Alice.Game.v2-Knosthalij").exists());

    let shortcut = harness.desktop.join("Space Game.desktop");
    assert!(shortcut.is_file());
    let records = read_registrations(&harness.layout, "Alice.Game.v2-Knosthalij")
        .expect("must read sidecar");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, KIND_DESKTOP_SHORTCUT);
    assert_eq!(records[0].path, shortcut.display().to_string());
}

#[test]
fn progress_never_goes_backwards_within_a_step() {
    let harness = harness("Knosthalij");
    let handle = harness.installer.spawn_install(remote_game());

    let mut events = Vec::new();
    let outcome = handle
        .wait(|event| {
            if let InstallEvent::Progress(progress) = event {
                events.push(*progress);
            }
        })
        .expect("must install");
    assert!(outcome.warnings().is_empty());

    assert!(events.iter().any(|p| p.state == InstallState::Fetching));
    assert!(events.iter().any(|p| p.state == InstallState::Extracting));
    for pair in events.windows(2) {
        if pair[0].state == pair[1].state {
            assert!(pair[1].done >= pair[0].done, "progress regressed: {pair:?}");
        }
    }
    for progress in &events {
        if let Some(total) = progress.total {
            assert!(progress.done <= total);
        }
    }
}

#[test]
fn incompatible_package_stops_before_touching_the_root() {
    let harness = harness("Danenone");
    let (sender, receiver) = mpsc::channel();

    let err = harness
        .installer
        .install(&remote_game(), &CancelToken::new(), Some(&sender))
        .expect_err("must be incompatible");
    let events = receiver.try_iter().collect::<Vec<_>>();

    match err {
        FlarmError::Incompatible { reason } => assert!(reason.contains("Danenone")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(states(&events).last(), Some(&InstallState::Incompatible));
    assert!(!harness
        .layout
        .root()
        .join("Alice.Game.v2-Danenone")
        .exists());
    assert_eq!(harness.transport.downloads.load(Ordering::SeqCst), 0);
}

#[test]
fn existing_folder_short_circuits_without_fetching() {
    let harness = harness("Knosthalij");
    let folder = harness.layout.root().join("Alice.Game.v2-Knosthalij");
    fs::create_dir_all(&folder).expect("must create existing install");
    let (sender, receiver) = mpsc::channel();

    let outcome = harness
        .installer
        .install(&remote_game(), &CancelToken::new(), Some(&sender))
        .expect("must report installed");
    let events = receiver.try_iter().collect::<Vec<_>>();

    assert!(matches!(
        outcome,
        InstallOutcome::Installed {
            already_installed: true,
            ..
        }
    ));
    assert_eq!(outcome.path(), folder.as_path());
    assert_eq!(
        states(&events),
        vec![
            InstallState::Resolving,
            InstallState::CheckingCompatibility,
            InstallState::CheckingInstalled,
            InstallState::Installed,
        ]
    );
    assert_eq!(harness.transport.downloads.load(Ordering::SeqCst), 0);
}

#[test]
fn inspection_reports_view_for_each_situation() {
    let compatible = harness("Knosthalij");
    let inspection = compatible
        .installer
        .inspect(&remote_game())
        .expect("must inspect");
    assert_eq!(inspection.view(), PackageView::Install);
    assert_eq!(inspection.extracted.metadata.display_name(), "Space Game");

    let folder = compatible.layout.root().join("Alice.Game.v2-Knosthalij");
    fs::create_dir_all(&folder).expect("must create install");
    let inspection = compatible
        .installer
        .inspect(&remote_game())
        .expect("must inspect");
    assert_eq!(inspection.view(), PackageView::Installed(folder));

    let incompatible = harness("Danenone");
    let inspection = incompatible
        .installer
        .inspect(&remote_game())
        .expect("must inspect");
    assert!(matches!(inspection.view(), PackageView::Incompatible(_)));
}

#[test]
fn cancel_during_download_cleans_staging_and_lock() {
    let cancel = CancelToken::new();
    let harness = harness_with("Knosthalij", Some(cancel.clone()));
    let (sender, receiver) = mpsc::channel();

    let err = harness
        .installer
        .install(&remote_game(), &cancel, Some(&sender))
        .expect_err("must cancel");
    let events = receiver.try_iter().collect::<Vec<_>>();

    assert!(matches!(err, FlarmError::Cancelled));
    assert_eq!(states(&events).last(), Some(&InstallState::Failed));
    assert!(!harness
        .layout
        .root()
        .join("Alice.Game.v2-Knosthalij")
        .exists());
    assert!(staging_entries(&harness.layout).is_empty());
    assert!(!harness.layout.lock_path("Alice.Game.v2-Knosthalij").exists());
}

#[test]
fn concurrent_install_of_same_identity_is_rejected() {
    let harness = harness("Knosthalij");
    let held = IdentityLock::acquire(&harness.layout, &game_identity()).expect("must lock");

    let err = harness
        .installer
        .install(&remote_game(), &CancelToken::new(), None)
        .expect_err("must be busy");
    assert!(matches!(err, FlarmError::InstallInProgress { .. }));
    assert!(err.is_retryable());
    assert!(!harness
        .layout
        .root()
        .join("Alice.Game.v2-Knosthalij")
        .exists());

    drop(held);
    harness
        .installer
        .install(&remote_game(), &CancelToken::new(), None)
        .expect("must install once the lock is released");
}

#[test]
fn local_package_installs_with_filename_hints() {
    let harness = harness("Knosthalij");
    let package = harness.base.join("Tool-v3-Knosthalij.iflapp");
    fs::create_dir_all(&harness.base).expect("must create base");
    fs::write(
        &package,
        package_zip(&[
            (
                "details.xml",
                b"<package><publisher>Bob</publisher><app>Tool</app></package>",
            ),
            ("bin/Tool.exe", b"binary"),
        ]),
    )
    .expect("must write package");

    let outcome = harness
        .installer
        .install(
            &PackageReference::Local {
                path: package.clone(),
            },
            &CancelToken::new(),
            None,
        )
        .expect("must install");

    let folder = harness.layout.root().join("Bob.Tool.v3-Knosthalij");
    assert_eq!(outcome.path(), folder.as_path());
    assert!(folder.join("bin/Tool.exe").is_file());
    assert!(package.is_file());
    assert_eq!(harness.transport.downloads.load(Ordering::SeqCst), 0);
    assert_eq!(
        outcome.warnings().len(),
        2,
        "missing name and version are reported: {:?}",
        outcome.warnings()
    );
}

#[test]
fn missing_executable_is_a_warning_not_a_failure() {
    let harness = harness("Knosthalij");
    let package = harness.base.join("Notes-v1-Knosthalij.iflapp");
    fs::create_dir_all(&harness.base).expect("must create base");
    fs::write(
        &package,
        package_zip(&[
            (
                "details.xml",
                b"<package><name>Notes</name><publisher>Bob</publisher><app>Notes</app>\
                  <version>v1</version></package>",
            ),
            ("readme.txt", b"hello"),
        ]),
    )
    .expect("must write package");

    let outcome = harness
        .installer
        .install(
            &PackageReference::Local { path: package },
            &CancelToken::new(),
            None,
        )
        .expect("must install");

    assert!(outcome.path().join("readme.txt").is_file());
    assert_eq!(outcome.warnings().len(), 1);
    assert!(outcome.warnings()[0].contains("no executable"));
    assert!(read_registrations(&harness.layout, "Bob.Notes.v1-Knosthalij")
        .expect("must read")
        .is_empty());
}

#[test]
fn uninstall_removes_folder_and_shortcut() {
    let harness = harness("Knosthalij");
    harness
        .installer
        .install(&remote_game(), &CancelToken::new(), None)
        .expect("must install");
    let shortcut = harness.desktop.join("Space Game.desktop");
    assert!(shortcut.is_file());

    let handle = harness.installer.spawn_uninstall(game_identity());
    let mut seen = Vec::new();
    let outcome = handle
        .wait(|event| {
            if let InstallEvent::State(state) = event {
                seen.push(*state);
            }
        })
        .expect("must uninstall");

    assert!(matches!(outcome, InstallOutcome::Uninstalled { .. }));
    assert_eq!(
        seen,
        vec![InstallState::Uninstalling, InstallState::Uninstalled]
    );
    assert!(!harness
        .layout
        .root()
        .join("Alice.Game.v2-Knosthalij")
        .exists());
    assert!(!shortcut.exists());
    assert!(!harness
        .layout
        .registration_path("Alice.Game.v2-Knosthalij")
        .exists());
    assert!(staging_entries(&harness.layout).is_empty());
}

#[test]
fn uninstall_of_missing_folder_reports_not_installed() {
    let harness = harness("Knosthalij");
    let (sender, receiver) = mpsc::channel();

    let err = harness
        .installer
        .uninstall(&game_identity(), &CancelToken::new(), Some(&sender))
        .expect_err("must fail");
    let events = receiver.try_iter().collect::<Vec<_>>();

    assert!(matches!(err, FlarmError::NotInstalled { .. }));
    assert_eq!(
        states(&events),
        vec![InstallState::Uninstalling, InstallState::Failed]
    );
}

#[test]
fn state_transitions_follow_the_pipeline() {
    use InstallState::*;

    assert!(Idle.can_transition_to(Resolving));
    assert!(CheckingInstalled.can_transition_to(Installed));
    assert!(CheckingCompatibility.can_transition_to(Incompatible));
    assert!(Extracting.can_transition_to(Failed));
    assert!(!Resolving.can_transition_to(Installed));
    assert!(!Fetching.can_transition_to(Incompatible));
    assert!(!Installed.can_transition_to(Failed));
    assert!(!Failed.can_transition_to(Resolving));
    assert!(Uninstalled.is_terminal());
    assert_eq!(CheckingCompatibility.as_str(), "checking-compatibility");
}

#[test]
fn cancel_token_is_shared_between_clones() {
    let token = CancelToken::new();
    let clone = token.clone();
    assert!(token.check().is_ok());
    clone.cancel();
    assert!(token.is_cancelled());
    assert!(matches!(token.check(), Err(FlarmError::Cancelled)));
}

#[test]
fn parse_registration_sidecar_rows() {
    let raw = "version=1\nregistration=shortcut:desktop\tdesktop-shortcut\t/home/a/Desktop/Game.desktop\n";
    let records = parse_registrations(raw).expect("must parse");
    assert_eq!(
        records,
        vec![RegistrationRecord {
            key: "shortcut:desktop".to_string(),
            kind: "desktop-shortcut".to_string(),
            path: "/home/a/Desktop/Game.desktop".to_string(),
        }]
    );

    assert!(parse_registrations("version=2\n").is_err());
    assert!(parse_registrations("registration=only-one-field\n").is_err());
}

#[test]
fn unknown_registration_kind_stays_in_sidecar() {
    let base = test_base();
    let layout = InstallLayout::new(&base);
    let records = vec![RegistrationRecord {
        key: "association".to_string(),
        kind: "file-association".to_string(),
        path: "iflapp".to_string(),
    }];
    write_registrations(&layout, "Bob.Tool.v1-Danenone", &records).expect("must write");

    let warnings = remove_registrations(&layout, "Bob.Tool.v1-Danenone").expect("must run");
    assert_eq!(warnings.len(), 1);
    assert_eq!(
        read_registrations(&layout, "Bob.Tool.v1-Danenone").expect("must read"),
        records
    );

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn shortcut_names_drop_reserved_characters() {
    assert_eq!(sanitize_shortcut_name("Space: Game?"), "Space Game");
    assert_eq!(sanitize_shortcut_name(" a/b\\c "), "abc");
    assert_eq!(sanitize_shortcut_name("<>"), "");
}

#[test]
fn find_executable_prefers_named_binary() {
    let base = test_base();
    fs::create_dir_all(base.join("bin")).expect("must create dirs");
    fs::write(base.join("aaa-helper.exe"), b"x").expect("must write");
    fs::write(base.join("bin").join("GAME.EXE"), b"x").expect("must write");

    assert_eq!(
        find_executable(&base, "Game"),
        Some(base.join("bin").join("GAME.EXE"))
    );
    assert_eq!(
        find_executable(&base, "Other"),
        Some(base.join("aaa-helper.exe"))
    );
    assert_eq!(find_icon(&base), None);

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn archive_detection_reads_magic_bytes() {
    let base = test_base();
    fs::create_dir_all(&base).expect("must create base");
    let zip_path = base.join("renamed.bin");
    fs::write(&zip_path, package_zip(&[("details.xml", b"<package/>")])).expect("must write");
    let junk_path = base.join("junk.iflapp");
    fs::write(&junk_path, b"definitely not an archive").expect("must write");

    assert_eq!(
        detect_archive_type(&zip_path).expect("must detect"),
        flarm_core::ArchiveType::Zip
    );
    assert!(matches!(
        detect_archive_type(&junk_path),
        Err(FlarmError::Archive { .. })
    ));

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn dotted_app_installs_lists_and_uninstalls_through_its_receipt() {
    let harness = harness("Knosthalij");
    let package = harness.base.join("my.game-1.2-Knosthalij.iflapp");
    fs::create_dir_all(&harness.base).expect("must create base");
    fs::write(
        &package,
        package_zip(&[
            (
                "details.xml",
                b"<package><name>My Game</name><publisher>Alice</publisher>\
                  <app>my.game</app><version>1.2</version>\
                  <platform>Knosthalij</platform></package>",
            ),
            ("my.game.exe", b"binary"),
        ]),
    )
    .expect("must write package");

    let outcome = harness
        .installer
        .install(
            &PackageReference::Local { path: package },
            &CancelToken::new(),
            None,
        )
        .expect("must install");
    let folder = harness.layout.root().join("Alice.my.game.1.2-Knosthalij");
    assert_eq!(outcome.path(), folder.as_path());

    let identity =
        InstallIdentity::new("Alice", "my.game", "1.2", "Knosthalij").expect("must build");
    assert_eq!(
        read_receipt(&harness.layout, "Alice.my.game.1.2-Knosthalij").expect("must read"),
        Some(identity.clone())
    );
    let listed = list_installed(&harness.layout).expect("must list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].identity, identity);
    assert_eq!(
        identify_installed(&harness.layout, "Alice.my.game.1.2-Knosthalij"),
        Some(identity.clone())
    );

    harness
        .installer
        .uninstall(&identity, &CancelToken::new(), None)
        .expect("must uninstall");
    assert!(!folder.exists());
    assert!(!harness
        .layout
        .receipt_path("Alice.my.game.1.2-Knosthalij")
        .exists());
}

#[test]
fn dotted_app_identity_keeps_its_name() {
    let identity =
        InstallIdentity::new("Alice", "my.game", "v2", "Knosthalij").expect("must build");
    assert_eq!(identity.canonical_folder_name(), "Alice.my.game.v2-Knosthalij");
    assert!(InstallIdentity::new("Alice", ".game", "v2", "Knosthalij").is_err());
    assert!(InstallIdentity::new("Alice", "game.", "v2", "Knosthalij").is_err());

    let base = test_base();
    let layout = InstallLayout::new(&base);
    write_receipt(&layout, &identity).expect("must write receipt");
    assert_eq!(
        identify_installed(&layout, "Alice.my.game.v2-Knosthalij"),
        Some(identity)
    );
    assert_eq!(
        identify_installed(&layout, "Alice.Game.v2-Knosthalij"),
        Some(game_identity())
    );

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn lock_left_by_an_exited_process_is_reclaimed() {
    let harness = harness("Knosthalij");
    let lock = harness.layout.lock_path("Alice.Game.v2-Knosthalij");
    fs::create_dir_all(harness.layout.locks_dir()).expect("must create locks dir");
    fs::write(&lock, b"999999999\n").expect("must write stale lock");

    harness
        .installer
        .install(&remote_game(), &CancelToken::new(), None)
        .expect("must install over a stale lock");
    assert!(harness
        .layout
        .root()
        .join("Alice.Game.v2-Knosthalij")
        .is_dir());
    assert!(!lock.exists());
}

#[test]
fn lock_of_a_running_process_is_kept() {
    let base = test_base();
    let layout = InstallLayout::new(&base);
    let lock = layout.lock_path("Alice.Game.v2-Knosthalij");
    fs::create_dir_all(layout.locks_dir()).expect("must create locks dir");
    fs::write(&lock, format!("{}\n", std::process::id())).expect("must write lock");

    let err = IdentityLock::acquire(&layout, &game_identity()).expect_err("must be held");
    assert!(matches!(err, FlarmError::InstallInProgress { .. }));
    assert!(lock.exists());

    fs::write(&lock, b"").expect("must truncate lock");
    let err = IdentityLock::acquire(&layout, &game_identity()).expect_err("must be pending");
    assert!(matches!(err, FlarmError::InstallInProgress { .. }));

    let _ = fs::remove_dir_all(&base);
}

#[test]
fn reservation_sweeps_orphaned_staging_dirs() {
    let base = test_base();
    let layout = InstallLayout::new(&base);
    let own_pid = std::process::id();
    let orphan_same = layout
        .staging_dir()
        .join(format!("Alice.Game.v2-Knosthalij-{own_pid}-1-0"));
    let orphan_dead = layout.staging_dir().join("Bob.Tool.v1-unknown-999999999-1-0");
    let retired = layout
        .staging_dir()
        .join("Bob.Tool.v1-unknown-removing-999999999-2-0");
    let live_other = layout
        .staging_dir()
        .join(format!("Bob.Tool.v1-unknown-{own_pid}-3-0"));
    for dir in [&orphan_same, &orphan_dead, &retired, &live_other] {
        fs::create_dir_all(dir.join("content")).expect("must create staging dir");
    }

    let reservation = Reservation::reserve(&layout, &game_identity()).expect("must reserve");
    assert!(!orphan_same.exists());
    assert!(!orphan_dead.exists());
    assert!(!retired.exists());
    assert!(live_other.exists());
    assert!(reservation.staging_root().exists());

    drop(reservation);
    let _ = fs::remove_dir_all(&base);
}

#[test]
fn failed_folder_removal_keeps_shortcut_registrations() {
    let harness = harness("Knosthalij");
    harness
        .installer
        .install(&remote_game(), &CancelToken::new(), None)
        .expect("must install");
    let shortcut = harness.desktop.join("Space Game.desktop");
    let staging = harness.layout.staging_dir();
    fs::remove_dir_all(&staging).expect("must remove staging");
    fs::write(&staging, b"in the way").expect("must block staging");

    harness
        .installer
        .uninstall(&game_identity(), &CancelToken::new(), None)
        .expect_err("must fail to retire the folder");
    assert!(harness
        .layout
        .root()
        .join("Alice.Game.v2-Knosthalij")
        .is_dir());
    assert!(shortcut.is_file());
    assert_eq!(
        read_registrations(&harness.layout, "Alice.Game.v2-Knosthalij")
            .expect("must read sidecar")
            .len(),
        1
    );

    fs::remove_file(&staging).expect("must unblock staging");
    harness
        .installer
        .uninstall(&game_identity(), &CancelToken::new(), None)
        .expect("must uninstall");
    assert!(!shortcut.exists());
}
