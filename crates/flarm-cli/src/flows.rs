use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use flarm_core::{
    parse_descriptor, share_url, shortened_share_url, FlarmError, PackageMetadata,
    PackageReference, Platform, ReferenceParser, Transport, DESCRIPTOR_FILE_NAME,
};
use flarm_installer::{
    default_desktop_dir, find_executable, find_installed, identify_installed, list_installed,
    Collaborators, DesktopShortcuts, InstallIdentity, InstallLayout, InstallOutcome,
    InstalledPackage, Installer, PackageArchives, PackageView, ShortcutCreator, ShortcutStyle,
};
use flarm_integrity::{
    IntegrityChecker, IntegrityConfig, IntegrityStatus, PrivilegeBroker, RegistrationStore,
    RepairOutcome, RestartScheduler, SystemCommands, SystemRestart, DEFAULT_RESTART_DELAY_SECS,
};
use flarm_remote::{GithubReleases, HttpTransport, IsGdShortener};
use tracing::{debug, info, warn};

use crate::config::FlarmConfig;
use crate::render::{EventRenderer, TerminalRenderer};

/// Values resolved once per invocation and handed to every command.
pub(crate) struct AppContext {
    pub config: FlarmConfig,
    pub config_path: Option<PathBuf>,
    pub install_root: PathBuf,
    pub renderer: TerminalRenderer,
}

impl AppContext {
    fn transport(&self) -> Result<Arc<dyn Transport>> {
        let transport = HttpTransport::new(self.config.fetch_timeout()).map_err(report)?;
        Ok(Arc::new(transport))
    }

    fn installer(&self, transport: Arc<dyn Transport>) -> Arc<Installer> {
        let collaborators = Collaborators {
            transport: transport.clone(),
            archives: Arc::new(PackageArchives),
            source: Arc::new(GithubReleases::new(transport, self.config.endpoints())),
            shortcuts: self.shortcut_creator(),
        };
        let installer = Installer::new(
            InstallLayout::new(&self.install_root),
            Platform::running(),
            collaborators,
        )
        .with_parser(self.config.parser())
        .with_endpoints(self.config.endpoints());
        Arc::new(installer)
    }

    fn shortcut_creator(&self) -> Option<Arc<dyn ShortcutCreator>> {
        if !self.config.create_shortcuts {
            return None;
        }
        match default_desktop_dir() {
            Ok(dir) => Some(Arc::new(DesktopShortcuts::new(dir, ShortcutStyle::for_host()))),
            Err(err) => {
                warn!(error = %err, "desktop folder unavailable; shortcuts disabled");
                None
            }
        }
    }

    fn online_installer(&self) -> Result<Arc<Installer>> {
        Ok(self.installer(self.transport()?))
    }
}

/// Folds the recovery hint into the error message shown by `main`.
pub(crate) fn report(err: FlarmError) -> anyhow::Error {
    match err.recovery_hint() {
        Some(hint) => anyhow!("{err}\nhint: {hint}"),
        None => anyhow!(err),
    }
}

pub(crate) fn run_open(ctx: &AppContext, input: &str) -> Result<()> {
    let installer = ctx.online_installer()?;
    let reference = installer.parse(input).map_err(report)?;
    let inspection = installer.inspect(&reference).map_err(report)?;
    let renderer = ctx.renderer;

    for warning in &inspection.extracted.warnings {
        renderer.print_warning(warning);
    }
    renderer.print_lines(&format_package_lines(&inspection.extracted.metadata, &reference));

    match inspection.view() {
        PackageView::Install => renderer.print_status(
            "ok",
            &format!("ready to install; run `flarm install {}`", input.trim()),
        ),
        PackageView::Installed(path) => renderer.print_status(
            "ok",
            &format!(
                "installed at {}; run `flarm run {}`",
                path.display(),
                inspection.identity
            ),
        ),
        PackageView::Incompatible(reason) => {
            renderer.print_status("err", &format!("incompatible: {reason}"))
        }
    }
    Ok(())
}

pub(crate) fn run_install(ctx: &AppContext, input: &str) -> Result<()> {
    let installer = ctx.online_installer()?;
    let reference = installer.parse(input).map_err(report)?;

    let mut events = EventRenderer::new(ctx.renderer);
    let result = installer
        .spawn_install(reference)
        .wait(|event| events.handle(event));
    events.finish();

    match result.map_err(report)? {
        InstallOutcome::Installed {
            identity,
            path,
            already_installed,
            ..
        } => {
            let message = if already_installed {
                format!("{identity} is already installed at {}", path.display())
            } else {
                format!("installed {identity} into {}", path.display())
            };
            ctx.renderer.print_status("ok", &message);
        }
        InstallOutcome::Uninstalled { identity, .. } => {
            return Err(anyhow!("install of {identity} reported an uninstall"));
        }
    }
    Ok(())
}

pub(crate) fn run_uninstall(ctx: &AppContext, input: &str) -> Result<()> {
    let identity = resolve_identity(ctx, input)?;
    let installer = ctx.installer(ctx.transport()?);

    let mut events = EventRenderer::new(ctx.renderer);
    let result = installer
        .spawn_uninstall(identity)
        .wait(|event| events.handle(event));
    events.finish();

    let outcome = result.map_err(report)?;
    ctx.renderer.print_status(
        "ok",
        &format!(
            "removed {} from {}",
            outcome.identity(),
            outcome.path().display()
        ),
    );
    Ok(())
}

pub(crate) fn run_launch(ctx: &AppContext, input: &str) -> Result<()> {
    let identity = resolve_identity(ctx, input)?;
    let layout = InstallLayout::new(&ctx.install_root);
    let path = find_installed(&layout, &identity)
        .map_err(report)?
        .ok_or_else(|| {
            report(FlarmError::NotInstalled {
                identity: identity.to_string(),
                root: layout.root().to_path_buf(),
            })
        })?;
    let executable = find_executable(&path, identity.app()).ok_or_else(|| {
        anyhow!(
            "no executable for {} found in {}",
            identity.app(),
            path.display()
        )
    })?;

    info!(executable = %executable.display(), "launching");
    Command::new(&executable)
        .current_dir(&path)
        .spawn()
        .with_context(|| format!("failed to launch {}", executable.display()))?;
    ctx.renderer
        .print_status("ok", &format!("launched {}", executable.display()));
    Ok(())
}

pub(crate) fn run_list(ctx: &AppContext) -> Result<()> {
    let layout = InstallLayout::new(&ctx.install_root);
    let packages = list_installed(&layout).map_err(report)?;
    if packages.is_empty() {
        ctx.renderer.print_status(
            "..",
            &format!("no packages installed in {}", layout.root().display()),
        );
        return Ok(());
    }
    ctx.renderer.print_lines(&format_installed_lines(&packages));
    Ok(())
}

pub(crate) fn run_share(ctx: &AppContext, input: &str, long: bool) -> Result<()> {
    let transport = ctx.transport()?;
    let installer = ctx.installer(transport.clone());
    let reference = installer.parse(input).map_err(report)?;
    let metadata = match &reference {
        PackageReference::Remote(_) => None,
        PackageReference::Local { .. } => {
            Some(installer.metadata(&reference).map_err(report)?.metadata)
        }
    };

    let endpoints = ctx.config.endpoints();
    let url = if long {
        share_url(&reference, metadata.as_ref(), &endpoints)
    } else {
        let shortener = IsGdShortener::new(transport, ctx.config.shortener_url.clone());
        shortened_share_url(&reference, metadata.as_ref(), &endpoints, &shortener)
    }
    .map_err(report)?;
    println!("{url}");
    Ok(())
}

pub(crate) fn run_integrity_check(ctx: &AppContext) -> Result<()> {
    let system = IntegritySystem::for_host(ctx)?;
    let status = system.checker().check().map_err(report)?;
    let (badge, message) = describe_integrity(status);
    ctx.renderer.print_status(badge, &message);
    Ok(())
}

pub(crate) fn run_integrity_repair(ctx: &AppContext) -> Result<()> {
    let system = IntegritySystem::for_host(ctx)?;
    let outcome = system.checker().repair().map_err(report)?;
    let message = match outcome {
        RepairOutcome::AlreadyHealthy => "registrations already in place".to_string(),
        RepairOutcome::Repaired {
            fixed,
            restart_scheduled,
        } => {
            let fixed = fixed
                .iter()
                .map(|registration| registration.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            if restart_scheduled {
                format!("repaired {fixed}; a restart has been scheduled to apply it")
            } else {
                format!("repaired {fixed}")
            }
        }
        RepairOutcome::RepairedElevated => "repaired by the elevated installer".to_string(),
    };
    ctx.renderer.print_status("ok", &message);
    Ok(())
}

pub(crate) fn run_doctor(ctx: &AppContext) -> Result<()> {
    let renderer = ctx.renderer;
    let endpoints = ctx.config.endpoints();
    renderer.print_section("configuration");
    renderer.print_lines(&[
        format!(
            "config: {}",
            ctx.config_path
                .as_deref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "(defaults)".to_string())
        ),
        format!("install root: {}", ctx.install_root.display()),
        format!("platform: {}", Platform::running().as_str()),
        format!("scheme: {}", ctx.config.parser().scheme()),
        format!("package extension: .{}", ctx.config.parser().extension()),
        format!("repository host: {}", endpoints.repo_host()),
        format!("fetch timeout: {}s", ctx.config.fetch_timeout().as_secs()),
        format!("desktop shortcuts: {}", ctx.config.create_shortcuts),
    ]);

    renderer.print_section("integrity");
    let status = IntegritySystem::for_host(ctx)
        .and_then(|system| system.checker().check().map_err(report));
    match status {
        Ok(status) => {
            let (badge, message) = describe_integrity(status);
            renderer.print_status(badge, &message);
        }
        Err(err) => renderer.print_status("err", &format!("integrity check failed: {err:#}")),
    }
    Ok(())
}

/// Uninstall and run accept either a canonical folder name or anything that resolves
/// to a package reference.
fn resolve_identity(ctx: &AppContext, input: &str) -> Result<InstallIdentity> {
    let parser = ctx.config.parser();
    let layout = InstallLayout::new(&ctx.install_root);
    if let Some(identity) = installed_identity_from_name(&parser, &layout, input) {
        debug!(%identity, "using canonical folder name");
        return Ok(identity);
    }

    let installer = ctx.online_installer()?;
    let reference = installer.parse(input).map_err(report)?;
    let inspection = installer.inspect(&reference).map_err(report)?;
    Ok(inspection.identity)
}

pub(crate) fn installed_identity_from_name(
    parser: &ReferenceParser,
    layout: &InstallLayout,
    input: &str,
) -> Option<InstallIdentity> {
    let trimmed = input.trim();
    if parser.is_package_path(trimmed) {
        return None;
    }
    identify_installed(layout, trimmed)
}

pub(crate) fn format_package_lines(
    metadata: &PackageMetadata,
    reference: &PackageReference,
) -> Vec<String> {
    let platform = if metadata.platform.trim().is_empty() {
        "universal"
    } else {
        metadata.platform.trim()
    };
    let source = match reference {
        PackageReference::Remote(coordinate) => format!("link {coordinate}"),
        PackageReference::Local { path } => format!("file {}", path.display()),
    };
    let mut lines = vec![
        format!("name: {}", metadata.display_name()),
        format!("publisher: {}", metadata.publisher),
        format!("version: {}", metadata.version),
        format!("platform: {platform}"),
    ];
    if let Some(author) = &metadata.author {
        lines.push(format!("author: {author}"));
    }
    lines.push(format!("source: {source}"));
    lines
}

pub(crate) fn format_installed_lines(packages: &[InstalledPackage]) -> Vec<String> {
    packages
        .iter()
        .map(|package| match installed_display_name(&package.path) {
            Some(name) => format!("{}\t{name}", package.identity),
            None => package.identity.to_string(),
        })
        .collect()
}

/// Reads the descriptor saved with the install. Packages installed without one have
/// no display name.
fn installed_display_name(package_dir: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(package_dir.join(DESCRIPTOR_FILE_NAME)).ok()?;
    let parsed = parse_descriptor(&raw).ok()?;
    let name = parsed.fields().name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

pub(crate) fn describe_integrity(status: IntegrityStatus) -> (&'static str, String) {
    match status {
        IntegrityStatus::Ok => (
            "ok",
            "link handler and package association registered".to_string(),
        ),
        IntegrityStatus::MissingHandler => (
            "warn",
            "link handler missing; run `flarm integrity repair`".to_string(),
        ),
        IntegrityStatus::MissingAssociation => (
            "warn",
            "package file association missing; run `flarm integrity repair`".to_string(),
        ),
        IntegrityStatus::Both => (
            "warn",
            "link handler and package association missing; run `flarm integrity repair`"
                .to_string(),
        ),
    }
}

struct IntegritySystem {
    config: IntegrityConfig,
    store: Box<dyn RegistrationStore>,
    broker: Box<dyn PrivilegeBroker>,
    restart: Box<dyn RestartScheduler>,
}

impl IntegritySystem {
    fn for_host(ctx: &AppContext) -> Result<Self> {
        let exe =
            std::env::current_exe().context("failed to resolve the installer executable")?;
        let mut config = IntegrityConfig::new(exe.clone());
        config.scheme = ctx.config.parser().scheme().to_string();
        config.package_extension = ctx.config.parser().extension().to_string();
        if let Some(icon) = &ctx.config.icon_path {
            config = config.with_icon(icon);
        }

        let restart: Box<dyn RestartScheduler> = Box::new(SystemRestart::new(
            SystemCommands,
            DEFAULT_RESTART_DELAY_SECS,
        ));
        let (store, broker) = host_backends(&exe, ctx)?;
        Ok(Self {
            config,
            store,
            broker,
            restart,
        })
    }

    fn checker(&self) -> IntegrityChecker<'_> {
        IntegrityChecker::new(
            &self.config,
            self.store.as_ref(),
            self.broker.as_ref(),
            self.restart.as_ref(),
        )
    }
}

#[cfg(windows)]
fn host_backends(
    exe: &Path,
    ctx: &AppContext,
) -> Result<(Box<dyn RegistrationStore>, Box<dyn PrivilegeBroker>)> {
    use flarm_integrity::{RegistryStore, RunAsElevation};

    let mut args = Vec::new();
    if let Some(path) = &ctx.config_path {
        args.push("--config".to_string());
        args.push(path.display().to_string());
    }
    args.extend(["integrity".to_string(), "repair".to_string()]);
    let store: Box<dyn RegistrationStore> = Box::new(RegistryStore::new(SystemCommands));
    let broker: Box<dyn PrivilegeBroker> =
        Box::new(RunAsElevation::new(SystemCommands, exe, args));
    Ok((store, broker))
}

#[cfg(target_os = "macos")]
fn host_backends(
    _exe: &Path,
    _ctx: &AppContext,
) -> Result<(Box<dyn RegistrationStore>, Box<dyn PrivilegeBroker>)> {
    use flarm_integrity::{default_applications_dir, LaunchServicesStore, UserSession};

    let store: Box<dyn RegistrationStore> = Box::new(LaunchServicesStore::new(
        SystemCommands,
        default_applications_dir()?,
    ));
    let broker: Box<dyn PrivilegeBroker> = Box::new(UserSession);
    Ok((store, broker))
}

#[cfg(not(any(windows, target_os = "macos")))]
fn host_backends(
    _exe: &Path,
    _ctx: &AppContext,
) -> Result<(Box<dyn RegistrationStore>, Box<dyn PrivilegeBroker>)> {
    use flarm_integrity::{default_data_home, UserSession, XdgStore};

    let store: Box<dyn RegistrationStore> =
        Box::new(XdgStore::new(SystemCommands, default_data_home()?));
    let broker: Box<dyn PrivilegeBroker> = Box::new(UserSession);
    Ok((store, broker))
}
