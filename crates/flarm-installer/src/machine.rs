use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flarm_core::{
    check_compatibility, ArchiveBackend, Compatibility, Endpoints, ErrorKind, ExtractedMetadata,
    FlarmError, FlarmResult, MetadataExtractor, PackageReference, PackageSource, Platform,
    ReferenceParser, Transport, DESCRIPTOR_FILE_NAME,
};
use tracing::{debug, info, warn};

use crate::layout::InstallLayout;
use crate::locator::{find_installed, remove_receipt, write_receipt, InstallIdentity};
use crate::registrations::{
    remove_registrations, write_registrations, RegistrationRecord, KIND_DESKTOP_SHORTCUT,
};
use crate::reservation::{retire_package_dir, IdentityLock, Reservation};
use crate::shortcut::{find_executable, find_icon, ShortcutCreator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallState {
    Idle,
    Resolving,
    CheckingCompatibility,
    CheckingInstalled,
    Fetching,
    Extracting,
    Installing,
    Registering,
    Installed,
    Incompatible,
    Failed,
    Uninstalling,
    Uninstalled,
}

impl InstallState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::CheckingCompatibility => "checking-compatibility",
            Self::CheckingInstalled => "checking-installed",
            Self::Fetching => "fetching",
            Self::Extracting => "extracting",
            Self::Installing => "installing",
            Self::Registering => "registering",
            Self::Installed => "installed",
            Self::Incompatible => "incompatible",
            Self::Failed => "failed",
            Self::Uninstalling => "uninstalling",
            Self::Uninstalled => "uninstalled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Installed | Self::Incompatible | Self::Failed | Self::Uninstalled
        )
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use InstallState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Resolving)
                | (Idle, Uninstalling)
                | (Resolving, CheckingCompatibility)
                | (CheckingCompatibility, CheckingInstalled)
                | (CheckingCompatibility, Incompatible)
                | (CheckingInstalled, Fetching)
                | (CheckingInstalled, Installed)
                | (Fetching, Extracting)
                | (Extracting, Installing)
                | (Installing, Registering)
                | (Registering, Installed)
                | (Uninstalling, Uninstalled)
        )
    }
}

/// Progress within one step: bytes while fetching, archive entries while extracting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepProgress {
    pub state: InstallState,
    pub done: u64,
    pub total: Option<u64>,
}

#[derive(Debug)]
pub enum InstallEvent {
    State(InstallState),
    Progress(StepProgress),
    Warning(String),
    /// Always the last event of an operation.
    Finished(FlarmResult<InstallOutcome>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed {
        identity: InstallIdentity,
        path: PathBuf,
        already_installed: bool,
        warnings: Vec<String>,
    },
    Uninstalled {
        identity: InstallIdentity,
        path: PathBuf,
        warnings: Vec<String>,
    },
}

impl InstallOutcome {
    pub fn identity(&self) -> &InstallIdentity {
        match self {
            Self::Installed { identity, .. } | Self::Uninstalled { identity, .. } => identity,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Installed { path, .. } | Self::Uninstalled { path, .. } => path,
        }
    }

    pub fn warnings(&self) -> &[String] {
        match self {
            Self::Installed { warnings, .. } | Self::Uninstalled { warnings, .. } => warnings,
        }
    }
}

/// Cooperative cancellation, observed between steps and from progress callbacks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> FlarmResult<()> {
        if self.is_cancelled() {
            return Err(FlarmError::Cancelled);
        }
        Ok(())
    }

    fn flow(&self) -> ControlFlow<()> {
        if self.is_cancelled() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

/// Orders everything one operation publishes: states only move along legal transitions
/// and progress within a step never goes backwards.
struct EventSink {
    sender: Option<Sender<InstallEvent>>,
    state: InstallState,
    last_progress: Option<(u64, Option<u64>)>,
    warnings: Vec<String>,
}

impl EventSink {
    fn new(sender: Option<Sender<InstallEvent>>) -> Self {
        Self {
            sender,
            state: InstallState::Idle,
            last_progress: None,
            warnings: Vec::new(),
        }
    }

    fn send(&self, event: InstallEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }

    fn transition(&mut self, next: InstallState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        info!(from = self.state.as_str(), to = next.as_str(), "state changed");
        self.state = next;
        self.last_progress = None;
        self.send(InstallEvent::State(next));
    }

    fn progress(&mut self, done: u64, total: Option<u64>) {
        let (done, total) = match self.last_progress {
            Some((last_done, last_total)) => {
                let total = last_total.or(total);
                let done = done.max(last_done);
                (total.map_or(done, |total| done.min(total)), total)
            }
            None => (total.map_or(done, |total| done.min(total)), total),
        };
        if self.last_progress == Some((done, total)) {
            return;
        }
        self.last_progress = Some((done, total));
        self.send(InstallEvent::Progress(StepProgress {
            state: self.state,
            done,
            total,
        }));
    }

    fn warn(&mut self, message: String) {
        warn!(state = self.state.as_str(), "{message}");
        self.send(InstallEvent::Warning(message.clone()));
        self.warnings.push(message);
    }

    fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    fn settle<T>(&mut self, result: FlarmResult<T>) -> FlarmResult<T> {
        if let Err(err) = &result {
            let terminal = if err.kind() == ErrorKind::Incompatible {
                InstallState::Incompatible
            } else {
                InstallState::Failed
            };
            warn!(kind = err.kind().as_str(), error = %err, "operation stopped");
            self.transition(terminal);
        }
        result
    }
}

pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub archives: Arc<dyn ArchiveBackend>,
    pub source: Arc<dyn PackageSource>,
    /// `None` skips desktop shortcuts during `Registering`.
    pub shortcuts: Option<Arc<dyn ShortcutCreator>>,
}

/// What the engine knows about a package before touching the install root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub extracted: ExtractedMetadata,
    pub compatibility: Compatibility,
    pub identity: InstallIdentity,
    pub installed: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageView {
    Install,
    Installed(PathBuf),
    Incompatible(String),
}

impl Inspection {
    pub fn view(&self) -> PackageView {
        if let Some(path) = &self.installed {
            return PackageView::Installed(path.clone());
        }
        match &self.compatibility {
            Compatibility::Compatible => PackageView::Install,
            Compatibility::Incompatible { reason } => PackageView::Incompatible(reason.clone()),
        }
    }
}

/// Runs install and uninstall pipelines against one install root. The root and the
/// running platform are fixed at construction.
pub struct Installer {
    layout: InstallLayout,
    running: Platform,
    parser: ReferenceParser,
    endpoints: Endpoints,
    transport: Arc<dyn Transport>,
    archives: Arc<dyn ArchiveBackend>,
    source: Arc<dyn PackageSource>,
    shortcuts: Option<Arc<dyn ShortcutCreator>>,
}

impl Installer {
    pub fn new(layout: InstallLayout, running: Platform, collaborators: Collaborators) -> Self {
        Self {
            layout,
            running,
            parser: ReferenceParser::default(),
            endpoints: Endpoints::default(),
            transport: collaborators.transport,
            archives: collaborators.archives,
            source: collaborators.source,
            shortcuts: collaborators.shortcuts,
        }
    }

    pub fn with_parser(mut self, parser: ReferenceParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn running_platform(&self) -> Platform {
        self.running
    }

    pub fn parser(&self) -> &ReferenceParser {
        &self.parser
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn parse(&self, input: &str) -> FlarmResult<PackageReference> {
        self.parser.parse(input)
    }

    /// Resolves package metadata without looking at the install root.
    pub fn metadata(&self, reference: &PackageReference) -> FlarmResult<ExtractedMetadata> {
        self.extractor().extract(reference)
    }

    pub fn inspect(&self, reference: &PackageReference) -> FlarmResult<Inspection> {
        let extracted = self.metadata(reference)?;
        let compatibility = check_compatibility(
            &extracted.metadata.platform_requirement(),
            self.running,
        );
        let identity = InstallIdentity::from_metadata(&extracted.metadata)?;
        let installed = find_installed(&self.layout, &identity)?;
        Ok(Inspection {
            extracted,
            compatibility,
            identity,
            installed,
        })
    }

    pub fn install(
        &self,
        reference: &PackageReference,
        cancel: &CancelToken,
        events: Option<&Sender<InstallEvent>>,
    ) -> FlarmResult<InstallOutcome> {
        let mut sink = EventSink::new(events.cloned());
        let result = self.run_install(reference, cancel, &mut sink);
        sink.settle(result)
    }

    pub fn uninstall(
        &self,
        identity: &InstallIdentity,
        cancel: &CancelToken,
        events: Option<&Sender<InstallEvent>>,
    ) -> FlarmResult<InstallOutcome> {
        let mut sink = EventSink::new(events.cloned());
        let result = self.run_uninstall(identity, cancel, &mut sink);
        sink.settle(result)
    }

    /// Runs the install pipeline on a worker thread.
    pub fn spawn_install(self: &Arc<Self>, reference: PackageReference) -> OperationHandle {
        let installer = Arc::clone(self);
        OperationHandle::spawn(move |cancel, events| {
            installer.install(&reference, &cancel, Some(&events))
        })
    }

    pub fn spawn_uninstall(self: &Arc<Self>, identity: InstallIdentity) -> OperationHandle {
        let installer = Arc::clone(self);
        OperationHandle::spawn(move |cancel, events| {
            installer.uninstall(&identity, &cancel, Some(&events))
        })
    }

    fn extractor(&self) -> MetadataExtractor<'_> {
        MetadataExtractor::new(
            self.transport.as_ref(),
            self.archives.as_ref(),
            &self.endpoints,
        )
    }

    fn run_install(
        &self,
        reference: &PackageReference,
        cancel: &CancelToken,
        sink: &mut EventSink,
    ) -> FlarmResult<InstallOutcome> {
        sink.transition(InstallState::Resolving);
        let extracted = self.extractor().extract(reference)?;
        for warning in &extracted.warnings {
            sink.warn(warning.clone());
        }
        let metadata = &extracted.metadata;
        let identity = InstallIdentity::from_metadata(metadata)?;
        cancel.check()?;

        sink.transition(InstallState::CheckingCompatibility);
        if let Compatibility::Incompatible { reason } =
            check_compatibility(&metadata.platform_requirement(), self.running)
        {
            return Err(FlarmError::Incompatible { reason });
        }

        sink.transition(InstallState::CheckingInstalled);
        if let Some(path) = find_installed(&self.layout, &identity)? {
            info!(identity = %identity, path = %path.display(), "package is already installed");
            sink.transition(InstallState::Installed);
            return Ok(InstallOutcome::Installed {
                identity,
                path,
                already_installed: true,
                warnings: sink.take_warnings(),
            });
        }
        cancel.check()?;

        let reservation = Reservation::reserve(&self.layout, &identity)?;

        sink.transition(InstallState::Fetching);
        let archive = self.fetch(reference, &reservation, cancel, sink)?;
        cancel.check()?;

        sink.transition(InstallState::Extracting);
        let content = reservation.content_dir();
        self.archives.extract(&archive, &content, &mut |progress| {
            sink.progress(progress.entries_done, progress.entries_total);
            cancel.flow()
        })?;
        cancel.check()?;

        sink.transition(InstallState::Installing);
        let descriptor_path = content.join(DESCRIPTOR_FILE_NAME);
        fs::write(&descriptor_path, &extracted.descriptor).map_err(|err| {
            FlarmError::io(
                format!("failed to write {}", descriptor_path.display()),
                err,
            )
        })?;
        cancel.check()?;
        let path = reservation.commit()?;
        info!(identity = %identity, path = %path.display(), "package installed");
        if let Err(err) = write_receipt(&self.layout, &identity) {
            warn!(identity = %identity, error = %err, "install receipt not written");
        }

        sink.transition(InstallState::Registering);
        self.register(&identity, &extracted, &path, sink);

        sink.transition(InstallState::Installed);
        Ok(InstallOutcome::Installed {
            identity,
            path,
            already_installed: false,
            warnings: sink.take_warnings(),
        })
    }

    fn fetch(
        &self,
        reference: &PackageReference,
        reservation: &Reservation,
        cancel: &CancelToken,
        sink: &mut EventSink,
    ) -> FlarmResult<PathBuf> {
        match reference {
            PackageReference::Local { path } => {
                if let Ok(metadata) = fs::metadata(path) {
                    sink.progress(metadata.len(), Some(metadata.len()));
                }
                Ok(path.clone())
            }
            PackageReference::Remote(coordinate) => {
                let selected = self.source.resolve_asset(coordinate, self.running)?;
                let dest = reservation.download_path(&selected.asset.name);
                debug!(
                    asset = %selected.asset.name,
                    url = %selected.asset.download_url,
                    dest = %dest.display(),
                    "downloading package"
                );
                self.transport
                    .fetch_with_progress(&selected.asset.download_url, &dest, &mut |progress| {
                        sink.progress(progress.bytes_done, progress.bytes_total);
                        cancel.flow()
                    })?;
                Ok(dest)
            }
        }
    }

    fn register(
        &self,
        identity: &InstallIdentity,
        extracted: &ExtractedMetadata,
        install_dir: &Path,
        sink: &mut EventSink,
    ) {
        let Some(shortcuts) = &self.shortcuts else {
            debug!("desktop shortcuts disabled");
            return;
        };
        let metadata = &extracted.metadata;
        let Some(executable) = find_executable(install_dir, &metadata.app) else {
            sink.warn(
                FlarmError::RegistrationFailed {
                    reason: format!(
                        "no executable for '{}' found; desktop shortcut skipped",
                        metadata.app
                    ),
                }
                .to_string(),
            );
            return;
        };

        let icon = find_icon(install_dir);
        let shortcut =
            match shortcuts.create_shortcut(&executable, metadata.display_name(), icon.as_deref())
            {
                Ok(shortcut) => shortcut,
                Err(err) => {
                    sink.warn(
                        FlarmError::RegistrationFailed {
                            reason: format!("{err:#}"),
                        }
                        .to_string(),
                    );
                    return;
                }
            };
        info!(shortcut = %shortcut.display(), "desktop shortcut created");

        let records = [RegistrationRecord {
            key: "shortcut:desktop".to_string(),
            kind: KIND_DESKTOP_SHORTCUT.to_string(),
            path: shortcut.display().to_string(),
        }];
        if let Err(err) =
            write_registrations(&self.layout, &identity.canonical_folder_name(), &records)
        {
            sink.warn(
                FlarmError::RegistrationFailed {
                    reason: format!("{err:#}"),
                }
                .to_string(),
            );
        }
    }

    fn run_uninstall(
        &self,
        identity: &InstallIdentity,
        cancel: &CancelToken,
        sink: &mut EventSink,
    ) -> FlarmResult<InstallOutcome> {
        sink.transition(InstallState::Uninstalling);
        let not_installed = || FlarmError::NotInstalled {
            identity: identity.canonical_folder_name(),
            root: self.layout.root().to_path_buf(),
        };

        let path = find_installed(&self.layout, identity)?.ok_or_else(not_installed)?;
        let _lock = IdentityLock::acquire(&self.layout, identity)?;
        if !path.is_dir() {
            return Err(not_installed());
        }
        cancel.check()?;

        if let Some(leftover) = retire_package_dir(&self.layout, &path)? {
            sink.warn(leftover);
        }

        let canonical = identity.canonical_folder_name();
        match remove_registrations(&self.layout, &canonical) {
            Ok(warnings) => {
                for warning in warnings {
                    sink.warn(FlarmError::RegistrationFailed { reason: warning }.to_string());
                }
            }
            Err(err) => sink.warn(
                FlarmError::RegistrationFailed {
                    reason: format!("{err:#}"),
                }
                .to_string(),
            ),
        }
        if let Err(err) = remove_receipt(&self.layout, &canonical) {
            warn!(identity = %identity, error = %err, "install receipt not removed");
        }
        info!(identity = %identity, path = %path.display(), "package uninstalled");

        sink.transition(InstallState::Uninstalled);
        Ok(InstallOutcome::Uninstalled {
            identity: identity.clone(),
            path,
            warnings: sink.take_warnings(),
        })
    }
}

/// A running install or uninstall. Events arrive in order on one channel and end with
/// [`InstallEvent::Finished`].
pub struct OperationHandle {
    events: Receiver<InstallEvent>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl OperationHandle {
    fn spawn<F>(operation: F) -> Self
    where
        F: FnOnce(CancelToken, Sender<InstallEvent>) -> FlarmResult<InstallOutcome>
            + Send
            + 'static,
    {
        let (sender, events) = mpsc::channel();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let worker = thread::spawn(move || {
            let result = operation(worker_cancel, sender.clone());
            let _ = sender.send(InstallEvent::Finished(result));
        });
        Self {
            events,
            cancel,
            worker: Some(worker),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn events(&self) -> &Receiver<InstallEvent> {
        &self.events
    }

    /// Forwards every event to `on_event` until the operation finishes.
    pub fn wait(mut self, mut on_event: impl FnMut(&InstallEvent)) -> FlarmResult<InstallOutcome> {
        loop {
            match self.events.recv() {
                Ok(InstallEvent::Finished(result)) => {
                    self.join();
                    return result;
                }
                Ok(event) => on_event(&event),
                Err(_) => {
                    self.join();
                    return Err(FlarmError::Filesystem {
                        reason: "install worker stopped without reporting a result".to_string(),
                    });
                }
            }
        }
    }

    fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("install worker panicked");
            }
        }
    }
}
