use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use flarm_installer::{InstallEvent, InstallState, StepProgress};
use indicatif::{HumanBytes, HumanCount, ProgressBar, ProgressStyle};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UiMode {
    Plain,
    Interactive,
}

/// Rich output only when stdout is a terminal and `--plain` was not given.
pub(crate) fn current_output_style(force_plain: bool) -> OutputStyle {
    if force_plain || !std::io::stdout().is_terminal() {
        OutputStyle::Plain
    } else {
        OutputStyle::Rich
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
    mode: UiMode,
}

pub(crate) struct TerminalProgress {
    style: OutputStyle,
    label: String,
    unit: ProgressUnit,
    total: Option<u64>,
    current: u64,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ProgressUnit {
    Bytes,
    Entries,
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self {
            style,
            mode: ui_mode_from_style(style),
        }
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_warning(self, message: &str) {
        eprintln!("{}", render_status_line(self.style, "warn", message));
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = render_section_header(self.mode, title) {
            println!();
            let rendered = match self.style {
                OutputStyle::Plain => line,
                OutputStyle::Rich => colorize(section_style(), &line),
            };
            println!("{rendered}");
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn start_progress(self, label: &str, unit: ProgressUnit) -> TerminalProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new(1);
            let template = match unit {
                ProgressUnit::Bytes => {
                    "{spinner:.cyan.bold} {msg:<12} [{bar:20.cyan/blue}] {bytes:>10}/{total_bytes:10} {elapsed_precise}"
                }
                ProgressUnit::Entries => {
                    "{spinner:.cyan.bold} {msg:<12} [{bar:20.cyan/blue}] {pos:>5}/{len:5} {elapsed_precise}"
                }
            };
            if let Ok(style) = ProgressStyle::with_template(template) {
                progress_bar.set_style(
                    style
                        .tick_chars(progress_tick_chars(label))
                        .progress_chars("=>-"),
                );
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        TerminalProgress {
            style: self.style,
            label: label.to_string(),
            unit,
            total: None,
            current: 0,
            progress_bar,
            started_at: Instant::now(),
        }
    }
}

impl TerminalProgress {
    pub(crate) fn set(&mut self, current: u64, total: Option<u64>) {
        self.total = total.or(self.total);
        self.current = match self.total {
            Some(total) => current.min(total),
            None => current,
        };

        let Some(progress_bar) = &self.progress_bar else {
            return;
        };

        let length = self.total.unwrap_or(self.current).max(1);
        progress_bar.set_length(length);
        progress_bar.set_position(self.current.min(length));
    }

    pub(crate) fn finish_success(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };

        progress_bar.finish_and_clear();
        if let Some(line) = render_progress_line(
            self.style,
            &self.label,
            self.unit,
            self.current,
            self.total.unwrap_or(self.current),
            Some(self.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }

    pub(crate) fn finish_abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

/// Turns install engine events into terminal output. One progress bar per step that
/// reports progress.
pub(crate) struct EventRenderer {
    renderer: TerminalRenderer,
    progress: Option<TerminalProgress>,
    last_state: Option<InstallState>,
}

impl EventRenderer {
    pub(crate) fn new(renderer: TerminalRenderer) -> Self {
        Self {
            renderer,
            progress: None,
            last_state: None,
        }
    }

    pub(crate) fn handle(&mut self, event: &InstallEvent) {
        match event {
            InstallEvent::State(state) => self.enter(*state),
            InstallEvent::Progress(progress) => self.advance(progress),
            InstallEvent::Warning(message) => {
                if let Some(progress) = &self.progress {
                    if let Some(bar) = &progress.progress_bar {
                        bar.suspend(|| self.renderer.print_warning(message));
                        return;
                    }
                }
                self.renderer.print_warning(message);
            }
            InstallEvent::Finished(_) => self.finish(),
        }
    }

    /// Clears any live progress bar. Call before printing the final result.
    pub(crate) fn finish(&mut self) {
        if let Some(progress) = self.progress.take() {
            if self.last_state.is_some_and(|state| state == InstallState::Failed) {
                progress.finish_abandon();
            } else {
                progress.finish_success();
            }
        }
    }

    fn enter(&mut self, state: InstallState) {
        if let Some(progress) = self.progress.take() {
            if state == InstallState::Failed {
                progress.finish_abandon();
            } else {
                progress.finish_success();
            }
        }
        self.last_state = Some(state);

        if state.is_terminal() {
            return;
        }
        if self.renderer.style() == OutputStyle::Plain {
            self.renderer.print_status("..", describe_state(state));
        }
        self.progress = progress_unit(state)
            .map(|unit| self.renderer.start_progress(state.as_str(), unit));
    }

    fn advance(&mut self, step: &StepProgress) {
        if self.last_state != Some(step.state) {
            return;
        }
        if let Some(progress) = &mut self.progress {
            progress.set(step.done, step.total);
        }
    }
}

fn progress_unit(state: InstallState) -> Option<ProgressUnit> {
    match state {
        InstallState::Fetching => Some(ProgressUnit::Bytes),
        InstallState::Extracting => Some(ProgressUnit::Entries),
        _ => None,
    }
}

pub(crate) fn describe_state(state: InstallState) -> &'static str {
    match state {
        InstallState::Idle => "waiting",
        InstallState::Resolving => "reading package details",
        InstallState::CheckingCompatibility => "checking platform compatibility",
        InstallState::CheckingInstalled => "looking for an existing install",
        InstallState::Fetching => "downloading package",
        InstallState::Extracting => "unpacking package",
        InstallState::Installing => "moving files into place",
        InstallState::Registering => "creating shortcuts",
        InstallState::Installed => "installed",
        InstallState::Incompatible => "not compatible with this system",
        InstallState::Failed => "failed",
        InstallState::Uninstalling => "removing package",
        InstallState::Uninstalled => "uninstalled",
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn progress_tick_chars(label: &str) -> &'static str {
    match label {
        "fetching" => ".oO@* ",
        "extracting" => "<^>v ",
        _ => "|/-\\ ",
    }
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn progress_bar_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightBlue.into()))
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn ui_mode_from_style(style: OutputStyle) -> UiMode {
    match style {
        OutputStyle::Plain => UiMode::Plain,
        OutputStyle::Rich => UiMode::Interactive,
    }
}

fn render_section_header(mode: UiMode, title: &str) -> Option<String> {
    match mode {
        UiMode::Plain => None,
        UiMode::Interactive => Some(format!("== {title} ==")),
    }
}

fn status_badge(status: &str) -> String {
    match status {
        "ok" => "[OK]".to_string(),
        "warn" => "[WARN]".to_string(),
        "err" => "[ERR]".to_string(),
        _ => "[..]".to_string(),
    }
}

/// Plain lines stay unadorned apart from a `warning:`/`error:` prefix.
pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => match status {
            "warn" => format!("warning: {message}"),
            "err" => format!("error: {message}"),
            _ => message.to_string(),
        },
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

pub(crate) fn render_progress_line(
    style: OutputStyle,
    label: &str,
    unit: ProgressUnit,
    current: u64,
    total: u64,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let width = 18_usize;
    let safe_total = total.max(1);
    let bounded_current = current.min(safe_total);
    let filled = ((bounded_current as usize) * width) / (safe_total as usize);
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        "-".repeat(width.saturating_sub(filled))
    );
    let percent = (bounded_current * 100) / safe_total;
    let counts = match unit {
        ProgressUnit::Bytes => format!("{}/{}", HumanBytes(current), HumanBytes(total)),
        ProgressUnit::Entries => format!("{}/{}", HumanCount(current), HumanCount(total)),
    };
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();

    Some(format!(
        "{} [{}] {:>3}% {}{}",
        colorize(progress_label_style(), label),
        colorize(progress_bar_style(), &bar),
        percent,
        counts,
        suffix
    ))
}
