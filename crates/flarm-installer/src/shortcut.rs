use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const SHORTCUT_RESERVED_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const ICON_CANDIDATES: &[&str] = &[
    "app/app-icon.png",
    "app/app-icon.ico",
    "app-icon.png",
    "app-icon.ico",
];

/// Creates launchers for installed applications outside the install root.
pub trait ShortcutCreator: Send + Sync {
    fn create_shortcut(&self, target: &Path, name: &str, icon: Option<&Path>) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutStyle {
    /// freedesktop `.desktop` entry.
    DesktopEntry,
    /// macOS `.command` script.
    CommandScript,
    /// Windows `.url` internet shortcut.
    InternetShortcut,
}

impl ShortcutStyle {
    pub fn for_host() -> Self {
        if cfg!(windows) {
            Self::InternetShortcut
        } else if cfg!(target_os = "macos") {
            Self::CommandScript
        } else {
            Self::DesktopEntry
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::DesktopEntry => "desktop",
            Self::CommandScript => "command",
            Self::InternetShortcut => "url",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopShortcuts {
    desktop_dir: PathBuf,
    style: ShortcutStyle,
}

impl DesktopShortcuts {
    pub fn new(desktop_dir: impl Into<PathBuf>, style: ShortcutStyle) -> Self {
        Self {
            desktop_dir: desktop_dir.into(),
            style,
        }
    }

    pub fn desktop_dir(&self) -> &Path {
        &self.desktop_dir
    }
}

impl ShortcutCreator for DesktopShortcuts {
    fn create_shortcut(&self, target: &Path, name: &str, icon: Option<&Path>) -> Result<PathBuf> {
        let name = sanitize_shortcut_name(name);
        if name.is_empty() {
            return Err(anyhow!("shortcut name is empty after sanitizing"));
        }
        fs::create_dir_all(&self.desktop_dir)
            .with_context(|| format!("failed to create {}", self.desktop_dir.display()))?;

        let path = self
            .desktop_dir
            .join(format!("{name}.{}", self.style.extension()));
        let content = match self.style {
            ShortcutStyle::DesktopEntry => render_desktop_entry(target, &name, icon),
            ShortcutStyle::CommandScript => render_command_script(target),
            ShortcutStyle::InternetShortcut => render_internet_shortcut(target, icon),
        };
        fs::write(&path, content.as_bytes())
            .with_context(|| format!("failed to write shortcut {}", path.display()))?;

        #[cfg(unix)]
        if self.style != ShortcutStyle::InternetShortcut {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("failed to mark {} executable", path.display()))?;
        }

        Ok(path)
    }
}

pub fn sanitize_shortcut_name(name: &str) -> String {
    name.chars()
        .filter(|ch| !SHORTCUT_RESERVED_CHARS.contains(ch) && !ch.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Looks for `<app>.exe`, an executable named `<app>`, or `<app>.elf` anywhere under
/// `root` (names compared case-insensitively), then settles for the first `.exe`.
pub fn find_executable(root: &Path, app: &str) -> Option<PathBuf> {
    let files = walk_files(root);
    let app = app.to_ascii_lowercase();
    let exe_name = format!("{app}.exe");
    let elf_name = format!("{app}.elf");

    let named = files.iter().find(|path| {
        let Some(name) = file_name_lower(path) else {
            return false;
        };
        name == exe_name || name == elf_name || (name == app && is_executable(path))
    });
    if let Some(path) = named {
        return Some(path.clone());
    }

    files
        .into_iter()
        .find(|path| file_name_lower(path).is_some_and(|name| name.ends_with(".exe")))
}

pub fn find_icon(root: &Path) -> Option<PathBuf> {
    ICON_CANDIDATES
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|path| path.is_file())
}

fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut entries = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect::<Vec<_>>();
        entries.sort();

        let mut subdirs = Vec::new();
        for path in entries {
            if path.is_dir() {
                subdirs.push(path);
            } else {
                files.push(path);
            }
        }
        pending.extend(subdirs.into_iter().rev());
    }
    files
}

fn file_name_lower(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_ascii_lowercase)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|metadata| metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn render_desktop_entry(target: &Path, name: &str, icon: Option<&Path>) -> String {
    let mut desktop = String::new();
    desktop.push_str("[Desktop Entry]\n");
    desktop.push_str("Type=Application\n");
    desktop.push_str(&format!("Name={name}\n"));
    desktop.push_str(&format!("Exec=\"{}\"\n", target.display()));
    if let Some(dir) = target.parent() {
        desktop.push_str(&format!("Path={}\n", dir.display()));
    }
    if let Some(icon) = icon {
        desktop.push_str(&format!("Icon={}\n", icon.display()));
    }
    desktop.push_str("Terminal=false\n");
    desktop.push_str("Categories=Utility;\n");
    desktop
}

fn render_command_script(target: &Path) -> String {
    let dir = target.parent().unwrap_or(target);
    format!(
        "#!/bin/bash\ncd \"{}\" && exec \"{}\"\n",
        dir.display(),
        target.display()
    )
}

fn render_internet_shortcut(target: &Path, icon: Option<&Path>) -> String {
    let url_path = target.display().to_string().replace('\\', "/");
    let mut content = format!(
        "[InternetShortcut]\nURL=file:///{}\n",
        url_path.trim_start_matches('/')
    );
    if let Some(icon) = icon {
        content.push_str(&format!("IconFile={}\nIconIndex=0\n", icon.display()));
    }
    content
}
