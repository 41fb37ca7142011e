use std::path::PathBuf;
use std::process::Command;

use flarm_core::{FlarmError, FlarmResult};
use tracing::debug;

use crate::checker::{
    ElevationGrant, IntegrityConfig, PrivilegeBroker, Registration, RegistrationSnapshot,
    RegistrationStore, SavedEntry,
};
use crate::commands::{describe_command, CommandRunner, SystemCommands};

pub const CLASSES_ROOT: &str = r"HKCU\Software\Classes";
pub const PACKAGE_PROG_ID: &str = "Flarm.Package";
/// Win32 `ERROR_CANCELLED`, what a declined UAC prompt surfaces as.
pub const ERROR_CANCELLED: i32 = 1223;

/// Handler and association under `HKCU\Software\Classes`, read and written with `reg`.
#[derive(Debug, Clone)]
pub struct RegistryStore<R = SystemCommands> {
    runner: R,
    classes_root: String,
}

impl Default for RegistryStore<SystemCommands> {
    fn default() -> Self {
        Self::new(SystemCommands)
    }
}

impl<R: CommandRunner> RegistryStore<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            classes_root: CLASSES_ROOT.to_string(),
        }
    }

    fn scheme_key(&self, config: &IntegrityConfig) -> String {
        format!(r"{}\{}", self.classes_root, config.scheme)
    }

    fn extension_key(&self, config: &IntegrityConfig) -> String {
        format!(
            r"{}\.{}",
            self.classes_root,
            config.package_extension.trim_start_matches('.')
        )
    }

    fn prog_id_key(&self) -> String {
        format!(r"{}\{PACKAGE_PROG_ID}", self.classes_root)
    }

    fn default_value(&self, key: &str) -> Option<String> {
        let mut command = Command::new("reg");
        command.arg("query").arg(key).arg("/ve");
        match self
            .runner
            .output(&mut command, "failed to query Windows registry key")
        {
            Ok(stdout) => parse_reg_default_value(&String::from_utf8_lossy(&stdout)),
            Err(err) => {
                debug!(key, error = %err, "registry key not readable");
                None
            }
        }
    }

    fn default_matches(&self, key: &str, expected: &str) -> bool {
        self.default_value(key)
            .is_some_and(|value| value.eq_ignore_ascii_case(expected))
    }

    fn set_default(&self, key: &str, value: &str) -> FlarmResult<()> {
        let mut command = Command::new("reg");
        command
            .arg("add")
            .arg(key)
            .arg("/ve")
            .arg("/d")
            .arg(value)
            .arg("/f");
        self.write(command, "failed to write Windows registry value")
    }

    fn set_named(&self, key: &str, name: &str, value: &str) -> FlarmResult<()> {
        let mut command = Command::new("reg");
        command
            .arg("add")
            .arg(key)
            .arg("/v")
            .arg(name)
            .arg("/d")
            .arg(value)
            .arg("/f");
        self.write(command, "failed to write Windows registry value")
    }

    fn key_exists(&self, key: &str) -> bool {
        let mut command = Command::new("reg");
        command.arg("query").arg(key);
        self.runner
            .run(&mut command, "failed to query Windows registry key")
            .is_ok()
    }

    fn delete_key(&self, key: &str) -> FlarmResult<()> {
        if !self.key_exists(key) {
            return Ok(());
        }
        let mut command = Command::new("reg");
        command.arg("delete").arg(key).arg("/f");
        self.write(command, "failed to delete Windows registry key")
    }

    /// Every key `register` sets a default on, in write order.
    fn written_keys(&self, registration: Registration, config: &IntegrityConfig) -> Vec<String> {
        match registration {
            Registration::Handler => {
                let scheme_key = self.scheme_key(config);
                let command_key = format!(r"{scheme_key}\shell\open\command");
                vec![scheme_key, command_key]
            }
            Registration::Association => {
                let prog_id = self.prog_id_key();
                vec![
                    self.extension_key(config),
                    prog_id.clone(),
                    format!(r"{prog_id}\DefaultIcon"),
                    format!(r"{prog_id}\shell\open\command"),
                ]
            }
        }
    }

    fn write(&self, mut command: Command, context: &str) -> FlarmResult<()> {
        debug!(command = %describe_command(&command), "writing registry value");
        self.runner
            .run(&mut command, context)
            .map_err(|err| FlarmError::filesystem(&err))
    }
}

impl<R: CommandRunner> RegistrationStore for RegistryStore<R> {
    fn is_registered(
        &self,
        registration: Registration,
        config: &IntegrityConfig,
    ) -> FlarmResult<bool> {
        let open_command = config.open_command();
        let registered = match registration {
            Registration::Handler => {
                let key = format!(r"{}\shell\open\command", self.scheme_key(config));
                self.default_matches(&key, &open_command)
            }
            Registration::Association => {
                let prog_id = self.prog_id_key();
                self.default_matches(&self.extension_key(config), PACKAGE_PROG_ID)
                    && self.default_matches(
                        &format!(r"{prog_id}\shell\open\command"),
                        &open_command,
                    )
                    && self.default_matches(
                        &format!(r"{prog_id}\DefaultIcon"),
                        &config.icon_resource(),
                    )
            }
        };
        Ok(registered)
    }

    fn register(&self, registration: Registration, config: &IntegrityConfig) -> FlarmResult<()> {
        let open_command = config.open_command();
        match registration {
            Registration::Handler => {
                let scheme_key = self.scheme_key(config);
                self.set_default(&scheme_key, "URL:Flarm Package Link")?;
                self.set_named(&scheme_key, "URL Protocol", "")?;
                self.set_default(&format!(r"{scheme_key}\shell\open\command"), &open_command)
            }
            Registration::Association => {
                let prog_id = self.prog_id_key();
                self.set_default(&self.extension_key(config), PACKAGE_PROG_ID)?;
                self.set_default(&prog_id, "Flarm Package")?;
                self.set_default(&format!(r"{prog_id}\DefaultIcon"), &config.icon_resource())?;
                self.set_default(&format!(r"{prog_id}\shell\open\command"), &open_command)
            }
        }
    }

    fn snapshot(
        &self,
        registration: Registration,
        config: &IntegrityConfig,
    ) -> FlarmResult<RegistrationSnapshot> {
        let snapshot = self
            .written_keys(registration, config)
            .into_iter()
            .fold(RegistrationSnapshot::new(registration), |snapshot, key| {
                let previous = self.default_value(&key);
                snapshot.value(key, previous)
            });
        Ok(snapshot)
    }

    /// A key that had no default before the write is treated as absent and deleted.
    fn restore(&self, snapshot: &RegistrationSnapshot) -> FlarmResult<()> {
        for entry in snapshot.entries.iter().rev() {
            match entry {
                SavedEntry::Value {
                    key,
                    previous: Some(value),
                } => self.set_default(key, value)?,
                SavedEntry::Value {
                    key,
                    previous: None,
                } => self.delete_key(key)?,
                SavedEntry::File { path, .. } => {
                    debug!(path = %path.display(), "registry store has no file entries");
                }
            }
        }
        Ok(())
    }

    fn requires_elevation(&self) -> bool {
        true
    }

    fn requires_restart(&self) -> bool {
        true
    }
}

/// Value of `(Default)` in `reg query <key> /ve` output.
pub fn parse_reg_default_value(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let line = line.trim();
        if !line.starts_with("(Default)") {
            return None;
        }
        ["REG_EXPAND_SZ", "REG_SZ"].iter().find_map(|kind| {
            line.find(kind)
                .map(|index| line[index + kind.len()..].trim().to_string())
        })
    })
}

/// Relaunches the installer through the UAC prompt and waits for it.
#[derive(Debug, Clone)]
pub struct RunAsElevation<R = SystemCommands> {
    runner: R,
    program: PathBuf,
    args: Vec<String>,
}

impl<R: CommandRunner> RunAsElevation<R> {
    pub fn new(runner: R, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            runner,
            program: program.into(),
            args,
        }
    }

    /// Prints the helper's exit code, or `ERROR_CANCELLED` when the prompt is declined,
    /// and always exits 0 so the answer travels on stdout.
    fn start_process_script(&self) -> String {
        let args = self
            .args
            .iter()
            .map(|arg| powershell_quote(arg))
            .collect::<Vec<_>>()
            .join(",");
        let mut start = format!(
            "$p = Start-Process -FilePath {} -Verb RunAs -Wait -PassThru -ErrorAction Stop",
            powershell_quote(&self.program.display().to_string())
        );
        if !args.is_empty() {
            start.push_str(&format!(" -ArgumentList {args}"));
        }
        format!(
            "try {{ {start} }} catch {{ Write-Output {ERROR_CANCELLED}; exit 0 }}; \
             Write-Output $p.ExitCode; exit 0"
        )
    }
}

impl<R: CommandRunner> PrivilegeBroker for RunAsElevation<R> {
    fn is_elevated(&self) -> bool {
        let mut command = Command::new("net");
        command.arg("session");
        self.runner
            .run(&mut command, "failed to check for an administrator session")
            .is_ok()
    }

    fn request_elevation(&self) -> FlarmResult<ElevationGrant> {
        let mut command = Command::new("powershell");
        command
            .arg("-NoProfile")
            .arg("-NonInteractive")
            .arg("-Command")
            .arg(self.start_process_script());
        let stdout = self
            .runner
            .output(&mut command, "failed to launch elevated repair")
            .map_err(|err| FlarmError::RepairFailed {
                reason: format!("{err:#}"),
            })?;
        interpret_elevated_exit(&String::from_utf8_lossy(&stdout))
    }
}

/// Maps the exit code printed by the elevation script to a grant.
pub fn interpret_elevated_exit(output: &str) -> FlarmResult<ElevationGrant> {
    let code = output
        .lines()
        .rev()
        .find_map(|line| line.trim().parse::<i32>().ok())
        .ok_or_else(|| FlarmError::RepairFailed {
            reason: format!("elevated repair reported no exit code: '{}'", output.trim()),
        })?;
    match code {
        0 => Ok(ElevationGrant::Delegated),
        ERROR_CANCELLED => Ok(ElevationGrant::Denied {
            reason: "the administrator prompt was declined".to_string(),
        }),
        code => Err(FlarmError::RepairFailed {
            reason: format!("elevated repair exited with code {code}"),
        }),
    }
}

fn powershell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
