use std::process::Command;

use flarm_core::{FlarmError, FlarmResult};

use crate::checker::{ElevationGrant, PrivilegeBroker, RestartScheduler};
use crate::commands::{CommandRunner, SystemCommands};

pub const DEFAULT_RESTART_DELAY_SECS: u64 = 60;

/// Asks the OS to restart after a grace period, leaving the user time to save work.
#[derive(Debug, Clone)]
pub struct SystemRestart<R = SystemCommands> {
    runner: R,
    delay_secs: u64,
}

impl<R: CommandRunner> SystemRestart<R> {
    pub fn new(runner: R, delay_secs: u64) -> Self {
        Self { runner, delay_secs }
    }

    pub fn restart_command(&self) -> Command {
        if cfg!(windows) {
            let mut command = Command::new("shutdown");
            command
                .arg("/r")
                .arg("/t")
                .arg(self.delay_secs.to_string())
                .arg("/c")
                .arg("FLARM registered its link handler; restarting to apply it.");
            command
        } else {
            let minutes = self.delay_secs.div_ceil(60).max(1);
            let mut command = Command::new("shutdown");
            command.arg("-r").arg(format!("+{minutes}"));
            command
        }
    }
}

impl<R: CommandRunner> RestartScheduler for SystemRestart<R> {
    fn schedule_restart(&self) -> FlarmResult<()> {
        let mut command = self.restart_command();
        self.runner
            .run(&mut command, "failed to schedule restart")
            .map_err(|err| FlarmError::filesystem(&err))
    }
}

/// Broker for stores that write per-user state and never need elevation.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserSession;

impl PrivilegeBroker for UserSession {
    fn is_elevated(&self) -> bool {
        true
    }

    fn request_elevation(&self) -> FlarmResult<ElevationGrant> {
        Ok(ElevationGrant::Granted)
    }
}
