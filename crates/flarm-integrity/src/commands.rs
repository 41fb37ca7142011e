use std::process::Command;

use anyhow::Result;
use flarm_core::{command_output, run_command};

/// Executes host commands for the registration backends. Swapped for a recorder in tests.
pub trait CommandRunner: Send + Sync {
    fn output(&self, command: &mut Command, context: &str) -> Result<Vec<u8>>;

    fn run(&self, command: &mut Command, context: &str) -> Result<()> {
        self.output(command, context).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommands;

impl CommandRunner for SystemCommands {
    fn output(&self, command: &mut Command, context: &str) -> Result<Vec<u8>> {
        command_output(command, context)
    }

    fn run(&self, command: &mut Command, context: &str) -> Result<()> {
        run_command(command, context)
    }
}

/// `program arg1 arg2`, for logs and test assertions.
pub fn describe_command(command: &Command) -> String {
    let mut line = command.get_program().to_string_lossy().into_owned();
    for arg in command.get_args() {
        line.push(' ');
        line.push_str(&arg.to_string_lossy());
    }
    line
}
