use std::process::Command;

use anyhow::{anyhow, Context, Result};

pub fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    command_output(command, context_message).map(|_| ())
}

/// Runs `command` to completion and returns its stdout.
pub fn command_output(command: &mut Command, context_message: &str) -> Result<Vec<u8>> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(output.stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}
