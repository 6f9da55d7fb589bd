use std::process::Command;

use anyhow::{Context, Result};

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Execute the child process, returning an error if it does not exit successfully.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout as a UTF-8 string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T>;
}

/// Render the program and arguments of a command, for error messages.
pub fn command_display(cmd: &Command) -> String {
    let prog = cmd.get_program().to_string_lossy();
    let args = cmd.get_args().map(|a| a.to_string_lossy());
    crate::shell_join(std::iter::once(prog).chain(args))
}

fn stderr_tail(stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    // Tools like lvm can be extremely chatty; the last line is usually the useful one.
    stderr.lines().last().unwrap_or_default().to_string()
}

impl CommandRunExt for Command {
    fn run(&mut self) -> Result<()> {
        tracing::debug!("exec: {}", command_display(self));
        let o = self
            .output()
            .with_context(|| format!("Spawning {}", command_display(self)))?;
        if !o.status.success() {
            anyhow::bail!(
                "{} failed: {:?}: {}",
                command_display(self),
                o.status,
                stderr_tail(&o.stderr)
            );
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        tracing::debug!("exec: {}", command_display(self));
        let o = self
            .output()
            .with_context(|| format!("Spawning {}", command_display(self)))?;
        if !o.status.success() {
            anyhow::bail!(
                "{} failed: {:?}: {}",
                command_display(self),
                o.status,
                stderr_tail(&o.stderr)
            );
        }
        String::from_utf8(o.stdout).context("Parsing command output as UTF-8")
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let buf = self.run_get_string()?;
        serde_json::from_str(&buf)
            .with_context(|| format!("Parsing output of {}", command_display(self)))
    }
}
