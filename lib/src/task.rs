use std::{
    ffi::OsStr,
    io::Write,
    process::{Command, Stdio},
};

use anyhow::{Context, Result};
use imgroot_utils::command_display;

pub(crate) struct Task {
    description: String,
    quiet: bool,
    quiet_output: bool,
    cmd: Command,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("description", &self.description)
            .field("cmd", &command_display(&self.cmd))
            .finish()
    }
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        let mut cmd = Command::new(exe.as_ref());
        let description = description.as_ref().to_string();
        // Default to noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description,
            quiet: false,
            quiet_output: false,
            cmd,
        }
    }

    /// Don't print the description.
    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Discard the child's stdout; cryptsetup and lvm are chatty.
    pub(crate) fn quiet_output(mut self) -> Self {
        self.quiet_output = true;
        self
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    fn announce(&self) {
        if !self.quiet {
            println!("{}", self.description);
        }
        tracing::debug!("exec: {}", command_display(&self.cmd));
    }

    /// Run the command, returning an error if the command does not exit successfully.
    pub(crate) fn run(self) -> Result<()> {
        self.run_with_stdin_buf(None)
    }

    /// Like [`Self::run()`], but feed the provided buffer to the child's stdin.
    pub(crate) fn run_with_stdin_buf(self, stdin: Option<&[u8]>) -> Result<()> {
        self.announce();
        let description = self.description;
        let mut cmd = self.cmd;
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        if self.quiet_output {
            cmd.stdout(Stdio::null());
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Spawning {description} failed"))?;
        if let Some(buf) = stdin {
            // Dropping the handle closes the pipe so the child sees EOF.
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow::anyhow!("Missing stdin for {description}"))?;
            stdin.write_all(buf)?;
        }
        let st = child.wait()?;
        if !st.success() {
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(())
    }
}
