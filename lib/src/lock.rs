//! Single-instance lock for everything that touches devices.
//!
//! The lock file carries the PID of the holder so a blocked invocation can say who it is
//! waiting for. It does not make the nbd slot scan atomic against tools other than
//! imgroot; the connect retry loop absorbs those collisions.

use std::fs::File;
use std::io::{Read, Seek, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use rustix::fs::{flock, FlockOperation};

#[derive(Debug)]
pub(crate) struct StateLock {
    file: File,
    path: Utf8PathBuf,
}

impl StateLock {
    /// Take the lock in `state_dir`, failing if another process holds it.
    pub(crate) fn acquire(state_dir: &Utf8Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir).with_context(|| format!("Creating {state_dir}"))?;
        let path = state_dir.join("lock");
        let mut file = File::options()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Opening {path}"))?;
        match flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {}
            Err(e) if e == rustix::io::Errno::WOULDBLOCK => {
                let mut holder = String::new();
                let _ = file.read_to_string(&mut holder);
                let holder = holder.trim();
                if holder.is_empty() {
                    anyhow::bail!("Another imgroot process holds {path}");
                }
                anyhow::bail!("Another imgroot process (pid {holder}) holds {path}");
            }
            Err(e) => return Err(e).with_context(|| format!("Locking {path}")),
        }
        file.set_len(0)?;
        file.rewind()?;
        writeln!(file, "{}", std::process::id())?;
        tracing::debug!("Acquired {path}");
        Ok(Self { file, path })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        // The lock itself goes away with the descriptor
        tracing::debug!("Releasing {}", self.path);
    }
}
