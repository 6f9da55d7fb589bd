//! Prepare a mounted root for `chroot`: kernel pseudo-filesystems and DNS.

use std::io::ErrorKind;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::host::{Host, MountRequest};
use crate::ledger::{Ledger, Resource};
use crate::model::{MountKind, MountRecord, ResolvConfOriginal, ResolvConfRecord};

/// Host directories bound into the target, in mount order.
const PSEUDO_FILESYSTEMS: &[&str] = &["/proc", "/sys", "/dev", "/dev/pts"];

const RESOLV_CONF: &str = "etc/resolv.conf";
const RESOLV_CONF_BACKUP: &str = "etc/resolv.conf.imgroot-backup";

/// Bind the host's pseudo-filesystems into `root`.
///
/// A failed bind is logged and skipped; the chroot is still usable for most things.
pub(crate) fn bind_pseudo_filesystems(host: &dyn Host, ledger: &mut Ledger, root: &Utf8Path) {
    for src in PSEUDO_FILESYSTEMS {
        let target = root.join(src.trim_start_matches('/'));
        let r = std::fs::create_dir_all(&target)
            .with_context(|| format!("Creating {target}"))
            .and_then(|_| host.mount(&MountRequest::new(*src, &target).bind()));
        match r {
            Ok(()) => ledger.push_mount(MountRecord {
                target,
                source: src.to_string(),
                fstype: None,
                options: None,
                kind: MountKind::Bind,
                ordinal: 0,
            }),
            Err(e) => tracing::warn!("Binding {src}: {e:#}"),
        }
    }
}

/// Replace the target's `resolv.conf` with the host's, remembering the original.
#[context("Replacing resolv.conf in {root}")]
pub(crate) fn replace_resolv_conf(
    ledger: &mut Ledger,
    root: &Utf8Path,
    host_resolv_conf: &Utf8Path,
) -> Result<()> {
    // Read first so that nothing is touched if the host has no resolver config
    let contents = std::fs::read(host_resolv_conf)
        .with_context(|| format!("Reading {host_resolv_conf}"))?;
    let path = root.join(RESOLV_CONF);
    let original = match path.symlink_metadata() {
        Ok(m) if m.file_type().is_symlink() => {
            let target = path
                .read_link_utf8()
                .with_context(|| format!("Reading link {path}"))?;
            std::fs::remove_file(&path).with_context(|| format!("Removing {path}"))?;
            ResolvConfOriginal::Symlink { target }
        }
        Ok(m) if m.is_file() => {
            let backup = root.join(RESOLV_CONF_BACKUP);
            std::fs::rename(&path, &backup).with_context(|| format!("Backing up {path}"))?;
            ResolvConfOriginal::File { backup }
        }
        Ok(_) => anyhow::bail!("{path} is not a regular file"),
        Err(e) if e.kind() == ErrorKind::NotFound => ResolvConfOriginal::Absent,
        Err(e) => return Err(e).with_context(|| format!("Querying {path}")),
    };
    let record = ResolvConfRecord {
        path: path.clone(),
        original,
    };
    if let Err(e) = std::fs::write(&path, contents) {
        // Put things back before reporting
        restore_resolv_conf(&record)?;
        return Err(e).with_context(|| format!("Writing {path}"));
    }
    ledger.push(Resource::ResolvConf(record));
    Ok(())
}

/// Undo [`replace_resolv_conf`].
#[context("Restoring {}", rec.path)]
pub(crate) fn restore_resolv_conf(rec: &ResolvConfRecord) -> Result<()> {
    let path = &rec.path;
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Removing {path}")),
    }
    match &rec.original {
        ResolvConfOriginal::File { backup } => {
            std::fs::rename(backup, path).with_context(|| format!("Restoring from {backup}"))
        }
        ResolvConfOriginal::Symlink { target } => std::os::unix::fs::symlink(target, path)
            .with_context(|| format!("Linking {path} to {target}")),
        ResolvConfOriginal::Absent => Ok(()),
    }
}
