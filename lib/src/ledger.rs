//! # Resource ledger
//!
//! Every resource a session acquires is pushed here, in acquisition order.
//! [`Ledger::teardown`] is the only place resources are released at the
//! end of a session; it never fails, and running it again on an empty (or
//! already partially released) ledger is a no-op.
//!
//! The ledger is also journaled to the state directory after every change,
//! so that `imgroot cleanup` can release what a crashed or `--keep` session
//! left behind.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::host::{Host, UnmountMode};
use crate::model::{
    BlockDeviceHandle, LuksMapping, MountKind, MountRecord, ResolvConfRecord, VolumeGroup,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource", rename_all = "kebab-case")]
pub(crate) enum Resource {
    BlockDevice(BlockDeviceHandle),
    Luks(LuksMapping),
    VolumeGroup(VolumeGroup),
    /// An ephemeral directory we created under the temporary root.
    Directory { path: Utf8PathBuf },
    Mount(MountRecord),
    ResolvConf(ResolvConfRecord),
}

/// Teardown runs phase by phase; lower phases are released first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Phase {
    ResolvConf,
    BindMount,
    FilesystemMount,
    Directory,
    VolumeGroup,
    Luks,
    BlockDevice,
}

impl Resource {
    pub(crate) fn phase(&self) -> Phase {
        match self {
            Resource::ResolvConf(_) => Phase::ResolvConf,
            Resource::Mount(m) if m.kind == MountKind::Bind => Phase::BindMount,
            Resource::Mount(_) => Phase::FilesystemMount,
            Resource::Directory { .. } => Phase::Directory,
            Resource::VolumeGroup(_) => Phase::VolumeGroup,
            Resource::Luks(_) => Phase::Luks,
            Resource::BlockDevice(_) => Phase::BlockDevice,
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Resource::BlockDevice(h) => format!("block device {} ({})", h.device, h.image),
            Resource::Luks(l) => format!("LUKS mapping {} ({})", l.name, l.source),
            Resource::VolumeGroup(v) => format!("volume group {}", v.name),
            Resource::Directory { path } => format!("directory {path}"),
            Resource::Mount(m) if m.kind == MountKind::Bind => format!("bind mount {}", m.target),
            Resource::Mount(m) => format!("mount {} on {}", m.source, m.target),
            Resource::ResolvConf(r) => format!("resolv.conf override {}", r.path),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Ledger {
    pub(crate) session: String,
    entries: Vec<Resource>,
    /// Monotonic count of everything ever pushed; used for mount ordinals.
    acquired: usize,
    #[serde(skip)]
    journal: Option<Utf8PathBuf>,
}

/// The outcome of a teardown; teardown itself never fails.
#[derive(Debug, Default)]
pub(crate) struct TeardownReport {
    pub(crate) released: Vec<Resource>,
    pub(crate) failed: Vec<(Resource, String)>,
}

impl TeardownReport {
    pub(crate) fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Ledger {
    pub(crate) fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            ..Default::default()
        }
    }

    /// Persist the ledger to `path` after every change from now on.
    pub(crate) fn journal_to(&mut self, path: impl Into<Utf8PathBuf>) -> Result<()> {
        let path = path.into();
        crate::statefile::write(&path, self)?;
        self.journal = Some(path);
        Ok(())
    }

    pub(crate) fn journal(&self) -> Option<&Utf8Path> {
        self.journal.as_deref()
    }

    /// Stop journaling and remove the journal file.
    pub(crate) fn discard_journal(&mut self) -> Result<()> {
        if let Some(p) = self.journal.take() {
            crate::statefile::remove(&p)?;
        }
        Ok(())
    }

    fn sync_journal(&self) {
        if let Some(p) = self.journal.as_deref() {
            if let Err(e) = crate::statefile::write(p, self) {
                tracing::warn!("Failed to update session state {p}: {e:#}");
            }
        }
    }

    pub(crate) fn push(&mut self, mut r: Resource) {
        if let Resource::Mount(m) = &mut r {
            m.ordinal = self.acquired;
        }
        self.acquired += 1;
        tracing::debug!("acquired {}", r.describe());
        self.entries.push(r);
        self.sync_journal();
    }

    pub(crate) fn push_mount(&mut self, m: MountRecord) {
        self.push(Resource::Mount(m))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> &[Resource] {
        &self.entries
    }

    pub(crate) fn mounts(&self) -> impl Iterator<Item = &MountRecord> {
        self.entries.iter().filter_map(|r| match r {
            Resource::Mount(m) => Some(m),
            _ => None,
        })
    }

    /// Release the most recently acquired resource right away; used when
    /// setup backs out of an attempt (scratch mounts, rejected roots).
    pub(crate) fn release_last(&mut self, host: &dyn Host) -> Result<()> {
        let Some(r) = self.entries.pop() else {
            return Ok(());
        };
        let res = release(host, &r);
        if res.is_err() {
            // Keep it so the final teardown gets another try
            self.entries.push(r);
        }
        self.sync_journal();
        res
    }

    /// Release everything, phase by phase, most recent first within a phase.
    ///
    /// Failures are logged and collected; every remaining release is still attempted.
    pub(crate) fn teardown(&mut self, host: &dyn Host) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.entries.is_empty() {
            return report;
        }
        let mut order: Vec<Resource> = self.entries.drain(..).rev().collect();
        // Stable, so acquisition order is preserved (reversed) within a phase
        order.sort_by_key(|r| r.phase());
        for r in order {
            match release(host, &r) {
                Ok(()) => {
                    tracing::debug!("released {}", r.describe());
                    report.released.push(r);
                }
                Err(e) => {
                    let msg = format!("{e:#}");
                    tracing::warn!("Failed to release {}: {msg}", r.describe());
                    report.failed.push((r, msg));
                }
            }
        }
        self.sync_journal();
        report
    }

    /// Put resources that could not be released back, so a later cleanup can retry.
    pub(crate) fn retain_failed(&mut self, report: &TeardownReport) {
        // Re-push in acquisition order; the report lists them in release order
        for (r, _) in report.failed.iter().rev() {
            self.entries.push(r.clone());
        }
        self.sync_journal();
    }
}

fn release(host: &dyn Host, r: &Resource) -> Result<()> {
    match r {
        Resource::ResolvConf(rec) => crate::chroot::restore_resolv_conf(rec),
        Resource::Mount(m) => release_mount(host, m),
        Resource::Directory { path } => match std::fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Removing {path}")),
        },
        Resource::VolumeGroup(vg) if vg.activated_by_session => host.vg_deactivate(&vg.name),
        Resource::VolumeGroup(vg) => {
            tracing::debug!("Leaving volume group {} active", vg.name);
            Ok(())
        }
        Resource::Luks(l) if l.open => host.luks_close(&l.name),
        Resource::Luks(l) => {
            tracing::debug!("{} is not open", l.name);
            Ok(())
        }
        Resource::BlockDevice(h) => host.nbd_disconnect(&h.device),
    }
}

fn release_mount(host: &dyn Host, m: &MountRecord) -> Result<()> {
    let err = match host.unmount(&m.target, UnmountMode::Normal) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if !m.is_btrfs() {
        return Err(err);
    }
    tracing::debug!("Unmounting {} failed ({err:#}); retrying lazily", m.target);
    match host.unmount(&m.target, UnmountMode::RecursiveLazy) {
        Ok(()) => Ok(()),
        Err(lazy_err) => {
            match host.blocking_processes(&m.target) {
                Ok(procs) => tracing::warn!("{} is busy:\n{}", m.target, procs.trim_end()),
                Err(e) => tracing::debug!("Listing processes using {}: {e:#}", m.target),
            }
            Err(lazy_err).with_context(|| format!("Unmounting {}", m.target))
        }
    }
}
