//! # Image sessions
//!
//! A [`Session`] owns the [`Ledger`] for one attached image and drives the
//! pipeline: connect, survey, classify, unlock/activate, mount, prepare the
//! chroot. Dropping the session tears everything down exactly once, whether
//! setup succeeded, failed half way, or was interrupted; [`Session::keep`]
//! opts out of that and leaves the state file for `imgroot cleanup`.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::chroot;
use crate::classify::{classify, Classification, Thresholds};
use crate::config::Settings;
use crate::connector::{self, ConnectOptions};
use crate::host::Host;
use crate::interrupt::Interrupt;
use crate::ledger::{Ledger, Resource, TeardownReport};
use crate::model::{BlockDeviceHandle, DiskLayout, ImageFormat, PartitionInfo};
use crate::mounter::Mounter;
use crate::prompt::Prompt;
use crate::statefile;
use crate::survey::survey;
use crate::volumes::{resolve_root, RootCandidate, RootOverrides, VolumeOptions};

/// What to attach and how to assemble it.
#[derive(Debug, Clone, Default)]
pub(crate) struct MountOptions {
    pub(crate) image: Utf8PathBuf,
    pub(crate) format: Option<ImageFormat>,
    pub(crate) device: Option<Utf8PathBuf>,
    pub(crate) overrides: RootOverrides,
    pub(crate) subvol: Option<String>,
    /// Don't mount `/boot` or the ESP.
    pub(crate) no_boot: bool,
}

/// The ephemeral directories of one session.
#[derive(Debug, Clone)]
pub(crate) struct Workdir {
    pub(crate) base: Utf8PathBuf,
    pub(crate) root: Utf8PathBuf,
    pub(crate) scratch: Utf8PathBuf,
}

/// A root filesystem ready for `chroot`.
#[derive(Debug)]
pub(crate) struct Prepared {
    pub(crate) handle: BlockDeviceHandle,
    pub(crate) root_device: RootCandidate,
    pub(crate) workdir: Workdir,
}

/// The result of attaching and classifying an image.
#[derive(Debug)]
pub(crate) struct Attached {
    pub(crate) handle: BlockDeviceHandle,
    pub(crate) layout: DiskLayout,
    pub(crate) classification: Classification,
}

/// A short random identifier, used in mapping names and paths.
pub(crate) fn new_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

pub(crate) struct Session<'a> {
    host: &'a dyn Host,
    settings: &'a Settings,
    interrupt: Interrupt,
    id: String,
    ledger: Ledger,
    keep: bool,
    torn_down: bool,
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("resources", &self.ledger.len())
            .finish()
    }
}

impl<'a> Session<'a> {
    pub(crate) fn new(host: &'a dyn Host, settings: &'a Settings, interrupt: Interrupt) -> Self {
        let id = new_session_id();
        Self {
            host,
            settings,
            interrupt,
            ledger: Ledger::new(id.clone()),
            id,
            keep: false,
            torn_down: false,
        }
    }

    /// Journal the ledger to the state directory from now on.
    #[context("Initializing session state")]
    pub(crate) fn journaled(mut self) -> Result<Self> {
        let dir = &self.settings.state_dir;
        std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;
        self.ledger
            .journal_to(statefile::session_path(dir, &self.id))?;
        Ok(self)
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Connect the image, survey and classify it.
    pub(crate) fn attach(
        &mut self,
        image: &Utf8Path,
        format: Option<ImageFormat>,
        device: Option<&Utf8Path>,
    ) -> Result<Attached> {
        let s = self.settings;
        let opts = ConnectOptions {
            slots: s.nbd_slots,
            attempts: s.connect_attempts,
            backoff: s.connect_backoff,
            ready_timeout: s.ready_timeout,
            device: device.map(ToOwned::to_owned),
            format,
        };
        let handle = connector::connect(self.host, &mut self.ledger, &self.interrupt, image, &opts)?;
        self.interrupt.check()?;
        let layout = survey(self.host, &handle.device)?;
        let classification = classify(&layout, &s.thresholds);
        Ok(Attached {
            handle,
            layout,
            classification,
        })
    }

    /// Run the whole pipeline, leaving a root ready for `chroot`.
    pub(crate) fn mount(&mut self, prompt: &dyn Prompt, opts: &MountOptions) -> Result<Prepared> {
        let Attached {
            handle,
            classification,
            ..
        } = self.attach(&opts.image, opts.format, opts.device.as_deref())?;
        self.interrupt.check()?;

        let vopts = VolumeOptions {
            session: &self.id,
            luks_attempts: self.settings.luks_attempts,
            extra_lv_names: &self.settings.root_lv_names,
            overrides: &opts.overrides,
        };
        let resolved = resolve_root(
            self.host,
            prompt,
            &mut self.ledger,
            &handle.device,
            &classification,
            &vopts,
        )?;
        for m in resolved.opened.iter() {
            println!("Unlocked {} as {}", m.source, m.device());
        }
        if !resolved.volume_groups.is_empty() {
            println!("Activated volume groups: {}", resolved.volume_groups.join(", "));
        }
        self.interrupt.check()?;

        let workdir = self.create_workdir()?;
        let mounter = Mounter {
            host: self.host,
            root: &workdir.root,
            scratch: &workdir.scratch,
            subvol: opts.subvol.as_deref(),
        };
        let root_device = mounter
            .mount_root(&mut self.ledger, &resolved.candidates)?
            .clone();
        if !opts.no_boot {
            let boot = boot_partition(&classification, &root_device, &self.settings.thresholds);
            mounter.mount_boot(&mut self.ledger, boot, classification.efi.as_ref());
        }
        self.interrupt.check()?;

        chroot::bind_pseudo_filesystems(self.host, &mut self.ledger, &workdir.root);
        if let Err(e) = chroot::replace_resolv_conf(
            &mut self.ledger,
            &workdir.root,
            &self.settings.host_resolv_conf,
        ) {
            tracing::warn!("{e:#}");
        }
        self.interrupt.check()?;
        Ok(Prepared {
            handle,
            root_device,
            workdir,
        })
    }

    /// Create `<temp-root>/disk_mount_<timestamp>-<id>/{root,scratch}`.
    fn create_workdir(&mut self) -> Result<Workdir> {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let base = self
            .settings
            .temp_root
            .join(format!("disk_mount_{stamp}-{}", self.id));
        let w = Workdir {
            root: base.join("root"),
            scratch: base.join("scratch"),
            base,
        };
        for d in [&w.base, &w.root, &w.scratch] {
            std::fs::create_dir(d).with_context(|| format!("Creating {d}"))?;
            self.ledger.push(Resource::Directory { path: d.clone() });
        }
        Ok(w)
    }

    /// Release everything acquired so far.
    pub(crate) fn teardown(&mut self) -> TeardownReport {
        let report = self.ledger.teardown(self.host);
        self.torn_down = true;
        if report.is_clean() {
            if let Err(e) = self.ledger.discard_journal() {
                tracing::warn!("{e:#}");
            }
        } else {
            self.ledger.retain_failed(&report);
            if let Some(p) = self.ledger.journal() {
                tracing::warn!(
                    "{} resources could not be released; retry with `imgroot cleanup` ({p})",
                    report.failed.len()
                );
            }
        }
        report
    }

    /// Leave everything in place; returns the state file that `cleanup` will use.
    pub(crate) fn keep(mut self) -> Option<Utf8PathBuf> {
        self.keep = true;
        self.ledger.journal().map(ToOwned::to_owned)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.keep || self.torn_down {
            return;
        }
        let _ = self.teardown();
    }
}

/// The partition to mount at `/boot`, if any.
///
/// A small Linux partition passed over because the root came from LUKS or
/// LVM is usually the separate `/boot`.
fn boot_partition<'c>(
    class: &'c Classification,
    root: &RootCandidate,
    t: &Thresholds,
) -> Option<&'c PartitionInfo> {
    if let Some(b) = class.boot.as_ref().filter(|b| b.path != root.device) {
        return Some(b);
    }
    class.root_candidates().find(|p| {
        p.path != root.device && p.fstype.is_boot_capable() && t.is_boot_sized(p.size)
    })
}

/// Tear down every session left behind in the state directory.
pub(crate) fn cleanup_state_dir(host: &dyn Host, state_dir: &Utf8Path) -> Result<usize> {
    let mut failed = 0;
    for path in statefile::list(state_dir)? {
        let mut ledger = match statefile::load(&path) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!("{e:#}");
                failed += 1;
                continue;
            }
        };
        println!("Cleaning up session {} ({} resources)", ledger.session, ledger.len());
        ledger.journal_to(&path)?;
        let report = ledger.teardown(host);
        if report.is_clean() {
            ledger.discard_journal()?;
        } else {
            ledger.retain_failed(&report);
            failed += report.failed.len();
        }
    }
    Ok(failed)
}
