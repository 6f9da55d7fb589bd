//! The boundary between the pipeline and the operating system.
//!
//! Every stage talks to the kernel and the external tools through [`Host`];
//! [`SystemHost`] is the real thing, tests substitute an in-memory disk.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use imgroot_blockdev::Device;
use imgroot_utils::CommandRunExt;

use crate::model::ImageFormat;
use crate::task::Task;
use crate::volumes::{LogicalVolume, LvReport, PhysicalVolume, PvReport, Report};

/// A single `mount` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MountRequest {
    pub(crate) source: String,
    pub(crate) target: Utf8PathBuf,
    pub(crate) fstype: Option<String>,
    pub(crate) options: Option<String>,
    pub(crate) bind: bool,
}

impl MountRequest {
    pub(crate) fn new(source: impl Into<String>, target: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            fstype: None,
            options: None,
            bind: false,
        }
    }

    pub(crate) fn fstype(mut self, fstype: impl Into<String>) -> Self {
        self.fstype = Some(fstype.into());
        self
    }

    pub(crate) fn options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    pub(crate) fn bind(mut self) -> Self {
        self.bind = true;
        self
    }

    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.bind {
            args.push("--bind".to_string());
        }
        if let Some(t) = self.fstype.as_deref() {
            args.extend(["-t".to_string(), t.to_string()]);
        }
        if let Some(o) = self.options.as_deref() {
            args.extend(["-o".to_string(), o.to_string()]);
        }
        args.extend([self.source.clone(), self.target.to_string()]);
        args
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum UnmountMode {
    Normal,
    /// `umount -R -l`, for trees that are still busy.
    RecursiveLazy,
}

pub(crate) trait Host: std::fmt::Debug {
    fn load_nbd_module(&self) -> Result<()>;
    /// Bytes currently backing the nbd slot; zero when unbound.
    fn nbd_slot_size(&self, slot: u32) -> Result<u64>;
    fn nbd_connect(&self, device: &Utf8Path, image: &Utf8Path, format: ImageFormat) -> Result<()>;
    fn nbd_disconnect(&self, device: &Utf8Path) -> Result<()>;
    fn rescan_partitions(&self, device: &Utf8Path) -> Result<()>;
    fn device_size(&self, device: &Utf8Path) -> Result<u64>;
    /// Wait for udev to finish processing device events.
    fn settle(&self) -> Result<()>;
    fn node_exists(&self, device: &Utf8Path) -> bool;
    /// The kernel name of a device node, e.g. `/dev/dm-3` for `/dev/mapper/x`.
    fn canonical_device(&self, device: &Utf8Path) -> Utf8PathBuf;

    fn list_device(&self, device: &Utf8Path) -> Result<Device>;
    fn probe_fstype(&self, device: &Utf8Path) -> Result<Option<String>>;

    fn luks_open(&self, source: &Utf8Path, name: &str, passphrase: &str) -> Result<()>;
    fn luks_close(&self, name: &str) -> Result<()>;

    fn lvm_scan(&self) -> Result<()>;
    fn list_physical_volumes(&self) -> Result<Vec<PhysicalVolume>>;
    fn list_logical_volumes(&self) -> Result<Vec<LogicalVolume>>;
    fn vg_activate(&self, vg: &str) -> Result<()>;
    fn vg_deactivate(&self, vg: &str) -> Result<()>;

    fn mount(&self, req: &MountRequest) -> Result<()>;
    fn unmount(&self, target: &Utf8Path, mode: UnmountMode) -> Result<()>;
    fn btrfs_subvolumes(&self, mountpoint: &Utf8Path) -> Result<Vec<String>>;
    /// Human-readable list of processes keeping `target` busy.
    fn blocking_processes(&self, target: &Utf8Path) -> Result<String>;
}

/// Runs the real tools against the real kernel.
#[derive(Debug, Default)]
pub(crate) struct SystemHost {}

impl Host for SystemHost {
    fn load_nbd_module(&self) -> Result<()> {
        Task::new("Loading nbd module", "modprobe")
            .args(["nbd", "max_part=16"])
            .quiet()
            .run()
    }

    fn nbd_slot_size(&self, slot: u32) -> Result<u64> {
        imgroot_blockdev::nbd_slot_size(Utf8Path::new(imgroot_blockdev::SYSFS), slot)
    }

    fn nbd_connect(&self, device: &Utf8Path, image: &Utf8Path, format: ImageFormat) -> Result<()> {
        Task::new(
            format!("Connecting {image} to {device} ({format})"),
            "qemu-nbd",
        )
        .args(["--connect", device.as_str(), "-f", format.as_str(), image.as_str()])
        .run()
    }

    fn nbd_disconnect(&self, device: &Utf8Path) -> Result<()> {
        Task::new(format!("Disconnecting {device}"), "qemu-nbd")
            .args(["--disconnect", device.as_str()])
            .quiet_output()
            .run()
    }

    #[context("Rescanning partitions on {device}")]
    fn rescan_partitions(&self, device: &Utf8Path) -> Result<()> {
        let reread = std::fs::OpenOptions::new()
            .write(true)
            .open(device)
            .with_context(|| format!("opening {device}"))
            .and_then(|mut f| imgroot_blockdev::reread_partition_table(&mut f, true));
        if let Err(e) = reread {
            tracing::debug!("BLKRRPART failed ({e:#}), falling back to partprobe");
            Task::new("Probing partitions", "partprobe")
                .args([device.as_str()])
                .quiet()
                .run()?;
        }
        imgroot_blockdev::udev_settle()
    }

    fn device_size(&self, device: &Utf8Path) -> Result<u64> {
        imgroot_blockdev::device_size(device)
    }

    fn settle(&self) -> Result<()> {
        imgroot_blockdev::udev_settle()
    }

    fn node_exists(&self, device: &Utf8Path) -> bool {
        device.exists()
    }

    fn canonical_device(&self, device: &Utf8Path) -> Utf8PathBuf {
        device
            .canonicalize_utf8()
            .unwrap_or_else(|_| device.to_owned())
    }

    fn list_device(&self, device: &Utf8Path) -> Result<Device> {
        imgroot_blockdev::list_dev(device)
    }

    fn probe_fstype(&self, device: &Utf8Path) -> Result<Option<String>> {
        imgroot_blockdev::probe_fstype(device)
    }

    fn luks_open(&self, source: &Utf8Path, name: &str, passphrase: &str) -> Result<()> {
        Task::new(format!("Unlocking {source} as {name}"), "cryptsetup")
            .args(["open", "--type", "luks", "--key-file=-", source.as_str(), name])
            .run_with_stdin_buf(Some(passphrase.as_bytes()))
    }

    fn luks_close(&self, name: &str) -> Result<()> {
        Task::new(format!("Closing {name}"), "cryptsetup")
            .args(["close", name])
            .run()
    }

    fn lvm_scan(&self) -> Result<()> {
        Task::new("Scanning for LVM physical volumes", "pvscan")
            .args(["--cache"])
            .quiet_output()
            .run()
    }

    fn list_physical_volumes(&self) -> Result<Vec<PhysicalVolume>> {
        let r: Report<PvReport> = Command::new("pvs")
            .args(["--reportformat", "json", "-o", "pv_name,vg_name"])
            .run_and_parse_json()?;
        Ok(r.into_physical_volumes())
    }

    fn list_logical_volumes(&self) -> Result<Vec<LogicalVolume>> {
        let r: Report<LvReport> = Command::new("lvs")
            .args([
                "--reportformat",
                "json",
                "--units",
                "b",
                "--nosuffix",
                "-o",
                "vg_name,lv_name,lv_path,lv_size,lv_active",
            ])
            .run_and_parse_json()?;
        r.into_logical_volumes()
    }

    fn vg_activate(&self, vg: &str) -> Result<()> {
        Task::new(format!("Activating volume group {vg}"), "vgchange")
            .args(["-ay", vg])
            .quiet_output()
            .run()
    }

    fn vg_deactivate(&self, vg: &str) -> Result<()> {
        Task::new(format!("Deactivating volume group {vg}"), "vgchange")
            .args(["-an", vg])
            .quiet_output()
            .run()
    }

    fn mount(&self, req: &MountRequest) -> Result<()> {
        let desc = if req.bind {
            format!("Binding {} to {}", req.source, req.target)
        } else {
            format!("Mounting {} on {}", req.source, req.target)
        };
        Task::new(desc, "mount").args(req.to_args()).quiet().run()
    }

    fn unmount(&self, target: &Utf8Path, mode: UnmountMode) -> Result<()> {
        let t = Task::new(format!("Unmounting {target}"), "umount").quiet();
        match mode {
            UnmountMode::Normal => t.args([target.as_str()]),
            UnmountMode::RecursiveLazy => t.args(["-R", "-l", target.as_str()]),
        }
        .run()
    }

    fn btrfs_subvolumes(&self, mountpoint: &Utf8Path) -> Result<Vec<String>> {
        let o = Command::new("btrfs")
            .args(["subvolume", "list", mountpoint.as_str()])
            .run_get_string()?;
        Ok(crate::mounter::parse_subvolume_list(&o))
    }

    fn blocking_processes(&self, target: &Utf8Path) -> Result<String> {
        // fuser prints the table on stderr and exits 1 when nothing was found
        let o = Command::new("fuser")
            .args(["-vm", target.as_str()])
            .output()
            .context("Spawning fuser")?;
        let mut r = String::from_utf8_lossy(&o.stdout).into_owned();
        r.push_str(&String::from_utf8_lossy(&o.stderr));
        Ok(r)
    }
}
