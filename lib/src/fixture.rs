//! Test suite fixture.  Should only be used by this library.
//!
//! [`FakeHost`] simulates the kernel and the storage tools in memory: images
//! attach to nbd slots, partitions carry filesystems, LUKS containers and LVM
//! volume groups, and mounting a filesystem populates the (real, temporary)
//! target directory with the filesystem's top-level entries so that sanity
//! checks see something. Every state-changing call is recorded.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use anyhow::{anyhow, Result};
use camino::{Utf8Path, Utf8PathBuf};
use imgroot_blockdev::Device;

use crate::classify::ESP_GUID;
use crate::host::{Host, MountRequest, UnmountMode};
use crate::model::ImageFormat;
use crate::prompt::Prompt;
use crate::volumes::{LogicalVolume, PhysicalVolume};

const MIB: u64 = 1024 * 1024;

/// A filesystem: its type, and the directories it holds.
#[derive(Debug, Clone)]
pub(crate) struct FakeFs {
    fstype: String,
    toplevel: Vec<String>,
    subvolumes: Vec<(String, Vec<String>)>,
}

impl FakeFs {
    pub(crate) fn plain(fstype: &str, dirs: &[&str]) -> Self {
        Self {
            fstype: fstype.into(),
            toplevel: dirs.iter().map(|d| d.to_string()).collect(),
            subvolumes: Vec::new(),
        }
    }

    pub(crate) fn btrfs() -> Self {
        Self::plain("btrfs", &[])
    }

    pub(crate) fn toplevel(mut self, dirs: &[&str]) -> Self {
        self.toplevel = dirs.iter().map(|d| d.to_string()).collect();
        self
    }

    pub(crate) fn subvolume(mut self, name: &str, dirs: &[&str]) -> Self {
        self.subvolumes
            .push((name.into(), dirs.iter().map(|d| d.to_string()).collect()));
        self
    }

    /// The directories visible when mounted with `options`.
    fn tree(&self, options: Option<&str>) -> Result<Vec<String>> {
        let subvol = options
            .into_iter()
            .flat_map(|o| o.split(','))
            .find_map(|o| o.strip_prefix("subvol="));
        match subvol {
            Some(name) => self
                .subvolumes
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, dirs)| dirs.clone())
                .ok_or_else(|| anyhow!("no subvolume {name}")),
            None => Ok(self
                .toplevel
                .iter()
                .cloned()
                .chain(self.subvolumes.iter().map(|(n, _)| n.clone()))
                .collect()),
        }
    }
}

/// A volume group and its logical volumes.
#[derive(Debug, Clone)]
pub(crate) struct FakeVg {
    name: String,
    lvs: Vec<(String, FakeFs)>,
    /// Activated as soon as its physical volume shows up.
    autoactivate: bool,
}

impl FakeVg {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            lvs: Vec::new(),
            autoactivate: false,
        }
    }

    pub(crate) fn lv(mut self, name: &str, fs: FakeFs) -> Self {
        self.lvs.push((name.into(), fs));
        self
    }

    pub(crate) fn active(mut self) -> Self {
        self.autoactivate = true;
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) enum FakeContent {
    Fs(FakeFs),
    Lvm(FakeVg),
    Luks {
        passphrase: String,
        inner: Box<FakeContent>,
    },
    /// Something we can't mount, e.g. NTFS.
    Opaque(String),
}

impl FakeContent {
    fn fstype(&self) -> &str {
        match self {
            FakeContent::Fs(fs) => &fs.fstype,
            FakeContent::Lvm(_) => "LVM2_member",
            FakeContent::Luks { .. } => "crypto_LUKS",
            FakeContent::Opaque(t) => t,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FakePartition {
    size: u64,
    label: Option<String>,
    content: FakeContent,
    /// Whether lsblk reports the filesystem type (otherwise only blkid does).
    udev_knows_fstype: bool,
    missing_node: bool,
    unprobeable: bool,
}

impl FakePartition {
    /// A partition of `mib` MiB; mountable types get an empty filesystem.
    pub(crate) fn new(fstype: &str, mib: u64) -> Self {
        let content = match fstype {
            "ext4" | "ext3" | "ext2" | "xfs" | "btrfs" | "vfat" => {
                FakeContent::Fs(FakeFs::plain(fstype, &[]))
            }
            o => FakeContent::Opaque(o.into()),
        };
        Self::with_content(mib, content)
    }

    pub(crate) fn luks(mib: u64, passphrase: &str, inner: FakeContent) -> Self {
        Self::with_content(
            mib,
            FakeContent::Luks {
                passphrase: passphrase.into(),
                inner: Box::new(inner),
            },
        )
    }

    pub(crate) fn lvm(mib: u64, vg: FakeVg) -> Self {
        Self::with_content(mib, FakeContent::Lvm(vg))
    }

    fn with_content(mib: u64, content: FakeContent) -> Self {
        Self {
            size: mib * MIB,
            label: None,
            content,
            udev_knows_fstype: true,
            missing_node: false,
            unprobeable: false,
        }
    }

    pub(crate) fn fs(mut self, fs: FakeFs) -> Self {
        self.content = FakeContent::Fs(fs);
        self
    }

    pub(crate) fn label(mut self, label: &str) -> Self {
        self.label = Some(label.into());
        self
    }

    pub(crate) fn unlabeled_fstype(mut self) -> Self {
        self.udev_knows_fstype = false;
        self
    }

    pub(crate) fn missing_node(mut self) -> Self {
        self.missing_node = true;
        self
    }

    pub(crate) fn unprobeable(mut self) -> Self {
        self.udev_knows_fstype = false;
        self.unprobeable = true;
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FakeDisk {
    pttype: Option<&'static str>,
    partitions: Vec<FakePartition>,
    size: Option<u64>,
}

impl FakeDisk {
    pub(crate) fn gpt(partitions: Vec<FakePartition>) -> Self {
        Self {
            pttype: Some("gpt"),
            partitions,
            size: None,
        }
    }

    pub(crate) fn dos(partitions: Vec<FakePartition>) -> Self {
        Self {
            pttype: Some("dos"),
            ..Self::gpt(partitions)
        }
    }

    /// Override the size the device reports; zero simulates a device that never gets ready.
    pub(crate) fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    fn total_size(&self) -> u64 {
        self.size
            .unwrap_or_else(|| MIB + self.partitions.iter().map(|p| p.size).sum::<u64>())
    }
}

/// State-changing calls, in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    NbdConnect(Utf8PathBuf, ImageFormat),
    NbdDisconnect(Utf8PathBuf),
    LuksOpen(String),
    LuksClose(String),
    VgActivate(String),
    VgDeactivate(String),
    Mount(Utf8PathBuf),
    Unmount(Utf8PathBuf),
    UnmountLazy(Utf8PathBuf),
    BlockingProcesses(Utf8PathBuf),
}

#[derive(Debug)]
struct FakeVgState {
    vg: FakeVg,
    pv: String,
    active: bool,
}

struct Hook(Box<dyn Fn()>);

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Hook")
    }
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    attempted: Vec<MountRequest>,
    images: BTreeMap<String, FakeDisk>,
    occupied: BTreeSet<u32>,
    connected: BTreeMap<Utf8PathBuf, FakeDisk>,
    rejected_formats: BTreeSet<String>,
    /// Every block device node that currently exists, with its content.
    nodes: BTreeMap<Utf8PathBuf, FakeContent>,
    unprobeable: BTreeSet<Utf8PathBuf>,
    /// Mapping name to source device.
    mappings: BTreeMap<String, Utf8PathBuf>,
    /// Report LUKS mappings by their `/dev/dm-N` name, like `pvs` may.
    dm_names: bool,
    dm_aliases: BTreeMap<Utf8PathBuf, Utf8PathBuf>,
    vgs: Vec<FakeVgState>,
    mounted: BTreeMap<Utf8PathBuf, String>,
    failing_mounts: BTreeSet<Utf8PathBuf>,
    failing_unmounts: BTreeSet<Utf8PathBuf>,
    on_mount: Option<Hook>,
}

impl State {
    fn add_node(&mut self, path: Utf8PathBuf, content: FakeContent) {
        if let FakeContent::Lvm(vg) = &content {
            let active = vg.autoactivate;
            self.vgs.push(FakeVgState {
                vg: vg.clone(),
                pv: path.to_string(),
                active,
            });
            if active {
                self.add_lv_nodes(self.vgs.len() - 1);
            }
        }
        self.nodes.insert(path, content);
    }

    fn remove_node(&mut self, path: &Utf8Path) {
        self.nodes.remove(path);
        self.vgs.retain(|v| v.pv != path.as_str());
    }

    fn add_lv_nodes(&mut self, i: usize) {
        let vg = self.vgs[i].vg.clone();
        for (lv, fs) in vg.lvs {
            let p = Utf8PathBuf::from(format!("/dev/{}/{lv}", vg.name));
            self.nodes.insert(p, FakeContent::Fs(fs));
        }
    }

    fn remove_lv_nodes(&mut self, i: usize) {
        let prefix = format!("/dev/{}/", self.vgs[i].vg.name);
        self.nodes.retain(|p, _| !p.as_str().starts_with(&prefix));
    }

    fn vg_index(&self, name: &str) -> Option<usize> {
        self.vgs.iter().position(|v| v.vg.name == name)
    }

    /// An active volume group with its physical volume on `pred`.
    fn active_vg_on(&self, pred: impl Fn(&str) -> bool) -> Option<&str> {
        self.vgs
            .iter()
            .find(|v| v.active && pred(&v.pv))
            .map(|v| v.vg.name.as_str())
    }

    fn canonical(&self, device: &Utf8Path) -> Utf8PathBuf {
        self.dm_aliases
            .get(device)
            .cloned()
            .unwrap_or_else(|| device.to_owned())
    }
}

/// An in-memory stand-in for the kernel and the storage tools.
#[derive(Debug, Default)]
pub(crate) struct FakeHost {
    state: RefCell<State>,
}

impl FakeHost {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    /// Every mount request made, including failed ones.
    pub(crate) fn mounts_attempted(&self) -> Vec<MountRequest> {
        self.state.borrow().attempted.clone()
    }

    pub(crate) fn attach_image(&self, path: &str, disk: FakeDisk) {
        self.state.borrow_mut().images.insert(path.into(), disk);
    }

    /// Make an nbd slot look busy.
    pub(crate) fn occupy_slot(&self, slot: u32) {
        self.state.borrow_mut().occupied.insert(slot);
    }

    pub(crate) fn reject_format(&self, format: ImageFormat) {
        self.state
            .borrow_mut()
            .rejected_formats
            .insert(format.as_str().into());
    }

    /// Register a filesystem on an arbitrary device node.
    pub(crate) fn add_filesystem(&self, device: &str, fs: FakeFs) {
        self.state
            .borrow_mut()
            .add_node(device.into(), FakeContent::Fs(fs));
    }

    /// A volume group of the host itself, already active.
    pub(crate) fn add_host_volume_group(&self, pv: &str, name: &str) {
        let vg = FakeVg::new(name).lv("root", FakeFs::plain("xfs", &[])).active();
        self.state
            .borrow_mut()
            .add_node(pv.into(), FakeContent::Lvm(vg));
    }

    /// Name LUKS mappings `/dev/dm-N` in `pvs` output.
    pub(crate) fn report_dm_names(&self) {
        self.state.borrow_mut().dm_names = true;
    }

    pub(crate) fn fail_mount(&self, target: impl Into<Utf8PathBuf>) {
        self.state.borrow_mut().failing_mounts.insert(target.into());
    }

    pub(crate) fn fail_unmount(&self, target: impl Into<Utf8PathBuf>) {
        self.state.borrow_mut().failing_unmounts.insert(target.into());
    }

    /// Run `f` after every successful mount.
    pub(crate) fn on_mount(&self, f: impl Fn() + 'static) {
        self.state.borrow_mut().on_mount = Some(Hook(Box::new(f)));
    }

    fn record(&self, c: Call) {
        self.state.borrow_mut().calls.push(c);
    }
}

fn clear_dir(d: &Utf8Path) -> Result<()> {
    let Ok(entries) = d.read_dir_utf8() else {
        return Ok(());
    };
    for ent in entries {
        let ent = ent?;
        if ent.file_type()?.is_dir() {
            std::fs::remove_dir_all(ent.path())?;
        } else {
            std::fs::remove_file(ent.path())?;
        }
    }
    Ok(())
}

impl Host for FakeHost {
    fn load_nbd_module(&self) -> Result<()> {
        Ok(())
    }

    fn nbd_slot_size(&self, slot: u32) -> Result<u64> {
        let s = self.state.borrow();
        let dev = imgroot_blockdev::nbd_device(slot);
        if s.occupied.contains(&slot) {
            return Ok(1 << 30);
        }
        Ok(s.connected.get(&dev).map_or(0, |d| d.total_size().max(1)))
    }

    fn nbd_connect(&self, device: &Utf8Path, image: &Utf8Path, format: ImageFormat) -> Result<()> {
        self.record(Call::NbdConnect(device.to_owned(), format));
        let mut s = self.state.borrow_mut();
        if s.rejected_formats.contains(format.as_str()) {
            anyhow::bail!("qemu-nbd: Could not open '{image}': Image is not in {format} format");
        }
        if s.connected.contains_key(device) {
            anyhow::bail!("qemu-nbd: Failed to set NBD socket: Device or resource busy");
        }
        let disk = s
            .images
            .get(image.as_str())
            .cloned()
            .ok_or_else(|| anyhow!("qemu-nbd: Failed to open {image}"))?;
        for (i, p) in disk.partitions.iter().enumerate() {
            if p.missing_node {
                continue;
            }
            let path = Utf8PathBuf::from(format!("{device}p{}", i + 1));
            if p.unprobeable {
                s.unprobeable.insert(path.clone());
            }
            s.add_node(path, p.content.clone());
        }
        s.connected.insert(device.to_owned(), disk);
        Ok(())
    }

    fn nbd_disconnect(&self, device: &Utf8Path) -> Result<()> {
        self.record(Call::NbdDisconnect(device.to_owned()));
        let mut s = self.state.borrow_mut();
        let prefix = format!("{device}p");
        if let Some(vg) = s.active_vg_on(|pv| pv.starts_with(&prefix)) {
            anyhow::bail!("qemu-nbd: {device} is in use by volume group {vg}");
        }
        if let Some(name) = s
            .mappings
            .iter()
            .find(|(_, src)| src.as_str().starts_with(&prefix))
            .map(|(n, _)| n)
        {
            anyhow::bail!("qemu-nbd: {device} is in use by {name}");
        }
        s.connected.remove(device);
        let parts = s
            .nodes
            .keys()
            .filter(|p| p.as_str().starts_with(&prefix))
            .cloned()
            .collect::<Vec<_>>();
        for p in parts {
            s.remove_node(&p);
        }
        Ok(())
    }

    fn rescan_partitions(&self, _device: &Utf8Path) -> Result<()> {
        Ok(())
    }

    fn device_size(&self, device: &Utf8Path) -> Result<u64> {
        let s = self.state.borrow();
        Ok(s.connected.get(device).map_or(0, |d| d.total_size()))
    }

    fn settle(&self) -> Result<()> {
        Ok(())
    }

    fn node_exists(&self, device: &Utf8Path) -> bool {
        self.state.borrow().nodes.contains_key(device)
    }

    fn canonical_device(&self, device: &Utf8Path) -> Utf8PathBuf {
        self.state.borrow().canonical(device)
    }

    fn list_device(&self, device: &Utf8Path) -> Result<Device> {
        let s = self.state.borrow();
        let disk = s
            .connected
            .get(device)
            .ok_or_else(|| anyhow!("lsblk: {device}: not a block device"))?;
        let name = device.file_name().unwrap_or_default().to_string();
        let children = disk
            .partitions
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let fstype = p.content.fstype();
                let parttype = (disk.pttype == Some("gpt") && fstype == "vfat")
                    .then(|| ESP_GUID.to_string());
                Device {
                    name: format!("{name}p{}", i + 1),
                    path: Some(format!("{device}p{}", i + 1)),
                    size: p.size,
                    fstype: p.udev_knows_fstype.then(|| fstype.to_string()),
                    label: p.label.clone(),
                    parttype,
                    pttype: disk.pttype.map(ToOwned::to_owned),
                    devtype: Some("part".into()),
                    children: None,
                }
            })
            .collect();
        Ok(Device {
            name,
            path: Some(device.to_string()),
            size: disk.total_size(),
            fstype: None,
            label: None,
            parttype: None,
            pttype: disk.pttype.map(ToOwned::to_owned),
            devtype: Some("disk".into()),
            children: Some(children),
        })
    }

    fn probe_fstype(&self, device: &Utf8Path) -> Result<Option<String>> {
        let s = self.state.borrow();
        if s.unprobeable.contains(device) {
            anyhow::bail!("blkid: {device}: Input/output error");
        }
        Ok(s.nodes.get(device).map(|c| c.fstype().to_string()))
    }

    fn luks_open(&self, source: &Utf8Path, name: &str, passphrase: &str) -> Result<()> {
        self.record(Call::LuksOpen(name.into()));
        let mut s = self.state.borrow_mut();
        let Some(FakeContent::Luks {
            passphrase: expected,
            inner,
        }) = s.nodes.get(source).cloned()
        else {
            anyhow::bail!("Device {source} is not a valid LUKS device.");
        };
        if expected != passphrase {
            anyhow::bail!("No key available with this passphrase.");
        }
        let mapped = Utf8PathBuf::from(format!("/dev/mapper/{name}"));
        if s.dm_names {
            let dm = Utf8PathBuf::from(format!("/dev/dm-{}", s.dm_aliases.len()));
            s.dm_aliases.insert(mapped.clone(), dm);
        }
        s.add_node(mapped, *inner);
        s.mappings.insert(name.into(), source.to_owned());
        Ok(())
    }

    fn luks_close(&self, name: &str) -> Result<()> {
        self.record(Call::LuksClose(name.into()));
        let mut s = self.state.borrow_mut();
        let mapped = Utf8PathBuf::from(format!("/dev/mapper/{name}"));
        if s.active_vg_on(|pv| pv == mapped.as_str()).is_some() {
            anyhow::bail!("Device {name} is still in use.");
        }
        s.mappings.remove(name);
        s.dm_aliases.remove(&mapped);
        s.remove_node(&mapped);
        Ok(())
    }

    fn lvm_scan(&self) -> Result<()> {
        Ok(())
    }

    fn list_physical_volumes(&self) -> Result<Vec<PhysicalVolume>> {
        let s = self.state.borrow();
        Ok(s.vgs
            .iter()
            .map(|v| PhysicalVolume {
                pv_name: s.canonical(Utf8Path::new(&v.pv)).into_string(),
                vg_name: v.vg.name.clone(),
            })
            .collect())
    }

    fn list_logical_volumes(&self) -> Result<Vec<LogicalVolume>> {
        let s = self.state.borrow();
        Ok(s.vgs
            .iter()
            .flat_map(|v| {
                v.vg.lvs.iter().map(|(lv, _)| LogicalVolume {
                    vg_name: v.vg.name.clone(),
                    lv_name: lv.clone(),
                    path: format!("/dev/{}/{lv}", v.vg.name).into(),
                    size: 1 << 30,
                    active: v.active,
                })
            })
            .collect())
    }

    fn vg_activate(&self, vg: &str) -> Result<()> {
        self.record(Call::VgActivate(vg.into()));
        let mut s = self.state.borrow_mut();
        let i = s
            .vg_index(vg)
            .ok_or_else(|| anyhow!("Volume group \"{vg}\" not found"))?;
        s.vgs[i].active = true;
        s.add_lv_nodes(i);
        Ok(())
    }

    fn vg_deactivate(&self, vg: &str) -> Result<()> {
        self.record(Call::VgDeactivate(vg.into()));
        let mut s = self.state.borrow_mut();
        if let Some(i) = s.vg_index(vg) {
            s.vgs[i].active = false;
            s.remove_lv_nodes(i);
        }
        Ok(())
    }

    fn mount(&self, req: &MountRequest) -> Result<()> {
        self.record(Call::Mount(req.target.clone()));
        let hook = {
            let mut s = self.state.borrow_mut();
            s.attempted.push(req.clone());
            if s.failing_mounts.contains(&req.target) {
                anyhow::bail!("mount: {}: permission denied", req.target);
            }
            if !req.bind {
                let fs = match s.nodes.get(Utf8Path::new(&req.source)) {
                    Some(FakeContent::Fs(fs)) => fs.clone(),
                    Some(_) => anyhow::bail!("mount: {}: wrong fs type", req.target),
                    None => anyhow::bail!("mount: {}: special device does not exist", req.source),
                };
                if req.fstype.as_deref().is_some_and(|t| t != fs.fstype) {
                    anyhow::bail!("mount: {}: wrong fs type", req.target);
                }
                for d in fs.tree(req.options.as_deref())? {
                    std::fs::create_dir_all(req.target.join(d))?;
                }
            }
            s.mounted.insert(req.target.clone(), req.source.clone());
            s.on_mount.take()
        };
        if let Some(Hook(f)) = hook {
            f();
            self.state.borrow_mut().on_mount = Some(Hook(f));
        }
        Ok(())
    }

    fn unmount(&self, target: &Utf8Path, mode: UnmountMode) -> Result<()> {
        self.record(match mode {
            UnmountMode::Normal => Call::Unmount(target.to_owned()),
            UnmountMode::RecursiveLazy => Call::UnmountLazy(target.to_owned()),
        });
        let mut s = self.state.borrow_mut();
        if s.failing_unmounts.contains(target) {
            anyhow::bail!("umount: {target}: target is busy.");
        }
        if s.mounted.remove(target).is_some() {
            clear_dir(target)?;
        }
        Ok(())
    }

    fn btrfs_subvolumes(&self, mountpoint: &Utf8Path) -> Result<Vec<String>> {
        let s = self.state.borrow();
        let source = s
            .mounted
            .get(mountpoint)
            .ok_or_else(|| anyhow!("ERROR: not a btrfs filesystem: {mountpoint}"))?;
        match s.nodes.get(Utf8Path::new(source)) {
            Some(FakeContent::Fs(fs)) if fs.fstype == "btrfs" => {
                Ok(fs.subvolumes.iter().map(|(n, _)| n.clone()).collect())
            }
            _ => anyhow::bail!("ERROR: not a btrfs filesystem: {mountpoint}"),
        }
    }

    fn blocking_processes(&self, target: &Utf8Path) -> Result<String> {
        self.record(Call::BlockingProcesses(target.to_owned()));
        Ok(format!(
            "                     USER        PID ACCESS COMMAND\n{target}: root       1234 ..c.. bash\n"
        ))
    }
}

/// Answers prompts from a script.
#[derive(Debug, Default)]
pub(crate) struct ScriptedPrompt {
    passphrases: RefCell<VecDeque<String>>,
}

impl ScriptedPrompt {
    /// Empty strings skip the container, like an empty answer at the terminal.
    pub(crate) fn passphrases(p: &[&str]) -> Self {
        Self {
            passphrases: RefCell::new(p.iter().map(|s| s.to_string()).collect()),
        }
    }
}

impl Prompt for ScriptedPrompt {
    fn passphrase(&self, _source: &Utf8Path, _attempt: u32) -> Result<Option<String>> {
        let p = self
            .passphrases
            .borrow_mut()
            .pop_front()
            .unwrap_or_default();
        Ok((!p.is_empty()).then_some(p))
    }

    fn select_image(&self, images: &[Utf8PathBuf]) -> Result<Utf8PathBuf> {
        images
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("Nothing to select"))
    }
}

#[test]
fn test_busy_storage_refuses_release() {
    let host = FakeHost::default();
    let vg = FakeVg::new("vg0").lv("root", FakeFs::plain("ext4", &["etc", "bin"])).active();
    host.attach_image(
        "/srv/disk.img",
        FakeDisk::gpt(vec![FakePartition::luks(1024, "pw", FakeContent::Lvm(vg))]),
    );
    let nbd = Utf8Path::new("/dev/nbd0");
    host.nbd_connect(nbd, Utf8Path::new("/srv/disk.img"), ImageFormat::Raw)
        .unwrap();
    host.luks_open(Utf8Path::new("/dev/nbd0p1"), "m0", "pw")
        .unwrap();
    assert!(host.luks_close("m0").is_err());
    assert!(host.nbd_disconnect(nbd).is_err());
    host.vg_deactivate("vg0").unwrap();
    assert!(host.nbd_disconnect(nbd).is_err());
    host.luks_close("m0").unwrap();
    host.nbd_disconnect(nbd).unwrap();
}
