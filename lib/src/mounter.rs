//! # Mounting the target
//!
//! Mounts the resolved root (resolving Btrfs subvolumes along the way),
//! checks that it looks like a Linux root, and opportunistically adds
//! `/boot` and the EFI system partition.

use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::error::SetupError;
use crate::host::{Host, MountRequest};
use crate::ledger::Ledger;
use crate::model::{FsType, MountKind, MountRecord, PartitionInfo};
use crate::volumes::RootCandidate;

/// Subvolumes conventionally holding the root filesystem, tried first.
const ROOT_SUBVOLUMES: &[&str] = &["@", "@root", "root"];
const HOME_SUBVOLUMES: &[&str] = &["@home", "home"];

/// Parse `btrfs subvolume list` output into subvolume paths.
pub(crate) fn parse_subvolume_list(buf: &str) -> Vec<String> {
    buf.lines()
        .filter_map(|l| l.split_once(" path ").map(|(_, p)| p.trim()))
        .filter(|p| !p.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// A mounted tree is accepted as root if it has `/etc` and either `/bin` or `/usr/bin`.
pub(crate) fn has_root_layout(root: &Utf8Path) -> bool {
    let exists = |p: &str| root.join(p).symlink_metadata().is_ok();
    exists("etc") && (exists("bin") || exists("usr/bin"))
}

/// Mount `req` and record it.
fn mount_recorded(host: &dyn Host, ledger: &mut Ledger, req: MountRequest) -> Result<()> {
    host.mount(&req)?;
    ledger.push_mount(MountRecord {
        target: req.target,
        source: req.source,
        fstype: req.fstype,
        options: req.options,
        kind: if req.bind {
            MountKind::Bind
        } else {
            MountKind::Filesystem
        },
        ordinal: 0,
    });
    Ok(())
}

/// How mounting one candidate at the root went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Root,
    /// Mounted, but without `/etc` and `/bin`.
    NotRoot,
    Unmountable,
}

/// Mount `req` at the root and keep it only if it passes the sanity check.
fn try_root(host: &dyn Host, ledger: &mut Ledger, req: MountRequest) -> Result<Attempt> {
    let desc = match req.options.as_deref() {
        Some(o) => format!("{} ({o})", req.source),
        None => req.source.clone(),
    };
    let root = req.target.clone();
    if let Err(e) = mount_recorded(host, ledger, req) {
        tracing::warn!("Mounting {desc}: {e:#}");
        return Ok(Attempt::Unmountable);
    }
    if has_root_layout(&root) {
        tracing::debug!("{desc} looks like a root filesystem");
        return Ok(Attempt::Root);
    }
    tracing::info!("{desc} has no /etc and /bin; trying the next candidate");
    ledger.release_last(host)?;
    Ok(Attempt::NotRoot)
}

fn request_for(c: &RootCandidate, target: &Utf8Path) -> MountRequest {
    let req = MountRequest::new(c.device.as_str(), target);
    match c.fstype.mount_type() {
        Some(t) => req.fstype(t),
        None => req,
    }
}

#[derive(Debug)]
pub(crate) struct Mounter<'a> {
    pub(crate) host: &'a dyn Host,
    /// Where the root is assembled.
    pub(crate) root: &'a Utf8Path,
    /// Scratch mount point used to inspect Btrfs filesystems.
    pub(crate) scratch: &'a Utf8Path,
    /// Subvolume to try before the built-in names.
    pub(crate) subvol: Option<&'a str>,
}

impl Mounter<'_> {
    /// Mount the first candidate that yields a sane root; returns the one used.
    ///
    /// Fails with [`SetupError::SanityCheckFailed`] if something mounted but
    /// none of it looked like a root, [`SetupError::NoUsableRoot`] if nothing
    /// mounted at all.
    pub(crate) fn mount_root<'c>(
        &self,
        ledger: &mut Ledger,
        candidates: &'c [RootCandidate],
    ) -> Result<&'c RootCandidate> {
        let mut mounted_any = false;
        for c in candidates {
            let attempt = match c.fstype {
                FsType::Btrfs => self.mount_btrfs(ledger, c)?,
                _ => try_root(self.host, ledger, request_for(c, self.root))?,
            };
            match attempt {
                Attempt::Root => {
                    println!("Mounted {} as root", c.device);
                    return Ok(c);
                }
                Attempt::NotRoot => mounted_any = true,
                Attempt::Unmountable => {}
            }
        }
        Err(if mounted_any {
            SetupError::SanityCheckFailed.into()
        } else {
            SetupError::NoUsableRoot.into()
        })
    }

    /// List subvolumes through a read-only scratch mount.
    fn list_subvolumes(&self, ledger: &mut Ledger, c: &RootCandidate) -> Result<Vec<String>> {
        let req = request_for(c, self.scratch).options("ro");
        mount_recorded(self.host, ledger, req)?;
        let r = self.host.btrfs_subvolumes(self.scratch);
        ledger.release_last(self.host)?;
        r
    }

    fn mount_btrfs(&self, ledger: &mut Ledger, c: &RootCandidate) -> Result<Attempt> {
        // The scratch mount already shows whether the filesystem mounts at all
        let (subvols, mut mounted_any) = match self.list_subvolumes(ledger, c) {
            Ok(s) => (s, true),
            Err(e) => {
                tracing::warn!("Listing subvolumes of {}: {e:#}", c.device);
                (Vec::new(), false)
            }
        };
        tracing::debug!("Subvolumes of {}: {subvols:?}", c.device);
        let mut names: Vec<&str> = Vec::new();
        let conventional = ROOT_SUBVOLUMES
            .iter()
            .copied()
            .filter(|n| subvols.is_empty() || subvols.iter().any(|s| s == n));
        let discovered = subvols
            .iter()
            .map(String::as_str)
            .filter(|s| !HOME_SUBVOLUMES.contains(s));
        for n in self.subvol.into_iter().chain(conventional).chain(discovered) {
            if !names.contains(&n) {
                names.push(n);
            }
        }
        for name in names {
            let req = request_for(c, self.root).options(format!("subvol={name}"));
            match try_root(self.host, ledger, req)? {
                Attempt::Root => {
                    self.mount_home(ledger, c, name, &subvols);
                    return Ok(Attempt::Root);
                }
                Attempt::NotRoot => mounted_any = true,
                Attempt::Unmountable => {}
            }
        }
        tracing::info!("No subvolume of {} holds a root; using the top level", c.device);
        match try_root(self.host, ledger, request_for(c, self.root))? {
            Attempt::Unmountable if mounted_any => Ok(Attempt::NotRoot),
            a => Ok(a),
        }
    }

    fn mount_home(&self, ledger: &mut Ledger, c: &RootCandidate, root: &str, subvols: &[String]) {
        let Some(home) = HOME_SUBVOLUMES
            .iter()
            .find(|h| **h != root && subvols.iter().any(|s| s == *h))
        else {
            return;
        };
        let target = self.root.join("home");
        let r = std::fs::create_dir_all(&target)
            .with_context(|| format!("Creating {target}"))
            .and_then(|_| {
                let req = request_for(c, &target).options(format!("subvol={home}"));
                mount_recorded(self.host, ledger, req)
            });
        if let Err(e) = r {
            tracing::warn!("Mounting home subvolume {home}: {e:#}");
        }
    }

    /// Mount `/boot` and the ESP when present; failures are only warnings.
    pub(crate) fn mount_boot(
        &self,
        ledger: &mut Ledger,
        boot: Option<&PartitionInfo>,
        efi: Option<&PartitionInfo>,
    ) {
        if let Some(boot) = boot {
            let target = self.root.join("boot");
            if dir_is_populated(&target) {
                tracing::debug!("{target} is already populated; not mounting {}", boot.path);
            } else if let Err(e) = self.mount_partition(ledger, boot, &target) {
                tracing::warn!("Mounting {} on /boot: {e:#}", boot.path);
            }
        }
        if let Some(efi) = efi {
            let target = efi_mountpoint(self.root);
            if let Err(e) = self.mount_partition(ledger, efi, &target) {
                tracing::warn!("Mounting EFI partition {}: {e:#}", efi.path);
            }
        }
    }

    fn mount_partition(&self, ledger: &mut Ledger, p: &PartitionInfo, target: &Utf8Path) -> Result<()> {
        std::fs::create_dir_all(target).with_context(|| format!("Creating {target}"))?;
        let mut req = MountRequest::new(p.path.as_str(), target);
        if let Some(t) = p.fstype.mount_type() {
            req = req.fstype(t);
        }
        mount_recorded(self.host, ledger, req)
    }
}

fn dir_is_populated(p: &Utf8Path) -> bool {
    std::fs::read_dir(p)
        .map(|mut it| it.next().is_some())
        .unwrap_or(false)
}

/// Raspberry Pi images mount their firmware partition at `/boot/firmware`.
fn efi_mountpoint(root: &Utf8Path) -> camino::Utf8PathBuf {
    let firmware = root.join("boot/firmware");
    let efi = root.join("boot/efi");
    if firmware.is_dir() && !efi.exists() {
        firmware
    } else {
        efi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{Call, FakeFs, FakeHost};
    use camino::Utf8PathBuf;
    use indoc::indoc;

    struct Env {
        _td: tempfile::TempDir,
        root: Utf8PathBuf,
        scratch: Utf8PathBuf,
    }

    fn env() -> Env {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap().to_owned();
        let root = base.join("root");
        let scratch = base.join("scratch");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir(&scratch).unwrap();
        Env {
            _td: td,
            root,
            scratch,
        }
    }

    fn candidate(dev: &str, fstype: FsType) -> RootCandidate {
        RootCandidate {
            device: dev.into(),
            fstype,
        }
    }

    #[test]
    fn test_parse_subvolume_list() {
        let buf = indoc! { "
            ID 256 gen 35 top level 5 path @
            ID 257 gen 33 top level 5 path @home
            ID 258 gen 12 top level 256 path var/lib/portables
        "};
        assert_eq!(
            parse_subvolume_list(buf),
            ["@", "@home", "var/lib/portables"]
        );
        assert!(parse_subvolume_list("").is_empty());
    }

    #[test]
    fn test_root_layout() {
        let e = env();
        assert!(!has_root_layout(&e.root));
        std::fs::create_dir_all(e.root.join("etc")).unwrap();
        assert!(!has_root_layout(&e.root));
        std::fs::create_dir_all(e.root.join("usr/bin")).unwrap();
        assert!(has_root_layout(&e.root));
        std::os::unix::fs::symlink("usr/bin", e.root.join("bin")).unwrap();
        assert!(has_root_layout(&e.root));
    }

    #[test]
    fn test_btrfs_subvolumes() {
        let e = env();
        let host = FakeHost::default();
        host.add_filesystem(
            "/dev/nbd0p2",
            FakeFs::btrfs()
                .subvolume("@", &["etc", "bin", "home"])
                .subvolume("home", &["alice"]),
        );
        let m = Mounter {
            host: &host,
            root: &e.root,
            scratch: &e.scratch,
            subvol: None,
        };
        let mut ledger = Ledger::new("x");
        let cands = [candidate("/dev/nbd0p2", FsType::Btrfs)];
        let used = m.mount_root(&mut ledger, &cands).unwrap();
        assert_eq!(used, &cands[0]);
        let mounts = ledger.mounts().collect::<Vec<_>>();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].target, e.root);
        assert_eq!(mounts[0].options.as_deref(), Some("subvol=@"));
        assert_eq!(mounts[1].target, e.root.join("home"));
        assert_eq!(mounts[1].options.as_deref(), Some("subvol=home"));
        assert!(e.root.join("home/alice").exists());
        // The scratch mount was released right away
        assert!(host
            .calls()
            .contains(&Call::Unmount(e.scratch.clone())));
    }

    #[test]
    fn test_btrfs_fallback_to_toplevel() {
        let e = env();
        let host = FakeHost::default();
        host.add_filesystem(
            "/dev/nbd0p1",
            FakeFs::btrfs()
                .toplevel(&["etc", "usr/bin"])
                .subvolume("data", &["srv"]),
        );
        let m = Mounter {
            host: &host,
            root: &e.root,
            scratch: &e.scratch,
            subvol: None,
        };
        let mut ledger = Ledger::new("x");
        let cands = [candidate("/dev/nbd0p1", FsType::Btrfs)];
        m.mount_root(&mut ledger, &cands).unwrap();
        let mounts = ledger.mounts().collect::<Vec<_>>();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].options, None);
        assert_eq!(mounts[0].fstype.as_deref(), Some("btrfs"));
        let subvol_attempts = host
            .mounts_attempted()
            .into_iter()
            .filter(|r| r.options.as_deref() == Some("subvol=data"))
            .count();
        assert_eq!(subvol_attempts, 1);
    }

    #[test]
    fn test_subvol_override() {
        let e = env();
        let host = FakeHost::default();
        host.add_filesystem(
            "/dev/nbd0p1",
            FakeFs::btrfs()
                .subvolume("@", &["etc", "bin"])
                .subvolume("snapshots/1", &["etc", "bin"]),
        );
        let m = Mounter {
            host: &host,
            root: &e.root,
            scratch: &e.scratch,
            subvol: Some("snapshots/1"),
        };
        let mut ledger = Ledger::new("x");
        let cands = [candidate("/dev/nbd0p1", FsType::Btrfs)];
        m.mount_root(&mut ledger, &cands).unwrap();
        let root = ledger.mounts().next().unwrap();
        assert_eq!(root.options.as_deref(), Some("subvol=snapshots/1"));
    }

    #[test]
    fn test_alternate_root() {
        let e = env();
        let host = FakeHost::default();
        host.add_filesystem("/dev/nbd0p1", FakeFs::plain("ext4", &["grub2", "vmlinuz"]));
        host.add_filesystem("/dev/nbd0p2", FakeFs::plain("xfs", &["etc", "usr/bin"]));
        let m = Mounter {
            host: &host,
            root: &e.root,
            scratch: &e.scratch,
            subvol: None,
        };
        let mut ledger = Ledger::new("x");
        let cands = [
            candidate("/dev/nbd0p1", FsType::Ext4),
            candidate("/dev/nbd0p9", FsType::Ext4),
            candidate("/dev/nbd0p2", FsType::Xfs),
        ];
        let used = m.mount_root(&mut ledger, &cands).unwrap();
        assert_eq!(used.device, "/dev/nbd0p2");
        assert_eq!(ledger.len(), 1);
        assert!(!e.root.join("vmlinuz").exists());

        let mut ledger = Ledger::new("y");
        host.unmount(&e.root, crate::host::UnmountMode::Normal).unwrap();
        let err = m.mount_root(&mut ledger, &cands[..2]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SetupError>(),
            Some(SetupError::SanityCheckFailed)
        ));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_nothing_mountable() {
        let e = env();
        let host = FakeHost::default();
        host.fail_mount(e.root.clone());
        host.add_filesystem("/dev/nbd0p1", FakeFs::plain("ext4", &["etc", "bin"]));
        let m = Mounter {
            host: &host,
            root: &e.root,
            scratch: &e.scratch,
            subvol: None,
        };
        let mut ledger = Ledger::new("x");
        let cands = [
            candidate("/dev/nbd0p1", FsType::Ext4),
            candidate("/dev/nbd0p9", FsType::Xfs),
        ];
        let err = m.mount_root(&mut ledger, &cands).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SetupError>(),
            Some(SetupError::NoUsableRoot)
        ));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_boot_and_efi() {
        let e = env();
        let host = FakeHost::default();
        host.add_filesystem("/dev/nbd0p3", FakeFs::plain("ext4", &["etc", "bin", "boot"]));
        host.add_filesystem("/dev/nbd0p2", FakeFs::plain("ext4", &["vmlinuz", "efi"]));
        host.add_filesystem("/dev/nbd0p1", FakeFs::plain("vfat", &["EFI"]));
        let m = Mounter {
            host: &host,
            root: &e.root,
            scratch: &e.scratch,
            subvol: None,
        };
        let mut ledger = Ledger::new("x");
        m.mount_root(&mut ledger, &[candidate("/dev/nbd0p3", FsType::Ext4)])
            .unwrap();
        let part = |path: &str, fstype: &str| PartitionInfo {
            path: path.into(),
            fstype: FsType::parse(fstype),
            size: 0,
            label: None,
            parttype: None,
            role: crate::model::PartitionRole::Unassigned,
        };
        let boot = part("/dev/nbd0p2", "ext4");
        let efi = part("/dev/nbd0p1", "vfat");
        m.mount_boot(&mut ledger, Some(&boot), Some(&efi));
        let targets = ledger.mounts().map(|m| m.target.clone()).collect::<Vec<_>>();
        assert_eq!(
            targets,
            [e.root.clone(), e.root.join("boot"), e.root.join("boot/efi")]
        );
        assert!(e.root.join("boot/efi/EFI").exists());
    }

    #[test]
    fn test_boot_skipped_when_populated() {
        let e = env();
        let host = FakeHost::default();
        host.add_filesystem(
            "/dev/nbd0p2",
            FakeFs::plain("ext4", &["etc", "bin", "boot/vmlinuz", "boot/firmware"]),
        );
        host.add_filesystem("/dev/nbd0p1", FakeFs::plain("vfat", &["config.txt"]));
        let m = Mounter {
            host: &host,
            root: &e.root,
            scratch: &e.scratch,
            subvol: None,
        };
        let mut ledger = Ledger::new("x");
        m.mount_root(&mut ledger, &[candidate("/dev/nbd0p2", FsType::Ext4)])
            .unwrap();
        let boot = PartitionInfo {
            path: "/dev/nbd0p3".into(),
            fstype: FsType::Ext4,
            size: 0,
            label: None,
            parttype: None,
            role: crate::model::PartitionRole::Boot,
        };
        let efi = PartitionInfo {
            path: "/dev/nbd0p1".into(),
            fstype: FsType::Vfat,
            ..boot.clone()
        };
        m.mount_boot(&mut ledger, Some(&boot), Some(&efi));
        let targets = ledger.mounts().map(|m| m.target.clone()).collect::<Vec<_>>();
        assert_eq!(targets, [e.root.clone(), e.root.join("boot/firmware")]);
    }

    #[test]
    fn test_boot_failure_is_soft() {
        let e = env();
        let host = FakeHost::default();
        host.add_filesystem("/dev/nbd0p2", FakeFs::plain("ext4", &["etc", "bin"]));
        let m = Mounter {
            host: &host,
            root: &e.root,
            scratch: &e.scratch,
            subvol: None,
        };
        let mut ledger = Ledger::new("x");
        m.mount_root(&mut ledger, &[candidate("/dev/nbd0p2", FsType::Ext4)])
            .unwrap();
        let efi = PartitionInfo {
            path: "/dev/nbd0p7".into(),
            fstype: FsType::Vfat,
            size: 0,
            label: None,
            parttype: None,
            role: crate::model::PartitionRole::Efi,
        };
        m.mount_boot(&mut ledger, None, Some(&efi));
        assert_eq!(ledger.len(), 1);
    }
}
