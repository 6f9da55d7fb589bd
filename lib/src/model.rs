//! Types shared across the pipeline: what we attach, what we find on it,
//! and what we acquire along the way.

use std::fmt::Display;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Container format of a disk image, named the way `qemu-nbd -f` expects.
#[derive(clap::ValueEnum, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum ImageFormat {
    Raw,
    Qcow2,
    Vdi,
    Vmdk,
    /// Virtual PC / VHD; also what Ventoy `.vtoy` images use.
    Vpc,
}

impl ImageFormat {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vdi => "vdi",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vpc => "vpc",
        }
    }
}

impl Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An image bound to an nbd device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct BlockDeviceHandle {
    pub(crate) device: Utf8PathBuf,
    pub(crate) image: Utf8PathBuf,
    pub(crate) format: ImageFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum FsType {
    Ext4,
    Ext3,
    Ext2,
    Xfs,
    Btrfs,
    Vfat,
    CryptoLuks,
    Lvm2Member,
    Swap,
    Unknown(String),
}

impl FsType {
    /// Parse a blkid/lsblk `TYPE` string.
    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "ext4" => Self::Ext4,
            "ext3" => Self::Ext3,
            "ext2" => Self::Ext2,
            "xfs" => Self::Xfs,
            "btrfs" => Self::Btrfs,
            "vfat" | "fat" | "msdos" => Self::Vfat,
            "crypto_LUKS" => Self::CryptoLuks,
            "LVM2_member" => Self::Lvm2Member,
            "swap" => Self::Swap,
            o => Self::Unknown(o.to_string()),
        }
    }

    /// The type string understood by `mount -t`, if this is mountable.
    pub(crate) fn mount_type(&self) -> Option<&str> {
        match self {
            Self::Ext4 => Some("ext4"),
            Self::Ext3 => Some("ext3"),
            Self::Ext2 => Some("ext2"),
            Self::Xfs => Some("xfs"),
            Self::Btrfs => Some("btrfs"),
            Self::Vfat => Some("vfat"),
            _ => None,
        }
    }

    /// Filesystems that can hold a Linux root.
    pub(crate) fn is_linux_root(&self) -> bool {
        matches!(
            self,
            Self::Ext4 | Self::Ext3 | Self::Ext2 | Self::Xfs | Self::Btrfs
        )
    }

    /// Filesystems we consider for a separate `/boot`.
    pub(crate) fn is_boot_capable(&self) -> bool {
        matches!(self, Self::Ext4 | Self::Ext3 | Self::Ext2 | Self::Xfs)
    }
}

impl Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CryptoLuks => f.write_str("crypto_LUKS"),
            Self::Lvm2Member => f.write_str("LVM2_member"),
            Self::Swap => f.write_str("swap"),
            Self::Unknown(s) if s.is_empty() => f.write_str("unknown"),
            Self::Unknown(s) => f.write_str(s),
            o => f.write_str(o.mount_type().unwrap_or("unknown")),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum PartitionRole {
    RootCandidate,
    Boot,
    Efi,
    LuksMember,
    LvmMember,
    Unassigned,
}

impl Display for PartitionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RootCandidate => "root",
            Self::Boot => "boot",
            Self::Efi => "efi",
            Self::LuksMember => "luks",
            Self::LvmMember => "lvm",
            Self::Unassigned => "-",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct PartitionInfo {
    pub(crate) path: Utf8PathBuf,
    pub(crate) fstype: FsType,
    pub(crate) size: u64,
    pub(crate) label: Option<String>,
    /// GPT type GUID or MBR type code.
    pub(crate) parttype: Option<String>,
    pub(crate) role: PartitionRole,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum PartitionTable {
    Gpt,
    Dos,
    None,
}

impl PartitionTable {
    pub(crate) fn parse(s: Option<&str>) -> Self {
        match s {
            Some("gpt") => Self::Gpt,
            Some("dos") | Some("mbr") => Self::Dos,
            _ => Self::None,
        }
    }
}

/// Everything the surveyor found on the attached device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct DiskLayout {
    pub(crate) device: Utf8PathBuf,
    pub(crate) table: PartitionTable,
    pub(crate) partitions: Vec<PartitionInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct LuksMapping {
    pub(crate) source: Utf8PathBuf,
    /// Name under `/dev/mapper`.
    pub(crate) name: String,
    pub(crate) open: bool,
}

impl LuksMapping {
    pub(crate) fn device(&self) -> Utf8PathBuf {
        format!("/dev/mapper/{}", self.name).into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct VolumeGroup {
    pub(crate) name: String,
    pub(crate) activated_by_session: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum MountKind {
    Filesystem,
    Bind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct MountRecord {
    pub(crate) target: Utf8PathBuf,
    pub(crate) source: String,
    pub(crate) fstype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) options: Option<String>,
    pub(crate) kind: MountKind,
    /// Position in the ledger at acquisition time.
    pub(crate) ordinal: usize,
}

impl MountRecord {
    pub(crate) fn is_btrfs(&self) -> bool {
        self.fstype.as_deref() == Some("btrfs")
    }
}

/// What `resolv.conf` in the target looked like before we replaced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub(crate) enum ResolvConfOriginal {
    File { backup: Utf8PathBuf },
    Symlink { target: Utf8PathBuf },
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ResolvConfRecord {
    pub(crate) path: Utf8PathBuf,
    pub(crate) original: ResolvConfOriginal,
}
