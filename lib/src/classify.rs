//! Heuristic partition roles.
//!
//! This is a best-effort guess from filesystem types and sizes; anything it
//! gets wrong can be overridden from the command line.

use std::cmp::Reverse;

use crate::model::{DiskLayout, FsType, PartitionInfo, PartitionRole, PartitionTable};

/// GPT type GUID of an EFI System Partition.
pub(crate) const ESP_GUID: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";

const MIB: u64 = 1024 * 1024;

/// Size thresholds, in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Thresholds {
    /// Root candidates below this are only used when nothing larger exists.
    pub(crate) min_root: u64,
    /// vfat partitions at or above this are not considered an ESP.
    pub(crate) max_efi: u64,
    pub(crate) boot_min: u64,
    pub(crate) boot_max: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_root: 500 * MIB,
            max_efi: 1000 * MIB,
            boot_min: 200 * MIB,
            boot_max: 2048 * MIB,
        }
    }
}

impl Thresholds {
    pub(crate) fn is_boot_sized(&self, size: u64) -> bool {
        (self.boot_min..=self.boot_max).contains(&size)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Classification {
    /// Best root candidate.
    pub(crate) root: Option<PartitionInfo>,
    /// The remaining root candidates, best first.
    pub(crate) alternates: Vec<PartitionInfo>,
    pub(crate) efi: Option<PartitionInfo>,
    pub(crate) boot: Option<PartitionInfo>,
    pub(crate) luks: Vec<PartitionInfo>,
    pub(crate) lvm: Vec<PartitionInfo>,
    /// Every surveyed partition, with its role filled in.
    pub(crate) partitions: Vec<PartitionInfo>,
}

impl Classification {
    /// Whether anything that could hold a Linux root was seen at all.
    pub(crate) fn has_linux_storage(&self) -> bool {
        self.root.is_some() || !self.luks.is_empty() || !self.lvm.is_empty()
    }

    pub(crate) fn root_candidates(&self) -> impl Iterator<Item = &PartitionInfo> {
        self.root.iter().chain(self.alternates.iter())
    }
}

fn is_esp(table: PartitionTable, p: &PartitionInfo, t: &Thresholds) -> bool {
    if p.fstype != FsType::Vfat || p.size >= t.max_efi {
        return false;
    }
    match (table, p.parttype.as_deref()) {
        (PartitionTable::Gpt, Some(guid)) => guid.eq_ignore_ascii_case(ESP_GUID),
        _ => true,
    }
}

pub(crate) fn classify(layout: &DiskLayout, t: &Thresholds) -> Classification {
    let mut parts = layout.partitions.clone();
    for p in parts.iter_mut() {
        p.role = match &p.fstype {
            f if f.is_linux_root() => PartitionRole::RootCandidate,
            FsType::CryptoLuks => PartitionRole::LuksMember,
            FsType::Lvm2Member => PartitionRole::LvmMember,
            _ => PartitionRole::Unassigned,
        };
    }
    if let Some(p) = parts.iter_mut().find(|p| is_esp(layout.table, p, t)) {
        p.role = PartitionRole::Efi;
    }

    let mut roots = parts
        .iter()
        .enumerate()
        .filter(|(_, p)| p.role == PartitionRole::RootCandidate)
        .map(|(i, p)| (i, p.size))
        .collect::<Vec<_>>();
    // Stable: equal sizes keep their on-disk order
    roots.sort_by_key(|&(_, size)| (size < t.min_root, Reverse(size)));
    let best = roots.first().map(|&(i, _)| i);

    let boot = parts
        .iter()
        .enumerate()
        .find(|&(i, p)| {
            Some(i) != best
                && p.role == PartitionRole::RootCandidate
                && p.fstype.is_boot_capable()
                && t.is_boot_sized(p.size)
        })
        .map(|(i, _)| i);
    if let Some(i) = boot {
        parts[i].role = PartitionRole::Boot;
    }

    let mut r = Classification {
        root: best.map(|i| parts[i].clone()),
        alternates: roots
            .iter()
            .skip(1)
            .filter(|&&(i, _)| Some(i) != boot)
            .map(|&(i, _)| parts[i].clone())
            .collect(),
        efi: parts.iter().find(|p| p.role == PartitionRole::Efi).cloned(),
        boot: boot.map(|i| parts[i].clone()),
        ..Default::default()
    };
    for p in parts.iter() {
        match p.role {
            PartitionRole::LuksMember => r.luks.push(p.clone()),
            PartitionRole::LvmMember => r.lvm.push(p.clone()),
            _ => {}
        }
    }
    r.partitions = parts;
    r
}
