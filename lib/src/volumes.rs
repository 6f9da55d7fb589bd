//! # Encryption and volume management
//!
//! Unlocks LUKS containers, activates the LVM volume groups that live on
//! this session's storage, and turns everything found into an ordered list
//! of root candidates.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::classify::Classification;
use crate::error::SetupError;
use crate::host::Host;
use crate::ledger::{Ledger, Resource};
use crate::model::{FsType, LuksMapping, VolumeGroup};
use crate::prompt::Prompt;

/// Logical volume names that conventionally hold the root filesystem, best first.
const ROOT_LV_NAMES: &[&str] = &["root", "rootlv", "lv_root", "lvol0", "system"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct PhysicalVolume {
    pub(crate) pv_name: String,
    #[serde(default)]
    pub(crate) vg_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LogicalVolume {
    pub(crate) vg_name: String,
    pub(crate) lv_name: String,
    pub(crate) path: Utf8PathBuf,
    pub(crate) size: u64,
    pub(crate) active: bool,
}

#[derive(Debug, Deserialize)]
struct LvsRow {
    vg_name: String,
    lv_name: String,
    #[serde(default)]
    lv_path: String,
    #[serde(default)]
    lv_size: String,
    #[serde(default)]
    lv_active: String,
}

/// The envelope of `pvs`/`lvs --reportformat json`.
#[derive(Debug, Deserialize)]
pub(crate) struct Report<T> {
    report: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PvReport {
    #[serde(default)]
    pv: Vec<PhysicalVolume>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LvReport {
    #[serde(default)]
    lv: Vec<LvsRow>,
}

impl Report<PvReport> {
    /// Rows of `pvs --reportformat json -o pv_name,vg_name`.
    pub(crate) fn into_physical_volumes(self) -> Vec<PhysicalVolume> {
        self.report.into_iter().flat_map(|r| r.pv).collect()
    }
}

impl Report<LvReport> {
    /// Rows of `lvs --reportformat json --units b --nosuffix -o vg_name,lv_name,lv_path,lv_size,lv_active`.
    pub(crate) fn into_logical_volumes(self) -> Result<Vec<LogicalVolume>> {
        self.report
            .into_iter()
            .flat_map(|r| r.lv)
            .map(|row| {
                let size = if row.lv_size.is_empty() {
                    0
                } else {
                    row.lv_size.parse().with_context(|| {
                        format!("Parsing size of {}/{}", row.vg_name, row.lv_name)
                    })?
                };
                let path = if row.lv_path.is_empty() {
                    format!("/dev/{}/{}", row.vg_name, row.lv_name)
                } else {
                    row.lv_path
                };
                Ok(LogicalVolume {
                    path: path.into(),
                    size,
                    active: row.lv_active == "active",
                    vg_name: row.vg_name,
                    lv_name: row.lv_name,
                })
            })
            .collect()
    }
}

/// Device-mapper name for the `index`th container unlocked by a session.
pub(crate) fn mapping_name(session: &str, index: usize) -> String {
    format!("imgroot-{session}-{index}")
}

/// A device that may hold the root filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RootCandidate {
    pub(crate) device: Utf8PathBuf,
    pub(crate) fstype: FsType,
}

impl RootCandidate {
    fn probe(host: &dyn Host, device: &Utf8Path) -> Self {
        let fstype = match host.probe_fstype(device) {
            Ok(t) => FsType::parse(t.as_deref().unwrap_or_default()),
            Err(e) => {
                tracing::debug!("Probing {device}: {e:#}");
                FsType::Unknown(String::new())
            }
        };
        Self {
            device: device.to_owned(),
            fstype,
        }
    }
}

/// User choices that take precedence over the heuristics.
#[derive(Debug, Default, Clone)]
pub(crate) struct RootOverrides {
    /// Use exactly this device as root.
    pub(crate) root: Option<Utf8PathBuf>,
    /// A logical volume, either `vg/lv` or just `lv`.
    pub(crate) root_lv: Option<String>,
}

#[derive(Debug)]
pub(crate) struct VolumeOptions<'a> {
    pub(crate) session: &'a str,
    pub(crate) luks_attempts: u32,
    /// Tried after the built-in logical volume names.
    pub(crate) extra_lv_names: &'a [String],
    pub(crate) overrides: &'a RootOverrides,
}

fn is_root_lv_name(name: &str, extra: &[String]) -> bool {
    ROOT_LV_NAMES.contains(&name) || name.ends_with("-root") || extra.iter().any(|e| e == name)
}

fn lv_name_rank(name: &str, extra: &[String]) -> usize {
    ROOT_LV_NAMES
        .iter()
        .position(|n| *n == name)
        .or_else(|| name.ends_with("-root").then_some(ROOT_LV_NAMES.len()))
        .or_else(|| {
            extra
                .iter()
                .position(|e| e == name)
                .map(|i| ROOT_LV_NAMES.len() + 1 + i)
        })
        .unwrap_or(usize::MAX)
}

/// Order logical volumes as root candidates: conventional names first, then
/// any volume with a Linux filesystem, then (if nothing else) the first one.
pub(crate) fn order_root_lvs(
    lvs: &[(LogicalVolume, FsType)],
    extra: &[String],
) -> Vec<RootCandidate> {
    let mut named = lvs
        .iter()
        .filter(|(lv, _)| is_root_lv_name(&lv.lv_name, extra))
        .collect::<Vec<_>>();
    named.sort_by_key(|(lv, _)| lv_name_rank(&lv.lv_name, extra));
    let mut r = named
        .into_iter()
        .map(|(lv, fstype)| RootCandidate {
            device: lv.path.clone(),
            fstype: fstype.clone(),
        })
        .collect::<Vec<_>>();
    for (lv, fstype) in lvs {
        if fstype.is_linux_root() && !r.iter().any(|c| c.device == lv.path) {
            r.push(RootCandidate {
                device: lv.path.clone(),
                fstype: fstype.clone(),
            });
        }
    }
    if r.is_empty() {
        if let Some((lv, fstype)) = lvs.first() {
            r.push(RootCandidate {
                device: lv.path.clone(),
                fstype: fstype.clone(),
            });
        }
    }
    r
}

fn matches_lv_override(spec: &str, lv: &LogicalVolume) -> bool {
    match spec.split_once('/') {
        Some((vg, name)) => lv.vg_name == vg && lv.lv_name == name,
        None => lv.lv_name == spec,
    }
}

/// What the volume manager did, for reporting.
#[derive(Debug, Default)]
pub(crate) struct Resolved {
    pub(crate) candidates: Vec<RootCandidate>,
    pub(crate) opened: Vec<LuksMapping>,
    pub(crate) volume_groups: Vec<String>,
}

/// Try to unlock one LUKS container, prompting for a passphrase.
fn unlock(
    host: &dyn Host,
    prompt: &dyn Prompt,
    source: &Utf8Path,
    name: &str,
    attempts: u32,
) -> Result<bool> {
    for attempt in 1..=attempts {
        let Some(passphrase) = prompt.passphrase(source, attempt)? else {
            tracing::warn!("Skipping encrypted partition {source}");
            return Ok(false);
        };
        match host.luks_open(source, name, &passphrase) {
            Ok(()) => return Ok(true),
            Err(e) => tracing::warn!("Unlocking {source} (attempt {attempt}/{attempts}): {e:#}"),
        }
    }
    tracing::warn!("Giving up on encrypted partition {source}");
    Ok(false)
}

/// Unlock, activate and collect root candidates, recording everything acquired.
pub(crate) fn resolve_root(
    host: &dyn Host,
    prompt: &dyn Prompt,
    ledger: &mut Ledger,
    device: &Utf8Path,
    class: &Classification,
    opts: &VolumeOptions,
) -> Result<Resolved> {
    let mut r = Resolved::default();
    let mut direct = Vec::new();
    let mut lvm_seen = !class.lvm.is_empty();

    for (index, part) in class.luks.iter().enumerate() {
        let name = mapping_name(opts.session, index);
        if !unlock(host, prompt, &part.path, &name, opts.luks_attempts)? {
            continue;
        }
        let mapping = LuksMapping {
            source: part.path.clone(),
            name,
            open: true,
        };
        ledger.push(Resource::Luks(mapping.clone()));
        let inner = RootCandidate::probe(host, &mapping.device());
        tracing::debug!("{} contains {}", mapping.source, inner.fstype);
        match &inner.fstype {
            f if f.is_linux_root() => direct.push(inner),
            FsType::Lvm2Member => lvm_seen = true,
            _ => {}
        }
        r.opened.push(mapping);
    }
    if !r.opened.is_empty() {
        if let Err(e) = host.settle() {
            tracing::warn!("Waiting for devices after unlock: {e:#}");
        }
    }

    let mut preferred_lv = None;
    let mut lv_candidates = Vec::new();
    if lvm_seen {
        let mut ours = r.opened.iter().map(|m| m.device()).collect::<Vec<_>>();
        ours.extend(class.lvm.iter().map(|p| p.path.clone()));
        let lvs = activate_volume_groups(host, ledger, device, &ours, &mut r.volume_groups)?;
        if let Some(spec) = opts.overrides.root_lv.as_deref() {
            match lvs.iter().find(|(lv, _)| matches_lv_override(spec, lv)) {
                Some((lv, fstype)) => {
                    preferred_lv = Some(RootCandidate {
                        device: lv.path.clone(),
                        fstype: fstype.clone(),
                    })
                }
                None => tracing::warn!("Logical volume {spec} not found"),
            }
        }
        lv_candidates = order_root_lvs(&lvs, opts.extra_lv_names);
    } else if let Some(spec) = opts.overrides.root_lv.as_deref() {
        tracing::warn!("Ignoring --root-lv {spec}: no LVM storage found");
    }

    if let Some(root) = opts.overrides.root.as_deref() {
        r.candidates.push(RootCandidate::probe(host, root));
        return Ok(r);
    }
    // Logical volumes only come after every direct root partition
    r.candidates.extend(preferred_lv);
    r.candidates.extend(direct);
    r.candidates.extend(class.root_candidates().map(|p| RootCandidate {
        device: p.path.clone(),
        fstype: p.fstype.clone(),
    }));
    for c in lv_candidates {
        if !r.candidates.contains(&c) {
            r.candidates.push(c);
        }
    }
    if r.candidates.is_empty() {
        let seen_linux = class.has_linux_storage();
        return Err(if seen_linux {
            SetupError::NoUsableRoot.into()
        } else {
            SetupError::NoLinuxPartition.into()
        });
    }
    Ok(r)
}

/// Activate the volume groups backed by this session's storage and return
/// their logical volumes with probed filesystem types.
///
/// Groups found already active were auto-activated when their physical
/// volume appeared, and are recorded all the same.
fn activate_volume_groups(
    host: &dyn Host,
    ledger: &mut Ledger,
    device: &Utf8Path,
    ours: &[Utf8PathBuf],
    activated: &mut Vec<String>,
) -> Result<Vec<(LogicalVolume, FsType)>> {
    if let Err(e) = host.lvm_scan() {
        tracing::warn!("Scanning for physical volumes: {e:#}");
    }
    let ours = ours
        .iter()
        .map(|p| host.canonical_device(p))
        .collect::<BTreeSet<_>>();
    let partition_prefix = format!("{device}p");
    let groups = host
        .list_physical_volumes()?
        .into_iter()
        .filter(|pv| !pv.vg_name.is_empty())
        .filter(|pv| {
            let pv_path = host.canonical_device(Utf8Path::new(&pv.pv_name));
            ours.contains(&pv_path)
                || pv_path.as_path() == device
                || pv_path.as_str().starts_with(&partition_prefix)
        })
        .map(|pv| pv.vg_name)
        .collect::<BTreeSet<_>>();
    if groups.is_empty() {
        tracing::debug!("No volume groups on {device}");
        return Ok(Vec::new());
    }
    let before = host.list_logical_volumes()?;
    for vg in groups.iter() {
        if before.iter().any(|lv| &lv.vg_name == vg && lv.active) {
            tracing::info!("Volume group {vg} was activated automatically");
        } else if let Err(e) = host.vg_activate(vg) {
            tracing::warn!("Activating volume group {vg}: {e:#}");
            continue;
        }
        ledger.push(Resource::VolumeGroup(VolumeGroup {
            name: vg.clone(),
            activated_by_session: true,
        }));
        activated.push(vg.clone());
    }
    let lvs = host
        .list_logical_volumes()?
        .into_iter()
        .filter(|lv| groups.contains(&lv.vg_name))
        .map(|lv| {
            let c = RootCandidate::probe(host, &lv.path);
            (lv, c.fstype)
        })
        .collect();
    Ok(lvs)
}
