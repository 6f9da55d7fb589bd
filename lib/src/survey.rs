//! Enumerate the partitions of an attached device.

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

use crate::host::Host;
use crate::model::{DiskLayout, FsType, PartitionInfo, PartitionRole, PartitionTable};

/// List the partitions of `device` with their filesystem metadata.
///
/// Partitions that have vanished or cannot be probed are skipped.
#[context("Surveying {device}")]
pub(crate) fn survey(host: &dyn Host, device: &Utf8Path) -> Result<DiskLayout> {
    let dev = host.list_device(device)?;
    let table = PartitionTable::parse(dev.pttype.as_deref());
    let mut partitions = Vec::new();
    for child in dev.partitions() {
        let path = child.path();
        if !host.node_exists(&path) {
            tracing::debug!("Skipping {path}: no device node");
            continue;
        }
        let fstype = match child.fstype.as_deref() {
            Some(t) if !t.is_empty() => Some(t.to_owned()),
            _ => match host.probe_fstype(&path) {
                Ok(t) => t,
                Err(e) => {
                    tracing::debug!("Skipping {path}: {e:#}");
                    continue;
                }
            },
        };
        let fstype = FsType::parse(fstype.as_deref().unwrap_or_default());
        tracing::debug!("Found {path}: {fstype}, {} bytes", child.size);
        partitions.push(PartitionInfo {
            path,
            fstype,
            size: child.size,
            label: child.label.clone(),
            parttype: child.parttype.clone(),
            role: PartitionRole::Unassigned,
        });
    }
    Ok(DiskLayout {
        device: device.to_owned(),
        table,
        partitions,
    })
}
