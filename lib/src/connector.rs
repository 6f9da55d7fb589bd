//! # Attaching images
//!
//! Binds an image file to a free `/dev/nbdN` with `qemu-nbd` and waits until
//! the kernel has picked up its partitions.

use std::io::Read;
use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::error::SetupError;
use crate::host::Host;
use crate::interrupt::Interrupt;
use crate::ledger::{Ledger, Resource};
use crate::model::{BlockDeviceHandle, ImageFormat};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

const QCOW2_MAGIC: &[u8] = b"QFI\xfb";
const VMDK_MAGIC: &[u8] = b"KDMV";
const VMDK_DESCRIPTOR: &[u8] = b"# Disk DescriptorFile";
const VHD_COOKIE: &[u8] = b"conectix";
/// Little-endian 0xbeda107f at offset 0x40.
const VDI_SIGNATURE: &[u8] = &[0x7f, 0x10, 0xda, 0xbe];
const VDI_SIGNATURE_OFFSET: usize = 0x40;

fn format_from_extension(path: &Utf8Path) -> Option<ImageFormat> {
    let ext = path.extension()?.to_ascii_lowercase();
    let f = match ext.as_str() {
        "vhd" | "vtoy" => ImageFormat::Vpc,
        "qcow2" => ImageFormat::Qcow2,
        "vmdk" => ImageFormat::Vmdk,
        "vdi" => ImageFormat::Vdi,
        "img" | "raw" => ImageFormat::Raw,
        _ => return None,
    };
    Some(f)
}

/// Identify a container format from the leading bytes of an image.
pub(crate) fn format_from_magic(buf: &[u8]) -> Option<ImageFormat> {
    if buf.starts_with(QCOW2_MAGIC) {
        Some(ImageFormat::Qcow2)
    } else if buf.starts_with(VMDK_MAGIC) || buf.starts_with(VMDK_DESCRIPTOR) {
        Some(ImageFormat::Vmdk)
    } else if buf.starts_with(VHD_COOKIE) {
        Some(ImageFormat::Vpc)
    } else if buf.get(VDI_SIGNATURE_OFFSET..VDI_SIGNATURE_OFFSET + VDI_SIGNATURE.len())
        == Some(VDI_SIGNATURE)
        || (buf.starts_with(b"<<< ") && contains(buf, b"Disk Image >>>"))
    {
        Some(ImageFormat::Vdi)
    } else {
        None
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Work out the container format of `path`: by extension, then by content, else raw.
#[context("Detecting format of {path}")]
pub(crate) fn detect_format(path: &Utf8Path) -> Result<ImageFormat> {
    if let Some(f) = format_from_extension(path) {
        return Ok(f);
    }
    let mut buf = Vec::with_capacity(512);
    std::fs::File::open(path)?
        .take(512)
        .read_to_end(&mut buf)?;
    Ok(format_from_magic(&buf).unwrap_or(ImageFormat::Raw))
}

#[derive(Debug, Clone)]
pub(crate) struct ConnectOptions {
    /// Number of `/dev/nbdN` slots to scan.
    pub(crate) slots: u32,
    pub(crate) attempts: u32,
    /// Backoff after the first failed attempt; grows linearly.
    pub(crate) backoff: Duration,
    pub(crate) ready_timeout: Duration,
    /// Use this device instead of scanning.
    pub(crate) device: Option<Utf8PathBuf>,
    /// Skip detection.
    pub(crate) format: Option<ImageFormat>,
}

/// The first slot with nothing bound to it.
fn find_free_slot(host: &dyn Host, slots: u32) -> Option<u32> {
    (0..slots).find(|&slot| match host.nbd_slot_size(slot) {
        Ok(size) => size == 0,
        Err(e) => {
            tracing::debug!("{e:#}");
            false
        }
    })
}

/// Bind `image` to a free nbd device, record it, and wait for it to be usable.
#[context("Connecting {image}")]
pub(crate) fn connect(
    host: &dyn Host,
    ledger: &mut Ledger,
    interrupt: &Interrupt,
    image: &Utf8Path,
    opts: &ConnectOptions,
) -> Result<BlockDeviceHandle> {
    anyhow::ensure!(image.exists(), "{image} does not exist");
    let image = image
        .canonicalize_utf8()
        .with_context(|| format!("Resolving {image}"))?;
    let detected = match opts.format {
        Some(f) => f,
        None => detect_format(&image)?,
    };
    tracing::debug!("Using format {detected} for {image}");
    if let Err(e) = host.load_nbd_module() {
        tracing::warn!("Loading nbd module: {e:#}");
    }

    let mut plan = vec![detected; opts.attempts.max(1) as usize];
    if opts.format.is_none() && detected != ImageFormat::Raw {
        plan.push(ImageFormat::Raw);
    }
    let mut saw_slot = false;
    for (i, format) in plan.iter().copied().enumerate() {
        interrupt.check()?;
        if i > 0 {
            if format == ImageFormat::Raw && detected != ImageFormat::Raw {
                tracing::warn!("Connecting as {detected} failed; trying raw");
            } else {
                sleep(opts.backoff * i as u32);
                interrupt.check()?;
            }
        }
        let device = match opts.device.as_ref() {
            Some(d) => d.clone(),
            None => match find_free_slot(host, opts.slots) {
                Some(slot) => imgroot_blockdev::nbd_device(slot),
                None => {
                    tracing::warn!("No free nbd device (attempt {})", i + 1);
                    continue;
                }
            },
        };
        saw_slot = true;
        match host.nbd_connect(&device, &image, format) {
            Ok(()) => {
                let handle = BlockDeviceHandle {
                    device,
                    image: image.clone(),
                    format,
                };
                ledger.push(Resource::BlockDevice(handle.clone()));
                wait_ready(host, interrupt, &handle.device, opts.ready_timeout)?;
                return Ok(handle);
            }
            Err(e) => tracing::warn!("Connecting to {device} as {format}: {e:#}"),
        }
    }
    if saw_slot {
        Err(SetupError::ConnectFailed {
            image,
            attempts: plan.len() as u32,
        }
        .into())
    } else {
        Err(SetupError::NoFreeSlot {
            last: opts.slots.saturating_sub(1),
        }
        .into())
    }
}

/// Reread the partition table and poll until the device reports a size.
fn wait_ready(
    host: &dyn Host,
    interrupt: &Interrupt,
    device: &Utf8Path,
    timeout: Duration,
) -> Result<u64> {
    if let Err(e) = host.rescan_partitions(device) {
        tracing::warn!("{e:#}");
    }
    let start = Instant::now();
    loop {
        interrupt.check()?;
        match host.device_size(device) {
            Ok(size) if size > 0 => {
                tracing::debug!("{device} is ready ({size} bytes)");
                return Ok(size);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("{e:#}"),
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(SetupError::DeviceNotReady {
                device: device.to_owned(),
                timeout,
            }
            .into());
        }
        sleep(READY_POLL_INTERVAL.min(timeout - elapsed));
    }
}
