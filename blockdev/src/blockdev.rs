//! Low-level helpers for the block devices backing an attached disk image:
//! `lsblk` parsing, partition table rereads, device sizes and NBD slots.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use imgroot_utils::CommandRunExt;
use nix::errno::Errno;
use serde::{Deserialize, Deserializer};

/// Default sysfs mount.
pub const SYSFS: &str = "/sys";

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// One entry of `lsblk --json` output.
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    /// Kernel name, e.g. `nbd0p2`.
    pub name: String,
    /// Device node; RHEL8's lsblk doesn't have PATH, see [`Device::path()`].
    pub path: Option<String>,
    /// Size in bytes.
    #[serde(default, deserialize_with = "deserialize_size")]
    pub size: u64,
    /// Filesystem type as seen by udev/blkid, e.g. `ext4` or `crypto_LUKS`.
    pub fstype: Option<String>,
    /// Filesystem label.
    pub label: Option<String>,
    /// Partition type; a GUID on GPT, a hex code such as `0xc` on MBR.
    pub parttype: Option<String>,
    /// Partition table type of the whole disk (`gpt`, `dos`).
    pub pttype: Option<String>,
    /// Device type (`disk`, `part`, `crypt`, `lvm`, ...).
    #[serde(rename = "type")]
    pub devtype: Option<String>,
    /// Child devices (partitions, mappings).
    pub children: Option<Vec<Device>>,
}

// lsblk started emitting numbers for SIZE with -b at some point; older versions
// emit strings.
fn deserialize_size<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Num(u64),
        Str(String),
        Null,
    }
    match Size::deserialize(d)? {
        Size::Num(n) => Ok(n),
        Size::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Size::Null => Ok(0),
    }
}

impl Device {
    /// Absolute path to the device node.
    pub fn path(&self) -> Utf8PathBuf {
        self.path
            .as_deref()
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| Utf8PathBuf::from(format!("/dev/{}", &self.name)))
    }

    /// The direct children that are partitions.
    pub fn partitions(&self) -> impl Iterator<Item = &Device> {
        self.children
            .iter()
            .flatten()
            .filter(|c| c.devtype.as_deref().map_or(true, |t| t == "part"))
    }
}

/// Parse the output of `lsblk --json`.
pub fn parse_lsblk(buf: &str) -> Result<Vec<Device>> {
    let devs: DevicesOutput = serde_json::from_str(buf).context("Parsing lsblk output")?;
    Ok(devs.blockdevices)
}

/// Query a device and its children.
#[context("Listing device {dev}")]
pub fn list_dev(dev: &Utf8Path) -> Result<Device> {
    let o = Command::new("lsblk")
        .args([
            "-J",
            "-b",
            "-o",
            "NAME,PATH,SIZE,FSTYPE,LABEL,PARTTYPE,PTTYPE,TYPE",
        ])
        .arg(dev.as_str())
        .run_get_string()?;
    parse_lsblk(&o)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
}

/// Low-level probe of the filesystem signature on a device, bypassing the udev cache.
///
/// Returns `None` when blkid finds no recognizable signature.
#[context("Probing {dev}")]
pub fn probe_fstype(dev: &Utf8Path) -> Result<Option<String>> {
    let o = Command::new("blkid")
        .args(["-p", "-o", "value", "-s", "TYPE"])
        .arg(dev.as_str())
        .output()?;
    // blkid exits with 2 when nothing could be identified
    if o.status.code() == Some(2) {
        return Ok(None);
    }
    if !o.status.success() {
        anyhow::bail!("blkid failed: {:?}", o.status);
    }
    let v = String::from_utf8(o.stdout)?;
    let v = v.trim();
    Ok((!v.is_empty()).then(|| v.to_string()))
}

/// Wait for udev to process pending events.
pub fn udev_settle() -> Result<()> {
    // There's a potential window after rereading the partition table where
    // udevd hasn't yet received updates from the kernel, settle will return
    // immediately, and lsblk won't pick up partition labels.  Try to sleep
    // our way out of this.
    std::thread::sleep(std::time::Duration::from_millis(200));

    Command::new("udevadm")
        .args(["settle", "--timeout=10"])
        .run()
        .context("Failed to run udevadm settle")
}

/// Ask the kernel to reread the partition table of the device behind `file`.
#[allow(unsafe_code)]
pub fn reread_partition_table(file: &mut File, retry: bool) -> Result<()> {
    let fd = file.as_raw_fd();
    // Reread sometimes fails inexplicably, in particular right after an nbd connect.
    // Retry several times before giving up.
    let max_tries = if retry { 20 } else { 1 };
    for retries in (0..max_tries).rev() {
        let result = unsafe { ioctl::blkrrpart(fd) };
        match result {
            Ok(_) => break,
            Err(err) if retries == 0 && err == Errno::EINVAL => {
                return Err(err)
                    .context("couldn't reread partition table: device may not support partitions")
            }
            Err(err) if retries == 0 && err == Errno::EBUSY => {
                return Err(err).context("couldn't reread partition table: device is in use")
            }
            Err(err) if retries == 0 => return Err(err).context("couldn't reread partition table"),
            Err(_) => std::thread::sleep(std::time::Duration::from_millis(100)),
        }
    }
    Ok(())
}

/// Size in bytes of the block device at `dev`.
#[allow(unsafe_code)]
#[context("Querying size of {dev}")]
pub fn device_size(dev: &Utf8Path) -> Result<u64> {
    let f = File::open(dev)?;
    let mut size: libc::size_t = 0;
    unsafe { ioctl::blkgetsize64(f.as_raw_fd(), &mut size) }?;
    Ok(size as u64)
}

// create unsafe ioctl wrappers
#[allow(clippy::missing_safety_doc)]
mod ioctl {
    use nix::{ioctl_none, ioctl_read, libc};
    ioctl_none!(blkrrpart, 0x12, 95);
    ioctl_read!(blkgetsize64, 0x12, 114, libc::size_t);
}

/// The device node for a given nbd slot.
pub fn nbd_device(slot: u32) -> Utf8PathBuf {
    format!("/dev/nbd{slot}").into()
}

/// Return the size in bytes currently backing an nbd slot, as reported by sysfs.
///
/// An unbound slot reports zero.
#[context("Querying nbd{slot}")]
pub fn nbd_slot_size(sysfs: &Utf8Path, slot: u32) -> Result<u64> {
    let p = sysfs.join(format!("block/nbd{slot}/size"));
    let sectors = std::fs::read_to_string(&p).with_context(|| format!("Reading {p}"))?;
    let sectors: u64 = sectors
        .trim()
        .parse()
        .with_context(|| format!("Parsing {p}"))?;
    // sysfs always counts 512-byte sectors, regardless of the logical block size
    Ok(sectors * 512)
}

/// Parse a string into mibibytes
pub fn parse_size_mib(mut s: &str) -> Result<u64> {
    let suffixes = [
        ("MiB", 1u64),
        ("M", 1u64),
        ("GiB", 1024),
        ("G", 1024),
        ("TiB", 1024 * 1024),
        ("T", 1024 * 1024),
    ];
    let mut mul = 1u64;
    for (suffix, imul) in suffixes {
        if let Some((sv, rest)) = s.rsplit_once(suffix) {
            if !rest.is_empty() {
                anyhow::bail!("Trailing text after size: {rest}");
            }
            s = sv;
            mul = imul;
            break;
        }
    }
    let v = s.trim().parse::<u64>()?;
    Ok(v * mul)
}
