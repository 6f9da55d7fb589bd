//! # Disk image chroot CLI
//!
//! Command line tool to attach a virtual disk image, assemble its root
//! filesystem and run a command inside it.

use std::ffi::OsString;
use std::process::{Command, ExitCode, ExitStatus};
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use fn_error_context::context;
use imgroot_utils::PathQuotedDisplay;
use serde::Serialize;

use crate::classify::Classification;
use crate::config::{load_config, Settings};
use crate::error::SetupError;
use crate::host::SystemHost;
use crate::interrupt::Interrupt;
use crate::lock::StateLock;
use crate::model::{ImageFormat, PartitionInfo, PartitionTable};
use crate::prompt::{find_images, Prompt, TerminalPrompt};
use crate::session::{cleanup_state_dir, MountOptions, Session};
use crate::volumes::RootOverrides;

/// Attach an image and enter its root filesystem
#[derive(Debug, Parser)]
pub(crate) struct MountOpts {
    /// Path to the disk image; prompts for one in the current directory if omitted.
    pub(crate) image: Option<Utf8PathBuf>,

    /// Image format; detected from the extension or contents by default.
    #[clap(long, value_enum)]
    pub(crate) format: Option<ImageFormat>,

    /// Use this nbd device instead of the first free one.
    #[clap(long)]
    pub(crate) device: Option<Utf8PathBuf>,

    /// Mount this block device as the root, skipping detection.
    #[clap(long, conflicts_with = "root_lv")]
    pub(crate) root: Option<Utf8PathBuf>,

    /// Prefer this logical volume (`VG/LV` or `LV`) as the root.
    #[clap(long)]
    pub(crate) root_lv: Option<String>,

    /// Btrfs subvolume to mount as the root.
    #[clap(long)]
    pub(crate) subvol: Option<String>,

    /// Don't mount a separate `/boot` or the EFI system partition.
    #[clap(long)]
    pub(crate) no_boot: bool,

    /// Leave everything mounted and print the root path instead of running a command.
    ///
    /// Use `imgroot cleanup` to release it later.
    #[clap(long, conflicts_with = "command")]
    pub(crate) keep: bool,

    /// Command to run inside the chroot; defaults to the configured shell.
    #[clap(last = true)]
    pub(crate) command: Vec<OsString>,
}

/// Show the partition layout of an image
#[derive(Debug, Parser)]
pub(crate) struct InspectOpts {
    /// Path to the disk image.
    pub(crate) image: Utf8PathBuf,

    #[clap(long, value_enum)]
    pub(crate) format: Option<ImageFormat>,

    /// Output JSON instead of a table.
    #[clap(long)]
    pub(crate) json: bool,
}

/// Mount a virtual disk image and chroot into it.
///
/// Images are attached through the kernel's nbd driver; encrypted (LUKS)
/// partitions are unlocked interactively and LVM volume groups activated.
/// Everything is released again when the command exits.
#[derive(Debug, Parser)]
#[clap(name = "imgroot", version)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Attach an image, mount its root and run a shell (or a command) inside it.
    Mount(MountOpts),
    /// Attach an image and print the partitions and the roles assigned to them.
    Inspect(InspectOpts),
    /// Release everything left behind by `mount --keep` or a crashed session.
    Cleanup,
}

/// Everything here manipulates block devices and mounts.
fn require_root() -> Result<()> {
    if !rustix::process::getuid().is_root() {
        anyhow::bail!("This command requires root privileges");
    }
    Ok(())
}

/// Pick an image from the current directory.
fn choose_image(prompt: &dyn Prompt) -> Result<Utf8PathBuf> {
    let cwd = Utf8PathBuf::try_from(std::env::current_dir()?)?;
    let images = find_images(&cwd)?;
    match images.as_slice() {
        [] => anyhow::bail!(
            "No disk images found in {cwd}; pass one explicitly (extensions: {})",
            crate::prompt::IMAGE_EXTENSIONS.join(", ")
        ),
        [only] => Ok(only.clone()),
        _ => prompt.select_image(&images),
    }
}

/// How often to check on the command while it runs.
const CHILD_POLL: Duration = Duration::from_millis(100);

/// How the command inside the chroot ended.
#[derive(Debug)]
struct ChrootOutcome {
    status: ExitStatus,
    /// SIGTERM or SIGHUP received (and passed on) while it ran.
    signal: Option<i32>,
}

/// The exit status of `mount`: 128+N if we were asked to terminate,
/// otherwise the command's own status.
fn mount_exit_status(outcome: &ChrootOutcome) -> u8 {
    use std::os::unix::process::ExitStatusExt;
    let status = &outcome.status;
    let code = outcome
        .signal
        .or_else(|| status.signal())
        .map(|s| 128 + s)
        .or_else(|| status.code())
        .unwrap_or(1);
    u8::try_from(code).unwrap_or(1)
}

fn forwarded_signal(sig: i32) -> Option<rustix::process::Signal> {
    use signal_hook::consts::{SIGHUP, SIGTERM};
    match sig {
        SIGTERM => Some(rustix::process::Signal::Term),
        SIGHUP => Some(rustix::process::Signal::Hup),
        _ => None,
    }
}

/// Run `command` (or `shell`) with `root` as its root directory, passing
/// SIGTERM and SIGHUP on to it.
fn run_in_chroot(
    root: &Utf8Path,
    command: &[OsString],
    shell: &str,
    interrupt: &Interrupt,
) -> Result<ChrootOutcome> {
    let mut cmd = Command::new("chroot");
    cmd.arg(root.as_str());
    if command.is_empty() {
        cmd.arg(shell);
    } else {
        cmd.args(command);
    }
    tracing::debug!("exec: {cmd:?}");
    let mut child = cmd.spawn().context("Spawning chroot")?;
    let pid = rustix::process::Pid::from_child(&child);
    let mut signal = None;
    loop {
        interrupt.clear_keyboard();
        if let Some(sig) = interrupt.termination().filter(|s| signal != Some(*s)) {
            if let Some(forward) = forwarded_signal(sig) {
                tracing::debug!("Passing signal {sig} on to {}", child.id());
                if let Err(e) = rustix::process::kill_process(pid, forward) {
                    tracing::warn!("Signalling chroot: {e}");
                }
            }
            signal = Some(sig);
        }
        if let Some(status) = child.try_wait().context("Waiting for chroot")? {
            return Ok(ChrootOutcome { status, signal });
        }
        std::thread::sleep(CHILD_POLL);
    }
}

/// Implementation of `imgroot mount`.
#[context("Mounting image")]
fn mount(opts: MountOpts) -> Result<ExitCode> {
    require_root()?;
    let settings = load_config()?;
    let _lock = StateLock::acquire(&settings.state_dir)?;
    let interrupt = Interrupt::install()?;
    let host = SystemHost::default();
    let prompt = TerminalPrompt::default();

    let image = match opts.image {
        Some(i) => i,
        None => choose_image(&prompt)?,
    };
    let mopts = MountOptions {
        image,
        format: opts.format,
        device: opts.device,
        overrides: RootOverrides {
            root: opts.root,
            root_lv: opts.root_lv,
        },
        subvol: opts.subvol,
        no_boot: opts.no_boot,
    };
    let mut session = Session::new(&host, &settings, interrupt.clone()).journaled()?;
    tracing::debug!("Session {}", session.id());
    let prepared = session.mount(&prompt, &mopts)?;
    let root = &prepared.workdir.root;
    println!(
        "Attached {} to {} ({})",
        prepared.handle.image, prepared.handle.device, prepared.handle.format
    );
    println!(
        "Root filesystem: {} ({})",
        prepared.root_device.device, prepared.root_device.fstype
    );

    if opts.keep {
        let resources = session.ledger().len();
        let state = session.keep();
        println!(
            "Left {resources} resources in place; root is at {}",
            PathQuotedDisplay::new(root)
        );
        if let Some(state) = state {
            println!(
                "Run `imgroot cleanup` to release them (state: {})",
                PathQuotedDisplay::new(&state)
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "Entering {}; exit the shell to unmount everything",
        PathQuotedDisplay::new(root)
    );
    let outcome = run_in_chroot(root, &opts.command, &settings.shell, &interrupt);
    interrupt.clear_keyboard();
    let report = session.teardown();
    let outcome = outcome?;
    if !report.is_clean() {
        let e = anyhow::anyhow!(
            "Failed to release {} of {} resources",
            report.failed.len(),
            report.failed.len() + report.released.len()
        );
        return Err(match outcome.signal {
            Some(sig) => e.context(SetupError::Interrupted(sig)),
            None => e,
        });
    }
    Ok(ExitCode::from(mount_exit_status(&outcome)))
}

/// The machine-readable form of `imgroot inspect`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct InspectReport<'a> {
    image: &'a Utf8Path,
    format: ImageFormat,
    device: &'a Utf8Path,
    table: PartitionTable,
    partitions: &'a [PartitionInfo],
    root: Option<&'a Utf8Path>,
    boot: Option<&'a Utf8Path>,
    efi: Option<&'a Utf8Path>,
}

impl<'a> InspectReport<'a> {
    fn new(
        image: &'a Utf8Path,
        format: ImageFormat,
        device: &'a Utf8Path,
        table: PartitionTable,
        c: &'a Classification,
    ) -> Self {
        Self {
            image,
            format,
            device,
            table,
            partitions: &c.partitions,
            root: c.root.as_ref().map(|p| p.path.as_path()),
            boot: c.boot.as_ref().map(|p| p.path.as_path()),
            efi: c.efi.as_ref().map(|p| p.path.as_path()),
        }
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut v = bytes as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit + 1 < UNITS.len() {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{v:.1} {}", UNITS[unit])
    }
}

fn print_table(report: &InspectReport) {
    println!(
        "{} ({}) attached as {}",
        report.image, report.format, report.device
    );
    let mut table = comfy_table::Table::new();
    table
        .load_preset(comfy_table::presets::NOTHING)
        .set_content_arrangement(comfy_table::ContentArrangement::Dynamic)
        .set_header(["DEVICE", "TYPE", "SIZE", "LABEL", "ROLE"]);
    for p in report.partitions {
        table.add_row([
            p.path.to_string(),
            p.fstype.to_string(),
            human_size(p.size),
            p.label.clone().unwrap_or_default(),
            p.role.to_string(),
        ]);
    }
    println!("{table}");
}

/// Implementation of `imgroot inspect`.
#[context("Inspecting image")]
fn inspect(opts: InspectOpts) -> Result<ExitCode> {
    require_root()?;
    let settings = load_config()?;
    let _lock = StateLock::acquire(&settings.state_dir)?;
    let interrupt = Interrupt::install()?;
    let host = SystemHost::default();
    let mut session = Session::new(&host, &settings, interrupt).journaled()?;
    let attached = session.attach(&opts.image, opts.format, None)?;
    let report = InspectReport::new(
        &attached.handle.image,
        attached.handle.format,
        &attached.handle.device,
        attached.layout.table,
        &attached.classification,
    );
    if opts.json {
        let mut out = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut out, &report)?;
        println!();
    } else {
        print_table(&report);
    }
    if !session.teardown().is_clean() {
        anyhow::bail!("Failed to release {}", attached.handle.device);
    }
    Ok(ExitCode::SUCCESS)
}

/// Implementation of `imgroot cleanup`.
fn cleanup(settings: &Settings) -> Result<ExitCode> {
    require_root()?;
    let _lock = StateLock::acquire(&settings.state_dir)?;
    let failed = cleanup_state_dir(&SystemHost::default(), &settings.state_dir)?;
    if failed > 0 {
        anyhow::bail!("{failed} resources could not be released");
    }
    Ok(ExitCode::SUCCESS)
}

fn exit_status_for(e: &anyhow::Error) -> u8 {
    SetupError::interrupted_by(e)
        .and_then(|sig| u8::try_from(128 + sig).ok())
        .unwrap_or(1)
}

/// The process exit code for a failed invocation: 128+N if a signal
/// interrupted setup, 1 otherwise.
pub fn exit_code_for(e: &anyhow::Error) -> ExitCode {
    ExitCode::from(exit_status_for(e))
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub fn run_from_iter<I>(args: I) -> Result<ExitCode>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
fn run_from_opt(opt: Opt) -> Result<ExitCode> {
    match opt {
        Opt::Mount(opts) => mount(opts),
        Opt::Inspect(opts) => inspect(opts),
        Opt::Cleanup => cleanup(&load_config()?),
    }
}

#[test]
fn test_parse_mount_args() {
    let o = Opt::try_parse_from([
        "imgroot",
        "mount",
        "--format",
        "vpc",
        "--root-lv",
        "ubuntu-vg/root",
        "disk.vtoy",
        "--",
        "grub-install",
        "--recheck",
    ])
    .unwrap();
    let o = match o {
        Opt::Mount(o) => o,
        o => panic!("Expected mount opts, not {o:?}"),
    };
    assert_eq!(o.image.as_deref(), Some(Utf8Path::new("disk.vtoy")));
    assert_eq!(o.format, Some(ImageFormat::Vpc));
    assert_eq!(o.root_lv.as_deref(), Some("ubuntu-vg/root"));
    assert_eq!(o.command, ["grub-install", "--recheck"]);

    let o = Opt::try_parse_from(["imgroot", "mount"]).unwrap();
    assert!(matches!(o, Opt::Mount(MountOpts { image: None, .. })));

    // Detection can be bypassed one way or the other, not both
    assert!(Opt::try_parse_from([
        "imgroot",
        "mount",
        "--root",
        "/dev/nbd0p2",
        "--root-lv",
        "root",
        "a.img"
    ])
    .is_err());
    assert!(Opt::try_parse_from(["imgroot", "mount", "--keep", "a.img", "--", "ls"]).is_err());
    assert!(Opt::try_parse_from(["imgroot", "mount", "--format", "iso", "a.img"]).is_err());
}

#[test]
fn test_exit_codes() {
    let e = anyhow::Error::from(SetupError::Interrupted(2)).context("Mounting image");
    assert_eq!(exit_status_for(&e), 130);
    let e = anyhow::Error::from(SetupError::NoUsableRoot);
    assert_eq!(exit_status_for(&e), 1);
}

#[test]
fn test_mount_exit_status() {
    use std::os::unix::process::ExitStatusExt;
    let exited = |code: i32| ExitStatus::from_raw(code << 8);
    let outcome = |status, signal| ChrootOutcome { status, signal };
    assert_eq!(mount_exit_status(&outcome(exited(0), None)), 0);
    assert_eq!(mount_exit_status(&outcome(exited(3), None)), 3);
    // Killed by a signal of its own
    assert_eq!(mount_exit_status(&outcome(ExitStatus::from_raw(9), None)), 137);
    // We were told to stop; the shell's status doesn't matter
    let sigterm = signal_hook::consts::SIGTERM;
    assert_eq!(mount_exit_status(&outcome(exited(0), Some(sigterm))), 143);
    let sighup = signal_hook::consts::SIGHUP;
    assert_eq!(mount_exit_status(&outcome(exited(129), Some(sighup))), 129);
    assert!(forwarded_signal(sigterm).is_some());
    assert!(forwarded_signal(signal_hook::consts::SIGINT).is_none());
}

#[test]
fn test_human_size() {
    assert_eq!(human_size(512), "512 B");
    assert_eq!(human_size(512 * 1024 * 1024), "512.0 MiB");
    assert_eq!(human_size(20 * 1024 * 1024 * 1024), "20.0 GiB");
}

#[test]
fn test_inspect_json() {
    use crate::classify::{classify, Thresholds};
    use crate::model::{DiskLayout, FsType, PartitionRole};
    let part = |path: &str, fstype: &str, mib: u64| PartitionInfo {
        path: path.into(),
        fstype: FsType::parse(fstype),
        size: mib * 1024 * 1024,
        label: None,
        parttype: None,
        role: PartitionRole::Unassigned,
    };
    let layout = DiskLayout {
        device: "/dev/nbd0".into(),
        table: PartitionTable::Dos,
        partitions: vec![part("/dev/nbd0p1", "vfat", 256), part("/dev/nbd0p2", "ext4", 8192)],
    };
    let c = classify(&layout, &Thresholds::default());
    let r = InspectReport::new(
        "/srv/disk.img".into(),
        ImageFormat::Raw,
        &layout.device,
        layout.table,
        &c,
    );
    let v = serde_json::to_value(&r).unwrap();
    assert_eq!(v["format"], "raw");
    assert_eq!(v["table"], "dos");
    assert_eq!(v["root"], "/dev/nbd0p2");
    assert_eq!(v["efi"], "/dev/nbd0p1");
    assert!(v["boot"].is_null());
    assert_eq!(v["partitions"][1]["role"], "root-candidate");
    assert_eq!(v["partitions"][1]["fstype"], "ext4");
}
