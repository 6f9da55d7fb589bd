//! # Configuration
//!
//! Optional TOML fragments in `imgroot/*.toml` (e.g. `/etc/imgroot/10-site.toml`)
//! tune slot counts, retry policy, classification thresholds and paths.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use fn_error_context::context;
use imgroot_blockdev::parse_size_mib;
use serde::{Deserialize, Serialize};

use crate::classify::Thresholds;

const SYSTEMD_CONVENTIONAL_BASES: &[&str] = &["/usr/lib", "/usr/local/lib", "/etc", "/run"];

/// The toplevel config entry, stored in imgroot/ (e.g. /etc/imgroot/05-custom.toml)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct ConfigurationToplevel {
    pub(crate) imgroot: Option<Configuration>,
}

/// The serialized `[imgroot]` section; every key is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename = "imgroot", rename_all = "kebab-case")]
pub(crate) struct Configuration {
    pub(crate) nbd_slots: Option<u32>,
    pub(crate) connect_attempts: Option<u32>,
    pub(crate) connect_backoff_ms: Option<u64>,
    pub(crate) ready_timeout_secs: Option<u64>,
    pub(crate) luks_attempts: Option<u32>,
    pub(crate) temp_root: Option<Utf8PathBuf>,
    pub(crate) state_dir: Option<Utf8PathBuf>,
    pub(crate) min_root_size: Option<String>,
    pub(crate) max_efi_size: Option<String>,
    pub(crate) boot_min_size: Option<String>,
    pub(crate) boot_max_size: Option<String>,
    /// Extra logical volume names tried after the built-in ones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) root_lv_names: Option<Vec<String>>,
    pub(crate) host_resolv_conf: Option<Utf8PathBuf>,
    pub(crate) shell: Option<String>,
}

impl Configuration {
    /// Apply any values in other, overriding any existing values in `self`.
    fn merge(&mut self, other: Self) {
        fn mergeopt<T>(s: &mut Option<T>, o: Option<T>) {
            if let Some(o) = o {
                *s = Some(o);
            }
        }
        mergeopt(&mut self.nbd_slots, other.nbd_slots);
        mergeopt(&mut self.connect_attempts, other.connect_attempts);
        mergeopt(&mut self.connect_backoff_ms, other.connect_backoff_ms);
        mergeopt(&mut self.ready_timeout_secs, other.ready_timeout_secs);
        mergeopt(&mut self.luks_attempts, other.luks_attempts);
        mergeopt(&mut self.temp_root, other.temp_root);
        mergeopt(&mut self.state_dir, other.state_dir);
        mergeopt(&mut self.min_root_size, other.min_root_size);
        mergeopt(&mut self.max_efi_size, other.max_efi_size);
        mergeopt(&mut self.boot_min_size, other.boot_min_size);
        mergeopt(&mut self.boot_max_size, other.boot_max_size);
        mergeopt(&mut self.host_resolv_conf, other.host_resolv_conf);
        mergeopt(&mut self.shell, other.shell);
        if let Some(names) = other.root_lv_names {
            self.root_lv_names
                .get_or_insert_with(Default::default)
                .extend(names)
        }
    }
}

/// Effective settings, with defaults filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) nbd_slots: u32,
    pub(crate) connect_attempts: u32,
    pub(crate) connect_backoff: Duration,
    pub(crate) ready_timeout: Duration,
    pub(crate) luks_attempts: u32,
    pub(crate) temp_root: Utf8PathBuf,
    pub(crate) state_dir: Utf8PathBuf,
    pub(crate) thresholds: Thresholds,
    pub(crate) root_lv_names: Vec<String>,
    pub(crate) host_resolv_conf: Utf8PathBuf,
    pub(crate) shell: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            nbd_slots: 32,
            connect_attempts: 5,
            connect_backoff: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(5),
            luks_attempts: 3,
            temp_root: "/tmp".into(),
            state_dir: "/run/imgroot".into(),
            thresholds: Thresholds::default(),
            root_lv_names: Vec::new(),
            host_resolv_conf: "/etc/resolv.conf".into(),
            shell: "/bin/bash".into(),
        }
    }
}

fn size_bytes(key: &str, v: &str) -> Result<u64> {
    let mib = parse_size_mib(v).with_context(|| format!("Parsing {key} = {v:?}"))?;
    Ok(mib * 1024 * 1024)
}

impl TryFrom<Configuration> for Settings {
    type Error = anyhow::Error;

    fn try_from(c: Configuration) -> Result<Self> {
        let mut s = Settings::default();
        if let Some(v) = c.nbd_slots {
            anyhow::ensure!(v > 0, "nbd-slots must be positive");
            s.nbd_slots = v;
        }
        if let Some(v) = c.connect_attempts {
            s.connect_attempts = v.max(1);
        }
        if let Some(v) = c.connect_backoff_ms {
            s.connect_backoff = Duration::from_millis(v);
        }
        if let Some(v) = c.ready_timeout_secs {
            s.ready_timeout = Duration::from_secs(v);
        }
        if let Some(v) = c.luks_attempts {
            s.luks_attempts = v.max(1);
        }
        if let Some(v) = c.temp_root {
            s.temp_root = v;
        }
        if let Some(v) = c.state_dir {
            s.state_dir = v;
        }
        let t = &mut s.thresholds;
        for (key, val, dest) in [
            ("min-root-size", c.min_root_size, &mut t.min_root),
            ("max-efi-size", c.max_efi_size, &mut t.max_efi),
            ("boot-min-size", c.boot_min_size, &mut t.boot_min),
            ("boot-max-size", c.boot_max_size, &mut t.boot_max),
        ] {
            if let Some(v) = val {
                *dest = size_bytes(key, &v)?;
            }
        }
        anyhow::ensure!(
            t.boot_min <= t.boot_max,
            "boot-min-size is larger than boot-max-size"
        );
        if let Some(v) = c.root_lv_names {
            s.root_lv_names = v;
        }
        if let Some(v) = c.host_resolv_conf {
            s.host_resolv_conf = v;
        }
        if let Some(v) = c.shell {
            s.shell = v;
        }
        Ok(s)
    }
}

fn parse_fragment(buf: &str) -> Result<(Option<Configuration>, Vec<String>)> {
    let mut unused = Vec::new();
    let de = toml::Deserializer::new(buf);
    let c: ConfigurationToplevel = serde_ignored::deserialize(de, |path| {
        unused.push(path.to_string());
    })?;
    Ok((c.imgroot, unused))
}

/// Load the configuration from the given base directories, merging all fragments.
pub(crate) fn load_config_from<S: AsRef<str>>(bases: &[S]) -> Result<Settings> {
    let bases = bases.iter().map(|b| b.as_ref()).collect::<Vec<_>>();
    let fragments = liboverdrop::scan(&bases, "imgroot", &["toml"], true);
    let mut config = Configuration::default();
    for (_name, path) in fragments {
        let buf = std::fs::read_to_string(&path).with_context(|| format!("Reading {path:?}"))?;
        let (c, unused) = parse_fragment(&buf).with_context(|| format!("Parsing {path:?}"))?;
        for key in unused {
            tracing::warn!("{path:?}: Unknown key {key}");
        }
        if let Some(c) = c {
            tracing::debug!("Merging config from {path:?}: {c:?}");
            config.merge(c);
        }
    }
    Settings::try_from(config)
}

/// Load the configuration from the standard locations.
#[context("Loading configuration")]
pub(crate) fn load_config() -> Result<Settings> {
    load_config_from(SYSTEMD_CONVENTIONAL_BASES)
}
