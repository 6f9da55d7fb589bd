//! Interactive questions: LUKS passphrases and image selection.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

/// File extensions offered when no image is given.
pub(crate) const IMAGE_EXTENSIONS: &[&str] = &["img", "raw", "vhd", "vtoy", "qcow2", "vmdk"];

pub(crate) trait Prompt: std::fmt::Debug {
    /// Ask for the passphrase of `source`; `None` skips the container.
    fn passphrase(&self, source: &Utf8Path, attempt: u32) -> Result<Option<String>>;
    /// Pick one of `images`.
    fn select_image(&self, images: &[Utf8PathBuf]) -> Result<Utf8PathBuf>;
}

/// Prompts on the controlling terminal.
#[derive(Debug, Default)]
pub(crate) struct TerminalPrompt {}

impl Prompt for TerminalPrompt {
    fn passphrase(&self, source: &Utf8Path, attempt: u32) -> Result<Option<String>> {
        let msg = if attempt > 1 {
            format!("Passphrase for {source} (attempt {attempt}, empty to skip)")
        } else {
            format!("Passphrase for {source} (empty to skip)")
        };
        let p = dialoguer::Password::new()
            .with_prompt(msg)
            .allow_empty_password(true)
            .interact()
            .context("Reading passphrase")?;
        Ok((!p.is_empty()).then_some(p))
    }

    fn select_image(&self, images: &[Utf8PathBuf]) -> Result<Utf8PathBuf> {
        let items = images.iter().map(|p| p.as_str()).collect::<Vec<_>>();
        let i = dialoguer::Select::new()
            .with_prompt("Select a disk image")
            .items(&items)
            .default(0)
            .interact()
            .context("Selecting image")?;
        images
            .get(i)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Invalid selection {i}"))
    }
}

fn has_image_extension(p: &Utf8Path) -> bool {
    p.extension()
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}

/// Image files directly inside `dir`, sorted by name.
pub(crate) fn find_images(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut r = Vec::new();
    for ent in dir.read_dir_utf8().with_context(|| format!("Reading {dir}"))? {
        let ent = ent?;
        if ent.file_type()?.is_file() && has_image_extension(ent.path()) {
            r.push(ent.path().to_owned());
        }
    }
    r.sort();
    Ok(r)
}

#[test]
fn test_find_images() {
    let td = tempfile::tempdir().unwrap();
    let d = Utf8Path::from_path(td.path()).unwrap();
    for f in ["b.qcow2", "a.IMG", "notes.txt", "c.vtoy", "noext"] {
        std::fs::write(d.join(f), "").unwrap();
    }
    std::fs::create_dir(d.join("dir.img")).unwrap();
    let found = find_images(d).unwrap();
    let names = found
        .iter()
        .map(|p| p.file_name().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(names, ["a.IMG", "b.qcow2", "c.vtoy"]);
}
