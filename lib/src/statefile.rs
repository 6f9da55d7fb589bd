//! On-disk journal of session ledgers, one JSON file per session.

use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::ledger::Ledger;

/// Path of the journal for `session`.
pub(crate) fn session_path(state_dir: &Utf8Path, session: &str) -> Utf8PathBuf {
    state_dir.join(format!("{session}.json"))
}

/// Atomically replace `path` with the serialized ledger.
pub(crate) fn write(path: &Utf8Path, ledger: &Ledger) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut f = std::fs::File::create(&tmp).with_context(|| format!("Creating {tmp}"))?;
    serde_json::to_writer_pretty(&mut f, ledger)?;
    f.write_all(b"\n")?;
    f.sync_all()?;
    std::fs::rename(&tmp, path).with_context(|| format!("Renaming {tmp}"))?;
    Ok(())
}

#[context("Loading session state {path}")]
pub(crate) fn load(path: &Utf8Path) -> Result<Ledger> {
    let buf = std::fs::read_to_string(path)?;
    let l: Ledger = serde_json::from_str(&buf)?;
    Ok(l)
}

pub(crate) fn remove(path: &Utf8Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Removing {path}")),
    }
}

/// All session journals in `state_dir`, oldest name first.
pub(crate) fn list(state_dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let entries = match state_dir.read_dir_utf8() {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Reading {state_dir}")),
    };
    let mut r = Vec::new();
    for ent in entries {
        let ent = ent?;
        if ent.path().extension() == Some("json") {
            r.push(ent.path().to_owned());
        }
    }
    r.sort();
    Ok(r)
}

#[test]
fn test_list() {
    let td = tempfile::tempdir().unwrap();
    let d = Utf8Path::from_path(td.path()).unwrap();
    assert!(list(&d.join("missing")).unwrap().is_empty());
    let mut l = Ledger::new("b");
    write(&session_path(d, "b"), &l).unwrap();
    l.session = "a".into();
    write(&session_path(d, "a"), &l).unwrap();
    std::fs::write(d.join("lock"), "1\n").unwrap();
    let found = list(d).unwrap();
    assert_eq!(found, [d.join("a.json"), d.join("b.json")]);
    assert_eq!(load(&found[0]).unwrap().session, "a");
    remove(&found[0]).unwrap();
    remove(&found[0]).unwrap();
    assert_eq!(list(d).unwrap().len(), 1);
}
