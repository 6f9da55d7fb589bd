//! # Disk image chroot tool
//!
//! This crate attaches virtual disk images (raw, qcow2, VHD, VMDK, VDI)
//! through the kernel's nbd driver, finds and assembles the Linux root
//! filesystem inside them (unlocking LUKS and activating LVM as needed)
//! and prepares it for `chroot`. Every acquired resource is recorded and
//! released again, in reverse, when the session ends.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod cli;
mod error;
pub use error::SetupError;

mod chroot;
mod classify;
pub(crate) mod config;
mod connector;
mod host;
mod interrupt;
mod ledger;
mod lock;
pub(crate) mod model;
mod mounter;
mod prompt;
mod session;
mod statefile;
mod survey;
mod task;
mod volumes;

#[cfg(test)]
mod fixture;
