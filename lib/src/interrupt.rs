//! Turn termination signals into a flag checked between pipeline stages.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

use crate::error::SetupError;

const SIGNALS: &[i32] = &[SIGINT, SIGTERM, SIGHUP];

/// The most recent termination signal, or zero.
#[derive(Debug, Clone, Default)]
pub(crate) struct Interrupt {
    flag: Arc<AtomicUsize>,
}

impl Interrupt {
    /// Replace the default disposition of the termination signals with
    /// recording them; the process then exits through the normal teardown path.
    pub(crate) fn install() -> Result<Self> {
        let r = Self::default();
        for &sig in SIGNALS {
            signal_hook::flag::register_usize(sig, Arc::clone(&r.flag), sig as usize)
                .with_context(|| format!("Registering handler for signal {sig}"))?;
        }
        Ok(r)
    }

    pub(crate) fn signal(&self) -> Option<i32> {
        match self.flag.load(Ordering::SeqCst) {
            0 => None,
            n => i32::try_from(n).ok(),
        }
    }

    /// Fail with [`SetupError::Interrupted`] if a signal arrived.
    pub(crate) fn check(&self) -> Result<()> {
        match self.signal() {
            Some(sig) => Err(SetupError::Interrupted(sig).into()),
            None => Ok(()),
        }
    }

    /// Forget a pending SIGINT. Ctrl-C at the terminal reaches the
    /// interactive command too, which handles it on its own.
    pub(crate) fn clear_keyboard(&self) {
        let _ = self.flag.compare_exchange(
            SIGINT as usize,
            0,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// A pending SIGTERM or SIGHUP.
    pub(crate) fn termination(&self) -> Option<i32> {
        self.signal().filter(|&sig| sig != SIGINT)
    }

    #[cfg(test)]
    pub(crate) fn raise(&self, sig: i32) {
        self.flag.store(sig as usize, Ordering::SeqCst);
    }
}

#[test]
fn test_interrupt() {
    let i = Interrupt::default();
    i.check().unwrap();
    i.raise(SIGTERM);
    let e = i.check().unwrap_err();
    assert_eq!(SetupError::interrupted_by(&e), Some(SIGTERM));
    i.clear_keyboard();
    assert_eq!(i.termination(), Some(SIGTERM));

    let i = Interrupt::default();
    i.raise(SIGINT);
    assert_eq!(i.termination(), None);
    i.clear_keyboard();
    assert_eq!(i.signal(), None);
}
