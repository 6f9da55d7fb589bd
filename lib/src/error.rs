use std::time::Duration;

use camino::Utf8PathBuf;

/// Conditions that abort a session.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("no free nbd device among /dev/nbd0-/dev/nbd{last}")]
    NoFreeSlot { last: u32 },
    #[error("failed to connect {image} after {attempts} attempts")]
    ConnectFailed { image: Utf8PathBuf, attempts: u32 },
    #[error("{device} did not become ready within {timeout:?}")]
    DeviceNotReady {
        device: Utf8PathBuf,
        timeout: Duration,
    },
    #[error("no Linux partition found")]
    NoLinuxPartition,
    #[error("no usable root device found")]
    NoUsableRoot,
    #[error("no root candidate has /etc and /bin or /usr/bin")]
    SanityCheckFailed,
    #[error("interrupted by signal {0}")]
    Interrupted(i32),
}

impl SetupError {
    /// The signal that interrupted the session, if any, anywhere in an error chain.
    pub fn interrupted_by(e: &anyhow::Error) -> Option<i32> {
        e.chain().find_map(|c| match c.downcast_ref::<SetupError>() {
            Some(SetupError::Interrupted(sig)) => Some(*sig),
            _ => None,
        })
    }
}

#[test]
fn test_interrupted_by() {
    let e = anyhow::Error::from(SetupError::Interrupted(15)).context("Connecting");
    assert_eq!(SetupError::interrupted_by(&e), Some(15));
    let e = anyhow::Error::from(SetupError::NoLinuxPartition);
    assert_eq!(SetupError::interrupted_by(&e), None);
    assert_eq!(e.to_string(), "no Linux partition found");
}
