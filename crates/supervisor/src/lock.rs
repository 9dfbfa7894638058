//! The running-instance lock file.

use localnet_topology::NetworkInstance;
use localnet_util::fs::write_atomic;

use crate::error::{Error, Result};

/// Writes the lock file, recording the supervising PID.
pub(crate) fn acquire(instance: &NetworkInstance) -> Result<()> {
    write_atomic(
        &instance.lock_path(),
        format!("{}\n", std::process::id()).as_bytes(),
    )
    .map_err(|e| Error::Io("failed to write lock file", e))
}

/// Removes the lock file if present.
pub(crate) fn release(instance: &NetworkInstance) -> Result<()> {
    match std::fs::remove_file(instance.lock_path()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io("failed to remove lock file", e)),
    }
}

/// PID recorded in the lock file, if any.
#[must_use]
pub fn holder(instance: &NetworkInstance) -> Option<u32> {
    std::fs::read_to_string(instance.lock_path())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
