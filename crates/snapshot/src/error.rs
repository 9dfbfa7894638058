use std::path::PathBuf;

use localnet_topology::InstanceId;
use thiserror::Error;

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while saving or loading snapshots.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0} - {1}")]
    Io(&'static str, #[source] std::io::Error),

    /// No snapshot exists for the instance.
    #[error("no snapshot for instance {0}")]
    NotFound(InstanceId),

    /// Snapshot exists but cannot be used.
    #[error("corrupt snapshot {}: {reason}", .path.display())]
    Corrupt {
        /// Snapshot file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// Serialization failed.
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}
