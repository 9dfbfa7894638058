//! Error types for process operations.

use std::io;
use std::path::PathBuf;

use localnet_topology::NodeId;
use thiserror::Error;

/// Result type for process operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while spawning or stopping node processes.
#[derive(Debug, Error)]
pub enum Error {
    /// Executable does not exist or is not executable.
    #[error("node {node}: binary {} not found or not executable", .path.display())]
    MissingBinary {
        /// Node being spawned.
        node: NodeId,
        /// Configured executable.
        path: PathBuf,
    },

    /// The node's working directory or config cannot be used.
    #[error("node {node}: invalid configuration: {reason}")]
    InvalidConfig {
        /// Node being spawned.
        node: NodeId,
        /// What is wrong.
        reason: String,
    },

    /// One of the node's ports is held by another process.
    #[error("node {node}: port {port} is already in use")]
    PortConflict {
        /// Node being spawned.
        node: NodeId,
        /// Conflicting port.
        port: u16,
    },

    /// The process exited during its startup grace window.
    #[error("node {node}: process exited during startup (code {code:?})")]
    ExitedDuringStartup {
        /// Node being spawned.
        node: NodeId,
        /// Exit code, if any.
        code: Option<i32>,
    },

    /// The OS refused to start the process for a reason worth retrying.
    #[error("node {node}: failed to spawn process: {source}")]
    Spawn {
        /// Node being spawned.
        node: NodeId,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Signal delivery failed.
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        /// Target process.
        pid: u32,
        /// Underlying error.
        #[source]
        source: nix::Error,
    },

    /// IO error.
    #[error("io error: {0} - {1}")]
    Io(&'static str, #[source] io::Error),
}

impl Error {
    /// Whether retrying the same spawn may succeed.
    ///
    /// Port races and filesystem races are transient; a missing binary, a
    /// bad config or an immediate exit are not.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::PortConflict { .. } | Self::Spawn { .. })
    }
}
