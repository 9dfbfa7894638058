//! Error types for supervision.

use localnet_topology::{InstanceId, NodeId};
use thiserror::Error;

/// Result type for supervision.
pub type Result<T> = std::result::Result<T, Error>;

/// Broad class of an [`Error`], used to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad template or topology; fix the input and retry.
    Config,

    /// A node process could not be started or stopped.
    Spawn,

    /// Persistence failed.
    Io,

    /// Unknown instance or node.
    NotFound,

    /// Persisted state is unreadable.
    Corrupt,
}

/// Errors surfaced by the supervisor and network manager.
#[derive(Debug, Error)]
pub enum Error {
    /// Topology error.
    #[error(transparent)]
    Topology(#[from] localnet_topology::Error),

    /// Process error.
    #[error(transparent)]
    Process(#[from] localnet_process::Error),

    /// Snapshot error.
    #[error(transparent)]
    Snapshot(#[from] localnet_snapshot::Error),

    /// Node is not part of the instance.
    #[error("instance {instance}: unknown node {node}")]
    UnknownNode {
        /// Instance searched.
        instance: InstanceId,
        /// Requested node.
        node: NodeId,
    },

    /// Another live session supervises the instance.
    #[error("instance {instance} is supervised by process {pid}")]
    AlreadySupervised {
        /// Instance requested.
        instance: InstanceId,
        /// Supervising process.
        pid: u32,
    },

    /// A majority of validators became unreachable before the instance was
    /// ready.
    #[error("instance {0} failed: a majority of validators is unreachable")]
    Unhealthy(InstanceId),

    /// The instance is not supervised by this session.
    #[error("instance {0} is not running here")]
    NotRunning(InstanceId),

    /// IO error.
    #[error("io error: {0} - {1}")]
    Io(&'static str, #[source] std::io::Error),
}

impl Error {
    /// Classifies the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        use localnet_snapshot::Error as SnapshotError;
        use localnet_topology::Error as TopologyError;

        match self {
            Self::Topology(TopologyError::NotFound(_))
            | Self::Snapshot(SnapshotError::NotFound(_))
            | Self::UnknownNode { .. } => ErrorKind::NotFound,
            Self::Topology(TopologyError::Corrupt { .. })
            | Self::Snapshot(SnapshotError::Corrupt { .. }) => ErrorKind::Corrupt,
            Self::Topology(TopologyError::Io(..) | TopologyError::Serialize(_))
            | Self::Snapshot(SnapshotError::Io(..) | SnapshotError::Serialize(_))
            | Self::Io(..) => ErrorKind::Io,
            Self::Topology(_) | Self::NotRunning(_) => ErrorKind::Config,
            Self::Process(_) | Self::AlreadySupervised { .. } | Self::Unhealthy(_) => {
                ErrorKind::Spawn
            }
        }
    }
}
