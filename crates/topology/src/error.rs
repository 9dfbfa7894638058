//! Error types for topology operations

use std::path::PathBuf;

use thiserror::Error;

use crate::{InstanceId, InstanceState, NodeId};

/// Result type for topology operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Topology-related errors
#[derive(Debug, Error)]
pub enum Error {
    /// Template failed a semantic check.
    #[error("invalid template: {0}")]
    Template(String),

    /// Template was not valid TOML or had unknown fields.
    #[error("failed to parse template: {0}")]
    TemplateParse(#[from] toml::de::Error),

    /// Instance identifier contains characters not allowed on disk.
    #[error("invalid instance id {0:?}: use 1-64 of [a-z0-9-_]")]
    InvalidInstanceId(String),

    /// Instance has no validator nodes.
    #[error("instance {0} has no validators")]
    ZeroValidators(InstanceId),

    /// Two nodes of the same instance share a port.
    #[error("instance {instance}: port {port} assigned to both {first} and {second}")]
    DuplicatePort {
        /// Instance being validated.
        instance: InstanceId,
        /// Conflicting port.
        port: u16,
        /// First node holding the port.
        first: NodeId,
        /// Second node holding the port.
        second: NodeId,
    },

    /// Two nodes share an identifier.
    #[error("instance {instance}: duplicate node id {node}")]
    DuplicateNode {
        /// Instance being validated.
        instance: InstanceId,
        /// Repeated node id.
        node: NodeId,
    },

    /// A node has no key material, or its key file is gone.
    #[error("instance {instance}: node {node} has no key material")]
    MissingKey {
        /// Instance being validated.
        instance: InstanceId,
        /// Node without a key.
        node: NodeId,
    },

    /// A key file exists but does not hold a 32-byte seed.
    #[error("invalid key material at {0}")]
    InvalidKey(PathBuf),

    /// Validators disagree on the genesis they reference.
    #[error("instance {instance}: validator {node} references a different genesis")]
    GenesisMismatch {
        /// Instance being validated.
        instance: InstanceId,
        /// Offending validator.
        node: NodeId,
    },

    /// Requested lifecycle transition is not allowed.
    #[error("instance {instance}: illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Instance being transitioned.
        instance: InstanceId,
        /// Current state.
        from: InstanceState,
        /// Requested state.
        to: InstanceState,
    },

    /// Operation requires a stopped instance.
    #[error("instance {0} is {1}; stop it first")]
    InstanceActive(InstanceId, InstanceState),

    /// No instance with this id exists.
    #[error("instance {0} not found")]
    NotFound(InstanceId),

    /// Persisted topology could not be parsed.
    #[error("corrupt topology file {path}: {source}")]
    Corrupt {
        /// File that failed to parse.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: serde_json::Error,
    },

    /// IO operation failed.
    #[error("{0}: {1}")]
    Io(&'static str, #[source] std::io::Error),

    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Port allocation failed.
    #[error(transparent)]
    Ports(#[from] localnet_util::port_allocator::Error),
}

impl Error {
    /// Whether the error is a user-fixable configuration problem.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Template(_)
                | Self::TemplateParse(_)
                | Self::InvalidInstanceId(_)
                | Self::ZeroValidators(_)
                | Self::DuplicatePort { .. }
                | Self::DuplicateNode { .. }
                | Self::MissingKey { .. }
                | Self::InvalidKey(_)
                | Self::GenesisMismatch { .. }
                | Self::IllegalTransition { .. }
                | Self::InstanceActive(..)
                | Self::Ports(_)
        )
    }

    /// Whether the error means the instance does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
