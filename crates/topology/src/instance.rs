//! Network instances and their lifecycle state machine.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node::{GenesisRef, NodeConfig, NodeId, NodeRole};

/// Lock file present in an instance's data dir while it is running.
pub const LOCK_FILENAME: &str = "localnet.lock";

/// Identifier of a network instance; doubles as its directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceId(String);

impl InstanceId {
    /// Creates an instance id, checking it is safe to use as a directory name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInstanceId`] unless the id is 1-64 characters
    /// of lowercase ASCII letters, digits, `-` or `_`.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= 64
            && id
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');

        if valid {
            Ok(Self(id))
        } else {
            Err(Error::InvalidInstanceId(id))
        }
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for InstanceId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<InstanceId> for String {
    fn from(id: InstanceId) -> Self {
        id.0
    }
}

/// Which upstream binaries the network is built from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    /// Mainnet release binaries.
    #[default]
    Mainnet,

    /// Testnet branch binaries.
    Testnet,
}

/// Lifecycle state of a network instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    /// Configuration exists, nothing was ever started.
    Unprovisioned,

    /// Processes are being spawned or are not ready yet.
    Starting,

    /// All validators and gateways are healthy.
    Running,

    /// Usable, but some node is unhealthy.
    Degraded,

    /// Processes are being stopped.
    Stopping,

    /// All processes are stopped.
    Stopped,

    /// A majority of validators is unreachable, or startup failed.
    Failed,
}

impl InstanceState {
    /// `Stopped` or `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether processes may be alive in this state.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Degraded | Self::Stopping
        )
    }

    /// Whether moving from `self` to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use InstanceState::{Degraded, Failed, Running, Starting, Stopped, Stopping, Unprovisioned};

        matches!(
            (self, next),
            (Unprovisioned | Stopped, Starting)
                | (Starting, Running | Degraded | Failed | Stopping)
                | (Running, Degraded | Failed | Stopping)
                | (Degraded, Running | Failed | Stopping)
                | (Stopping, Stopped | Failed)
                | (Failed, Starting | Stopping | Stopped)
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One provisioned local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInstance {
    id: InstanceId,
    name: String,
    flavor: Flavor,
    nodes: Vec<NodeConfig>,
    state: InstanceState,
    data_dir: PathBuf,
    created_at: DateTime<Utc>,
    genesis: GenesisRef,
}

impl NetworkInstance {
    pub(crate) const fn new(
        id: InstanceId,
        name: String,
        flavor: Flavor,
        nodes: Vec<NodeConfig>,
        data_dir: PathBuf,
        created_at: DateTime<Utc>,
        genesis: GenesisRef,
    ) -> Self {
        Self {
            id,
            name,
            flavor,
            nodes,
            state: InstanceState::Unprovisioned,
            data_dir,
            created_at,
            genesis,
        }
    }

    /// Instance identifier.
    #[must_use]
    pub const fn id(&self) -> &InstanceId {
        &self.id
    }

    /// Human readable network name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binary flavor.
    #[must_use]
    pub const fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Nodes in start order (validators first).
    #[must_use]
    pub fn nodes(&self) -> &[NodeConfig] {
        &self.nodes
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Nodes with the given role.
    pub fn nodes_with_role(&self, role: NodeRole) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter().filter(move |n| n.role == role)
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> InstanceState {
        self.state
    }

    /// Root directory of the instance.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// When the instance was provisioned.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Genesis shared by all validators.
    #[must_use]
    pub const fn genesis(&self) -> &GenesisRef {
        &self.genesis
    }

    /// Path of the running-instance lock file.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILENAME)
    }

    #[cfg(test)]
    pub(crate) fn nodes_mut(&mut self) -> &mut Vec<NodeConfig> {
        &mut self.nodes
    }

    /// Moves the instance to `next`.
    ///
    /// Returns `Ok(false)` when already in `next`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalTransition`] if the transition table forbids it.
    pub fn transition(&mut self, next: InstanceState) -> Result<bool> {
        if self.state == next {
            return Ok(false);
        }

        if !self.state.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                instance: self.id.clone(),
                from: self.state,
                to: next,
            });
        }

        self.state = next;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_validation() {
        assert!(InstanceId::new("local-net_1").is_ok());
        assert!(InstanceId::new("").is_err());
        assert!(InstanceId::new("Upper").is_err());
        assert!(InstanceId::new("../escape").is_err());
        assert!(InstanceId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn test_instance_id_serde_rejects_invalid() {
        assert!(serde_json::from_str::<InstanceId>("\"ok-id\"").is_ok());
        assert!(serde_json::from_str::<InstanceId>("\"not/ok\"").is_err());
    }

    #[test]
    fn test_transition_table() {
        use InstanceState::*;

        assert!(Unprovisioned.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Starting));
        assert!(Failed.can_transition_to(Stopping));

        assert!(!Unprovisioned.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn test_terminal_states() {
        assert!(InstanceState::Stopped.is_terminal());
        assert!(InstanceState::Failed.is_terminal());
        assert!(!InstanceState::Running.is_terminal());
        assert!(InstanceState::Stopping.is_active());
        assert!(!InstanceState::Unprovisioned.is_active());
    }
}
