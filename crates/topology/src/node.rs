//! Node configuration types

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// File every node writes its process output to, inside its working dir.
pub const NODE_LOG_FILENAME: &str = "node.log";

/// Directory holding a node's chain database, inside its working dir.
pub const NODE_DB_DIRNAME: &str = "db";

/// Identifier of a node, unique within its instance (e.g. `validator-0`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The possible roles of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Participates in consensus.
    Validator,

    /// Follows the chain without validating.
    FullNode,

    /// Serves the block explorer.
    Explorer,

    /// Serves the HTTP API.
    ApiGateway,
}

impl NodeRole {
    /// Stable lowercase name, used in node ids and file names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validator => "validator",
            Self::FullNode => "full-node",
            Self::Explorer => "explorer",
            Self::ApiGateway => "api-gateway",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ports owned by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSet {
    /// Peer-to-peer traffic.
    pub p2p: u16,

    /// Client-facing RPC / HTTP.
    pub rpc: u16,

    /// Health and status endpoint polled by the monitor.
    pub health: u16,
}

impl PortSet {
    /// Number of ports a node needs at minimum.
    pub const COUNT: u16 = 3;

    /// Builds a port set from the first ports of an allocated range.
    ///
    /// Returns `None` if the range is too narrow.
    #[must_use]
    pub fn from_range(range: &Range<u16>) -> Option<Self> {
        if range.len() < usize::from(Self::COUNT) {
            return None;
        }

        Some(Self {
            p2p: range.start,
            rpc: range.start + 1,
            health: range.start + 2,
        })
    }

    /// All ports in the set.
    #[must_use]
    pub const fn ports(&self) -> [u16; 3] {
        [self.p2p, self.rpc, self.health]
    }
}

/// How to launch a node process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    /// Binary to execute.
    pub executable: PathBuf,

    /// Argument template; see [`NodeConfig::resolved_args`].
    pub args: Vec<String>,

    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Reference to a node's key material on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRef {
    /// Path to the 32-byte ed25519 seed.
    pub path: PathBuf,

    /// Hex-encoded public key.
    pub public_key: String,
}

/// Reference to the genesis document shared by an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisRef {
    /// Path to `genesis.json`.
    pub path: PathBuf,

    /// Hex-encoded SHA-256 of the file contents.
    pub digest: String,
}

/// Last known health of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Not polled yet.
    #[default]
    Unknown,

    /// Last poll succeeded.
    Healthy,

    /// Last poll failed, below the unreachable threshold.
    Unhealthy,

    /// Consecutive failures reached the unreachable threshold.
    Unreachable,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// Configuration of a single node of a network instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier.
    pub id: NodeId,

    /// Role in the network.
    pub role: NodeRole,

    /// Ports owned by the node.
    pub ports: PortSet,

    /// Key material.
    pub key: Option<KeyRef>,

    /// Genesis shared with the rest of the instance.
    pub genesis: GenesisRef,

    /// Working directory of the process.
    pub working_dir: PathBuf,

    /// Generated configuration file handed to the binary.
    pub config_path: PathBuf,

    /// Launch command.
    pub command: LaunchCommand,
}

impl NodeConfig {
    /// Arguments with `{config}`, `{working_dir}`, `{node_id}`,
    /// `{p2p_port}`, `{rpc_port}` and `{health_port}` substituted.
    #[must_use]
    pub fn resolved_args(&self) -> Vec<String> {
        let config = self.config_path.to_string_lossy();
        let working_dir = self.working_dir.to_string_lossy();

        self.command
            .args
            .iter()
            .map(|arg| {
                arg.replace("{config}", &config)
                    .replace("{working_dir}", &working_dir)
                    .replace("{node_id}", self.id.as_str())
                    .replace("{p2p_port}", &self.ports.p2p.to_string())
                    .replace("{rpc_port}", &self.ports.rpc.to_string())
                    .replace("{health_port}", &self.ports.health.to_string())
            })
            .collect()
    }

    /// Full command line: executable followed by resolved arguments.
    #[must_use]
    pub fn command_line(&self) -> Vec<String> {
        let mut line = vec![self.command.executable.to_string_lossy().into_owned()];
        line.extend(self.resolved_args());
        line
    }

    /// Environment for the process, including the `LOCALNET_*` variables.
    #[must_use]
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .command
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        env.push((
            "LOCALNET_CONFIG".to_string(),
            self.config_path.to_string_lossy().into_owned(),
        ));
        env.push(("LOCALNET_NODE_ID".to_string(), self.id.to_string()));
        env.push((
            "LOCALNET_WORKING_DIR".to_string(),
            self.working_dir.to_string_lossy().into_owned(),
        ));
        env
    }

    /// Where the node's output is captured.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.working_dir.join(NODE_LOG_FILENAME)
    }

    /// The node's chain database directory.
    #[must_use]
    pub fn db_dir(&self) -> PathBuf {
        self.working_dir.join(NODE_DB_DIRNAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> NodeConfig {
        NodeConfig {
            id: NodeId::new("validator-0"),
            role: NodeRole::Validator,
            ports: PortSet {
                p2p: 20000,
                rpc: 20001,
                health: 20002,
            },
            key: None,
            genesis: GenesisRef {
                path: PathBuf::from("/data/genesis.json"),
                digest: "00".to_string(),
            },
            working_dir: PathBuf::from("/data/nodes/validator-0"),
            config_path: PathBuf::from("/data/nodes/validator-0/node.json"),
            command: LaunchCommand {
                executable: PathBuf::from("/usr/bin/validator-engine"),
                args: vec![
                    "--config".to_string(),
                    "{config}".to_string(),
                    "--listen=127.0.0.1:{health_port}".to_string(),
                ],
                env: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn test_resolved_args_substitutes_placeholders() {
        assert_eq!(
            node().resolved_args(),
            vec![
                "--config",
                "/data/nodes/validator-0/node.json",
                "--listen=127.0.0.1:20002"
            ]
        );
    }

    #[test]
    fn test_command_line_starts_with_executable() {
        let line = node().command_line();
        assert_eq!(line[0], "/usr/bin/validator-engine");
        assert_eq!(line.len(), 4);
    }

    #[test]
    fn test_env_contains_localnet_variables() {
        let env = node().env();
        assert!(env.contains(&("LOCALNET_NODE_ID".to_string(), "validator-0".to_string())));
    }

    #[test]
    fn test_port_set_requires_three_ports() {
        assert!(PortSet::from_range(&(100..102)).is_none());
        assert_eq!(
            PortSet::from_range(&(100..110)).unwrap().ports(),
            [100, 101, 102]
        );
    }
}
