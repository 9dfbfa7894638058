//! Provisioning and persistence of network instances.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use localnet_util::fs::write_atomic;
use localnet_util::{PortRangeAllocator, random_base_port};

use crate::error::{Error, Result};
use crate::genesis::{Genesis, GenesisValidator};
use crate::instance::{Flavor, InstanceId, InstanceState, NetworkInstance};
use crate::keys;
use crate::node::{KeyRef, LaunchCommand, NodeConfig, NodeId, NodeRole, PortSet};
use crate::template::Template;
use crate::validate::validate;

/// Persisted topology of an instance, inside its data dir.
pub const TOPOLOGY_FILENAME: &str = "topology.json";

/// Genesis document, inside an instance's data dir.
pub const GENESIS_FILENAME: &str = "genesis.json";

/// Generated per-node configuration, inside each node's working dir.
pub const NODE_CONFIG_FILENAME: &str = "node.json";

const KEYS_DIRNAME: &str = "keys";
const NODES_DIRNAME: &str = "nodes";

/// Configuration file handed to each node binary.
#[derive(Serialize)]
struct NodeFile<'a> {
    network: &'a str,
    flavor: Flavor,
    node_id: &'a NodeId,
    role: NodeRole,
    ports: PortSet,
    key_path: &'a Path,
    public_key: &'a str,
    genesis_path: &'a Path,
    genesis_digest: &'a str,
    db_dir: PathBuf,
    peers: Vec<&'a str>,
}

/// A node planned during provisioning, before genesis exists.
struct PlannedNode {
    id: NodeId,
    role: NodeRole,
    ports: PortSet,
    key: KeyRef,
}

/// Owns the network instances stored under a root directory.
///
/// Each instance lives in `<root>/<id>/` with its `topology.json`,
/// `genesis.json`, `keys/` and one `nodes/<node-id>/` working directory per
/// node.
#[derive(Debug)]
pub struct TopologyManager {
    instances: RwLock<HashMap<InstanceId, NetworkInstance>>,
    root: PathBuf,
}

impl TopologyManager {
    /// Creates a manager rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            root: root.into(),
        }
    }

    /// Root directory holding all instances.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one instance.
    #[must_use]
    pub fn instance_dir(&self, id: &InstanceId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Provisions an instance from a template.
    ///
    /// Allocates pairwise disjoint port blocks, generates (or reuses) key
    /// material, writes one genesis shared by all validators and a config
    /// file per node. Re-provisioning a stopped instance keeps its keys.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid template or when the
    /// instance already exists and is active, or an IO error.
    pub fn provision(&self, template: &Template) -> Result<NetworkInstance> {
        let id = template.check()?;

        let previous = match self.refresh(&id) {
            Ok(existing) if existing.state().is_active() => {
                return Err(Error::InstanceActive(id, existing.state()));
            }
            Ok(existing) => {
                info!("Re-provisioning instance {}", id);
                Some(existing)
            }
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let data_dir = self.instance_dir(&id);
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| Error::Io("failed to create instance directory", e))?;

        // Without an explicit base port, keep the ports handed out last time.
        let base_port = template
            .base_port
            .or_else(|| previous.as_ref().and_then(|p| p.nodes().first()).map(|n| n.ports.p2p))
            .unwrap_or_else(random_base_port);
        let planned = Self::plan_nodes(template, &data_dir, base_port)?;

        let mut genesis = Genesis {
            network: template.name.clone(),
            flavor: template.flavor,
            genesis_time: Utc::now(),
            validators: planned
                .iter()
                .filter(|n| n.role == NodeRole::Validator)
                .map(|n| GenesisValidator {
                    node_id: n.id.clone(),
                    public_key: n.key.public_key.clone(),
                    p2p_address: format!("127.0.0.1:{}", n.ports.p2p),
                })
                .collect(),
        };
        let genesis_path = data_dir.join(GENESIS_FILENAME);
        if let Some(previous) = &previous {
            match Genesis::read(&genesis_path) {
                Ok(existing) if existing.same_chain(&genesis) => {
                    genesis.genesis_time = existing.genesis_time;
                }
                _ => {
                    warn!("Genesis of {} changed, wiping chain data", id);
                    for node in previous.nodes() {
                        remove_if_exists(&node.db_dir(), true)?;
                    }
                }
            }
        }
        let genesis_ref = genesis.write(&genesis_path)?;

        let nodes: Vec<NodeConfig> = planned
            .into_iter()
            .map(|node| {
                let working_dir = data_dir.join(NODES_DIRNAME).join(node.id.as_str());
                let spec = template.binary(node.role).ok_or_else(|| {
                    Error::Template(format!("no binary configured for {}", node.role))
                })?;

                Ok(NodeConfig {
                    config_path: working_dir.join(NODE_CONFIG_FILENAME),
                    working_dir,
                    id: node.id,
                    role: node.role,
                    ports: node.ports,
                    key: Some(node.key),
                    genesis: genesis_ref.clone(),
                    command: LaunchCommand {
                        executable: spec.executable.clone(),
                        args: spec.args.clone(),
                        env: spec.env.clone(),
                    },
                })
            })
            .collect::<Result<_>>()?;

        for node in &nodes {
            Self::write_node_file(&id, template, &genesis, node)?;
        }

        let instance = NetworkInstance::new(
            id.clone(),
            template.name.clone(),
            template.flavor,
            nodes,
            data_dir,
            Utc::now(),
            genesis_ref,
        );

        validate(&instance)?;

        let mut instances = self.instances.write();
        self.persist(&instance)?;
        instances.insert(id.clone(), instance.clone());
        drop(instances);

        info!(
            "Provisioned instance {} with {} nodes",
            id,
            instance.nodes().len()
        );

        Ok(instance)
    }

    fn plan_nodes(
        template: &Template,
        data_dir: &Path,
        base_port: u16,
    ) -> Result<Vec<PlannedNode>> {
        let mut allocator = PortRangeAllocator::new(base_port, template.ports_per_node)?
            .with_availability_check(template.check_port_availability);

        let mut planned = Vec::new();
        for (role, count) in template.roles() {
            for index in 0..count {
                let id = match role {
                    NodeRole::Validator | NodeRole::FullNode => {
                        NodeId::new(format!("{role}-{index}"))
                    }
                    NodeRole::Explorer | NodeRole::ApiGateway => NodeId::new(role.as_str()),
                };

                let range = allocator.allocate_range()?;
                let ports = PortSet::from_range(&range).ok_or_else(|| {
                    Error::Template(format!("port block {range:?} too narrow for {id}"))
                })?;

                let key_path = data_dir
                    .join(KEYS_DIRNAME)
                    .join(format!("{}.key", id.as_str()));
                let key = keys::load_or_generate(&key_path)?;

                debug!("Planned {} with ports {:?}", id, ports);

                planned.push(PlannedNode {
                    id,
                    role,
                    ports,
                    key,
                });
            }
        }

        Ok(planned)
    }

    fn write_node_file(
        id: &InstanceId,
        template: &Template,
        genesis: &Genesis,
        node: &NodeConfig,
    ) -> Result<()> {
        std::fs::create_dir_all(&node.working_dir)
            .map_err(|e| Error::Io("failed to create node working directory", e))?;

        let key = node.key.as_ref().ok_or_else(|| Error::MissingKey {
            instance: id.clone(),
            node: node.id.clone(),
        })?;

        let file = NodeFile {
            network: &template.name,
            flavor: template.flavor,
            node_id: &node.id,
            role: node.role,
            ports: node.ports,
            key_path: &key.path,
            public_key: &key.public_key,
            genesis_path: &node.genesis.path,
            genesis_digest: &node.genesis.digest,
            db_dir: node.db_dir(),
            peers: genesis
                .validators
                .iter()
                .filter(|v| v.node_id != node.id)
                .map(|v| v.p2p_address.as_str())
                .collect(),
        };

        let bytes = serde_json::to_vec_pretty(&file)?;
        write_atomic(&node.config_path, &bytes)
            .map_err(|e| Error::Io("failed to write node config", e))
    }

    /// Loads an instance, from memory if already known, else from disk.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no topology exists for `id`, or
    /// [`Error::Corrupt`] if it cannot be parsed.
    pub fn load(&self, id: &InstanceId) -> Result<NetworkInstance> {
        if let Some(instance) = self.instances.read().get(id) {
            return Ok(instance.clone());
        }

        self.refresh(id)
    }

    /// Re-reads an instance from disk, replacing the in-memory copy.
    ///
    /// # Errors
    ///
    /// Same as [`Self::load`].
    pub fn refresh(&self, id: &InstanceId) -> Result<NetworkInstance> {
        let path = self.instance_dir(id).join(TOPOLOGY_FILENAME);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(id.clone()));
            }
            Err(e) => return Err(Error::Io("failed to read topology", e)),
        };

        let instance: NetworkInstance =
            serde_json::from_slice(&bytes).map_err(|source| Error::Corrupt { path, source })?;

        self.instances.write().insert(id.clone(), instance.clone());
        Ok(instance)
    }

    /// Validates an instance; see [`validate`].
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found.
    pub fn validate(&self, instance: &NetworkInstance) -> Result<()> {
        debug!("Validating instance {} under {}", instance.id(), self.root.display());
        validate(instance)
    }

    /// Applies a lifecycle transition and persists it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalTransition`] for transitions the state machine
    /// forbids, [`Error::NotFound`] for unknown instances, or an IO error.
    pub fn transition(&self, id: &InstanceId, next: InstanceState) -> Result<NetworkInstance> {
        self.load(id)?;

        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;

        let from = instance.state();
        if instance.transition(next)? {
            self.persist(instance)?;
            debug!("Instance {} transitioned {} -> {}", id, from, next);
        }

        Ok(instance.clone())
    }

    /// Lists provisioned instances.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the root directory cannot be read.
    pub fn list(&self) -> Result<Vec<InstanceId>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io("failed to read root directory", e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::Io("failed to read directory entry", e))?;
            if !entry.path().join(TOPOLOGY_FILENAME).is_file() {
                continue;
            }

            match entry.file_name().to_str().map(InstanceId::new) {
                Some(Ok(id)) => ids.push(id),
                _ => warn!("Skipping unexpected directory {}", entry.path().display()),
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Wipes every node's chain database and log, keeping keys, genesis and
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstanceActive`] unless the instance is stopped.
    pub fn reset(&self, id: &InstanceId) -> Result<NetworkInstance> {
        let instance = self.refresh(id)?;
        if instance.state().is_active() {
            return Err(Error::InstanceActive(id.clone(), instance.state()));
        }

        for node in instance.nodes() {
            remove_if_exists(&node.db_dir(), true)?;
            remove_if_exists(&node.log_path(), false)?;
        }
        remove_if_exists(&instance.lock_path(), false)?;

        info!("Reset instance {}", id);
        Ok(instance)
    }

    /// Removes an instance and everything under its directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InstanceActive`] unless the instance is stopped.
    pub fn delete(&self, id: &InstanceId) -> Result<()> {
        let instance = self.refresh(id)?;
        if instance.state().is_active() {
            return Err(Error::InstanceActive(id.clone(), instance.state()));
        }

        std::fs::remove_dir_all(instance.data_dir())
            .map_err(|e| Error::Io("failed to remove instance directory", e))?;
        self.instances.write().remove(id);

        info!("Deleted instance {}", id);
        Ok(())
    }

    fn persist(&self, instance: &NetworkInstance) -> Result<()> {
        let path = self.instance_dir(instance.id()).join(TOPOLOGY_FILENAME);
        let bytes = serde_json::to_vec_pretty(instance)?;
        write_atomic(&path, &bytes).map_err(|e| Error::Io("failed to write topology", e))
    }
}

fn remove_if_exists(path: &Path, dir: bool) -> Result<()> {
    let result = if dir {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io("failed to remove node state", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    use tempfile::tempdir;

    use crate::template::BinarySpec;

    fn template(validators: u16) -> Template {
        Template::new("dev")
            .with_validators(validators)
            .with_base_port(40000)
            .with_port_availability_check(false)
            .with_binary(NodeRole::Validator, BinarySpec::new("/bin/validator"))
            .with_binary(NodeRole::ApiGateway, BinarySpec::new("/bin/http-api"))
            .with_binary(NodeRole::Explorer, BinarySpec::new("/bin/explorer"))
    }

    #[test]
    fn test_provision_four_validators() {
        let dir = tempdir().unwrap();
        let manager = TopologyManager::new(dir.path());

        let instance = manager.provision(&template(4)).unwrap();

        assert_eq!(instance.state(), InstanceState::Unprovisioned);
        assert_eq!(instance.nodes_with_role(NodeRole::Validator).count(), 4);

        let mut ports = HashSet::new();
        for node in instance.nodes() {
            for port in node.ports.ports() {
                assert!(ports.insert(port), "port {port} allocated twice");
            }
        }

        assert!(
            instance
                .nodes_with_role(NodeRole::Validator)
                .all(|n| &n.genesis == instance.genesis())
        );

        let genesis = Genesis::read(&instance.genesis().path).unwrap();
        assert_eq!(genesis.validators.len(), 4);
    }

    #[test]
    fn test_node_ids_and_files() {
        let dir = tempdir().unwrap();
        let manager = TopologyManager::new(dir.path());

        let instance = manager
            .provision(&template(2).with_full_nodes(1).with_api_gateway(true).with_explorer(true))
            .unwrap();

        let ids: Vec<_> = instance.nodes().iter().map(|n| n.id.to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "validator-0",
                "validator-1",
                "full-node-0",
                "api-gateway",
                "explorer"
            ]
        );

        for node in instance.nodes() {
            assert!(node.config_path.is_file());
            assert!(node.key.as_ref().unwrap().path.is_file());
        }

        let node_file: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&instance.nodes()[0].config_path).unwrap())
                .unwrap();
        assert_eq!(node_file["peers"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_reprovision_reuses_keys() {
        let dir = tempdir().unwrap();
        let manager = TopologyManager::new(dir.path());

        let first = manager.provision(&template(2)).unwrap();
        let second = manager.provision(&template(2)).unwrap();

        assert_eq!(first.nodes()[0].key, second.nodes()[0].key);
    }

    #[test]
    fn test_reprovision_keeps_genesis_and_chain_data() {
        let dir = tempdir().unwrap();
        let manager = TopologyManager::new(dir.path());
        let mut template = template(3);
        template.base_port = None;

        let first = manager.provision(&template).unwrap();
        let db = first.nodes()[0].db_dir();
        std::fs::create_dir_all(&db).unwrap();

        let second = manager.provision(&template).unwrap();

        assert_eq!(first.genesis().digest, second.genesis().digest);
        assert_eq!(first.nodes()[0].ports, second.nodes()[0].ports);
        assert!(db.exists());
    }

    #[test]
    fn test_changed_validator_set_wipes_chain_data() {
        let dir = tempdir().unwrap();
        let manager = TopologyManager::new(dir.path());

        let first = manager.provision(&template(2)).unwrap();
        let db = first.nodes()[0].db_dir();
        std::fs::create_dir_all(&db).unwrap();

        let second = manager.provision(&template(3)).unwrap();

        assert_ne!(first.genesis().digest, second.genesis().digest);
        assert!(!db.exists());
        assert!(second.nodes()[0].key.as_ref().unwrap().path.exists());
    }

    #[test]
    fn test_provision_refuses_active_instance() {
        let dir = tempdir().unwrap();
        let manager = TopologyManager::new(dir.path());
        let instance = manager.provision(&template(1)).unwrap();

        manager
            .transition(instance.id(), InstanceState::Starting)
            .unwrap();

        assert!(matches!(
            manager.provision(&template(1)),
            Err(Error::InstanceActive(_, InstanceState::Starting))
        ));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempdir().unwrap();
        let instance = TopologyManager::new(dir.path())
            .provision(&template(3))
            .unwrap();

        let loaded = TopologyManager::new(dir.path())
            .load(instance.id())
            .unwrap();

        assert_eq!(loaded, instance);
    }

    #[test]
    fn test_load_unknown_instance() {
        let dir = tempdir().unwrap();
        let manager = TopologyManager::new(dir.path());

        let err = manager.load(&InstanceId::new("missing").unwrap()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_load_corrupt_topology() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join(TOPOLOGY_FILENAME), b"{not json").unwrap();

        let err = TopologyManager::new(dir.path())
            .load(&InstanceId::new("broken").unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn test_transition_is_persisted() {
        let dir = tempdir().unwrap();
        let manager = TopologyManager::new(dir.path());
        let instance = manager.provision(&template(1)).unwrap();

        manager
            .transition(instance.id(), InstanceState::Starting)
            .unwrap();
        manager
            .transition(instance.id(), InstanceState::Running)
            .unwrap();

        let reloaded = TopologyManager::new(dir.path())
            .load(instance.id())
            .unwrap();
        assert_eq!(reloaded.state(), InstanceState::Running);

        assert!(matches!(
            manager.transition(instance.id(), InstanceState::Unprovisioned),
            Err(Error::IllegalTransition { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_ports() {
        let dir = tempdir().unwrap();
        let manager = TopologyManager::new(dir.path());
        let mut instance = manager.provision(&template(2)).unwrap();

        let first = instance.nodes()[0].ports;
        instance.nodes_mut()[1].ports.rpc = first.p2p;

        assert!(matches!(
            manager.validate(&instance),
            Err(Error::DuplicatePort { port, .. }) if port == first.p2p
        ));
    }

    #[test]
    fn test_validate_rejects_missing_key() {
        let dir = tempdir().unwrap();
        let manager = TopologyManager::new(dir.path());
        let mut instance = manager.provision(&template(2)).unwrap();

        instance.nodes_mut()[1].key = None;

        assert!(matches!(
            manager.validate(&instance),
            Err(Error::MissingKey { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_validators() {
        let dir = tempdir().unwrap();
        let manager = TopologyManager::new(dir.path());
        let mut instance = manager
            .provision(&template(1).with_api_gateway(true))
            .unwrap();

        instance
            .nodes_mut()
            .retain(|n| n.role != NodeRole::Validator);

        assert!(matches!(
            manager.validate(&instance),
            Err(Error::ZeroValidators(_))
        ));
    }

    #[test]
    fn test_reset_wipes_node_state() {
        let dir = tempdir().unwrap();
        let manager = TopologyManager::new(dir.path());
        let instance = manager.provision(&template(1)).unwrap();
        let node = &instance.nodes()[0];

        std::fs::create_dir_all(node.db_dir()).unwrap();
        std::fs::write(node.db_dir().join("blocks"), b"data").unwrap();
        std::fs::write(node.log_path(), b"log").unwrap();

        manager.reset(instance.id()).unwrap();

        assert!(!node.db_dir().exists());
        assert!(!node.log_path().exists());
        assert!(node.config_path.exists());
        assert!(node.key.as_ref().unwrap().path.exists());
    }

    #[test]
    fn test_delete_and_list() {
        let dir = tempdir().unwrap();
        let manager = TopologyManager::new(dir.path());
        let instance = manager.provision(&template(1)).unwrap();

        assert_eq!(manager.list().unwrap(), vec![instance.id().clone()]);

        manager.delete(instance.id()).unwrap();

        assert!(manager.list().unwrap().is_empty());
        assert!(manager.load(instance.id()).unwrap_err().is_not_found());
    }
}
