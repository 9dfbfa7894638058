//! Structural checks on a network instance.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::instance::NetworkInstance;
use crate::node::{NodeId, NodeRole};

/// Validates an instance.
///
/// Rejects instances without validators, with duplicate node ids, with a
/// port used twice, with a node lacking key material on disk, or with
/// validators that disagree on the genesis.
///
/// # Errors
///
/// Returns the first configuration error found.
pub fn validate(instance: &NetworkInstance) -> Result<()> {
    let id = instance.id();

    if instance.nodes_with_role(NodeRole::Validator).next().is_none() {
        return Err(Error::ZeroValidators(id.clone()));
    }

    let mut node_ids = HashSet::new();
    let mut ports: HashMap<u16, &NodeId> = HashMap::new();

    for node in instance.nodes() {
        if !node_ids.insert(&node.id) {
            return Err(Error::DuplicateNode {
                instance: id.clone(),
                node: node.id.clone(),
            });
        }

        for port in node.ports.ports() {
            if let Some(first) = ports.insert(port, &node.id) {
                return Err(Error::DuplicatePort {
                    instance: id.clone(),
                    port,
                    first: first.clone(),
                    second: node.id.clone(),
                });
            }
        }

        match &node.key {
            Some(key) if key.path.is_file() => {}
            _ => {
                return Err(Error::MissingKey {
                    instance: id.clone(),
                    node: node.id.clone(),
                });
            }
        }

        if node.role == NodeRole::Validator && &node.genesis != instance.genesis() {
            return Err(Error::GenesisMismatch {
                instance: id.clone(),
                node: node.id.clone(),
            });
        }
    }

    Ok(())
}
