//! Local network topology: data model, templates and provisioning.
//!
//! This crate provides:
//! - Node and instance identity types ([`NodeId`], [`InstanceId`])
//! - The [`NetworkInstance`] lifecycle state machine
//! - TOML [`Template`]s describing a network shape
//! - The [`TopologyManager`], which provisions instances on disk (ports,
//!   key material, genesis) and loads them back
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod genesis;
mod instance;
mod keys;
mod manager;
mod node;
mod template;
mod validate;

pub use error::{Error, Result};
pub use genesis::{Genesis, GenesisValidator};
pub use instance::{Flavor, InstanceId, InstanceState, LOCK_FILENAME, NetworkInstance};
pub use manager::{GENESIS_FILENAME, NODE_CONFIG_FILENAME, TOPOLOGY_FILENAME, TopologyManager};
pub use node::{
    GenesisRef, HealthStatus, KeyRef, LaunchCommand, NODE_DB_DIRNAME, NODE_LOG_FILENAME,
    NodeConfig, NodeId, NodeRole, PortSet,
};
pub use template::{BinarySpec, Binaries, Template};
pub use validate::validate;
