//! Network templates.
//!
//! A template describes the shape of a network: how many validators and
//! full nodes to run, whether to add an explorer and an HTTP API gateway,
//! and which binary serves each role. Templates are usually TOML files:
//!
//! ```toml
//! name = "dev"
//! validators = 4
//! api_gateway = true
//!
//! [binaries.validator]
//! executable = "/opt/ton/bin/validator-engine"
//! args = ["--config", "{config}", "--status-port", "{health_port}"]
//!
//! [binaries.api-gateway]
//! executable = "/opt/ton/bin/ton-http-api"
//! args = ["--port", "{rpc_port}"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::instance::{Flavor, InstanceId};
use crate::node::{NodeRole, PortSet};

const fn default_validators() -> u16 {
    1
}

const fn default_ports_per_node() -> u16 {
    PortSet::COUNT
}

const fn default_true() -> bool {
    true
}

fn default_args() -> Vec<String> {
    vec!["--config".to_string(), "{config}".to_string()]
}

/// Binary used for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinarySpec {
    /// Path to the executable.
    pub executable: PathBuf,

    /// Argument template. Defaults to `["--config", "{config}"]`.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl BinarySpec {
    /// Creates a spec with the default arguments.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: default_args(),
            env: BTreeMap::new(),
        }
    }

    /// Replaces the argument template.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Per-role binaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Binaries {
    /// Validator binary.
    pub validator: Option<BinarySpec>,

    /// Full node binary. Falls back to the validator binary.
    pub full_node: Option<BinarySpec>,

    /// Explorer binary.
    pub explorer: Option<BinarySpec>,

    /// HTTP API gateway binary.
    pub api_gateway: Option<BinarySpec>,
}

/// Shape of a network to provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Template {
    /// Network name; also the instance id.
    pub name: String,

    /// Which upstream binaries are used.
    #[serde(default)]
    pub flavor: Flavor,

    /// Number of validators (at least one).
    #[serde(default = "default_validators")]
    pub validators: u16,

    /// Number of non-validating full nodes.
    #[serde(default)]
    pub full_nodes: u16,

    /// Run a block explorer.
    #[serde(default)]
    pub explorer: bool,

    /// Run an HTTP API gateway.
    #[serde(default)]
    pub api_gateway: bool,

    /// First port to allocate from; random in 15000-25000 when unset.
    #[serde(default)]
    pub base_port: Option<u16>,

    /// Width of each node's port block.
    #[serde(default = "default_ports_per_node")]
    pub ports_per_node: u16,

    /// Skip port blocks that are already bound on the host.
    #[serde(default = "default_true")]
    pub check_port_availability: bool,

    /// Binaries per role.
    #[serde(default)]
    pub binaries: Binaries,
}

impl Template {
    /// Creates a single-validator template with no binaries configured.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flavor: Flavor::default(),
            validators: default_validators(),
            full_nodes: 0,
            explorer: false,
            api_gateway: false,
            base_port: None,
            ports_per_node: default_ports_per_node(),
            check_port_availability: true,
            binaries: Binaries::default(),
        }
    }

    /// Parses a TOML template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TemplateParse`] on malformed TOML or unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Reads and parses a TOML template file.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be read, or a parse error.
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Io("failed to read template", e))?;
        Self::from_toml_str(&contents)
    }

    /// Sets the validator count.
    #[must_use]
    pub const fn with_validators(mut self, validators: u16) -> Self {
        self.validators = validators;
        self
    }

    /// Sets the full node count.
    #[must_use]
    pub const fn with_full_nodes(mut self, full_nodes: u16) -> Self {
        self.full_nodes = full_nodes;
        self
    }

    /// Enables or disables the explorer.
    #[must_use]
    pub const fn with_explorer(mut self, explorer: bool) -> Self {
        self.explorer = explorer;
        self
    }

    /// Enables or disables the HTTP API gateway.
    #[must_use]
    pub const fn with_api_gateway(mut self, api_gateway: bool) -> Self {
        self.api_gateway = api_gateway;
        self
    }

    /// Pins the first allocated port.
    #[must_use]
    pub const fn with_base_port(mut self, port: u16) -> Self {
        self.base_port = Some(port);
        self
    }

    /// Sets the width of each node's port block.
    #[must_use]
    pub const fn with_ports_per_node(mut self, ports: u16) -> Self {
        self.ports_per_node = ports;
        self
    }

    /// Enables or disables the host bind check during allocation.
    #[must_use]
    pub const fn with_port_availability_check(mut self, check: bool) -> Self {
        self.check_port_availability = check;
        self
    }

    /// Sets the binary flavor.
    #[must_use]
    pub const fn with_flavor(mut self, flavor: Flavor) -> Self {
        self.flavor = flavor;
        self
    }

    /// Sets the binary for a role.
    #[must_use]
    pub fn with_binary(mut self, role: NodeRole, spec: BinarySpec) -> Self {
        let slot = match role {
            NodeRole::Validator => &mut self.binaries.validator,
            NodeRole::FullNode => &mut self.binaries.full_node,
            NodeRole::Explorer => &mut self.binaries.explorer,
            NodeRole::ApiGateway => &mut self.binaries.api_gateway,
        };
        *slot = Some(spec);
        self
    }

    /// Binary serving `role`; full nodes fall back to the validator binary.
    #[must_use]
    pub const fn binary(&self, role: NodeRole) -> Option<&BinarySpec> {
        match role {
            NodeRole::Validator => self.binaries.validator.as_ref(),
            NodeRole::FullNode => match self.binaries.full_node.as_ref() {
                Some(spec) => Some(spec),
                None => self.binaries.validator.as_ref(),
            },
            NodeRole::Explorer => self.binaries.explorer.as_ref(),
            NodeRole::ApiGateway => self.binaries.api_gateway.as_ref(),
        }
    }

    /// Roles and node counts in start order.
    #[must_use]
    pub fn roles(&self) -> Vec<(NodeRole, u16)> {
        let mut roles = vec![(NodeRole::Validator, self.validators)];
        if self.full_nodes > 0 {
            roles.push((NodeRole::FullNode, self.full_nodes));
        }
        if self.api_gateway {
            roles.push((NodeRole::ApiGateway, 1));
        }
        if self.explorer {
            roles.push((NodeRole::Explorer, 1));
        }
        roles
    }

    /// Checks the template is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem found.
    pub fn check(&self) -> Result<InstanceId> {
        let id = InstanceId::new(self.name.clone())?;

        if self.validators == 0 {
            return Err(Error::ZeroValidators(id));
        }

        if self.ports_per_node < PortSet::COUNT {
            return Err(Error::Template(format!(
                "ports_per_node must be at least {}",
                PortSet::COUNT
            )));
        }

        for (role, _) in self.roles() {
            if self.binary(role).is_none() {
                return Err(Error::Template(format!("no binary configured for {role}")));
            }
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"
name = "dev"
flavor = "testnet"
validators = 4
full_nodes = 1
api_gateway = true
base_port = 31000

[binaries.validator]
executable = "/opt/ton/bin/validator-engine"
args = ["--config", "{config}"]

[binaries.api-gateway]
executable = "/opt/ton/bin/ton-http-api"
env = { TON_API_LOGS = "debug" }
"#;

    #[test]
    fn test_parse_template() {
        let template = Template::from_toml_str(TEMPLATE).unwrap();

        assert_eq!(template.name, "dev");
        assert_eq!(template.flavor, Flavor::Testnet);
        assert_eq!(template.validators, 4);
        assert_eq!(template.base_port, Some(31000));
        assert_eq!(template.ports_per_node, 3);
        assert!(template.check_port_availability);
        assert_eq!(
            template.binaries.api_gateway.as_ref().unwrap().args,
            vec!["--config", "{config}"]
        );
        assert!(template.check().is_ok());
    }

    #[test]
    fn test_full_node_falls_back_to_validator_binary() {
        let template = Template::from_toml_str(TEMPLATE).unwrap();
        assert_eq!(
            template.binary(NodeRole::FullNode),
            template.binary(NodeRole::Validator)
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = Template::from_toml_str("name = \"x\"\nvalidatorz = 2\n").unwrap_err();
        assert!(matches!(err, Error::TemplateParse(_)));
    }

    #[test]
    fn test_check_rejects_missing_binary() {
        let template = Template::new("dev").with_explorer(true).with_binary(
            NodeRole::Validator,
            BinarySpec::new("/bin/validator"),
        );
        assert!(matches!(template.check(), Err(Error::Template(_))));
    }

    #[test]
    fn test_check_rejects_zero_validators() {
        let template = Template::new("dev")
            .with_validators(0)
            .with_binary(NodeRole::Validator, BinarySpec::new("/bin/validator"));
        assert!(matches!(template.check(), Err(Error::ZeroValidators(_))));
    }

    #[test]
    fn test_roles_order() {
        let template = Template::from_toml_str(TEMPLATE)
            .unwrap()
            .with_explorer(true);
        let roles: Vec<_> = template.roles().into_iter().map(|(r, _)| r).collect();
        assert_eq!(
            roles,
            vec![
                NodeRole::Validator,
                NodeRole::FullNode,
                NodeRole::ApiGateway,
                NodeRole::Explorer
            ]
        );
    }
}
