use std::collections::HashSet;

use localnet_topology::{BinarySpec, Genesis, NodeRole, Template, TopologyManager};
use proptest::prelude::*;
use tempfile::tempdir;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn provisioned_ports_are_disjoint(
        validators in 1u16..6,
        full_nodes in 0u16..3,
        api_gateway in any::<bool>(),
        ports_per_node in 3u16..6,
        base_port in 30000u16..40000,
    ) {
        let dir = tempdir().unwrap();
        let template = Template::new("props")
            .with_validators(validators)
            .with_full_nodes(full_nodes)
            .with_api_gateway(api_gateway)
            .with_base_port(base_port)
            .with_ports_per_node(ports_per_node)
            .with_port_availability_check(false)
            .with_binary(NodeRole::Validator, BinarySpec::new("/bin/validator"))
            .with_binary(NodeRole::ApiGateway, BinarySpec::new("/bin/http-api"));

        let instance = TopologyManager::new(dir.path()).provision(&template).unwrap();

        let mut seen = HashSet::new();
        for node in instance.nodes() {
            for port in node.ports.ports() {
                prop_assert!(seen.insert(port));
            }
        }

        let expected = usize::from(validators) + usize::from(full_nodes) + usize::from(api_gateway);
        prop_assert_eq!(instance.nodes().len(), expected);

        let genesis = Genesis::read(&instance.genesis().path).unwrap();
        prop_assert_eq!(genesis.validators.len(), usize::from(validators));
    }
}
