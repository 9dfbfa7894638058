use localnet_topology::{HealthStatus, NetworkInstance, NodeId, NodeRole};

/// Health of a whole instance, derived from its nodes' statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    /// Every node is healthy.
    Ready,

    /// Validators and gateways are healthy, some other node is not.
    Degraded,

    /// Some validator or gateway is not healthy yet.
    Pending,

    /// A majority of validators is unreachable.
    Failed,
}

/// Assesses an instance from per-node statuses.
pub fn assess<F>(instance: &NetworkInstance, status: F) -> Assessment
where
    F: Fn(&NodeId) -> HealthStatus,
{
    let validators: Vec<_> = instance.nodes_with_role(NodeRole::Validator).collect();
    let unreachable = validators
        .iter()
        .filter(|n| status(&n.id) == HealthStatus::Unreachable)
        .count();

    if unreachable * 2 > validators.len() {
        return Assessment::Failed;
    }

    let (critical, others): (Vec<_>, Vec<_>) = instance
        .nodes()
        .iter()
        .partition(|n| matches!(n.role, NodeRole::Validator | NodeRole::ApiGateway));

    if !critical.iter().all(|n| status(&n.id) == HealthStatus::Healthy) {
        return Assessment::Pending;
    }

    if others.iter().all(|n| status(&n.id) == HealthStatus::Healthy) {
        Assessment::Ready
    } else {
        Assessment::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use localnet_topology::{BinarySpec, Template, TopologyManager};
    use tempfile::tempdir;

    fn instance(root: &std::path::Path) -> NetworkInstance {
        let template = Template::new("ready")
            .with_validators(3)
            .with_full_nodes(1)
            .with_api_gateway(true)
            .with_base_port(42000)
            .with_port_availability_check(false)
            .with_binary(NodeRole::Validator, BinarySpec::new("/bin/validator"))
            .with_binary(NodeRole::ApiGateway, BinarySpec::new("/bin/http-api"));
        TopologyManager::new(root).provision(&template).unwrap()
    }

    fn assess_with(instance: &NetworkInstance, overrides: &[(&str, HealthStatus)]) -> Assessment {
        let overrides: HashMap<_, _> = overrides
            .iter()
            .map(|(id, status)| (NodeId::from(*id), *status))
            .collect();
        assess(instance, |id| {
            overrides
                .get(id)
                .copied()
                .unwrap_or(HealthStatus::Healthy)
        })
    }

    #[test]
    fn test_all_healthy_is_ready() {
        let dir = tempdir().unwrap();
        assert_eq!(assess_with(&instance(dir.path()), &[]), Assessment::Ready);
    }

    #[test]
    fn test_unhealthy_full_node_degrades() {
        let dir = tempdir().unwrap();
        assert_eq!(
            assess_with(
                &instance(dir.path()),
                &[("full-node-0", HealthStatus::Unreachable)]
            ),
            Assessment::Degraded
        );
    }

    #[test]
    fn test_gateway_gates_readiness() {
        let dir = tempdir().unwrap();
        assert_eq!(
            assess_with(
                &instance(dir.path()),
                &[("api-gateway", HealthStatus::Unknown)]
            ),
            Assessment::Pending
        );
    }

    #[test]
    fn test_majority_unreachable_fails() {
        let dir = tempdir().unwrap();
        let instance = instance(dir.path());

        assert_eq!(
            assess_with(&instance, &[("validator-0", HealthStatus::Unreachable)]),
            Assessment::Pending
        );
        assert_eq!(
            assess_with(
                &instance,
                &[
                    ("validator-0", HealthStatus::Unreachable),
                    ("validator-2", HealthStatus::Unreachable)
                ]
            ),
            Assessment::Failed
        );
    }
}
