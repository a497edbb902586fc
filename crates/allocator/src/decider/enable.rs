//! Cluster-wide switches for allocation and rebalancing

use routing::{Decision, RecoverySource, RoutingNode, ShardRouting};

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::config::{AllocationSettings, EnableAllocation, EnableRebalance};

const NAME: &str = "enable";

#[derive(Debug, Clone)]
pub struct EnableAllocationDecider {
    enable: EnableAllocation,
    rebalance_enable: EnableRebalance,
}

impl EnableAllocationDecider {
    pub fn new(settings: &AllocationSettings) -> Self {
        Self {
            enable: settings.enable,
            rebalance_enable: settings.rebalance_enable,
        }
    }
}

impl AllocationDecider for EnableAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, _node: &RoutingNode<'_>, _allocation: &RoutingAllocation<'_>) -> Decision {
        match self.enable {
            EnableAllocation::All => Decision::yes(NAME, "all allocations are allowed"),
            EnableAllocation::None => Decision::no(NAME, "no allocations are allowed due to enable=none"),
            EnableAllocation::Primaries if shard.primary => {
                Decision::yes(NAME, "primary allocations are allowed")
            }
            EnableAllocation::Primaries => {
                Decision::no(NAME, "replica allocations are forbidden due to enable=primaries")
            }
            EnableAllocation::NewPrimaries => {
                let new_primary = shard.primary
                    && !shard.active()
                    && shard.recovery_source != Some(RecoverySource::ExistingStore);
                if new_primary {
                    Decision::yes(NAME, "new primary allocations are allowed")
                } else {
                    Decision::no(
                        NAME,
                        "non-new primary allocations are forbidden due to enable=new_primaries",
                    )
                }
            }
        }
    }

    fn can_rebalance(&self, shard: &ShardRouting, _allocation: &RoutingAllocation<'_>) -> Decision {
        match self.rebalance_enable {
            EnableRebalance::All => Decision::yes(NAME, "all rebalancing is allowed"),
            EnableRebalance::None => Decision::no(NAME, "no rebalancing is allowed due to rebalance_enable=none"),
            EnableRebalance::Primaries if shard.primary => {
                Decision::yes(NAME, "primary rebalancing is allowed")
            }
            EnableRebalance::Primaries => Decision::no(
                NAME,
                "replica rebalancing is forbidden due to rebalance_enable=primaries",
            ),
            EnableRebalance::Replicas if !shard.primary => {
                Decision::yes(NAME, "replica rebalancing is allowed")
            }
            EnableRebalance::Replicas => Decision::no(
                NAME,
                "primary rebalancing is forbidden due to rebalance_enable=replicas",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::tests::TestCluster;

    fn decider(enable: EnableAllocation, rebalance_enable: EnableRebalance) -> EnableAllocationDecider {
        EnableAllocationDecider::new(&AllocationSettings {
            enable,
            rebalance_enable,
            ..Default::default()
        })
    }

    #[test]
    fn test_enable_modes() {
        let cluster = TestCluster::new(&["node1"], 1);
        let allocation = cluster.allocation();
        let node1 = allocation.routing_nodes().node("node1").unwrap();
        let primary = cluster.unassigned_primary(&allocation);
        let replica = allocation
            .routing_nodes()
            .unassigned()
            .into_iter()
            .filter_map(|id| allocation.routing_nodes().get(id).cloned())
            .find(|s| !s.primary)
            .unwrap();

        let none = decider(EnableAllocation::None, EnableRebalance::All);
        assert!(none.can_allocate(&primary, &node1, &allocation).is_no());
        // Soft: a forced primary overrides it
        assert!(none.can_force_allocate_primary(&primary, &node1, &allocation).is_yes());

        let primaries = decider(EnableAllocation::Primaries, EnableRebalance::All);
        assert!(primaries.can_allocate(&primary, &node1, &allocation).is_yes());
        assert!(primaries.can_allocate(&replica, &node1, &allocation).is_no());

        let new_primaries = decider(EnableAllocation::NewPrimaries, EnableRebalance::All);
        assert!(new_primaries.can_allocate(&primary, &node1, &allocation).is_yes());
        let recovered = ShardRouting {
            recovery_source: Some(RecoverySource::ExistingStore),
            ..primary.clone()
        };
        assert!(new_primaries.can_allocate(&recovered, &node1, &allocation).is_no());
    }

    #[test]
    fn test_rebalance_modes() {
        let cluster = TestCluster::new(&["node1"], 0);
        let allocation = cluster.allocation();
        let primary = cluster.unassigned_primary(&allocation);

        assert!(decider(EnableAllocation::All, EnableRebalance::Replicas)
            .can_rebalance(&primary, &allocation)
            .is_no());
        assert!(decider(EnableAllocation::All, EnableRebalance::Primaries)
            .can_rebalance(&primary, &allocation)
            .is_yes());
    }
}
