//! Replicas recover from an active primary, so they wait for one.

use routing::{Decision, RoutingNode, ShardRouting};

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;

const NAME: &str = "replica_after_primary_active";

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicaAfterPrimaryActiveAllocationDecider;

impl AllocationDecider for ReplicaAfterPrimaryActiveAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, _node: &RoutingNode<'_>, allocation: &RoutingAllocation<'_>) -> Decision {
        if shard.primary {
            return Decision::yes(NAME, "shard is primary and can be allocated");
        }
        match allocation.routing_nodes().active_primary(&shard.shard_id) {
            Some(_) => Decision::yes(NAME, "primary shard for this replica is already active"),
            None => Decision::no(NAME, "primary shard for this replica is not yet active"),
        }
    }
}
