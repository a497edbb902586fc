//! Same shard allocation decider
//!
//! Two copies of one shard never share a node. With `same_host` enabled
//! they never share a host either, so losing one machine cannot take out
//! more than one copy.

use routing::{Decision, RoutingNode, ShardRouting};

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::config::AllocationSettings;

const NAME: &str = "same_shard";

#[derive(Debug, Clone)]
pub struct SameShardAllocationDecider {
    same_host: bool,
}

impl SameShardAllocationDecider {
    pub fn new(settings: &AllocationSettings) -> Self {
        Self {
            same_host: settings.same_host,
        }
    }
}

impl AllocationDecider for SameShardAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, node: &RoutingNode<'_>, allocation: &RoutingAllocation<'_>) -> Decision {
        if let Some(existing) = node.shard_for(&shard.shard_id) {
            return Decision::no(
                NAME,
                format!(
                    "a copy of this shard is already allocated to this node [{}]",
                    existing
                ),
            );
        }

        if self.same_host {
            let Some(this) = allocation.nodes().get(node.node_id()) else {
                return Decision::yes(NAME, "node has no host information");
            };
            for other in allocation.routing_nodes().nodes() {
                if other.node_id() == node.node_id() {
                    continue;
                }
                let Some(other_node) = allocation.nodes().get(other.node_id()) else {
                    continue;
                };
                if this.same_host(other_node) {
                    if let Some(existing) = other.shard_for(&shard.shard_id) {
                        return Decision::no(
                            NAME,
                            format!(
                                "a copy of this shard is already allocated to host [{}] on node [{}]: [{}]",
                                this.host_address,
                                other.node_id(),
                                existing
                            ),
                        );
                    }
                }
            }
        }

        Decision::yes(NAME, "this node does not hold a copy of this shard")
    }

    fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode<'_>,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        self.can_allocate(shard, node, allocation)
    }
}
