//! Recovery throttling
//!
//! Limits how many recoveries run per node at once:
//! - primaries recovering from their own store or a snapshot on the target node
//! - peer recoveries streaming into the target node
//! - peer recoveries streaming out of the source node

use routing::{Decision, RecoverySource, RoutingNode, ShardRouting};

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::config::AllocationSettings;

const NAME: &str = "throttling";

#[derive(Debug, Clone)]
pub struct ThrottlingAllocationDecider {
    primaries_initial_recoveries: usize,
    concurrent_incoming_recoveries: usize,
    concurrent_outgoing_recoveries: usize,
}

impl ThrottlingAllocationDecider {
    pub fn new(settings: &AllocationSettings) -> Self {
        Self {
            primaries_initial_recoveries: settings.node_initial_primaries_recoveries,
            concurrent_incoming_recoveries: settings.node_concurrent_incoming_recoveries,
            concurrent_outgoing_recoveries: settings.node_concurrent_outgoing_recoveries,
        }
    }
}

fn is_initial_primary_recovery(shard: &ShardRouting) -> bool {
    shard.primary && shard.unassigned() && shard.recovery_source != Some(RecoverySource::Peer)
}

impl AllocationDecider for ThrottlingAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, node: &RoutingNode<'_>, allocation: &RoutingAllocation<'_>) -> Decision {
        let rn = allocation.routing_nodes();

        if is_initial_primary_recovery(shard) {
            let recoveries = rn.initial_primary_recoveries(node.node_id());
            if recoveries >= self.primaries_initial_recoveries {
                return Decision::throttle(
                    NAME,
                    format!(
                        "reached the limit of ongoing initial primary recoveries [{}], node_initial_primaries_recoveries=[{}]",
                        recoveries, self.primaries_initial_recoveries
                    ),
                );
            }
            return Decision::yes(NAME, "below primary recovery limit");
        }

        let incoming = rn.incoming_recoveries(node.node_id());
        if incoming >= self.concurrent_incoming_recoveries {
            return Decision::throttle(
                NAME,
                format!(
                    "reached the limit of incoming shard recoveries [{}], node_concurrent_incoming_recoveries=[{}]",
                    incoming, self.concurrent_incoming_recoveries
                ),
            );
        }

        // A moving copy recovers from itself, a new replica from the primary
        let source_node = match &shard.current_node_id {
            Some(node_id) => Some(node_id.clone()),
            None => rn
                .active_primary(&shard.shard_id)
                .and_then(|(_, primary)| primary.current_node_id.clone()),
        };
        if let Some(source_node) = source_node {
            let outgoing = rn.outgoing_recoveries(&source_node);
            if outgoing >= self.concurrent_outgoing_recoveries {
                return Decision::throttle(
                    NAME,
                    format!(
                        "reached the limit of outgoing shard recoveries [{}] on node [{}], node_concurrent_outgoing_recoveries=[{}]",
                        outgoing, source_node, self.concurrent_outgoing_recoveries
                    ),
                );
            }
        }

        Decision::yes(NAME, "below shard recovery limit")
    }
}
