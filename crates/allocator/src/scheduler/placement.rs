//! Shard placement strategy
//!
//! Default `ShardsAllocator`: walks the unassigned list, primaries first,
//! and assigns each copy to the least loaded node the deciders accept. It
//! never moves copies that are already assigned.

use std::collections::HashSet;

use routing::{AllocationStatus, CopyId, Decision, DecisionKind, Decisions, NodeId, RoutingError, ShardRouting};
use tracing::{debug, info, warn};

use super::ShardsAllocator;
use crate::allocation::RoutingAllocation;
use crate::config::AllocationSettings;
use crate::decider::AllocationDeciders;

/// Placement strategy
#[derive(Debug, Clone)]
pub struct PlacementStrategy {
    /// Prefer nodes whose `rack` attribute holds no copy of the shard yet
    pub rack_aware: bool,
    /// Prefer nodes hosting fewer copies
    pub load_balance: bool,
}

impl Default for PlacementStrategy {
    fn default() -> Self {
        Self {
            rack_aware: false,
            load_balance: true,
        }
    }
}

impl PlacementStrategy {
    pub fn from_settings(settings: &AllocationSettings) -> Self {
        Self {
            rack_aware: settings.rack_awareness,
            ..Self::default()
        }
    }

    /// Candidate nodes for `shard`, most preferred first
    pub fn candidate_nodes(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Vec<NodeId> {
        let rn = allocation.routing_nodes();
        let mut candidates: Vec<(usize, bool, NodeId)> = rn
            .nodes()
            .filter(|n| allocation.nodes().contains(n.node_id()))
            .map(|n| {
                let load = if self.load_balance { n.num_shards() } else { 0 };
                (load, false, n.node_id().to_string())
            })
            .collect();

        if self.rack_aware {
            let used_racks: HashSet<&str> = rn
                .group(&shard.shard_id)
                .into_iter()
                .filter_map(|(_, s)| s.current_node_id.as_deref())
                .filter_map(|node_id| allocation.nodes().get(node_id))
                .filter_map(|node| node.attribute("rack"))
                .collect();
            for (_, rack_used, node_id) in candidates.iter_mut() {
                *rack_used = allocation
                    .nodes()
                    .get(node_id)
                    .and_then(|n| n.attribute("rack"))
                    .is_some_and(|rack| used_racks.contains(rack));
            }
        }

        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)).then_with(|| a.2.cmp(&b.2)));
        candidates.into_iter().map(|(_, _, node_id)| node_id).collect()
    }

    fn allocate_copy(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
        id: CopyId,
        shard: &ShardRouting,
    ) -> Result<(), RoutingError> {
        let mut throttled: Option<Decisions> = None;
        let mut rejected: Option<Decisions> = None;

        for node_id in self.candidate_nodes(shard, allocation) {
            let Some(node) = allocation.routing_nodes().node(&node_id) else {
                continue;
            };
            let decisions = deciders.can_allocate(shard, &node, allocation);
            match decisions.kind() {
                DecisionKind::Yes => {
                    let initialized = allocation.routing_nodes_mut().initialize_shard(id, &node_id, None)?;
                    info!("Allocated {} to node [{}]", initialized, node_id);
                    return Ok(());
                }
                DecisionKind::Throttle => {
                    throttled.get_or_insert(decisions);
                }
                DecisionKind::No => {
                    debug!("{} cannot be allocated to node [{}]: {}", shard.shard_id, node_id, decisions);
                    rejected.get_or_insert(decisions);
                }
            }
        }

        let (status, decision) = match (throttled, rejected) {
            (Some(decisions), _) => (AllocationStatus::DecidersThrottled, decisions.representative()),
            (None, Some(decisions)) => (AllocationStatus::DecidersNo, decisions.representative()),
            (None, None) => (
                AllocationStatus::DecidersNo,
                Decision::no("placement", "no data nodes available"),
            ),
        };
        debug!("{} stays unassigned: {}", shard.shard_id, decision);
        allocation.routing_nodes_mut().ignore_shard(id, status, Some(decision))
    }
}

impl ShardsAllocator for PlacementStrategy {
    fn allocate(&self, allocation: &mut RoutingAllocation<'_>, deciders: &AllocationDeciders) -> Result<(), RoutingError> {
        let mut ids = allocation.routing_nodes().unassigned();
        ids.sort_by_key(|id| allocation.routing_nodes().get(*id).map(|s| !s.primary));

        for id in ids {
            let Some(shard) = allocation.routing_nodes().get(id).cloned() else {
                continue;
            };
            if !shard.unassigned() {
                continue;
            }

            // A fresh copy would discard the data of the in-sync copies
            let needs_data = shard.recovery_source.as_ref().is_some_and(|s| s.needs_store_data());
            let tracked = allocation
                .metadata()
                .index(&shard.shard_id.index)
                .is_some_and(|index| index.tracks_allocation_ids(shard.shard_id.id));
            if shard.primary && needs_data && tracked {
                warn!(
                    "{}: refusing to create an empty primary while in-sync copies may exist",
                    shard.shard_id
                );
                allocation.routing_nodes_mut().ignore_shard(
                    id,
                    AllocationStatus::NoValidShardCopy,
                    Some(Decision::no(
                        "placement",
                        "no in-sync copy of this primary has been found",
                    )),
                )?;
                continue;
            }

            self.allocate_copy(allocation, deciders, id, &shard)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::tests::TestCluster;
    use crate::config::AllocationSettings;
    use crate::metadata::DiscoveryNode;

    #[test]
    fn test_least_loaded_node_first() {
        let cluster = TestCluster::new(&["node1", "node2", "node3"], 0);
        let state = cluster.state.with_index_created("busy", 2, 0).unwrap();
        let cache = crate::gateway::ShardStoreCache::new();
        let mut allocation = RoutingAllocation::new(&state, &cache);
        let rn = allocation.routing_nodes_mut();
        let busy: Vec<_> = rn
            .unassigned()
            .into_iter()
            .filter(|id| rn.get(*id).unwrap().shard_id.index == "busy")
            .collect();
        rn.initialize_shard(busy[0], "node1", None).unwrap();
        rn.initialize_shard(busy[1], "node3", None).unwrap();

        let test_shard = cluster.unassigned_primary(&allocation);
        let strategy = PlacementStrategy::default();
        assert_eq!(strategy.candidate_nodes(&test_shard, &allocation), vec!["node2", "node1", "node3"]);
    }

    #[test]
    fn test_rack_awareness_spreads_copies() {
        let cluster = TestCluster::with_nodes(
            vec![
                DiscoveryNode::new("node1", "h1", "10.0.0.1").with_attribute("rack", "r1"),
                DiscoveryNode::new("node2", "h2", "10.0.0.2").with_attribute("rack", "r1"),
                DiscoveryNode::new("node3", "h3", "10.0.0.3").with_attribute("rack", "r2"),
            ],
            1,
        );
        let mut allocation = cluster.allocation();
        let rn = allocation.routing_nodes_mut();
        let primary = rn.unassigned().into_iter().find(|id| rn.get(*id).unwrap().primary).unwrap();
        rn.initialize_shard(primary, "node1", None).unwrap();
        rn.start_shard(primary).unwrap();

        let replica = allocation
            .routing_nodes()
            .unassigned()
            .into_iter()
            .find_map(|id| allocation.routing_nodes().get(id).cloned())
            .unwrap();
        let strategy = PlacementStrategy::from_settings(&AllocationSettings {
            rack_awareness: true,
            ..Default::default()
        });
        assert_eq!(strategy.candidate_nodes(&replica, &allocation)[0], "node3");
        assert_eq!(PlacementStrategy::default().candidate_nodes(&replica, &allocation)[0], "node2");
    }

    #[test]
    fn test_allocates_primaries_before_replicas() {
        let cluster = TestCluster::new(&["node1", "node2"], 1);
        let mut allocation = cluster.allocation();
        let deciders = AllocationDeciders::from_settings(&AllocationSettings::default());
        PlacementStrategy::default().allocate(&mut allocation, &deciders).unwrap();

        let rn = allocation.routing_nodes();
        let (_, primary) = rn
            .copies()
            .find(|(_, s)| s.primary)
            .unwrap();
        assert!(primary.initializing());
        // The replica waits for an active primary
        assert_eq!(rn.ignored().len(), 1);
        let replica = rn.get(rn.ignored()[0]).unwrap();
        assert_eq!(
            replica.unassigned_info.as_ref().unwrap().last_allocation_status,
            AllocationStatus::DecidersNo
        );
    }
}
