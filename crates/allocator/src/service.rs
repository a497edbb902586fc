//! Allocation service
//!
//! Entry points that turn one cluster state into the next: reroute,
//! explicit commands, started-shard and failed-shard reports. Each call
//! builds a fresh `RoutingAllocation`, mutates it, and freezes it into a new
//! state. Nothing is committed when a call returns an error.

use std::sync::Arc;

use routing::{
    ClusterHealth, CopyId, DecisionKind, NodeId, RoutingError, ShardRouting, UnassignedInfo,
    UnassignedReason,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::allocation::RoutingAllocation;
use crate::commands::{AllocationCommand, CommandExplanation};
use crate::config::AllocationSettings;
use crate::decider::AllocationDeciders;
use crate::error::AllocationError;
use crate::gateway::{PrimaryAllocation, PrimaryShardAllocator, ShardStoreCache};
use crate::metadata::ClusterState;
use crate::scheduler::{PlacementStrategy, ShardsAllocator};

/// Options of a reroute
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RerouteOptions {
    /// Reset failed-allocation counters before allocating
    #[serde(default)]
    pub retry_failed: bool,
}

/// A copy reported failed by the node hosting it
#[derive(Debug, Clone)]
pub struct FailedShard {
    pub routing: ShardRouting,
    pub message: String,
    pub failure: Option<String>,
}

impl FailedShard {
    pub fn new(routing: ShardRouting, message: impl Into<String>) -> Self {
        Self {
            routing,
            message: message.into(),
            failure: None,
        }
    }

    pub fn with_failure(mut self, failure: impl Into<String>) -> Self {
        self.failure = Some(failure.into());
        self
    }

    fn describe(&self) -> String {
        match &self.failure {
            Some(failure) => format!("{}, failure {}", self.message, failure),
            None => self.message.clone(),
        }
    }
}

/// Outcome of one allocation call
#[derive(Debug, Clone)]
pub struct RoutingAllocationResult {
    /// The next state, or a clone of the input when nothing changed
    pub state: ClusterState,
    pub changed: bool,
    /// Copies set aside during this pass, with their allocation status
    pub ignored: Vec<ShardRouting>,
    /// Per-command decisions, in command order
    pub explanations: Vec<CommandExplanation>,
    pub health: ClusterHealth,
}

/// Allocation service
#[derive(Debug)]
pub struct AllocationService {
    deciders: AllocationDeciders,
    primary_allocator: PrimaryShardAllocator,
    shards_allocator: Box<dyn ShardsAllocator>,
    store_cache: Arc<ShardStoreCache>,
}

impl AllocationService {
    /// Service with the standard deciders and the configured placement strategy
    pub fn new(settings: &AllocationSettings, store_cache: Arc<ShardStoreCache>) -> Self {
        Self::with_allocators(
            settings,
            AllocationDeciders::from_settings(settings),
            Box::new(PlacementStrategy::from_settings(settings)),
            store_cache,
        )
    }

    pub fn with_allocators(
        settings: &AllocationSettings,
        deciders: AllocationDeciders,
        shards_allocator: Box<dyn ShardsAllocator>,
        store_cache: Arc<ShardStoreCache>,
    ) -> Self {
        Self {
            deciders,
            primary_allocator: PrimaryShardAllocator::new(settings),
            shards_allocator,
            store_cache,
        }
    }

    pub fn deciders(&self) -> &AllocationDeciders {
        &self.deciders
    }

    pub fn store_cache(&self) -> &Arc<ShardStoreCache> {
        &self.store_cache
    }

    /// Run one allocation pass over `state`
    pub fn reroute(&self, state: &ClusterState, reason: &str) -> Result<RoutingAllocationResult, AllocationError> {
        self.reroute_with_options(state, &RerouteOptions::default(), reason)
    }

    pub fn reroute_with_options(
        &self,
        state: &ClusterState,
        options: &RerouteOptions,
        reason: &str,
    ) -> Result<RoutingAllocationResult, AllocationError> {
        let mut allocation = RoutingAllocation::new(state, &self.store_cache);
        self.reset_failed(&mut allocation, options);
        self.allocate(&mut allocation)?;
        self.build_result(state, allocation, Vec::new(), reason)
    }

    /// Apply explicit commands, then allocate what is left.
    ///
    /// The first invalid or rejected command fails the whole call.
    pub fn execute_commands(
        &self,
        state: &ClusterState,
        commands: &[AllocationCommand],
        options: &RerouteOptions,
    ) -> Result<RoutingAllocationResult, AllocationError> {
        let mut allocation = RoutingAllocation::new(state, &self.store_cache);
        self.reset_failed(&mut allocation, options);
        self.disassociate_dead_nodes(&mut allocation)?;

        let mut explanations = Vec::with_capacity(commands.len());
        for command in commands {
            match command.execute(&mut allocation, &self.deciders) {
                Ok(explanation) => {
                    info!("Executed allocation command [{}]", command);
                    explanations.push(explanation);
                }
                Err(e) => {
                    warn!("Allocation command [{}] failed: {}", command, e);
                    return Err(e);
                }
            }
        }

        self.allocate(&mut allocation)?;
        self.build_result(state, allocation, explanations, "allocation commands")
    }

    /// Mark reported copies started, then allocate.
    ///
    /// Reports for copies that are unknown or no longer initializing are
    /// skipped.
    pub fn apply_started_shards(
        &self,
        state: &ClusterState,
        started: &[ShardRouting],
    ) -> Result<RoutingAllocationResult, AllocationError> {
        let mut allocation = RoutingAllocation::new(state, &self.store_cache);

        for report in started {
            let Some(id) = find_reported(&allocation, report) else {
                debug!("Ignoring started report for unknown copy {}", report);
                continue;
            };
            let Some(current) = allocation.routing_nodes().get(id).cloned() else {
                continue;
            };
            if !current.initializing() {
                debug!("Ignoring started report for {}: not initializing", current);
                continue;
            }

            let removed_source = allocation.routing_nodes_mut().start_shard(id)?;
            let shard_id = current.shard_id.clone();
            if let Some(allocation_id) = &current.allocation_id {
                allocation.in_sync_updates_mut().add(&shard_id, allocation_id.id.clone());
            }
            if let Some(source) = removed_source {
                info!(
                    "Relocation of {} from node [{}] completed",
                    shard_id,
                    source.current_node_id.as_deref().unwrap_or("-")
                );
                if let Some(source_id) = source.allocation_id {
                    allocation.in_sync_updates_mut().remove(&shard_id, source_id.id);
                }
            }
            if current.primary {
                self.store_cache.clear(&shard_id);
            }
            info!(
                "Started {} on node [{}]",
                shard_id,
                current.current_node_id.as_deref().unwrap_or("-")
            );
        }

        self.allocate(&mut allocation)?;
        self.build_result(state, allocation, Vec::new(), "shards started")
    }

    pub fn apply_failed_shard(
        &self,
        state: &ClusterState,
        failed: FailedShard,
    ) -> Result<RoutingAllocationResult, AllocationError> {
        self.apply_failed_shards(state, &[failed])
    }

    /// Apply every failure in order on one working copy, then allocate once.
    ///
    /// A later failure in the batch sees the effects of earlier ones, such
    /// as a promoted replica.
    pub fn apply_failed_shards(
        &self,
        state: &ClusterState,
        failed: &[FailedShard],
    ) -> Result<RoutingAllocationResult, AllocationError> {
        let mut allocation = RoutingAllocation::new(state, &self.store_cache);

        for failure in failed {
            let Some(id) = find_reported(&allocation, &failure.routing) else {
                debug!("Ignoring failure report for unknown copy {}", failure.routing);
                continue;
            };
            let Some(current) = allocation.routing_nodes().get(id).cloned() else {
                continue;
            };
            warn!("Failing {}: {}", current, failure.describe());
            let info = UnassignedInfo::failed(current.unassigned_info.as_ref(), failure.describe());
            fail_shard(&mut allocation, &self.deciders, id, info)?;
        }

        self.allocate(&mut allocation)?;
        self.build_result(state, allocation, Vec::new(), "shards failed")
    }

    fn reset_failed(&self, allocation: &mut RoutingAllocation<'_>, options: &RerouteOptions) {
        if options.retry_failed {
            let reset = allocation.routing_nodes_mut().reset_failed_allocations();
            if reset > 0 {
                info!("Reset failed allocation counters of {} copies", reset);
            }
        }
    }

    fn disassociate_dead_nodes(&self, allocation: &mut RoutingAllocation<'_>) -> Result<(), RoutingError> {
        let dead: Vec<NodeId> = allocation
            .routing_nodes()
            .node_ids()
            .filter(|node_id| !allocation.nodes().contains(node_id))
            .cloned()
            .collect();

        for node_id in dead {
            while let Some(id) = allocation
                .routing_nodes()
                .node(&node_id)
                .and_then(|node| node.copy_ids().first().copied())
            {
                let info = UnassignedInfo::new(UnassignedReason::NodeLeft, Some(format!("node_left [{}]", node_id)));
                fail_shard(allocation, &self.deciders, id, info)?;
                let still_there = allocation
                    .routing_nodes()
                    .node(&node_id)
                    .is_some_and(|node| node.copy_ids().contains(&id));
                if still_there {
                    return Err(RoutingError::InvariantViolation(format!(
                        "copy {} stayed on departed node [{}] after failing it",
                        id, node_id
                    )));
                }
            }
            allocation.routing_nodes_mut().remove_node(&node_id)?;
            info!("Removed departed node [{}] from routing", node_id);
        }
        Ok(())
    }

    fn allocate(&self, allocation: &mut RoutingAllocation<'_>) -> Result<(), RoutingError> {
        self.disassociate_dead_nodes(allocation)?;

        let outcomes = self.primary_allocator.allocate_unassigned(allocation, &self.deciders)?;
        for (id, outcome) in &outcomes {
            if let PrimaryAllocation::Initialized { node_id, forced: true } = outcome {
                debug!("Copy {} force allocated on node [{}]", id, node_id);
            }
        }

        self.shards_allocator.allocate(allocation, &self.deciders)
    }

    fn build_result(
        &self,
        state: &ClusterState,
        allocation: RoutingAllocation<'_>,
        explanations: Vec<CommandExplanation>,
        reason: &str,
    ) -> Result<RoutingAllocationResult, AllocationError> {
        let (routing_nodes, in_sync_updates) = allocation.into_parts();
        let routing_table = routing_nodes
            .into_routing_table(&state.routing_table)
            .map_err(|e| {
                warn!("Allocation pass [{}] aborted: {}", reason, e);
                e
            })?;
        let ignored: Vec<ShardRouting> = routing_nodes
            .ignored()
            .iter()
            .filter_map(|id| routing_nodes.get(*id).cloned())
            .collect();
        let metadata = in_sync_updates.apply(&state.metadata, &routing_table);

        let changed = !routing_table.same_routing(&state.routing_table) || metadata != state.metadata;
        let next = if changed {
            state.next(state.nodes.clone(), metadata, routing_table)
        } else {
            state.clone()
        };
        let health = ClusterHealth::from_routing_table(&next.routing_table);

        if changed {
            info!(
                "Reroute [{}]: routing version {} -> {}, health {}, {} ignored",
                reason,
                state.routing_table.version,
                next.routing_table.version,
                health.status,
                ignored.len()
            );
        } else {
            debug!("Reroute [{}]: no changes, health {}", reason, health.status);
        }

        Ok(RoutingAllocationResult {
            state: next,
            changed,
            ignored,
            explanations,
            health,
        })
    }
}

fn find_reported(allocation: &RoutingAllocation<'_>, report: &ShardRouting) -> Option<CopyId> {
    let node_id = report.current_node_id.as_deref()?;
    let allocation_id = report.allocation_id.as_ref()?;
    allocation
        .routing_nodes()
        .find_assigned(&report.shard_id, node_id, &allocation_id.id)
}

/// Take an assigned copy off its node.
///
/// - a relocation target is discarded and its source reverts to started
/// - a relocating source on a live node reverts to started; on a departed
///   node its relocation is cancelled and it fails like a started copy
/// - a primary takes its recovering replicas down with it and hands the
///   role to an active replica if one may serve it
/// - a replica just becomes unassigned
pub(crate) fn fail_shard(
    allocation: &mut RoutingAllocation<'_>,
    deciders: &AllocationDeciders,
    id: CopyId,
    info: UnassignedInfo,
) -> Result<(), RoutingError> {
    let shard = allocation
        .routing_nodes()
        .get(id)
        .cloned()
        .ok_or_else(|| RoutingError::InvariantViolation(format!("copy {} does not exist", id)))?;
    let Some(node_id) = shard.current_node_id.clone() else {
        debug!("{} is already unassigned", shard);
        return Ok(());
    };
    allocation.add_ignore_shard_for_node(&shard.shard_id, &node_id);
    let node_alive = allocation.nodes().contains(&node_id);

    if shard.is_relocation_target() {
        let source = allocation.routing_nodes().relocation_source_of(id).ok_or_else(|| {
            RoutingError::InvariantViolation(format!("relocation source of {} is missing", shard))
        })?;
        allocation.routing_nodes_mut().cancel_relocation(source)?;
        info!("Relocation target {} failed, source reverts to started", shard);
        return Ok(());
    }

    if shard.relocating() {
        allocation.routing_nodes_mut().cancel_relocation(id)?;
        if node_alive {
            info!("Relocation of {} aborted, source keeps serving", shard.shard_id);
            return Ok(());
        }
    }

    let shard = allocation
        .routing_nodes()
        .get(id)
        .cloned()
        .ok_or_else(|| RoutingError::InvariantViolation(format!("copy {} does not exist", id)))?;

    if shard.primary {
        return fail_primary(allocation, deciders, id, &shard, info);
    }

    let stale = shard.active() && info.reason == UnassignedReason::AllocationFailed;
    allocation.routing_nodes_mut().move_to_unassigned(id, info)?;
    if stale {
        if let Some(allocation_id) = &shard.allocation_id {
            allocation
                .in_sync_updates_mut()
                .remove(&shard.shard_id, allocation_id.id.clone());
        }
    }
    Ok(())
}

fn fail_primary(
    allocation: &mut RoutingAllocation<'_>,
    deciders: &AllocationDeciders,
    id: CopyId,
    primary: &ShardRouting,
    info: UnassignedInfo,
) -> Result<(), RoutingError> {
    let shard_id = primary.shard_id.clone();
    let siblings: Vec<(CopyId, ShardRouting)> = allocation
        .routing_nodes()
        .group(&shard_id)
        .into_iter()
        .filter(|(_, s)| !s.primary)
        .map(|(cid, s)| (cid, s.clone()))
        .collect();

    // Replicas recovering from this primary cannot finish
    for (cid, replica) in &siblings {
        if replica.relocating() {
            allocation.routing_nodes_mut().cancel_relocation(*cid)?;
        } else if replica.initializing() && !replica.is_relocation_target() {
            allocation.routing_nodes_mut().move_to_unassigned(
                *cid,
                UnassignedInfo::new(
                    UnassignedReason::PrimaryFailed,
                    Some(format!("primary failed while replica initializing: {}", info.message.as_deref().unwrap_or(""))),
                ),
            )?;
        }
    }

    let candidate = {
        let rn = allocation.routing_nodes();
        rn.group(&shard_id)
            .into_iter()
            .filter(|(_, s)| !s.primary && s.active())
            .filter(|(_, s)| {
                s.current_node_id
                    .as_deref()
                    .is_some_and(|node_id| allocation.nodes().contains(node_id))
            })
            .find(|(_, s)| {
                let Some(node) = s.current_node_id.as_deref().and_then(|n| rn.node(n)) else {
                    return false;
                };
                let as_primary = s.move_active_replica_to_primary();
                deciders.can_remain(&as_primary, &node, allocation).kind() != DecisionKind::No
            })
            .map(|(cid, s)| (cid, s.clone()))
    };

    allocation.routing_nodes_mut().move_to_unassigned(id, info)?;

    match candidate {
        Some((cid, replica)) => {
            allocation.routing_nodes_mut().demote_unassigned_primary(id)?;
            allocation.routing_nodes_mut().promote_active_replica(cid)?;
            if let Some(allocation_id) = &replica.allocation_id {
                allocation.in_sync_updates_mut().add(&shard_id, allocation_id.id.clone());
            }
            info!(
                "Primary of {} failed, promoted replica on node [{}]",
                shard_id,
                replica.current_node_id.as_deref().unwrap_or("-")
            );
        }
        None => {
            allocation.store_cache().clear(&shard_id);
            warn!("Primary of {} failed and no active replica can take over", shard_id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::DiscoveryNode;
    use routing::{ClusterHealthStatus, ShardRoutingState};

    fn service() -> AllocationService {
        AllocationService::new(&AllocationSettings::default(), Arc::new(ShardStoreCache::new()))
    }

    fn cluster(nodes: &[&str], replicas: u32) -> ClusterState {
        let mut state = ClusterState::new("test");
        for (i, id) in nodes.iter().enumerate() {
            state = state.with_node_joined(DiscoveryNode::new(*id, format!("h{}", i), format!("10.0.0.{}", i)));
        }
        state.with_index_created("test", 1, replicas).unwrap()
    }

    fn start_all(service: &AllocationService, mut state: ClusterState) -> ClusterState {
        loop {
            let initializing: Vec<ShardRouting> = state
                .routing_table
                .shards_with_state(ShardRoutingState::Initializing)
                .into_iter()
                .cloned()
                .collect();
            if initializing.is_empty() {
                return state;
            }
            state = service.apply_started_shards(&state, &initializing).unwrap().state;
        }
    }

    #[test]
    fn test_reroute_then_start() {
        let service = service();
        let state = cluster(&["node1", "node2"], 1);
        let result = service.reroute(&state, "test").unwrap();
        assert!(result.changed);
        assert_eq!(result.health.status, ClusterHealthStatus::Red);

        let state = start_all(&service, result.state);
        let health = ClusterHealth::from_routing_table(&state.routing_table);
        assert_eq!(health.status, ClusterHealthStatus::Green);
        assert_eq!(health.active_shards, 2);

        // Both copies are recorded as in sync
        let index = state.metadata.index("test").unwrap();
        assert_eq!(index.in_sync_ids(0).len(), 2);
    }

    #[test]
    fn test_unchanged_reroute_keeps_state() {
        let service = service();
        let state = start_all(&service, service.reroute(&cluster(&["node1"], 0), "test").unwrap().state);
        let result = service.reroute(&state, "noop").unwrap();
        assert!(!result.changed);
        assert_eq!(result.state.version, state.version);
    }

    #[test]
    fn test_stale_started_report_is_skipped() {
        let service = service();
        let state = service.reroute(&cluster(&["node1"], 0), "test").unwrap().state;
        let mut report = state.routing_table.all_shards().next().unwrap().clone();
        report.allocation_id = Some(routing::AllocationId::with_existing("nope"));
        let result = service.apply_started_shards(&state, &[report]).unwrap();
        assert!(!result.changed);
    }

    #[test]
    fn test_failed_replica_is_retried_elsewhere() {
        let service = service();
        let state = start_all(&service, service.reroute(&cluster(&["node1", "node2", "node3"], 1), "test").unwrap().state);
        let replica = state
            .routing_table
            .all_shards()
            .find(|s| !s.primary)
            .unwrap()
            .clone();
        let failed_node = replica.current_node_id.clone().unwrap();

        let result = service
            .apply_failed_shard(&state, FailedShard::new(replica.clone(), "disk error"))
            .unwrap();
        let new_replica = result.state.routing_table.all_shards().find(|s| !s.primary).unwrap();
        assert!(new_replica.initializing());
        // Not retried on the node it just failed on
        assert_ne!(new_replica.current_node_id.as_deref(), Some(failed_node.as_str()));
        assert_eq!(new_replica.unassigned_info.as_ref().unwrap().failed_allocations, 1);

        // The failed copy is no longer in sync
        let index = result.state.metadata.index("test").unwrap();
        assert!(!index.is_in_sync(0, &replica.allocation_id.unwrap().id));
    }

    #[test]
    fn test_node_left_promotes_replica() {
        let service = service();
        let state = start_all(&service, service.reroute(&cluster(&["node1", "node2"], 1), "test").unwrap().state);
        let primary_node = state
            .routing_table
            .all_shards()
            .find(|s| s.primary)
            .and_then(|s| s.current_node_id.clone())
            .unwrap();

        let departed = state.with_node_left(&primary_node).unwrap();
        let result = service.reroute(&departed, "node left").unwrap();
        let group = result
            .state
            .routing_table
            .shard_routing_table(&routing::ShardId::new("test", 0))
            .unwrap();
        let primary = group.primary_shard().unwrap();
        assert!(primary.started());
        assert_ne!(primary.current_node_id.as_deref(), Some(primary_node.as_str()));
        let replica = group.replica_shards().next().unwrap();
        assert!(replica.unassigned());
        assert_eq!(replica.unassigned_info.as_ref().unwrap().reason, UnassignedReason::NodeLeft);
        assert_eq!(result.health.status, ClusterHealthStatus::Yellow);
    }
}
