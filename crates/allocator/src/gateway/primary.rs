//! Primary shard allocator
//!
//! Resolves unassigned primaries that must recover existing data, from an
//! existing store or a snapshot, using the store reports cached in
//! `ShardStoreCache`. Fresh primaries (empty store) are left to the shards
//! allocator.
//!
//! Two selection modes:
//! - allocation ids: the index records which copies are in sync; only nodes
//!   reporting one of those ids are candidates
//! - legacy versions: every node with data is a candidate, highest version
//!   first, and a quorum of copies must have reported before allocating

use routing::{AllocationStatus, CopyId, Decision, DecisionKind, Decisions, RoutingError, ShardRouting};
use tracing::{debug, info, warn};

use super::store::{FetchResult, NodeShardState};
use crate::allocation::RoutingAllocation;
use crate::config::{AllocationSettings, InitialShards};
use crate::decider::AllocationDeciders;
use crate::metadata::IndexMetadata;

/// Outcome for one unassigned primary, used for logging and tests
#[derive(Debug, Clone, PartialEq)]
pub enum PrimaryAllocation {
    /// Not handled here (replica or fresh primary)
    NotApplicable,
    /// No node reported any data; left in the unassigned list
    NoDataFound,
    /// Store reports are still being fetched
    Fetching,
    /// Data exists but no copy may be used
    NoValidCopy,
    Throttled,
    Rejected,
    Initialized { node_id: String, forced: bool },
}

#[derive(Debug, Clone)]
pub struct PrimaryShardAllocator {
    prefer_previous_primary: bool,
    initial_shards: InitialShards,
}

impl PrimaryShardAllocator {
    pub fn new(settings: &AllocationSettings) -> Self {
        Self {
            prefer_previous_primary: settings.prefer_previous_primary,
            initial_shards: settings.initial_shards,
        }
    }

    /// Try every primary currently in the unassigned list
    pub fn allocate_unassigned(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
    ) -> Result<Vec<(CopyId, PrimaryAllocation)>, RoutingError> {
        let mut outcomes = Vec::new();
        for id in allocation.routing_nodes().unassigned() {
            let Some(shard) = allocation.routing_nodes().get(id).cloned() else {
                continue;
            };
            let outcome = self.allocate_primary(allocation, deciders, id, &shard)?;
            if outcome != PrimaryAllocation::NotApplicable {
                outcomes.push((id, outcome));
            }
        }
        Ok(outcomes)
    }

    fn allocate_primary(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
        id: CopyId,
        shard: &ShardRouting,
    ) -> Result<PrimaryAllocation, RoutingError> {
        let needs_data = shard
            .recovery_source
            .as_ref()
            .is_some_and(|source| source.needs_store_data());
        if !shard.primary || !needs_data {
            return Ok(PrimaryAllocation::NotApplicable);
        }
        let Some(index) = allocation.metadata().index(&shard.shard_id.index) else {
            warn!("No metadata for index of {}, skipping primary allocation", shard);
            return Ok(PrimaryAllocation::NotApplicable);
        };

        let states = match allocation.store_cache().fetch(&shard.shard_id, allocation.nodes()) {
            FetchResult::Pending => {
                debug!("{}: still fetching shard store data", shard.shard_id);
                allocation
                    .routing_nodes_mut()
                    .ignore_shard(id, AllocationStatus::FetchingShardData, None)?;
                return Ok(PrimaryAllocation::Fetching);
            }
            FetchResult::Complete(states) => states,
        };

        // Only nodes still hosting a routing view can take the shard
        let states: Vec<NodeShardState> = states
            .into_iter()
            .filter(|s| allocation.routing_nodes().has_node(&s.node_id))
            .collect();

        if !states.iter().any(NodeShardState::found) {
            debug!("{}: no node reported shard data", shard.shard_id);
            return Ok(PrimaryAllocation::NoDataFound);
        }

        let candidates = if index.tracks_allocation_ids(shard.shard_id.id) {
            self.in_sync_candidates(index, shard, &states)
        } else {
            match self.legacy_candidates(index, shard, &states) {
                Some(candidates) => candidates,
                None => {
                    allocation
                        .routing_nodes_mut()
                        .ignore_shard(id, AllocationStatus::NoValidShardCopy, None)?;
                    return Ok(PrimaryAllocation::NoValidCopy);
                }
            }
        };

        let Some(selected) = candidates.first() else {
            warn!(
                "{}: shard data found but no valid copy can be allocated as primary",
                shard.shard_id
            );
            allocation
                .routing_nodes_mut()
                .ignore_shard(id, AllocationStatus::NoValidShardCopy, None)?;
            return Ok(PrimaryAllocation::NoValidCopy);
        };

        let decisions = match allocation.routing_nodes().node(&selected.node_id) {
            Some(node) => deciders.can_allocate(shard, &node, allocation),
            None => Decisions::single(Decision::no(
                "primary_allocator",
                format!("node [{}] is not part of the routing nodes", selected.node_id),
            )),
        };

        match decisions.kind() {
            DecisionKind::Yes => {
                self.initialize(allocation, id, selected, false)?;
                Ok(PrimaryAllocation::Initialized {
                    node_id: selected.node_id.clone(),
                    forced: false,
                })
            }
            DecisionKind::Throttle => {
                debug!(
                    "{}: throttled on node [{}]: {}",
                    shard.shard_id, selected.node_id, decisions
                );
                allocation.routing_nodes_mut().ignore_shard(
                    id,
                    AllocationStatus::DecidersThrottled,
                    Some(decisions.representative()),
                )?;
                Ok(PrimaryAllocation::Throttled)
            }
            DecisionKind::No => self.force_allocate(allocation, deciders, id, shard, &candidates, decisions),
        }
    }

    /// Deciders said NO on the selected copy: look for any candidate where
    /// a forced allocation is permitted
    fn force_allocate(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
        id: CopyId,
        shard: &ShardRouting,
        candidates: &[NodeShardState],
        rejection: Decisions,
    ) -> Result<PrimaryAllocation, RoutingError> {
        let mut throttled: Option<Decisions> = None;
        for candidate in candidates {
            let Some(node) = allocation.routing_nodes().node(&candidate.node_id) else {
                continue;
            };
            let decisions = deciders.can_force_allocate_primary(shard, &node, allocation);
            match decisions.kind() {
                DecisionKind::Yes => {
                    info!(
                        "{}: forcing primary allocation to node [{}] holding existing data, deciders said: {}",
                        shard.shard_id, candidate.node_id, rejection
                    );
                    self.initialize(allocation, id, candidate, true)?;
                    return Ok(PrimaryAllocation::Initialized {
                        node_id: candidate.node_id.clone(),
                        forced: true,
                    });
                }
                DecisionKind::Throttle => {
                    throttled.get_or_insert(decisions);
                }
                DecisionKind::No => {}
            }
        }

        match throttled {
            Some(decisions) => {
                debug!("{}: forced allocation throttled: {}", shard.shard_id, decisions);
                allocation.routing_nodes_mut().ignore_shard(
                    id,
                    AllocationStatus::DecidersThrottled,
                    Some(decisions.representative()),
                )?;
                Ok(PrimaryAllocation::Throttled)
            }
            None => {
                debug!("{}: primary allocation rejected: {}", shard.shard_id, rejection);
                allocation.routing_nodes_mut().ignore_shard(
                    id,
                    AllocationStatus::DecidersNo,
                    Some(rejection.representative()),
                )?;
                Ok(PrimaryAllocation::Rejected)
            }
        }
    }

    fn initialize(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        id: CopyId,
        candidate: &NodeShardState,
        forced: bool,
    ) -> Result<(), RoutingError> {
        let node_id = candidate.node_id.clone();
        let initialized = allocation.routing_nodes_mut().initialize_shard(
            id,
            &node_id,
            candidate.allocation_id.clone(),
        )?;
        info!(
            "Allocated primary {} to node [{}] from existing data{}",
            initialized,
            node_id,
            if forced { " (forced)" } else { "" }
        );
        Ok(())
    }

    /// Copies whose allocation id is in sync, in preference order
    fn in_sync_candidates(
        &self,
        index: &IndexMetadata,
        shard: &ShardRouting,
        states: &[NodeShardState],
    ) -> Vec<NodeShardState> {
        let mut candidates: Vec<NodeShardState> = states
            .iter()
            .filter(|s| s.has_data())
            .filter(|s| {
                s.allocation_id
                    .as_deref()
                    .is_some_and(|aid| index.is_in_sync(shard.shard_id.id, aid))
            })
            .cloned()
            .collect();

        for rejected in states.iter().filter(|s| s.found() && !candidates.contains(s)) {
            debug!(
                "{}: copy on node [{}] is not usable (allocation id {:?}, store exception {:?})",
                shard.shard_id, rejected.node_id, rejected.allocation_id, rejected.store_exception
            );
        }

        if self.prefer_previous_primary {
            candidates.sort_by(|a, b| b.primary.cmp(&a.primary).then_with(|| a.node_id.cmp(&b.node_id)));
        } else {
            candidates.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        }
        candidates
    }

    /// Copies ordered by highest version, or `None` when fewer copies than
    /// required have reported
    fn legacy_candidates(
        &self,
        index: &IndexMetadata,
        shard: &ShardRouting,
        states: &[NodeShardState],
    ) -> Option<Vec<NodeShardState>> {
        let mut candidates: Vec<NodeShardState> =
            states.iter().filter(|s| s.has_data()).cloned().collect();
        candidates.sort_by(|a, b| {
            b.legacy_version
                .cmp(&a.legacy_version)
                .then_with(|| b.primary.cmp(&a.primary))
                .then_with(|| a.node_id.cmp(&b.node_id))
        });

        let initial_shards = index.initial_shards.unwrap_or(self.initial_shards);
        let required = initial_shards.required(index.number_of_replicas) as usize;
        if candidates.len() < required {
            debug!(
                "{}: found {} copies, {} required by initial_shards [{}], waiting for more",
                shard.shard_id,
                candidates.len(),
                required,
                initial_shards
            );
            return None;
        }
        Some(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ShardStoreCache;
    use crate::metadata::{ClusterState, DiscoveryNode};
    use routing::ShardId;

    fn recovered_state(nodes: &[&str], replicas: u32, in_sync: &[&str]) -> ClusterState {
        let mut metadata = crate::metadata::Metadata::new();
        let mut index = IndexMetadata::new("test", 1, replicas);
        if !in_sync.is_empty() {
            index
                .in_sync_allocation_ids
                .insert(0, in_sync.iter().map(|s| s.to_string()).collect());
        }
        metadata.put(index);
        let mut state = ClusterState::recovered("test", metadata).unwrap();
        for (i, id) in nodes.iter().enumerate() {
            state = state.with_node_joined(DiscoveryNode::new(*id, format!("h{}", i), format!("10.0.0.{}", i)));
        }
        state
    }

    fn run(
        state: &ClusterState,
        cache: &ShardStoreCache,
        settings: &AllocationSettings,
    ) -> (PrimaryAllocation, Option<ShardRouting>) {
        let mut allocation = RoutingAllocation::new(state, cache);
        let deciders = AllocationDeciders::from_settings(settings);
        let outcomes = PrimaryShardAllocator::new(settings)
            .allocate_unassigned(&mut allocation, &deciders)
            .unwrap();
        let (id, outcome) = outcomes.into_iter().next().unwrap();
        (outcome, allocation.routing_nodes().get(id).cloned())
    }

    #[test]
    fn test_pending_fetch_ignores_shard() {
        let state = recovered_state(&["node1"], 0, &["a1"]);
        let cache = ShardStoreCache::new();
        let (outcome, shard) = run(&state, &cache, &AllocationSettings::default());
        assert_eq!(outcome, PrimaryAllocation::Fetching);
        let shard = shard.unwrap();
        assert!(shard.unassigned());
        assert_eq!(
            shard.unassigned_info.unwrap().last_allocation_status,
            AllocationStatus::FetchingShardData
        );
        assert_eq!(cache.drain_requests(), vec![ShardId::new("test", 0)]);
    }

    #[test]
    fn test_allocation_id_mode_reuses_reported_id() {
        let state = recovered_state(&["node1", "node2"], 0, &["a1"]);
        let cache = ShardStoreCache::new();
        cache.on_fetch_complete(
            &ShardId::new("test", 0),
            vec![
                NodeShardState::with_allocation_id("node1", "stale", true),
                NodeShardState::with_allocation_id("node2", "a1", false),
            ],
        );
        let (outcome, shard) = run(&state, &cache, &AllocationSettings::default());
        assert_eq!(
            outcome,
            PrimaryAllocation::Initialized {
                node_id: "node2".to_string(),
                forced: false
            }
        );
        let shard = shard.unwrap();
        assert!(shard.initializing());
        assert_eq!(shard.allocation_id.unwrap().id, "a1");
    }

    #[test]
    fn test_previous_primary_preferred_among_in_sync() {
        let state = recovered_state(&["node1", "node2"], 1, &["a1", "a2"]);
        let cache = ShardStoreCache::new();
        cache.on_fetch_complete(
            &ShardId::new("test", 0),
            vec![
                NodeShardState::with_allocation_id("node1", "a1", false),
                NodeShardState::with_allocation_id("node2", "a2", true),
            ],
        );
        let (_, shard) = run(&state, &cache, &AllocationSettings::default());
        assert_eq!(shard.unwrap().current_node_id.as_deref(), Some("node2"));

        let by_node_id = AllocationSettings {
            prefer_previous_primary: false,
            ..Default::default()
        };
        let (_, shard) = run(&state, &cache, &by_node_id);
        assert_eq!(shard.unwrap().current_node_id.as_deref(), Some("node1"));
    }

    #[test]
    fn test_no_in_sync_copy_is_not_valid() {
        let state = recovered_state(&["node1"], 0, &["a1"]);
        let cache = ShardStoreCache::new();
        cache.on_fetch_complete(
            &ShardId::new("test", 0),
            vec![NodeShardState::with_allocation_id("node1", "other", true)],
        );
        let (outcome, shard) = run(&state, &cache, &AllocationSettings::default());
        assert_eq!(outcome, PrimaryAllocation::NoValidCopy);
        assert_eq!(
            shard.unwrap().unassigned_info.unwrap().last_allocation_status,
            AllocationStatus::NoValidShardCopy
        );
    }

    #[test]
    fn test_store_exception_is_not_usable() {
        let state = recovered_state(&["node1"], 0, &[]);
        let cache = ShardStoreCache::new();
        cache.on_fetch_complete(&ShardId::new("test", 0), vec![NodeShardState::failed("node1", "corrupt")]);
        let (outcome, _) = run(&state, &cache, &AllocationSettings::default());
        assert_eq!(outcome, PrimaryAllocation::NoValidCopy);
    }

    #[test]
    fn test_no_data_leaves_shard_unassigned() {
        let state = recovered_state(&["node1"], 0, &[]);
        let cache = ShardStoreCache::new();
        cache.on_fetch_complete(&ShardId::new("test", 0), vec![NodeShardState::empty("node1")]);

        let mut allocation = RoutingAllocation::new(&state, &cache);
        let settings = AllocationSettings::default();
        let outcomes = PrimaryShardAllocator::new(&settings)
            .allocate_unassigned(&mut allocation, &AllocationDeciders::from_settings(&settings))
            .unwrap();
        assert_eq!(outcomes[0].1, PrimaryAllocation::NoDataFound);
        assert!(allocation.routing_nodes().ignored().is_empty());
        assert_eq!(allocation.routing_nodes().unassigned().len(), 1);
    }

    #[test]
    fn test_legacy_highest_version_wins() {
        let state = recovered_state(&["node1", "node2", "node3"], 2, &[]);
        let cache = ShardStoreCache::new();
        cache.on_fetch_complete(
            &ShardId::new("test", 0),
            vec![
                NodeShardState::with_legacy_version("node1", 7, false),
                NodeShardState::with_legacy_version("node2", 9, false),
                NodeShardState::empty("node3"),
            ],
        );
        let (outcome, shard) = run(&state, &cache, &AllocationSettings::default());
        assert!(matches!(outcome, PrimaryAllocation::Initialized { .. }));
        assert_eq!(shard.unwrap().current_node_id.as_deref(), Some("node2"));
    }

    #[test]
    fn test_throttled_primary_is_ignored() {
        let state = recovered_state(&["node1"], 0, &["a1"]);
        let cache = ShardStoreCache::new();
        cache.on_fetch_complete(
            &ShardId::new("test", 0),
            vec![NodeShardState::with_allocation_id("node1", "a1", true)],
        );
        let settings = AllocationSettings {
            node_initial_primaries_recoveries: 0,
            ..Default::default()
        };
        let (outcome, shard) = run(&state, &cache, &settings);
        assert_eq!(outcome, PrimaryAllocation::Throttled);
        let info = shard.unwrap().unassigned_info.unwrap();
        assert_eq!(info.last_allocation_status, AllocationStatus::DecidersThrottled);
        assert_eq!(info.last_decision.unwrap().label, "throttling");
    }
}
