//! Context of one allocation pass
//!
//! `RoutingAllocation` owns the mutable `RoutingNodes` working view and
//! borrows the rest of the cluster state it was built from. Side effects
//! on index metadata are collected as `InSyncUpdates` and applied when the
//! pass is frozen.

use std::collections::{BTreeSet, HashMap};

use routing::{IndexShardRoutingTable, NodeId, RoutingNodes, RoutingTable, ShardId};
use tracing::debug;

use crate::gateway::ShardStoreCache;
use crate::metadata::{ClusterState, DiscoveryNodes, Metadata};

/// Change to the in-sync allocation ids of one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InSyncChange {
    Add(String),
    Remove(String),
    /// Replace the set; `None` clears it
    Reset(Option<String>),
}

/// In-sync id changes recorded during a pass, in order
#[derive(Debug, Clone, Default)]
pub struct InSyncUpdates {
    changes: Vec<(ShardId, InSyncChange)>,
}

impl InSyncUpdates {
    pub fn add(&mut self, shard_id: &ShardId, allocation_id: impl Into<String>) {
        self.changes.push((shard_id.clone(), InSyncChange::Add(allocation_id.into())));
    }

    pub fn remove(&mut self, shard_id: &ShardId, allocation_id: impl Into<String>) {
        self.changes.push((shard_id.clone(), InSyncChange::Remove(allocation_id.into())));
    }

    pub fn reset(&mut self, shard_id: &ShardId, allocation_id: Option<String>) {
        self.changes.push((shard_id.clone(), InSyncChange::Reset(allocation_id)));
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> &[(ShardId, InSyncChange)] {
        &self.changes
    }

    /// Metadata with every change applied; untouched if nothing changed
    ///
    /// A set that grew past `number_of_replicas + 1` ids is trimmed against
    /// `routing_table`, keeping ids of assigned copies first.
    pub fn apply(&self, metadata: &Metadata, routing_table: &RoutingTable) -> Metadata {
        let mut updated = metadata.clone();
        let mut changed = false;
        let mut grown: BTreeSet<ShardId> = BTreeSet::new();
        for (shard_id, change) in &self.changes {
            let Some(index) = updated.index_mut(&shard_id.index) else {
                continue;
            };
            let before = index.in_sync_ids(shard_id.id);
            let mut ids = before.clone();
            match change {
                InSyncChange::Add(id) => {
                    ids.insert(id.clone());
                    grown.insert(shard_id.clone());
                }
                InSyncChange::Remove(id) => {
                    ids.remove(id);
                }
                InSyncChange::Reset(id) => {
                    ids = id.iter().cloned().collect();
                }
            }
            if ids != before {
                index.in_sync_allocation_ids.insert(shard_id.id, ids);
                changed = true;
            }
        }

        for shard_id in grown {
            let Some(index) = updated.index_mut(&shard_id.index) else {
                continue;
            };
            let old_len = metadata
                .index(&shard_id.index)
                .map(|i| i.in_sync_ids(shard_id.id).len())
                .unwrap_or(0);
            let ids = index.in_sync_ids(shard_id.id);
            let max_active = index.number_of_replicas as usize + 1;
            if ids.len() <= old_len || ids.len() <= max_active {
                continue;
            }
            let Ok(group) = routing_table.shard_routing_table(&shard_id) else {
                continue;
            };
            let trimmed = trim_in_sync(&ids, group, max_active);
            debug!(
                "Trimmed in-sync ids of {} from {} to {}",
                shard_id,
                ids.len(),
                trimmed.len()
            );
            index.in_sync_allocation_ids.insert(shard_id.id, trimmed);
        }

        if changed {
            updated.version += 1;
        }
        updated
    }
}

/// At most `max_active` of `ids`, those held by an assigned copy first
pub(crate) fn trim_in_sync(
    ids: &BTreeSet<String>,
    group: &IndexShardRoutingTable,
    max_active: usize,
) -> BTreeSet<String> {
    let assigned: BTreeSet<&str> = group
        .assigned_shards()
        .filter(|s| !s.is_relocation_target())
        .filter_map(|s| s.allocation_id.as_ref().map(|a| a.id.as_str()))
        .collect();
    let (held, unheld): (Vec<&String>, Vec<&String>) = ids.iter().partition(|id| assigned.contains(id.as_str()));
    held.into_iter().chain(unheld).take(max_active).cloned().collect()
}

/// Mutable context of one allocation pass
#[derive(Debug)]
pub struct RoutingAllocation<'a> {
    routing_nodes: RoutingNodes,
    nodes: &'a DiscoveryNodes,
    metadata: &'a Metadata,
    store_cache: &'a ShardStoreCache,
    /// Nodes on which a shard failed during this pass
    ignored_shard_to_nodes: HashMap<ShardId, BTreeSet<NodeId>>,
    in_sync_updates: InSyncUpdates,
}

impl<'a> RoutingAllocation<'a> {
    pub fn new(state: &'a ClusterState, store_cache: &'a ShardStoreCache) -> Self {
        let routing_nodes = RoutingNodes::new(&state.routing_table, state.nodes.ids().cloned());
        Self {
            routing_nodes,
            nodes: &state.nodes,
            metadata: &state.metadata,
            store_cache,
            ignored_shard_to_nodes: HashMap::new(),
            in_sync_updates: InSyncUpdates::default(),
        }
    }

    pub fn routing_nodes(&self) -> &RoutingNodes {
        &self.routing_nodes
    }

    pub fn routing_nodes_mut(&mut self) -> &mut RoutingNodes {
        &mut self.routing_nodes
    }

    /// Data nodes currently in the cluster
    pub fn nodes(&self) -> &'a DiscoveryNodes {
        self.nodes
    }

    pub fn metadata(&self) -> &'a Metadata {
        self.metadata
    }

    pub fn store_cache(&self) -> &'a ShardStoreCache {
        self.store_cache
    }

    pub fn add_ignore_shard_for_node(&mut self, shard_id: &ShardId, node_id: &str) {
        self.ignored_shard_to_nodes
            .entry(shard_id.clone())
            .or_default()
            .insert(node_id.to_string());
    }

    pub fn should_ignore_shard_for_node(&self, shard_id: &ShardId, node_id: &str) -> bool {
        self.ignored_shard_to_nodes
            .get(shard_id)
            .is_some_and(|nodes| nodes.contains(node_id))
    }

    pub fn in_sync_updates(&self) -> &InSyncUpdates {
        &self.in_sync_updates
    }

    pub fn in_sync_updates_mut(&mut self) -> &mut InSyncUpdates {
        &mut self.in_sync_updates
    }

    pub fn into_parts(self) -> (RoutingNodes, InSyncUpdates) {
        (self.routing_nodes, self.in_sync_updates)
    }
}
