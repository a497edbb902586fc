//! Cluster state
//!
//! One consistent snapshot of nodes, index metadata and routing. Every change
//! produces a new state with a higher version; allocation passes never
//! mutate a committed state.

use chrono::{DateTime, Utc};
use routing::{RoutingTable, RoutingTableBuilder, ShardRoutingState};
use serde::{Deserialize, Serialize};

use super::{DiscoveryNode, DiscoveryNodes, IndexMetadata, Metadata};
use crate::allocation::trim_in_sync;
use crate::error::AllocationError;

/// Cluster state snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    /// Cluster name
    pub cluster_name: String,
    /// Incremented on every committed change
    pub version: u64,
    /// Last update time
    pub updated_at: DateTime<Utc>,
    pub nodes: DiscoveryNodes,
    pub metadata: Metadata,
    pub routing_table: RoutingTable,
}

impl ClusterState {
    /// Create an empty cluster
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            version: 0,
            updated_at: Utc::now(),
            nodes: DiscoveryNodes::new(),
            metadata: Metadata::new(),
            routing_table: RoutingTable::new(),
        }
    }

    /// State after a full cluster restart: metadata is known, every shard
    /// copy is unassigned and must be recovered from an existing store
    pub fn recovered(cluster_name: impl Into<String>, metadata: Metadata) -> Result<Self, AllocationError> {
        let mut builder = RoutingTableBuilder::new();
        for index in metadata.indices() {
            builder.add_as_recovery(&index.name, index.number_of_shards, index.number_of_replicas)?;
        }
        let routing_table = builder.build()?;
        Ok(Self {
            metadata,
            routing_table,
            ..Self::new(cluster_name)
        })
    }

    /// Successor state sharing this state's name
    pub fn next(&self, nodes: DiscoveryNodes, metadata: Metadata, routing_table: RoutingTable) -> Self {
        Self {
            cluster_name: self.cluster_name.clone(),
            version: self.version + 1,
            updated_at: Utc::now(),
            nodes,
            metadata,
            routing_table,
        }
    }

    /// Add (or refresh) a data node
    pub fn with_node_joined(&self, node: DiscoveryNode) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.add(node);
        self.next(nodes, self.metadata.clone(), self.routing_table.clone())
    }

    /// Remove a data node. Its copies stay in the routing table until the
    /// next allocation pass fails them.
    pub fn with_node_left(&self, node_id: &str) -> Result<Self, AllocationError> {
        let mut nodes = self.nodes.clone();
        nodes
            .remove(node_id)
            .ok_or_else(|| AllocationError::NodeNotFound(node_id.to_string()))?;
        Ok(self.next(nodes, self.metadata.clone(), self.routing_table.clone()))
    }

    /// Create an empty index
    pub fn with_index_created(
        &self,
        name: &str,
        number_of_shards: u32,
        number_of_replicas: u32,
    ) -> Result<Self, AllocationError> {
        self.check_new_index(name, number_of_shards)?;
        let mut metadata = self.metadata.clone();
        metadata.put(IndexMetadata::new(name, number_of_shards, number_of_replicas));
        let mut builder = self.routing_table.builder();
        builder.add_as_new(name, number_of_shards, number_of_replicas)?;
        Ok(self.next(self.nodes.clone(), metadata, builder.build()?))
    }

    /// Create an index whose primaries recover from a snapshot
    pub fn with_index_restored(
        &self,
        name: &str,
        number_of_shards: u32,
        number_of_replicas: u32,
        repository: &str,
        snapshot: &str,
    ) -> Result<Self, AllocationError> {
        self.check_new_index(name, number_of_shards)?;
        let mut metadata = self.metadata.clone();
        metadata.put(IndexMetadata::new(name, number_of_shards, number_of_replicas));
        let mut builder = self.routing_table.builder();
        builder.add_as_restore(name, number_of_shards, number_of_replicas, repository, snapshot)?;
        Ok(self.next(self.nodes.clone(), metadata, builder.build()?))
    }

    pub fn with_index_deleted(&self, name: &str) -> Result<Self, AllocationError> {
        let mut metadata = self.metadata.clone();
        metadata
            .remove(name)
            .ok_or_else(|| AllocationError::IndexNotFound(name.to_string()))?;
        let mut builder = self.routing_table.builder();
        builder.remove_index(name)?;
        Ok(self.next(self.nodes.clone(), metadata, builder.build()?))
    }

    /// Grow or shrink the replica count of an index
    pub fn with_number_of_replicas(&self, name: &str, number_of_replicas: u32) -> Result<Self, AllocationError> {
        let mut metadata = self.metadata.clone();
        let index = metadata
            .index_mut(name)
            .ok_or_else(|| AllocationError::IndexNotFound(name.to_string()))?;
        index.number_of_replicas = number_of_replicas;
        let mut builder = self.routing_table.builder();
        builder.update_number_of_replicas(name, number_of_replicas)?;
        let routing_table = builder.build()?;

        // Ids of removed copies leave the in-sync set while a primary serves
        let max_active = number_of_replicas as usize + 1;
        for shard_id in index.shard_ids().collect::<Vec<_>>() {
            let ids = index.in_sync_ids(shard_id.id);
            let Ok(group) = routing_table.shard_routing_table(&shard_id) else {
                continue;
            };
            if ids.len() > max_active && group.primary_active() {
                index
                    .in_sync_allocation_ids
                    .insert(shard_id.id, trim_in_sync(&ids, group, max_active));
            }
        }
        metadata.version += 1;
        Ok(self.next(self.nodes.clone(), metadata, routing_table))
    }

    fn check_new_index(&self, name: &str, number_of_shards: u32) -> Result<(), AllocationError> {
        if name.is_empty() {
            return Err(AllocationError::InvalidSettings("index name must not be empty".to_string()));
        }
        if number_of_shards == 0 {
            return Err(AllocationError::InvalidSettings(format!(
                "index [{}] must have at least one shard",
                name
            )));
        }
        if self.metadata.has_index(name) || self.routing_table.has_index(name) {
            return Err(AllocationError::IndexAlreadyExists(name.to_string()));
        }
        Ok(())
    }

    /// Get cluster statistics
    pub fn stats(&self) -> ClusterStats {
        let count = |state| self.routing_table.shards_with_state(state).len();
        ClusterStats {
            total_nodes: self.nodes.len(),
            total_indices: self.metadata.indices().count(),
            total_shards: self.routing_table.all_shards().count(),
            started_shards: count(ShardRoutingState::Started),
            relocating_shards: count(ShardRoutingState::Relocating),
            initializing_shards: count(ShardRoutingState::Initializing),
            unassigned_shards: count(ShardRoutingState::Unassigned),
            state_version: self.version,
            routing_version: self.routing_table.version,
        }
    }
}

/// Cluster statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStats {
    pub total_nodes: usize,
    pub total_indices: usize,
    pub total_shards: usize,
    pub started_shards: usize,
    pub relocating_shards: usize,
    pub initializing_shards: usize,
    pub unassigned_shards: usize,
    pub state_version: u64,
    pub routing_version: u64,
}
