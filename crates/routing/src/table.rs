//! Routing table definitions
//!
//! The committed, immutable mapping from index to shard groups. A new table is
//! produced per reroute pass through `RoutingTableBuilder`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

use crate::shard::{
    NodeId, RecoverySource, ShardId, ShardRouting, ShardRoutingState, UnassignedInfo,
    UnassignedReason,
};

/// Routing table errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("Index not found: {0}")]
    IndexNotFound(String),
    #[error("Shard not found: {0}")]
    ShardNotFound(ShardId),
    #[error("Index already exists: {0}")]
    DuplicateIndex(String),
    #[error("Invalid shard count for index {index}: {count}")]
    InvalidShardCount { index: String, count: u32 },
    #[error("Routing invariant violated: {0}")]
    InvariantViolation(String),
}

/// One primary plus its replicas for a single `ShardId`
///
/// Relocation targets are not stored; they are implied by the relocating
/// source and materialized by `RoutingNodes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexShardRoutingTable {
    pub shard_id: ShardId,
    pub shards: Vec<ShardRouting>,
}

impl IndexShardRoutingTable {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            shards: Vec::new(),
        }
    }

    /// The copy flagged primary
    pub fn primary_shard(&self) -> Option<&ShardRouting> {
        self.shards.iter().find(|s| s.primary)
    }

    pub fn replica_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| !s.primary)
    }

    pub fn active_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| s.active())
    }

    pub fn assigned_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| s.assigned_to_node())
    }

    /// Copies on `node_id`, counting a relocation target as living on its target node
    pub fn shards_on_node<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ShardRouting> {
        self.shards.iter().filter(move |s| {
            s.current_node_id.as_deref() == Some(node_id)
                || s.relocating_node_id.as_deref() == Some(node_id)
        })
    }

    pub fn primary_active(&self) -> bool {
        self.primary_shard().map(|p| p.active()).unwrap_or(false)
    }

    pub fn size(&self) -> usize {
        self.shards.len()
    }

    /// Check the single-primary and per-node exclusivity rules for this group
    pub fn validate(&self) -> Result<(), RoutingError> {
        let primaries = self.shards.iter().filter(|s| s.primary).count();
        if primaries != 1 {
            return Err(RoutingError::InvariantViolation(format!(
                "{} has {} copies flagged primary",
                self.shard_id, primaries
            )));
        }

        let mut nodes: HashSet<&str> = HashSet::new();
        for shard in &self.shards {
            if shard.shard_id != self.shard_id {
                return Err(RoutingError::InvariantViolation(format!(
                    "{} stored under {}",
                    shard, self.shard_id
                )));
            }
            if shard.unassigned() != shard.current_node_id.is_none() {
                return Err(RoutingError::InvariantViolation(format!(
                    "{} has inconsistent node assignment",
                    shard
                )));
            }
            if shard.relocating() != shard.relocating_node_id.is_some() {
                return Err(RoutingError::InvariantViolation(format!(
                    "{} has inconsistent relocation info",
                    shard
                )));
            }
            for node in shard.current_node_id.iter().chain(shard.relocating_node_id.iter()) {
                if !nodes.insert(node.as_str()) {
                    return Err(RoutingError::InvariantViolation(format!(
                        "{} has more than one copy on node [{}]",
                        self.shard_id, node
                    )));
                }
            }
        }
        Ok(())
    }
}

/// All shard groups of one index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    pub index: String,
    pub shards: BTreeMap<u32, IndexShardRoutingTable>,
}

impl IndexRoutingTable {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            shards: BTreeMap::new(),
        }
    }

    pub fn shard(&self, id: u32) -> Option<&IndexShardRoutingTable> {
        self.shards.get(&id)
    }

    pub fn number_of_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.values().flat_map(|g| g.shards.iter())
    }
}

/// Routing table
///
/// Immutable once built; every pass produces a new version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// Incremented on every build
    pub version: u64,
    indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTable {
    /// Create empty routing table
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder(&self) -> RoutingTableBuilder {
        RoutingTableBuilder::from(self)
    }

    pub fn index(&self, index: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(index)
    }

    pub fn has_index(&self, index: &str) -> bool {
        self.indices.contains_key(index)
    }

    pub fn indices(&self) -> impl Iterator<Item = &IndexRoutingTable> {
        self.indices.values()
    }

    pub fn shard_routing_table(&self, shard_id: &ShardId) -> Result<&IndexShardRoutingTable, RoutingError> {
        self.indices
            .get(&shard_id.index)
            .ok_or_else(|| RoutingError::IndexNotFound(shard_id.index.clone()))?
            .shard(shard_id.id)
            .ok_or_else(|| RoutingError::ShardNotFound(shard_id.clone()))
    }

    /// Every stored copy, in index/shard order
    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.indices.values().flat_map(|i| i.all_shards())
    }

    pub fn shards_with_state(&self, state: ShardRoutingState) -> Vec<&ShardRouting> {
        self.all_shards().filter(|s| s.state == state).collect()
    }

    /// Same copies in every index, whatever the versions
    pub fn same_routing(&self, other: &RoutingTable) -> bool {
        self.indices == other.indices
    }

    /// Validate every group and cross-group node bookkeeping
    pub fn validate(&self) -> Result<(), RoutingError> {
        for index in self.indices.values() {
            for (id, group) in &index.shards {
                if group.shard_id.index != index.index || group.shard_id.id != *id {
                    return Err(RoutingError::InvariantViolation(format!(
                        "group {} stored under [{}][{}]",
                        group.shard_id, index.index, id
                    )));
                }
                group.validate()?;
            }
        }
        Ok(())
    }

    /// Copies per node, relocation targets counted on their target node
    pub fn shards_per_node(&self) -> HashMap<NodeId, usize> {
        let mut counts: HashMap<NodeId, usize> = HashMap::new();
        for shard in self.all_shards() {
            for node in shard.current_node_id.iter().chain(shard.relocating_node_id.iter()) {
                *counts.entry(node.clone()).or_default() += 1;
            }
        }
        counts
    }
}

/// Copy-on-write builder for `RoutingTable`
#[derive(Debug, Clone, Default)]
pub struct RoutingTableBuilder {
    version: u64,
    indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(table: &RoutingTable) -> Self {
        Self {
            version: table.version,
            indices: table.indices.clone(),
        }
    }

    /// Routing for a freshly created index: empty primaries
    pub fn add_as_new(&mut self, index: &str, shards: u32, replicas: u32) -> Result<&mut Self, RoutingError> {
        self.add_unassigned(index, shards, replicas, RecoverySource::EmptyStore, UnassignedReason::IndexCreated)
    }

    /// Routing for an index recovered after a full cluster restart
    pub fn add_as_recovery(&mut self, index: &str, shards: u32, replicas: u32) -> Result<&mut Self, RoutingError> {
        self.add_unassigned(index, shards, replicas, RecoverySource::ExistingStore, UnassignedReason::ClusterRecovered)
    }

    /// Routing for an index restored from a snapshot
    pub fn add_as_restore(
        &mut self,
        index: &str,
        shards: u32,
        replicas: u32,
        repository: &str,
        snapshot: &str,
    ) -> Result<&mut Self, RoutingError> {
        let source = RecoverySource::Snapshot {
            repository: repository.to_string(),
            snapshot: snapshot.to_string(),
        };
        self.add_unassigned(index, shards, replicas, source, UnassignedReason::NewIndexRestored)
    }

    fn add_unassigned(
        &mut self,
        index: &str,
        shards: u32,
        replicas: u32,
        primary_source: RecoverySource,
        reason: UnassignedReason,
    ) -> Result<&mut Self, RoutingError> {
        if shards == 0 {
            return Err(RoutingError::InvalidShardCount {
                index: index.to_string(),
                count: shards,
            });
        }
        if self.indices.contains_key(index) {
            return Err(RoutingError::DuplicateIndex(index.to_string()));
        }

        let mut table = IndexRoutingTable::new(index);
        for id in 0..shards {
            let shard_id = ShardId::new(index, id);
            let mut group = IndexShardRoutingTable::new(shard_id.clone());
            group.shards.push(ShardRouting::new_unassigned(
                shard_id.clone(),
                true,
                primary_source.clone(),
                UnassignedInfo::new(reason, None),
            ));
            for _ in 0..replicas {
                group.shards.push(ShardRouting::new_unassigned(
                    shard_id.clone(),
                    false,
                    RecoverySource::Peer,
                    UnassignedInfo::new(reason, None),
                ));
            }
            table.shards.insert(id, group);
        }
        self.indices.insert(index.to_string(), table);
        Ok(self)
    }

    /// Grow or shrink the replica set of every group of `index`
    ///
    /// Shrinking removes unassigned replicas first, then initializing ones,
    /// then active ones.
    pub fn update_number_of_replicas(&mut self, index: &str, replicas: u32) -> Result<&mut Self, RoutingError> {
        let table = self
            .indices
            .get_mut(index)
            .ok_or_else(|| RoutingError::IndexNotFound(index.to_string()))?;

        for group in table.shards.values_mut() {
            let current = group.replica_shards().count();
            let wanted = replicas as usize;
            if current < wanted {
                for _ in current..wanted {
                    group.shards.push(ShardRouting::new_unassigned(
                        group.shard_id.clone(),
                        false,
                        RecoverySource::Peer,
                        UnassignedInfo::new(UnassignedReason::ReplicaAdded, None),
                    ));
                }
            } else {
                let mut excess = current - wanted;
                for state in [
                    ShardRoutingState::Unassigned,
                    ShardRoutingState::Initializing,
                    ShardRoutingState::Started,
                    ShardRoutingState::Relocating,
                ] {
                    while excess > 0 {
                        match group.shards.iter().rposition(|s| !s.primary && s.state == state) {
                            Some(pos) => {
                                group.shards.remove(pos);
                                excess -= 1;
                            }
                            None => break,
                        }
                    }
                }
            }
        }
        Ok(self)
    }

    pub fn remove_index(&mut self, index: &str) -> Result<IndexRoutingTable, RoutingError> {
        self.indices
            .remove(index)
            .ok_or_else(|| RoutingError::IndexNotFound(index.to_string()))
    }

    /// Replace one group wholesale
    pub fn put_shard_table(&mut self, group: IndexShardRoutingTable) -> &mut Self {
        let index = group.shard_id.index.clone();
        self.indices
            .entry(index.clone())
            .or_insert_with(|| IndexRoutingTable::new(index))
            .shards
            .insert(group.shard_id.id, group);
        self
    }

    /// Drop all groups, keeping the version
    pub fn clear(&mut self) -> &mut Self {
        self.indices.clear();
        self
    }

    /// Validate and freeze into a new table version
    pub fn build(self) -> Result<RoutingTable, RoutingError> {
        let table = RoutingTable {
            version: self.version + 1,
            indices: self.indices,
        };
        table.validate()?;
        Ok(table)
    }
}
