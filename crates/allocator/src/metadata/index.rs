//! Index metadata
//!
//! Index-level settings consumed by allocation, including the per-shard set
//! of in-sync allocation ids.

use chrono::{DateTime, Utc};
use routing::ShardId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::InitialShards;

/// Metadata of one index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    /// Shard number -> allocation ids of copies known to hold current data
    #[serde(default)]
    pub in_sync_allocation_ids: BTreeMap<u32, BTreeSet<String>>,
    /// Per-index override of `allocation.initial_shards`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_shards: Option<InitialShards>,
    pub created_at: DateTime<Utc>,
}

impl IndexMetadata {
    pub fn new(name: impl Into<String>, number_of_shards: u32, number_of_replicas: u32) -> Self {
        Self {
            name: name.into(),
            number_of_shards,
            number_of_replicas,
            in_sync_allocation_ids: BTreeMap::new(),
            initial_shards: None,
            created_at: Utc::now(),
        }
    }

    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> + '_ {
        (0..self.number_of_shards).map(move |id| ShardId::new(self.name.clone(), id))
    }

    /// In-sync ids of one shard; empty for indices that never started a primary
    pub fn in_sync_ids(&self, shard: u32) -> BTreeSet<String> {
        self.in_sync_allocation_ids.get(&shard).cloned().unwrap_or_default()
    }

    /// Whether the shard tracks allocation ids (otherwise legacy versions apply)
    pub fn tracks_allocation_ids(&self, shard: u32) -> bool {
        self.in_sync_allocation_ids
            .get(&shard)
            .is_some_and(|ids| !ids.is_empty())
    }

    pub fn is_in_sync(&self, shard: u32, allocation_id: &str) -> bool {
        self.in_sync_allocation_ids
            .get(&shard)
            .is_some_and(|ids| ids.contains(allocation_id))
    }
}

/// Metadata of every index in the cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Incremented on every change
    pub version: u64,
    #[serde(default)]
    indices: BTreeMap<String, IndexMetadata>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.indices.get(name)
    }

    pub fn index_mut(&mut self, name: &str) -> Option<&mut IndexMetadata> {
        self.indices.get_mut(name)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    pub fn indices(&self) -> impl Iterator<Item = &IndexMetadata> {
        self.indices.values()
    }

    /// Insert or replace an index
    pub fn put(&mut self, index: IndexMetadata) {
        self.indices.insert(index.name.clone(), index);
        self.version += 1;
    }

    pub fn remove(&mut self, name: &str) -> Option<IndexMetadata> {
        let removed = self.indices.remove(name);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }
}
