//! Shard store fetch cache
//!
//! Caches what each node reported about its on-disk copy of a shard. The
//! allocator only reads this cache; reading an entry that was never
//! requested queues a fetch request for the external fetch collaborator,
//! which answers through `on_fetch_complete`.

use std::collections::{BTreeMap, HashMap};

use parking_lot::{Mutex, RwLock};
use routing::{NodeId, ShardId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metadata::DiscoveryNodes;

/// Legacy version reported by a node without a usable copy
pub const NO_VERSION: i64 = -1;

/// What one node holds on disk for one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeShardState {
    pub node_id: NodeId,
    /// Version of the copy for indices that predate allocation ids
    #[serde(default = "no_version")]
    pub legacy_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<String>,
    /// Whether the copy last served as primary
    #[serde(default)]
    pub primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_exception: Option<String>,
}

fn no_version() -> i64 {
    NO_VERSION
}

impl NodeShardState {
    /// Node reports no copy at all
    pub fn empty(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            legacy_version: NO_VERSION,
            allocation_id: None,
            primary: false,
            store_exception: None,
        }
    }

    pub fn with_allocation_id(node_id: impl Into<NodeId>, allocation_id: impl Into<String>, primary: bool) -> Self {
        Self {
            allocation_id: Some(allocation_id.into()),
            primary,
            ..Self::empty(node_id)
        }
    }

    pub fn with_legacy_version(node_id: impl Into<NodeId>, legacy_version: i64, primary: bool) -> Self {
        Self {
            legacy_version,
            primary,
            ..Self::empty(node_id)
        }
    }

    /// Node has a copy but failed to open it
    pub fn failed(node_id: impl Into<NodeId>, error: impl Into<String>) -> Self {
        Self {
            store_exception: Some(error.into()),
            ..Self::empty(node_id)
        }
    }

    /// Node reported anything about a copy, usable or not
    pub fn found(&self) -> bool {
        self.store_exception.is_some() || self.allocation_id.is_some() || self.legacy_version != NO_VERSION
    }

    /// Node holds a copy that can be opened
    pub fn has_data(&self) -> bool {
        self.store_exception.is_none() && (self.allocation_id.is_some() || self.legacy_version != NO_VERSION)
    }
}

/// Result of reading the cache for one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    /// Request queued or in flight; retry on a later pass
    Pending,
    /// One entry per live node, ordered by node id
    Complete(Vec<NodeShardState>),
}

#[derive(Debug, Clone)]
enum FetchState {
    Pending,
    Complete(BTreeMap<NodeId, NodeShardState>),
}

/// Per-shard cache of node store reports
#[derive(Debug, Default)]
pub struct ShardStoreCache {
    entries: RwLock<HashMap<ShardId, FetchState>>,
    requests: Mutex<Vec<ShardId>>,
}

impl ShardStoreCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the cached reports for `shard_id` restricted to `live_nodes`.
    ///
    /// An unrequested entry, or a complete entry missing a live node,
    /// becomes pending and a fetch request is queued.
    pub fn fetch(&self, shard_id: &ShardId, live_nodes: &DiscoveryNodes) -> FetchResult {
        {
            let entries = self.entries.read();
            match entries.get(shard_id) {
                Some(FetchState::Pending) => return FetchResult::Pending,
                Some(FetchState::Complete(states)) if live_nodes.ids().all(|id| states.contains_key(id)) => {
                    let states = states
                        .values()
                        .filter(|s| live_nodes.contains(&s.node_id))
                        .cloned()
                        .collect();
                    return FetchResult::Complete(states);
                }
                _ => {}
            }
        }

        self.entries.write().insert(shard_id.clone(), FetchState::Pending);
        let mut requests = self.requests.lock();
        if !requests.contains(shard_id) {
            debug!("Queued shard store fetch for {}", shard_id);
            requests.push(shard_id.clone());
        }
        FetchResult::Pending
    }

    /// Cached reports without queueing a request
    pub fn peek(&self, shard_id: &ShardId) -> Option<Vec<NodeShardState>> {
        match self.entries.read().get(shard_id) {
            Some(FetchState::Complete(states)) => Some(states.values().cloned().collect()),
            _ => None,
        }
    }

    /// Store the reports of a finished fetch, replacing earlier ones
    pub fn on_fetch_complete(&self, shard_id: &ShardId, states: Vec<NodeShardState>) {
        let states: BTreeMap<NodeId, NodeShardState> =
            states.into_iter().map(|s| (s.node_id.clone(), s)).collect();
        debug!("Shard store fetch for {} completed with {} node reports", shard_id, states.len());
        self.entries.write().insert(shard_id.clone(), FetchState::Complete(states));
        self.requests.lock().retain(|id| id != shard_id);
    }

    /// Forget everything known about `shard_id`
    pub fn clear(&self, shard_id: &ShardId) {
        self.entries.write().remove(shard_id);
        self.requests.lock().retain(|id| id != shard_id);
    }

    /// Drop entries of indices that no longer exist
    pub fn retain_indices<F>(&self, keep: F)
    where
        F: Fn(&str) -> bool,
    {
        self.entries.write().retain(|shard_id, _| keep(&shard_id.index));
        self.requests.lock().retain(|shard_id| keep(&shard_id.index));
    }

    /// Take the queued fetch requests
    pub fn drain_requests(&self) -> Vec<ShardId> {
        std::mem::take(&mut *self.requests.lock())
    }
}
