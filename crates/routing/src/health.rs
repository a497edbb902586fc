//! Cluster health derivation
//!
//! A pure read of a routing table: RED if any primary is unassigned, YELLOW if
//! any replica is unassigned, GREEN otherwise.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::table::{IndexRoutingTable, RoutingTable};

/// Health status, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealthStatus {
    Green,
    Yellow,
    Red,
}

impl std::fmt::Display for ClusterHealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterHealthStatus::Green => write!(f, "green"),
            ClusterHealthStatus::Yellow => write!(f, "yellow"),
            ClusterHealthStatus::Red => write!(f, "red"),
        }
    }
}

/// Shard counters of one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHealth {
    pub status: ClusterHealthStatus,
    pub active_primary_shards: usize,
    pub active_shards: usize,
    pub relocating_shards: usize,
    pub initializing_shards: usize,
    pub unassigned_shards: usize,
}

impl IndexHealth {
    pub fn from_index(index: &IndexRoutingTable) -> Self {
        let mut health = Self {
            status: ClusterHealthStatus::Green,
            active_primary_shards: 0,
            active_shards: 0,
            relocating_shards: 0,
            initializing_shards: 0,
            unassigned_shards: 0,
        };
        for shard in index.all_shards() {
            if shard.active() {
                health.active_shards += 1;
                if shard.primary {
                    health.active_primary_shards += 1;
                }
            }
            if shard.relocating() {
                health.relocating_shards += 1;
            }
            if shard.initializing() {
                health.initializing_shards += 1;
            }
            if shard.unassigned() {
                health.unassigned_shards += 1;
                let status = if shard.primary {
                    ClusterHealthStatus::Red
                } else {
                    ClusterHealthStatus::Yellow
                };
                health.status = health.status.max(status);
            }
        }
        health
    }
}

/// Health of the whole routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub status: ClusterHealthStatus,
    pub routing_version: u64,
    pub active_primary_shards: usize,
    pub active_shards: usize,
    pub relocating_shards: usize,
    pub initializing_shards: usize,
    pub unassigned_shards: usize,
    pub indices: BTreeMap<String, IndexHealth>,
}

impl ClusterHealth {
    pub fn from_routing_table(table: &RoutingTable) -> Self {
        let mut health = Self {
            status: ClusterHealthStatus::Green,
            routing_version: table.version,
            active_primary_shards: 0,
            active_shards: 0,
            relocating_shards: 0,
            initializing_shards: 0,
            unassigned_shards: 0,
            indices: BTreeMap::new(),
        };
        for index in table.indices() {
            let index_health = IndexHealth::from_index(index);
            health.status = health.status.max(index_health.status);
            health.active_primary_shards += index_health.active_primary_shards;
            health.active_shards += index_health.active_shards;
            health.relocating_shards += index_health.relocating_shards;
            health.initializing_shards += index_health.initializing_shards;
            health.unassigned_shards += index_health.unassigned_shards;
            health.indices.insert(index.index.clone(), index_health);
        }
        health
    }
}
