//! Allocator - shard allocation control plane
//!
//! Decides where every shard copy of every index lives and drives the
//! routing table from one consistent state to the next.
//!
//! # Features
//! - Pluggable allocation deciders folded into YES / THROTTLE / NO
//! - Primary recovery from existing on-disk copies (in-sync ids or legacy versions)
//! - Reroute passes for node changes, started and failed shards and explicit commands
//! - Persisted index metadata and routing version watches
//!
//! # Usage Example
//! ```ignore
//! use allocator::{AllocatorConfig, ClusterCoordinator};
//!
//! let coordinator = ClusterCoordinator::new(AllocatorConfig::default()).await?;
//! coordinator.node_joined(DiscoveryNode::new("node1", "host1", "10.0.0.1")).await?;
//! coordinator.create_index("logs", 3, 1).await?;
//! ```

pub mod allocation;
pub mod commands;
pub mod config;
pub mod decider;
pub mod error;
pub mod explain;
pub mod gateway;
pub mod metadata;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod watch;

// Re-export commonly used types
pub use commands::{AllocationCommand, CommandExplanation};
pub use config::{AllocationSettings, AllocatorConfig};
pub use error::AllocationError;
pub use gateway::{NodeShardState, ShardStoreCache};
pub use metadata::{ClusterState, DiscoveryNode};
pub use service::{AllocationService, FailedShard, RerouteOptions, RoutingAllocationResult};

use std::sync::Arc;

use routing::{ClusterHealth, RoutingError, ShardId, ShardRouting};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use explain::ShardExplanation;
use storage::{FileStorage, StorageError};
use watch::{RoutingTableWatcher, RoutingVersion};

/// Owner of the committed cluster state.
///
/// Every trigger runs one allocation pass under the write lock and commits
/// the result only if the pass succeeded.
pub struct ClusterCoordinator {
    config: AllocatorConfig,
    storage: FileStorage,
    state: Arc<RwLock<ClusterState>>,
    service: AllocationService,
    store_cache: Arc<ShardStoreCache>,
    watcher: RoutingTableWatcher,
}

impl ClusterCoordinator {
    /// Load persisted metadata (or start empty) and build the service
    pub async fn new(config: AllocatorConfig) -> Result<Self, StorageError> {
        let service = AllocationService::new(&config.allocation, Arc::new(ShardStoreCache::new()));
        Self::with_service(config, service).await
    }

    /// Same as `new`, allocating with a caller-built service
    pub async fn with_service(config: AllocatorConfig, service: AllocationService) -> Result<Self, StorageError> {
        let storage = FileStorage::new(&config.cluster.data_dir);
        let state = storage.load_or_create(&config.cluster.name).await?;
        let store_cache = service.store_cache().clone();

        let health = ClusterHealth::from_routing_table(&state.routing_table);
        let watcher = RoutingTableWatcher::new(RoutingVersion {
            state_version: state.version,
            routing_version: state.routing_table.version,
            status: health.status,
        });

        info!(
            "Coordinator initialized: cluster={}, data_dir={:?}, deciders={:?}",
            state.cluster_name,
            config.cluster.data_dir,
            service.deciders().names()
        );

        Ok(Self {
            config,
            storage,
            state: Arc::new(RwLock::new(state)),
            service,
            store_cache,
            watcher,
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn service(&self) -> &AllocationService {
        &self.service
    }

    pub fn routing_watcher(&self) -> &RoutingTableWatcher {
        &self.watcher
    }

    /// Snapshot of the committed state
    pub async fn state(&self) -> ClusterState {
        self.state.read().await.clone()
    }

    pub async fn health(&self) -> ClusterHealth {
        ClusterHealth::from_routing_table(&self.state.read().await.routing_table)
    }

    pub async fn explain(&self) -> Vec<ShardExplanation> {
        explain::explain(&self.state.read().await.routing_table)
    }

    pub async fn explain_shard(&self, shard_id: &ShardId) -> Result<Vec<ShardExplanation>, RoutingError> {
        explain::explain_shard(&self.state.read().await.routing_table, shard_id)
    }

    /// Shards whose store data must be fetched from the nodes
    pub fn pending_fetches(&self) -> Vec<ShardId> {
        self.store_cache.drain_requests()
    }

    /// Run `pass` against the committed state and commit its result
    async fn submit<F>(&self, reason: &str, pass: F) -> Result<RoutingAllocationResult, AllocationError>
    where
        F: FnOnce(&ClusterState, &AllocationService) -> Result<RoutingAllocationResult, AllocationError>,
    {
        let mut state = self.state.write().await;
        let result = match pass(&state, &self.service) {
            Ok(result) => result,
            Err(e) => {
                warn!("Cluster update [{}] failed, keeping state version {}: {}", reason, state.version, e);
                return Err(e);
            }
        };

        if result.changed || result.state.version != state.version {
            *state = result.state.clone();
            self.watcher.notify(state.version, &result.health);
            info!(
                "Committed cluster state version {} [{}]: health {}",
                state.version, reason, result.health.status
            );
        }
        Ok(result)
    }

    pub async fn node_joined(&self, node: DiscoveryNode) -> Result<RoutingAllocationResult, AllocationError> {
        let reason = format!("node_join [{}]", node.id);
        self.submit(&reason, |state, service| {
            let next = state.with_node_joined(node);
            service.reroute(&next, &reason)
        })
        .await
    }

    pub async fn node_left(&self, node_id: &str) -> Result<RoutingAllocationResult, AllocationError> {
        let reason = format!("node_left [{}]", node_id);
        self.submit(&reason, |state, service| {
            let next = state.with_node_left(node_id)?;
            service.reroute(&next, &reason)
        })
        .await
    }

    pub async fn create_index(
        &self,
        name: &str,
        number_of_shards: u32,
        number_of_replicas: u32,
    ) -> Result<RoutingAllocationResult, AllocationError> {
        let reason = format!("index_created [{}]", name);
        self.submit(&reason, |state, service| {
            let next = state.with_index_created(name, number_of_shards, number_of_replicas)?;
            service.reroute(&next, &reason)
        })
        .await
    }

    pub async fn restore_index(
        &self,
        name: &str,
        number_of_shards: u32,
        number_of_replicas: u32,
        repository: &str,
        snapshot: &str,
    ) -> Result<RoutingAllocationResult, AllocationError> {
        let reason = format!("index_restored [{}]", name);
        self.submit(&reason, |state, service| {
            let next = state.with_index_restored(name, number_of_shards, number_of_replicas, repository, snapshot)?;
            service.reroute(&next, &reason)
        })
        .await
    }

    pub async fn delete_index(&self, name: &str) -> Result<RoutingAllocationResult, AllocationError> {
        let reason = format!("index_deleted [{}]", name);
        let result = self
            .submit(&reason, |state, service| {
                let next = state.with_index_deleted(name)?;
                service.reroute(&next, &reason)
            })
            .await?;
        self.store_cache.retain_indices(|index| index != name);
        Ok(result)
    }

    pub async fn update_number_of_replicas(
        &self,
        name: &str,
        number_of_replicas: u32,
    ) -> Result<RoutingAllocationResult, AllocationError> {
        let reason = format!("update_replicas [{}] to {}", name, number_of_replicas);
        self.submit(&reason, |state, service| {
            let next = state.with_number_of_replicas(name, number_of_replicas)?;
            service.reroute(&next, &reason)
        })
        .await
    }

    pub async fn shards_started(&self, started: &[ShardRouting]) -> Result<RoutingAllocationResult, AllocationError> {
        self.submit("shards_started", |state, service| {
            service.apply_started_shards(state, started)
        })
        .await
    }

    pub async fn shards_failed(&self, failed: &[FailedShard]) -> Result<RoutingAllocationResult, AllocationError> {
        self.submit("shards_failed", |state, service| {
            service.apply_failed_shards(state, failed)
        })
        .await
    }

    pub async fn execute_commands(
        &self,
        commands: &[AllocationCommand],
        options: &RerouteOptions,
    ) -> Result<RoutingAllocationResult, AllocationError> {
        self.submit("commands", |state, service| {
            service.execute_commands(state, commands, options)
        })
        .await
    }

    pub async fn reroute(&self, options: &RerouteOptions, reason: &str) -> Result<RoutingAllocationResult, AllocationError> {
        self.submit(reason, |state, service| service.reroute_with_options(state, options, reason))
            .await
    }

    /// Store results for one shard arrived; run a pass to use them
    pub async fn shard_store_fetched(
        &self,
        shard_id: &ShardId,
        states: Vec<NodeShardState>,
    ) -> Result<RoutingAllocationResult, AllocationError> {
        self.store_cache.on_fetch_complete(shard_id, states);
        let reason = format!("shard_store_fetched [{}]", shard_id);
        self.submit(&reason, |state, service| service.reroute(state, &reason))
            .await
    }

    /// Save metadata
    pub async fn save(&self) -> Result<(), StorageError> {
        let state = self.state.read().await;
        self.storage.save(&state).await
    }

    /// Start periodic reroute task
    pub fn start_periodic_reroute(self: Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        use tokio::time::{interval, Duration};

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                if let Err(e) = self.reroute(&RerouteOptions::default(), "periodic").await {
                    error!("Periodic reroute failed: {}", e);
                }
            }
        })
    }

    /// Start periodic save task
    pub fn start_periodic_save(self: Arc<Self>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
        use tokio::time::{interval, Duration};

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(interval_secs.max(1)));
            loop {
                interval.tick().await;
                if let Err(e) = self.save().await {
                    error!("Failed to save metadata: {}", e);
                }
            }
        })
    }
}
