// test_cluster.rs

use allocator::allocation::RoutingAllocation;
use allocator::config::AllocationSettings;
use allocator::decider::AllocationDeciders;
use allocator::scheduler::ShardsAllocator;
use allocator::{
    AllocationCommand, AllocationService, ClusterState, DiscoveryNode, FailedShard, NodeShardState,
    RerouteOptions, RoutingAllocationResult, ShardStoreCache,
};
use routing::{ClusterHealth, RoutingError, RoutingTable, ShardId, ShardRouting};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Leaves every remaining copy unassigned
#[derive(Debug)]
pub struct NoopAllocator;

impl ShardsAllocator for NoopAllocator {
    fn allocate(&self, _allocation: &mut RoutingAllocation<'_>, _deciders: &AllocationDeciders) -> Result<(), RoutingError> {
        Ok(())
    }
}

pub fn node(id: &str, host: &str) -> DiscoveryNode {
    DiscoveryNode::new(id, host, format!("addr-{}", host))
}

/// Drives an `AllocationService` the way the coordinator would, one
/// committed state at a time
pub struct TestCluster {
    pub state: ClusterState,
    pub service: AllocationService,
    pub cache: Arc<ShardStoreCache>,
    /// shard -> node -> (allocation id, served as primary) of copies that reached started
    pub disk: HashMap<ShardId, BTreeMap<String, (String, bool)>>,
}

impl TestCluster {
    pub fn new(settings: AllocationSettings) -> Self {
        let cache = Arc::new(ShardStoreCache::new());
        let service = AllocationService::new(&settings, cache.clone());
        Self {
            state: ClusterState::new("test"),
            service,
            cache,
            disk: HashMap::new(),
        }
    }

    /// Same cluster state, scheduled by a service that never places copies
    pub fn without_placement(settings: &AllocationSettings, state: ClusterState) -> Self {
        let cache = Arc::new(ShardStoreCache::new());
        let service = AllocationService::with_allocators(
            settings,
            AllocationDeciders::from_settings(settings),
            Box::new(NoopAllocator),
            cache.clone(),
        );
        Self {
            state,
            service,
            cache,
            disk: HashMap::new(),
        }
    }

    pub fn with_nodes(mut self, nodes: &[(&str, &str)]) -> Self {
        for (id, host) in nodes {
            self.state = self.state.with_node_joined(node(id, host));
        }
        self
    }

    pub fn with_index(mut self, name: &str, shards: u32, replicas: u32) -> Self {
        self.state = self.state.with_index_created(name, shards, replicas).unwrap();
        self
    }

    fn commit(&mut self, result: RoutingAllocationResult) -> RoutingAllocationResult {
        self.state = result.state.clone();
        assert_invariants(&self.state.routing_table);
        self.record_started();
        result
    }

    fn record_started(&mut self) {
        for shard in self.state.routing_table.all_shards().filter(|s| s.active()) {
            let (Some(node), Some(id)) = (&shard.current_node_id, &shard.allocation_id) else {
                continue;
            };
            self.disk
                .entry(shard.shard_id.clone())
                .or_default()
                .insert(node.clone(), (id.id.clone(), shard.primary));
        }
    }

    pub fn reroute(&mut self) -> RoutingAllocationResult {
        let result = self.service.reroute(&self.state, "test").unwrap();
        self.commit(result)
    }

    pub fn reroute_with_options(&mut self, options: &RerouteOptions) -> RoutingAllocationResult {
        let result = self.service.reroute_with_options(&self.state, options, "test").unwrap();
        self.commit(result)
    }

    pub fn join(&mut self, id: &str, host: &str) -> RoutingAllocationResult {
        self.state = self.state.with_node_joined(node(id, host));
        self.reroute()
    }

    pub fn leave(&mut self, id: &str) -> RoutingAllocationResult {
        self.state = self.state.with_node_left(id).unwrap();
        self.reroute()
    }

    pub fn execute(&mut self, commands: &[AllocationCommand]) -> Result<RoutingAllocationResult, allocator::AllocationError> {
        let result = self
            .service
            .execute_commands(&self.state, commands, &RerouteOptions::default())?;
        Ok(self.commit(result))
    }

    pub fn start(&mut self, shards: &[ShardRouting]) -> RoutingAllocationResult {
        let result = self.service.apply_started_shards(&self.state, shards).unwrap();
        self.commit(result)
    }

    /// Start whatever is initializing, including relocation targets
    pub fn start_initializing(&mut self) -> RoutingAllocationResult {
        let initializing = initializing_copies(&self.state.routing_table);
        self.start(&initializing)
    }

    /// Keep starting copies until nothing initializes any more
    pub fn start_all(&mut self) {
        for _ in 0..16 {
            if initializing_copies(&self.state.routing_table).is_empty() {
                return;
            }
            self.start_initializing();
        }
        panic!("copies keep initializing");
    }

    pub fn fail(&mut self, shards: &[ShardRouting]) -> RoutingAllocationResult {
        let failed: Vec<FailedShard> = shards
            .iter()
            .map(|s| FailedShard::new(s.clone(), "test failure"))
            .collect();
        let result = self.service.apply_failed_shards(&self.state, &failed).unwrap();
        self.commit(result)
    }

    /// Answer pending store fetches from what started copies left on disk
    pub fn answer_fetches(&mut self) -> usize {
        let requests = self.cache.drain_requests();
        for shard_id in &requests {
            let on_disk = self.disk.get(shard_id);
            let states = self
                .state
                .nodes
                .ids()
                .map(|node_id| match on_disk.and_then(|d| d.get(node_id)) {
                    Some((id, primary)) => NodeShardState::with_allocation_id(node_id.clone(), id.clone(), *primary),
                    None => NodeShardState::empty(node_id.clone()),
                })
                .collect();
            self.cache.on_fetch_complete(shard_id, states);
        }
        requests.len()
    }

    pub fn copies(&self, index: &str, shard: u32) -> Vec<ShardRouting> {
        self.state
            .routing_table
            .shard_routing_table(&ShardId::new(index, shard))
            .unwrap()
            .shards
            .clone()
    }

    pub fn primary(&self, index: &str, shard: u32) -> ShardRouting {
        self.copies(index, shard).into_iter().find(|s| s.primary).unwrap()
    }

    pub fn replicas(&self, index: &str, shard: u32) -> Vec<ShardRouting> {
        self.copies(index, shard).into_iter().filter(|s| !s.primary).collect()
    }

    pub fn health(&self) -> ClusterHealth {
        ClusterHealth::from_routing_table(&self.state.routing_table)
    }

    pub fn in_sync(&self, index: &str, shard: u32) -> Vec<String> {
        self.state
            .metadata
            .index(index)
            .unwrap()
            .in_sync_ids(shard)
            .into_iter()
            .collect()
    }
}

/// Initializing copies as the hosting nodes would report them
pub fn initializing_copies(table: &RoutingTable) -> Vec<ShardRouting> {
    table
        .all_shards()
        .filter_map(|s| {
            if s.initializing() {
                Some(s.clone())
            } else {
                s.build_target_relocating_shard()
            }
        })
        .collect()
}

/// Every assigned copy, relocation targets included
pub fn assigned_copies(table: &RoutingTable) -> Vec<ShardRouting> {
    let mut copies: Vec<ShardRouting> = table.all_shards().filter(|s| s.assigned_to_node()).cloned().collect();
    copies.extend(table.all_shards().filter_map(ShardRouting::build_target_relocating_shard));
    copies
}

/// At most one copy of a shard per node, at most one assigned primary per shard
pub fn assert_invariants(table: &RoutingTable) {
    let mut placed: HashSet<(ShardId, String)> = HashSet::new();
    for copy in assigned_copies(table) {
        let node = copy.current_node_id.clone().unwrap();
        assert!(
            placed.insert((copy.shard_id.clone(), node.clone())),
            "two copies of {} on node {}",
            copy.shard_id,
            node
        );
    }
    for index in table.indices() {
        for shard in index.all_shards() {
            let group = table.shard_routing_table(&shard.shard_id).unwrap();
            let primaries = group.shards.iter().filter(|s| s.primary && !s.unassigned()).count();
            assert!(primaries <= 1, "{} has {} assigned primaries", shard.shard_id, primaries);
        }
    }
}
