mod common;

use allocator::config::AllocationSettings;
use allocator::{AllocationCommand, ClusterState, NodeShardState};
use common::test_cluster::TestCluster;
use routing::{AllocationStatus, ClusterHealthStatus, RecoverySource, ShardId, UnassignedReason};

fn started_cluster(nodes: &[(&str, &str)], replicas: u32) -> TestCluster {
    let mut cluster = TestCluster::new(AllocationSettings::default())
        .with_nodes(nodes)
        .with_index("test", 1, replicas);
    cluster.reroute();
    cluster.start_all();
    cluster
}

fn move_primary(cluster: &mut TestCluster, to_node: &str) {
    let from_node = cluster.primary("test", 0).current_node_id.unwrap();
    cluster
        .execute(&[AllocationCommand::Move {
            index: "test".to_string(),
            shard: 0,
            from_node,
            to_node: to_node.to_string(),
        }])
        .unwrap();
}

#[test]
fn test_failed_relocation_target_reverts_source() {
    let mut cluster = started_cluster(&[("node1", "h1"), ("node2", "h2"), ("node3", "h3")], 1);
    let primary = cluster.primary("test", 0);
    let replica = cluster.replicas("test", 0)[0].clone();
    assert_eq!(primary.current_node_id.as_deref(), Some("node1"));

    move_primary(&mut cluster, "node3");
    let source = cluster.primary("test", 0);
    assert!(source.relocating());
    assert_eq!(cluster.health().relocating_shards, 1);
    let target = source.build_target_relocating_shard().unwrap();

    cluster.fail(&[target]);
    let primary_after = cluster.primary("test", 0);
    assert!(primary_after.started());
    assert_eq!(primary_after.current_node_id.as_deref(), Some("node1"));
    assert_eq!(primary_after.allocation_id.as_ref().unwrap().id, primary.allocation_id.unwrap().id);
    assert!(primary_after.allocation_id.unwrap().relocation_id.is_none());

    // The replica keeps its role
    let replica_after = &cluster.replicas("test", 0)[0];
    assert!(replica_after.started());
    assert_eq!(replica_after.allocation_id, replica.allocation_id);
    assert_eq!(cluster.health().status, ClusterHealthStatus::Green);
}

#[test]
fn test_failed_relocation_source_keeps_serving() {
    let mut cluster = started_cluster(&[("node1", "h1"), ("node2", "h2")], 0);
    move_primary(&mut cluster, "node2");
    let source = cluster.primary("test", 0);

    cluster.fail(&[source]);
    let primary = cluster.primary("test", 0);
    assert!(primary.started());
    assert_eq!(primary.current_node_id.as_deref(), Some("node1"));
    assert!(primary.relocating_node_id.is_none());
}

#[test]
fn test_completed_relocation_moves_in_sync_id() {
    let mut cluster = started_cluster(&[("node1", "h1"), ("node2", "h2"), ("node3", "h3")], 1);
    let source_id = cluster.primary("test", 0).allocation_id.unwrap().id;
    let replica_id = cluster.replicas("test", 0)[0].allocation_id.clone().unwrap().id;

    move_primary(&mut cluster, "node3");
    let target_id = cluster
        .primary("test", 0)
        .build_target_relocating_shard()
        .unwrap()
        .allocation_id
        .unwrap()
        .id;
    cluster.start_initializing();

    let primary = cluster.primary("test", 0);
    assert!(primary.started());
    assert_eq!(primary.current_node_id.as_deref(), Some("node3"));
    assert_eq!(cluster.copies("test", 0).len(), 2);

    let in_sync = cluster.in_sync("test", 0);
    assert!(in_sync.contains(&target_id));
    assert!(in_sync.contains(&replica_id));
    assert!(!in_sync.contains(&source_id));
}

#[test]
fn test_primary_failure_promotes_started_replica_and_resets_recovering_one() {
    let settings = AllocationSettings::default();
    let mut cluster = TestCluster::new(settings.clone())
        .with_nodes(&[("node1", "h1"), ("node2", "h2"), ("node3", "h3")])
        .with_index("test", 1, 2);
    cluster.reroute();
    cluster.start_initializing();
    let replicas = cluster.replicas("test", 0);
    assert!(replicas.iter().all(|r| r.initializing()));
    cluster.start(&replicas[..1]);

    let primary = cluster.primary("test", 0);
    let started = replicas[0].clone();
    let recovering = replicas[1].clone();

    let mut frozen = TestCluster::without_placement(&settings, cluster.state.clone());
    let result = frozen.fail(&[primary.clone()]);

    let new_primary = frozen.primary("test", 0);
    assert!(new_primary.started());
    assert_eq!(new_primary.current_node_id, started.current_node_id);
    assert_eq!(new_primary.allocation_id, started.allocation_id);

    let replicas = frozen.replicas("test", 0);
    assert_eq!(replicas.len(), 2);
    assert!(replicas.iter().all(|r| r.unassigned()));
    let reasons: Vec<UnassignedReason> = replicas
        .iter()
        .map(|r| r.unassigned_info.as_ref().unwrap().reason)
        .collect();
    assert!(reasons.contains(&UnassignedReason::PrimaryFailed));
    assert!(reasons.contains(&UnassignedReason::AllocationFailed));
    assert!(replicas.iter().all(|r| r.allocation_id != recovering.allocation_id));
    assert_eq!(result.health.status, ClusterHealthStatus::Yellow);

    // The promoted copy stays in sync
    let in_sync = frozen.in_sync("test", 0);
    assert!(in_sync.contains(&started.allocation_id.unwrap().id));
}

#[test]
fn test_batched_failures_see_earlier_promotion() {
    let mut cluster = started_cluster(&[("node1", "h1"), ("node2", "h2")], 1);
    let primary = cluster.primary("test", 0);
    let replica = cluster.replicas("test", 0)[0].clone();

    // The replica is reported with its old role; it was promoted by the first failure
    let result = cluster.fail(&[primary.clone(), replica.clone()]);
    assert_eq!(result.health.status, ClusterHealthStatus::Red);
    let new_primary = cluster.primary("test", 0);
    assert!(new_primary.unassigned());
    let info = new_primary.unassigned_info.as_ref().unwrap();
    assert_eq!(info.reason, UnassignedReason::AllocationFailed);
    assert_eq!(info.last_allocation_status, AllocationStatus::FetchingShardData);
    assert_eq!(new_primary.recovery_source, Some(RecoverySource::ExistingStore));

    // Both stores are still on disk; the previous primary's copy is preferred
    assert_eq!(cluster.answer_fetches(), 1);
    cluster.reroute();
    let recovered = cluster.primary("test", 0);
    assert!(recovered.initializing());
    assert_eq!(recovered.current_node_id, primary.current_node_id);
    assert_eq!(recovered.allocation_id.unwrap().id, primary.allocation_id.unwrap().id);
}

#[test]
fn test_departed_relocation_source_fails_primary() {
    let mut cluster = started_cluster(&[("node1", "h1"), ("node2", "h2"), ("node3", "h3")], 0);
    move_primary(&mut cluster, "node2");

    let result = cluster.leave("node1");
    let primary = cluster.primary("test", 0);
    assert!(primary.unassigned());
    assert!(primary.relocating_node_id.is_none());
    let info = primary.unassigned_info.as_ref().unwrap();
    assert_eq!(info.reason, UnassignedReason::NodeLeft);
    assert_eq!(info.last_allocation_status, AllocationStatus::FetchingShardData);
    assert_eq!(result.health.status, ClusterHealthStatus::Red);
    assert_eq!(result.health.initializing_shards, 0);

    // The only valid copy left with node1
    assert_eq!(cluster.answer_fetches(), 1);
    let result = cluster.reroute();
    let info = cluster.primary("test", 0).unassigned_info.unwrap();
    assert_eq!(info.last_allocation_status, AllocationStatus::NoValidShardCopy);
    assert_eq!(result.ignored.len(), 1);

    // It comes back with its data
    cluster.join("node1", "h1");
    assert_eq!(cluster.answer_fetches(), 1);
    cluster.reroute();
    let primary = cluster.primary("test", 0);
    assert!(primary.initializing());
    assert_eq!(primary.current_node_id.as_deref(), Some("node1"));
}

#[test]
fn test_lone_primary_failure_recovers_from_own_store() {
    let mut cluster = started_cluster(&[("node1", "h1")], 0);
    let primary = cluster.primary("test", 0);

    cluster.fail(&[primary.clone()]);
    let failed = cluster.primary("test", 0);
    assert!(failed.unassigned());
    assert_eq!(failed.unassigned_info.as_ref().unwrap().failed_allocations, 1);

    cluster.answer_fetches();
    cluster.reroute();
    let recovered = cluster.primary("test", 0);
    assert!(recovered.initializing());
    assert_eq!(recovered.allocation_id.unwrap().id, primary.allocation_id.unwrap().id);
    assert_eq!(recovered.unassigned_info.unwrap().failed_allocations, 1);
}

#[test]
fn test_replaced_replica_is_not_promoted_after_restart() {
    let mut cluster = started_cluster(&[("node1", "h1"), ("node2", "h2"), ("node3", "h3")], 1);
    let primary_id = cluster.primary("test", 0).allocation_id.unwrap().id;
    let old_replica = cluster.replicas("test", 0)[0].clone();
    let old_node = old_replica.current_node_id.clone().unwrap();
    let old_id = old_replica.allocation_id.unwrap().id;

    cluster.leave(&old_node);
    cluster.start_all();
    let new_replica = cluster.replicas("test", 0)[0].clone();
    assert!(new_replica.started());
    let new_id = new_replica.allocation_id.unwrap().id;

    let mut expected = vec![primary_id, new_id];
    expected.sort();
    assert_eq!(cluster.in_sync("test", 0), expected);

    // Full restart where only the departed replica's node comes back
    let mut restarted = TestCluster::new(AllocationSettings::default());
    restarted.state = ClusterState::recovered("test", cluster.state.metadata.clone()).unwrap();
    let mut restarted = restarted.with_nodes(&[(old_node.as_str(), "h2")]);
    restarted.cache.on_fetch_complete(
        &ShardId::new("test", 0),
        vec![NodeShardState::with_allocation_id(old_node.as_str(), old_id.as_str(), false)],
    );

    let result = restarted.reroute();
    let primary = restarted.primary("test", 0);
    assert!(primary.unassigned());
    assert_eq!(
        primary.unassigned_info.unwrap().last_allocation_status,
        AllocationStatus::NoValidShardCopy
    );
    assert_eq!(result.health.status, ClusterHealthStatus::Red);
}
