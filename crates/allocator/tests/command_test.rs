mod common;

use allocator::config::AllocationSettings;
use allocator::metadata::{IndexMetadata, Metadata};
use allocator::{AllocationCommand, AllocationError, ClusterState, NodeShardState};
use common::test_cluster::TestCluster;
use routing::{DecisionKind, RecoverySource, ShardId, UnassignedReason};

fn started_cluster(settings: AllocationSettings) -> TestCluster {
    let mut cluster = TestCluster::new(settings)
        .with_nodes(&[("node1", "h1"), ("node2", "h2"), ("node3", "h3")])
        .with_index("test", 1, 1);
    cluster.reroute();
    cluster.start_all();
    cluster
}

fn move_command(from_node: &str, to_node: &str) -> AllocationCommand {
    AllocationCommand::Move {
        index: "test".to_string(),
        shard: 0,
        from_node: from_node.to_string(),
        to_node: to_node.to_string(),
    }
}

#[test]
fn test_move_onto_node_with_copy_is_rejected() {
    let mut cluster = started_cluster(AllocationSettings::default());
    let before = cluster.state.version;
    let primary_node = cluster.primary("test", 0).current_node_id.unwrap();
    let replica_node = cluster.replicas("test", 0)[0].current_node_id.clone().unwrap();

    match cluster.execute(&[move_command(&primary_node, &replica_node)]) {
        Err(AllocationError::CommandRejected { decisions, .. }) => {
            assert_eq!(decisions.kind(), DecisionKind::No);
            assert_eq!(decisions.representative().label, "same_shard");
        }
        other => panic!("unexpected result: {:?}", other.map(|r| r.changed)),
    }
    assert_eq!(cluster.state.version, before);
}

#[test]
fn test_invalid_commands_are_user_errors() {
    let mut cluster = started_cluster(AllocationSettings::default());
    let primary_node = cluster.primary("test", 0).current_node_id.unwrap();

    let err = cluster.execute(&[move_command(&primary_node, "ghost")]).unwrap_err();
    assert!(matches!(err, AllocationError::InvalidCommand(_)));
    let err = cluster.execute(&[move_command("node9", "node3")]).unwrap_err();
    assert!(err.is_user_error());

    // A batch fails as a whole
    let err = cluster
        .execute(&[move_command(&primary_node, "node3"), move_command("node9", "node3")])
        .unwrap_err();
    assert!(err.is_user_error());
    assert!(cluster.primary("test", 0).started());
}

#[test]
fn test_throttled_move_is_accepted() {
    let settings = AllocationSettings {
        node_concurrent_incoming_recoveries: 0,
        ..Default::default()
    };
    let mut cluster = TestCluster::new(settings)
        .with_nodes(&[("node1", "h1"), ("node2", "h2")])
        .with_index("test", 1, 0);
    cluster.reroute();
    cluster.start_all();

    let result = cluster.execute(&[move_command("node1", "node2")]).unwrap();
    assert_eq!(result.explanations.len(), 1);
    assert_eq!(result.explanations[0].decisions.kind(), DecisionKind::Throttle);
    let primary = cluster.primary("test", 0);
    assert!(primary.relocating());
    assert_eq!(primary.relocating_node_id.as_deref(), Some("node2"));
}

#[test]
fn test_cancel_replica_reallocates_elsewhere() {
    let mut cluster = started_cluster(AllocationSettings::default());
    let replica = cluster.replicas("test", 0)[0].clone();
    let node = replica.current_node_id.clone().unwrap();

    cluster
        .execute(&[AllocationCommand::Cancel {
            index: "test".to_string(),
            shard: 0,
            node: node.clone(),
            allow_primary: false,
        }])
        .unwrap();

    let replica = &cluster.replicas("test", 0)[0];
    assert!(replica.initializing());
    assert_ne!(replica.current_node_id.as_deref(), Some(node.as_str()));
    assert_eq!(replica.unassigned_info.as_ref().unwrap().reason, UnassignedReason::RerouteCancelled);
}

#[test]
fn test_allocate_stale_primary_resets_in_sync_ids() {
    let mut metadata = Metadata::new();
    let mut index = IndexMetadata::new("test", 1, 0);
    index.in_sync_allocation_ids.insert(0, ["lost".to_string()].into_iter().collect());
    metadata.put(index);
    let mut cluster = TestCluster::new(AllocationSettings::default());
    cluster.state = ClusterState::recovered("test", metadata).unwrap();
    let mut cluster = cluster.with_nodes(&[("node1", "h1"), ("node2", "h2")]);
    let shard_id = ShardId::new("test", 0);
    cluster.cache.on_fetch_complete(
        &shard_id,
        vec![
            NodeShardState::with_allocation_id("node1", "old", true),
            NodeShardState::empty("node2"),
        ],
    );

    cluster.reroute();
    assert!(cluster.primary("test", 0).unassigned());

    let stale = |node: &str, accept_data_loss: bool| AllocationCommand::AllocateStalePrimary {
        index: "test".to_string(),
        shard: 0,
        node: node.to_string(),
        accept_data_loss,
    };
    assert!(cluster.execute(&[stale("node1", false)]).is_err());
    // No data on node2
    assert!(matches!(
        cluster.execute(&[stale("node2", true)]),
        Err(AllocationError::InvalidCommand(_))
    ));

    cluster.execute(&[stale("node1", true)]).unwrap();
    let primary = cluster.primary("test", 0);
    assert!(primary.initializing());
    assert_eq!(primary.allocation_id.as_ref().unwrap().id, "old");
    assert_eq!(cluster.in_sync("test", 0), vec!["old".to_string()]);

    cluster.start_all();
    assert_eq!(cluster.in_sync("test", 0), vec!["old".to_string()]);
}

#[test]
fn test_allocate_empty_primary_discards_history() {
    let mut metadata = Metadata::new();
    let mut index = IndexMetadata::new("test", 1, 0);
    index.in_sync_allocation_ids.insert(0, ["lost".to_string()].into_iter().collect());
    metadata.put(index);
    let mut cluster = TestCluster::new(AllocationSettings::default());
    cluster.state = ClusterState::recovered("test", metadata).unwrap();
    let mut cluster = cluster.with_nodes(&[("node1", "h1")]);

    cluster.reroute();
    assert!(cluster.primary("test", 0).unassigned());

    cluster
        .execute(&[AllocationCommand::AllocateEmptyPrimary {
            index: "test".to_string(),
            shard: 0,
            node: "node1".to_string(),
            accept_data_loss: true,
        }])
        .unwrap();
    let primary = cluster.primary("test", 0);
    assert!(primary.initializing());
    assert_eq!(primary.recovery_source, Some(RecoverySource::EmptyStore));
    assert!(cluster.in_sync("test", 0).is_empty());

    cluster.start_all();
    let allocation_id = cluster.primary("test", 0).allocation_id.unwrap().id;
    assert_eq!(cluster.in_sync("test", 0), vec![allocation_id]);
}
