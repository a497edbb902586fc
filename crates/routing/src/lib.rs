//! Shard routing model
//!
//! Provides the data model shared by the allocation engine:
//! - Shard identity and shard copies with their state transitions
//! - The immutable, versioned routing table and its builder
//! - The mutable per-pass `RoutingNodes` working view
//! - Allocation decision values and cluster health derivation

pub mod decision;
pub mod health;
pub mod nodes;
pub mod shard;
pub mod table;

// Re-export commonly used types
pub use decision::{Decision, DecisionKind, Decisions};
pub use health::{ClusterHealth, ClusterHealthStatus, IndexHealth};
pub use nodes::{CopyId, RoutingNode, RoutingNodes};
pub use shard::{
    AllocationId, AllocationStatus, NodeId, RecoverySource, ShardId, ShardRouting,
    ShardRoutingState, UnassignedInfo, UnassignedReason,
};
pub use table::{
    IndexRoutingTable, IndexShardRoutingTable, RoutingError, RoutingTable, RoutingTableBuilder,
};
