//! Allocation explain read model
//!
//! Projections of the committed routing table for operators. Nothing here is
//! stored; every call walks the table it is given.

use routing::{AllocationStatus, Decision, NodeId, RoutingError, RoutingTable, ShardId, ShardRouting, ShardRoutingState, UnassignedReason};
use serde::Serialize;

/// One copy as seen by an operator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardExplanation {
    pub shard_id: ShardId,
    pub primary: bool,
    pub state: ShardRoutingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relocating_node: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unassigned: Option<UnassignedExplanation>,
}

/// Why a copy is unassigned and what the last attempt decided
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnassignedExplanation {
    pub reason: UnassignedReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub failed_allocations: u32,
    pub last_allocation_status: AllocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_decision: Option<Decision>,
}

impl From<&ShardRouting> for ShardExplanation {
    fn from(shard: &ShardRouting) -> Self {
        let unassigned = if shard.unassigned() {
            shard.unassigned_info.as_ref().map(|info| UnassignedExplanation {
                reason: info.reason,
                message: info.message.clone(),
                failed_allocations: info.failed_allocations,
                last_allocation_status: info.last_allocation_status,
                last_decision: info.last_decision.clone(),
            })
        } else {
            None
        };
        Self {
            shard_id: shard.shard_id.clone(),
            primary: shard.primary,
            state: shard.state,
            node: shard.current_node_id.clone(),
            relocating_node: shard.relocating_node_id.clone(),
            allocation_id: shard.allocation_id.as_ref().map(|a| a.id.clone()),
            unassigned,
        }
    }
}

/// Every copy of every shard
pub fn explain(table: &RoutingTable) -> Vec<ShardExplanation> {
    table.all_shards().map(ShardExplanation::from).collect()
}

/// Copies of one shard, primary first
pub fn explain_shard(table: &RoutingTable, shard_id: &ShardId) -> Result<Vec<ShardExplanation>, RoutingError> {
    let group = table.shard_routing_table(shard_id)?;
    let mut copies: Vec<ShardExplanation> = group.shards.iter().map(ShardExplanation::from).collect();
    copies.sort_by_key(|c| !c.primary);
    Ok(copies)
}

/// Unassigned copies only
pub fn unassigned(table: &RoutingTable) -> Vec<ShardExplanation> {
    table
        .all_shards()
        .filter(|s| s.unassigned())
        .map(ShardExplanation::from)
        .collect()
}
