//! Explicit allocation commands
//!
//! Operator-issued moves, cancellations and manual allocations. Every
//! command is validated against the cluster first (user errors) and then
//! against the deciders; only a NO rejects a command.

use routing::{CopyId, DecisionKind, Decisions, RecoverySource, ShardId, ShardRouting, UnassignedInfo, UnassignedReason};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::allocation::RoutingAllocation;
use crate::decider::AllocationDeciders;
use crate::error::AllocationError;
use crate::service::fail_shard;

/// Allocation command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AllocationCommand {
    /// Relocate a started copy between nodes
    Move {
        index: String,
        shard: u32,
        from_node: String,
        to_node: String,
    },
    /// Cancel recovery or relocation of a copy, or fail a started replica
    Cancel {
        index: String,
        shard: u32,
        node: String,
        #[serde(default)]
        allow_primary: bool,
    },
    AllocateReplica {
        index: String,
        shard: u32,
        node: String,
    },
    /// Start an empty primary, discarding whatever data may exist
    AllocateEmptyPrimary {
        index: String,
        shard: u32,
        node: String,
        #[serde(default)]
        accept_data_loss: bool,
    },
    /// Promote the data found on a node to primary even if it is not in sync
    AllocateStalePrimary {
        index: String,
        shard: u32,
        node: String,
        #[serde(default)]
        accept_data_loss: bool,
    },
}

/// What the deciders said about an executed command
#[derive(Debug, Clone, Serialize)]
pub struct CommandExplanation {
    pub command: String,
    pub decisions: Decisions,
}

impl AllocationCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AllocationCommand::Move { .. } => "move",
            AllocationCommand::Cancel { .. } => "cancel",
            AllocationCommand::AllocateReplica { .. } => "allocate_replica",
            AllocationCommand::AllocateEmptyPrimary { .. } => "allocate_empty_primary",
            AllocationCommand::AllocateStalePrimary { .. } => "allocate_stale_primary",
        }
    }

    pub fn shard_id(&self) -> ShardId {
        match self {
            AllocationCommand::Move { index, shard, .. }
            | AllocationCommand::Cancel { index, shard, .. }
            | AllocationCommand::AllocateReplica { index, shard, .. }
            | AllocationCommand::AllocateEmptyPrimary { index, shard, .. }
            | AllocationCommand::AllocateStalePrimary { index, shard, .. } => ShardId::new(index.clone(), *shard),
        }
    }

    /// Apply the command to the working routing
    pub fn execute(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
    ) -> Result<CommandExplanation, AllocationError> {
        let shard_id = self.shard_id();
        if !allocation.routing_nodes().shard_ids().any(|id| id == &shard_id) {
            return Err(AllocationError::InvalidCommand(format!(
                "[{}] shard {} does not exist",
                self.name(),
                shard_id
            )));
        }

        let decisions = match self {
            AllocationCommand::Move { from_node, to_node, .. } => {
                self.execute_move(allocation, deciders, &shard_id, from_node, to_node)?
            }
            AllocationCommand::Cancel { node, allow_primary, .. } => {
                self.execute_cancel(allocation, deciders, &shard_id, node, *allow_primary)?
            }
            AllocationCommand::AllocateReplica { node, .. } => {
                self.execute_allocate_replica(allocation, deciders, &shard_id, node)?
            }
            AllocationCommand::AllocateEmptyPrimary { node, accept_data_loss, .. } => {
                self.require_data_loss_accepted(*accept_data_loss)?;
                let id = self.unassigned_primary(allocation, &shard_id, node)?;
                let decisions = self.check_primary(allocation, deciders, id, node)?;
                allocation
                    .routing_nodes_mut()
                    .update_recovery_source(id, RecoverySource::EmptyStore)?;
                allocation.routing_nodes_mut().initialize_shard(id, node, None)?;
                allocation.in_sync_updates_mut().reset(&shard_id, None);
                allocation.store_cache().clear(&shard_id);
                warn!("Allocated empty primary of {} on node [{}], existing data is discarded", shard_id, node);
                decisions
            }
            AllocationCommand::AllocateStalePrimary { node, accept_data_loss, .. } => {
                self.require_data_loss_accepted(*accept_data_loss)?;
                let id = self.unassigned_primary(allocation, &shard_id, node)?;
                let found = allocation
                    .store_cache()
                    .peek(&shard_id)
                    .unwrap_or_default()
                    .into_iter()
                    .find(|state| &state.node_id == node && state.has_data())
                    .ok_or_else(|| {
                        AllocationError::InvalidCommand(format!(
                            "[{}] no data for shard {} found on node [{}]",
                            self.name(),
                            shard_id,
                            node
                        ))
                    })?;
                let decisions = self.check_primary(allocation, deciders, id, node)?;
                let initialized = allocation
                    .routing_nodes_mut()
                    .initialize_shard(id, node, found.allocation_id.clone())?;
                let allocation_id = initialized.allocation_id.as_ref().map(|a| a.id.clone());
                allocation.in_sync_updates_mut().reset(&shard_id, allocation_id);
                allocation.store_cache().clear(&shard_id);
                warn!("Allocated stale primary of {} on node [{}], newer writes may be lost", shard_id, node);
                decisions
            }
        };

        Ok(CommandExplanation {
            command: self.to_string(),
            decisions,
        })
    }

    fn execute_move(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
        shard_id: &ShardId,
        from_node: &str,
        to_node: &str,
    ) -> Result<Decisions, AllocationError> {
        let (id, shard) = self.copy_on_node(allocation, shard_id, from_node)?;
        if !shard.started() {
            return Err(AllocationError::InvalidCommand(format!(
                "[{}] {} on node [{}] is not started",
                self.name(),
                shard_id,
                from_node
            )));
        }
        let target = self.live_node(allocation, to_node)?;
        let decisions = {
            let node = allocation
                .routing_nodes()
                .node(&target)
                .ok_or_else(|| self.unknown_node(&target))?;
            deciders.can_allocate(&shard, &node, allocation)
        };
        self.reject_on_no(&decisions)?;
        allocation.routing_nodes_mut().relocate_shard(id, &target)?;
        info!("Moving {} from node [{}] to node [{}]", shard_id, from_node, target);
        Ok(decisions)
    }

    fn execute_cancel(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
        shard_id: &ShardId,
        node: &str,
        allow_primary: bool,
    ) -> Result<Decisions, AllocationError> {
        let (id, shard) = self.copy_on_node(allocation, shard_id, node)?;
        // Cancelling a relocating source cancels the relocation only
        if shard.relocating() {
            allocation.routing_nodes_mut().cancel_relocation(id)?;
            info!("Cancelled relocation of {} from node [{}]", shard_id, node);
            return Ok(Decisions::new());
        }
        if shard.primary && !shard.is_relocation_target() && !allow_primary {
            return Err(AllocationError::InvalidCommand(format!(
                "[{}] {} on node [{}] is a primary; set allow_primary to cancel it",
                self.name(),
                shard_id,
                node
            )));
        }
        let info = UnassignedInfo::new(
            UnassignedReason::RerouteCancelled,
            Some(format!("shard cancelled on node [{}]", node)),
        );
        fail_shard(allocation, deciders, id, info)?;
        info!("Cancelled {} on node [{}]", shard_id, node);
        Ok(Decisions::new())
    }

    fn execute_allocate_replica(
        &self,
        allocation: &mut RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
        shard_id: &ShardId,
        node: &str,
    ) -> Result<Decisions, AllocationError> {
        let node_id = self.live_node(allocation, node)?;
        if allocation.routing_nodes().active_primary(shard_id).is_none() {
            return Err(AllocationError::InvalidCommand(format!(
                "[{}] {} has no active primary to recover from",
                self.name(),
                shard_id
            )));
        }
        let (id, shard) = allocation
            .routing_nodes()
            .unassigned()
            .into_iter()
            .filter_map(|id| allocation.routing_nodes().get(id).map(|s| (id, s.clone())))
            .find(|(_, s)| &s.shard_id == shard_id && !s.primary)
            .ok_or_else(|| {
                AllocationError::InvalidCommand(format!(
                    "[{}] {} has no unassigned replica",
                    self.name(),
                    shard_id
                ))
            })?;
        let decisions = {
            let routing_node = allocation
                .routing_nodes()
                .node(&node_id)
                .ok_or_else(|| self.unknown_node(&node_id))?;
            deciders.can_allocate(&shard, &routing_node, allocation)
        };
        self.reject_on_no(&decisions)?;
        allocation.routing_nodes_mut().initialize_shard(id, &node_id, None)?;
        info!("Allocated replica of {} on node [{}]", shard_id, node_id);
        Ok(decisions)
    }

    /// Deciders for a manual primary: a soft NO is overridden, a hard one is not
    fn check_primary(
        &self,
        allocation: &RoutingAllocation<'_>,
        deciders: &AllocationDeciders,
        id: CopyId,
        node_id: &str,
    ) -> Result<Decisions, AllocationError> {
        let shard = allocation
            .routing_nodes()
            .get(id)
            .cloned()
            .ok_or_else(|| AllocationError::InvalidCommand(format!("[{}] copy vanished", self.name())))?;
        let node = allocation
            .routing_nodes()
            .node(node_id)
            .ok_or_else(|| self.unknown_node(node_id))?;
        let decisions = deciders.can_allocate(&shard, &node, allocation);
        if decisions.kind() != DecisionKind::No {
            return Ok(decisions);
        }
        let forced = deciders.can_force_allocate_primary(&shard, &node, allocation);
        self.reject_on_no(&forced)?;
        Ok(forced)
    }

    fn unassigned_primary(
        &self,
        allocation: &RoutingAllocation<'_>,
        shard_id: &ShardId,
        node: &str,
    ) -> Result<CopyId, AllocationError> {
        self.live_node(allocation, node)?;
        let (id, primary) = allocation
            .routing_nodes()
            .group(shard_id)
            .into_iter()
            .find(|(_, s)| s.primary)
            .ok_or_else(|| AllocationError::InvalidCommand(format!("[{}] {} has no primary", self.name(), shard_id)))?;
        if !primary.unassigned() {
            return Err(AllocationError::InvalidCommand(format!(
                "[{}] primary of {} is already assigned to node [{}]",
                self.name(),
                shard_id,
                primary.current_node_id.as_deref().unwrap_or("-")
            )));
        }
        Ok(id)
    }

    fn copy_on_node(
        &self,
        allocation: &RoutingAllocation<'_>,
        shard_id: &ShardId,
        node: &str,
    ) -> Result<(CopyId, ShardRouting), AllocationError> {
        allocation
            .routing_nodes()
            .group(shard_id)
            .into_iter()
            .find(|(_, s)| s.current_node_id.as_deref() == Some(node))
            .map(|(id, s)| (id, s.clone()))
            .ok_or_else(|| {
                AllocationError::InvalidCommand(format!(
                    "[{}] no copy of {} on node [{}]",
                    self.name(),
                    shard_id,
                    node
                ))
            })
    }

    fn live_node(&self, allocation: &RoutingAllocation<'_>, node: &str) -> Result<String, AllocationError> {
        if allocation.nodes().contains(node) && allocation.routing_nodes().has_node(node) {
            Ok(node.to_string())
        } else {
            Err(self.unknown_node(node))
        }
    }

    fn unknown_node(&self, node: &str) -> AllocationError {
        AllocationError::InvalidCommand(format!("[{}] node [{}] is not part of the cluster", self.name(), node))
    }

    fn require_data_loss_accepted(&self, accepted: bool) -> Result<(), AllocationError> {
        if accepted {
            Ok(())
        } else {
            Err(AllocationError::InvalidCommand(format!(
                "[{}] may lose data; set accept_data_loss to proceed",
                self.name()
            )))
        }
    }

    fn reject_on_no(&self, decisions: &Decisions) -> Result<(), AllocationError> {
        if decisions.kind() == DecisionKind::No {
            return Err(AllocationError::CommandRejected {
                command: self.to_string(),
                decisions: decisions.clone(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for AllocationCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationCommand::Move {
                index,
                shard,
                from_node,
                to_node,
            } => write!(f, "move [{}][{}] from [{}] to [{}]", index, shard, from_node, to_node),
            AllocationCommand::Cancel { index, shard, node, .. } => {
                write!(f, "cancel [{}][{}] on [{}]", index, shard, node)
            }
            AllocationCommand::AllocateReplica { index, shard, node }
            | AllocationCommand::AllocateEmptyPrimary { index, shard, node, .. }
            | AllocationCommand::AllocateStalePrimary { index, shard, node, .. } => {
                write!(f, "{} [{}][{}] on [{}]", self.name(), index, shard, node)
            }
        }
    }
}
