//! Per-pass working view of the routing table
//!
//! `RoutingNodes` indexes every shard copy by hosting node and keeps the
//! global unassigned list plus the transient ignored list. Copies live in an
//! arena addressed by `CopyId`; relocation targets are materialized here and
//! folded back into their source when freezing into a `RoutingTable`.

use std::collections::{BTreeMap, HashMap};

use crate::decision::Decision;
use crate::shard::{
    AllocationStatus, NodeId, RecoverySource, ShardId, ShardRouting, ShardRoutingState,
    UnassignedInfo,
};
use crate::table::{IndexShardRoutingTable, RoutingError, RoutingTable};

/// Arena index of a copy inside one `RoutingNodes`
pub type CopyId = usize;

/// Read-only view of the copies hosted by one node
#[derive(Debug, Clone, Copy)]
pub struct RoutingNode<'a> {
    node_id: &'a str,
    copies: &'a [CopyId],
    routing_nodes: &'a RoutingNodes,
}

impl<'a> RoutingNode<'a> {
    pub fn node_id(&self) -> &'a str {
        self.node_id
    }

    pub fn shards(&self) -> impl Iterator<Item = &'a ShardRouting> + 'a {
        let routing_nodes = self.routing_nodes;
        let copies = self.copies;
        copies.iter().filter_map(move |id| routing_nodes.get(*id))
    }

    /// The copy of `shard_id` on this node, if any
    pub fn shard_for(&self, shard_id: &ShardId) -> Option<&'a ShardRouting> {
        self.shards().find(|s| &s.shard_id == shard_id)
    }

    pub fn copy_ids(&self) -> &'a [CopyId] {
        self.copies
    }

    pub fn num_shards(&self) -> usize {
        self.copies.len()
    }

    pub fn num_shards_with_state(&self, state: ShardRoutingState) -> usize {
        self.shards().filter(|s| s.state == state).count()
    }
}

/// Mutable working copy of the routing for one allocation pass
#[derive(Debug, Clone, Default)]
pub struct RoutingNodes {
    copies: Vec<Option<ShardRouting>>,
    nodes: BTreeMap<NodeId, Vec<CopyId>>,
    groups: BTreeMap<ShardId, Vec<CopyId>>,
    unassigned: Vec<CopyId>,
    ignored: Vec<CopyId>,
}

impl RoutingNodes {
    /// Build the working view over `table` for the given data nodes.
    ///
    /// Copies assigned to nodes outside `data_nodes` are still indexed so that
    /// they can be failed explicitly.
    pub fn new<I>(table: &RoutingTable, data_nodes: I) -> Self
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut routing_nodes = Self::default();
        for node_id in data_nodes {
            routing_nodes.nodes.entry(node_id).or_default();
        }

        for shard in table.all_shards() {
            let target = shard.build_target_relocating_shard();
            routing_nodes.insert(shard.clone());
            if let Some(target) = target {
                routing_nodes.insert(target);
            }
        }
        routing_nodes
    }

    fn insert(&mut self, shard: ShardRouting) -> CopyId {
        let id = self.copies.len();
        self.groups.entry(shard.shard_id.clone()).or_default().push(id);
        match &shard.current_node_id {
            Some(node) => self.nodes.entry(node.clone()).or_default().push(id),
            None => self.unassigned.push(id),
        }
        self.copies.push(Some(shard));
        id
    }

    fn remove(&mut self, id: CopyId) -> Result<ShardRouting, RoutingError> {
        let shard = self
            .copies
            .get_mut(id)
            .and_then(Option::take)
            .ok_or_else(|| RoutingError::InvariantViolation(format!("copy {} does not exist", id)))?;
        if let Some(ids) = self.groups.get_mut(&shard.shard_id) {
            ids.retain(|c| *c != id);
        }
        if let Some(node) = &shard.current_node_id {
            if let Some(ids) = self.nodes.get_mut(node) {
                ids.retain(|c| *c != id);
            }
        }
        self.unassigned.retain(|c| *c != id);
        self.ignored.retain(|c| *c != id);
        Ok(shard)
    }

    fn replace(&mut self, id: CopyId, shard: ShardRouting) {
        self.copies[id] = Some(shard);
    }

    fn lookup(&self, id: CopyId) -> Result<&ShardRouting, RoutingError> {
        self.get(id)
            .ok_or_else(|| RoutingError::InvariantViolation(format!("copy {} does not exist", id)))
    }

    pub fn get(&self, id: CopyId) -> Option<&ShardRouting> {
        self.copies.get(id).and_then(Option::as_ref)
    }

    pub fn node(&self, node_id: &str) -> Option<RoutingNode<'_>> {
        self.nodes.get_key_value(node_id).map(|(node_id, copies)| RoutingNode {
            node_id: node_id.as_str(),
            copies: copies.as_slice(),
            routing_nodes: self,
        })
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = RoutingNode<'_>> {
        self.nodes.iter().map(move |(node_id, copies)| RoutingNode {
            node_id: node_id.as_str(),
            copies: copies.as_slice(),
            routing_nodes: self,
        })
    }

    /// Every live copy with its id
    pub fn copies(&self) -> impl Iterator<Item = (CopyId, &ShardRouting)> {
        self.copies
            .iter()
            .enumerate()
            .filter_map(|(id, c)| c.as_ref().map(|c| (id, c)))
    }

    pub fn shard_ids(&self) -> impl Iterator<Item = &ShardId> {
        self.groups.keys()
    }

    /// Every copy of one shard group, relocation targets included
    pub fn group(&self, shard_id: &ShardId) -> Vec<(CopyId, &ShardRouting)> {
        self.groups
            .get(shard_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(*id).map(|s| (*id, s))).collect())
            .unwrap_or_default()
    }

    pub fn active_primary(&self, shard_id: &ShardId) -> Option<(CopyId, &ShardRouting)> {
        self.group(shard_id)
            .into_iter()
            .find(|(_, s)| s.primary && s.active())
    }

    /// Copies waiting in the main unassigned list
    pub fn unassigned(&self) -> Vec<CopyId> {
        self.unassigned.clone()
    }

    /// Copies set aside for this pass
    pub fn ignored(&self) -> &[CopyId] {
        &self.ignored
    }

    pub fn has_unassigned_primaries(&self) -> bool {
        self.unassigned
            .iter()
            .filter_map(|id| self.get(*id))
            .any(|s| s.primary)
    }

    pub fn has_unassigned_shards(&self) -> bool {
        !self.unassigned.is_empty()
    }

    /// Find the assigned copy `(shard_id, node_id, allocation id)`
    pub fn find_assigned(&self, shard_id: &ShardId, node_id: &str, allocation_id: &str) -> Option<CopyId> {
        self.group(shard_id).into_iter().find_map(|(id, s)| {
            let matches = s.current_node_id.as_deref() == Some(node_id)
                && s.allocation_id.as_ref().map(|a| a.id.as_str()) == Some(allocation_id);
            matches.then_some(id)
        })
    }

    /// The initializing target of a relocating source
    pub fn relocation_target_of(&self, source: CopyId) -> Option<CopyId> {
        let source = self.get(source)?;
        let target_node = source.relocating_node_id.as_deref()?;
        let target_id = source.allocation_id.as_ref()?.relocation_id.as_deref()?;
        self.find_assigned(&source.shard_id, target_node, target_id)
    }

    /// The relocating source of an initializing target
    pub fn relocation_source_of(&self, target: CopyId) -> Option<CopyId> {
        let target = self.get(target)?;
        let source_node = target.relocating_node_id.as_deref()?;
        let source_id = target.allocation_id.as_ref()?.relocation_id.as_deref()?;
        self.find_assigned(&target.shard_id, source_node, source_id)
    }

    /// Peer recoveries currently streaming into `node_id`
    pub fn incoming_recoveries(&self, node_id: &str) -> usize {
        self.node(node_id)
            .map(|n| {
                n.shards()
                    .filter(|s| s.initializing() && s.recovery_source == Some(RecoverySource::Peer))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Peer recoveries currently sourced from `node_id`
    pub fn outgoing_recoveries(&self, node_id: &str) -> usize {
        self.copies()
            .filter(|(_, s)| s.initializing() && s.recovery_source == Some(RecoverySource::Peer))
            .filter(|(_, s)| match &s.relocating_node_id {
                Some(source) => source == node_id,
                None => self
                    .active_primary(&s.shard_id)
                    .and_then(|(_, p)| p.current_node_id.as_deref())
                    == Some(node_id),
            })
            .count()
    }

    /// Primaries initializing on `node_id` from a store or snapshot
    pub fn initial_primary_recoveries(&self, node_id: &str) -> usize {
        self.node(node_id)
            .map(|n| {
                n.shards()
                    .filter(|s| s.primary && s.initializing() && !s.is_relocation_target())
                    .count()
            })
            .unwrap_or(0)
    }

    // ==================== Transitions ====================

    /// Assign an unassigned copy to `node_id`
    pub fn initialize_shard(
        &mut self,
        id: CopyId,
        node_id: &str,
        existing_allocation_id: Option<String>,
    ) -> Result<&ShardRouting, RoutingError> {
        let shard = self.lookup(id)?;
        if !shard.unassigned() || !self.unassigned.contains(&id) {
            return Err(RoutingError::InvariantViolation(format!(
                "cannot initialize {}: not in the unassigned list",
                shard
            )));
        }
        if !self.nodes.contains_key(node_id) {
            return Err(RoutingError::InvariantViolation(format!(
                "cannot initialize {} on unknown node [{}]",
                shard, node_id
            )));
        }
        let initialized = shard.initialize(node_id, existing_allocation_id);
        self.unassigned.retain(|c| *c != id);
        self.nodes.entry(node_id.to_string()).or_default().push(id);
        self.replace(id, initialized);
        self.lookup(id)
    }

    /// Mark an initializing copy started.
    ///
    /// For a relocation target the source copy is removed and returned.
    pub fn start_shard(&mut self, id: CopyId) -> Result<Option<ShardRouting>, RoutingError> {
        let shard = self.lookup(id)?;
        if !shard.initializing() {
            return Err(RoutingError::InvariantViolation(format!(
                "cannot start {}: not initializing",
                shard
            )));
        }
        let removed_source = if shard.is_relocation_target() {
            let source = self.relocation_source_of(id).ok_or_else(|| {
                RoutingError::InvariantViolation(format!("relocation source of {} is missing", shard))
            })?;
            Some(self.remove(source)?)
        } else {
            None
        };
        let started = self.lookup(id)?.move_to_started();
        self.replace(id, started);
        Ok(removed_source)
    }

    /// Start relocating a started copy; returns the target's id
    pub fn relocate_shard(&mut self, id: CopyId, target_node: &str) -> Result<CopyId, RoutingError> {
        let shard = self.lookup(id)?;
        if !shard.started() {
            return Err(RoutingError::InvariantViolation(format!(
                "cannot relocate {}: not started",
                shard
            )));
        }
        if !self.nodes.contains_key(target_node) {
            return Err(RoutingError::InvariantViolation(format!(
                "cannot relocate {} to unknown node [{}]",
                shard, target_node
            )));
        }
        let source = shard.relocate(target_node);
        let target = source.build_target_relocating_shard().ok_or_else(|| {
            RoutingError::InvariantViolation(format!("{} has no relocation target", source))
        })?;
        self.replace(id, source);
        Ok(self.insert(target))
    }

    /// Discard the target of a relocating source and revert the source to started
    pub fn cancel_relocation(&mut self, source: CopyId) -> Result<(), RoutingError> {
        let shard = self.lookup(source)?;
        if !shard.relocating() {
            return Err(RoutingError::InvariantViolation(format!(
                "cannot cancel relocation of {}: not relocating",
                shard
            )));
        }
        if let Some(target) = self.relocation_target_of(source) {
            self.remove(target)?;
        }
        let reverted = self.lookup(source)?.cancel_relocation();
        self.replace(source, reverted);
        Ok(())
    }

    /// Take a copy off its node and put it back in the unassigned list.
    ///
    /// Relocating copies must have their relocation cancelled first; relocation
    /// targets are discarded through `cancel_relocation` on their source.
    pub fn move_to_unassigned(&mut self, id: CopyId, info: UnassignedInfo) -> Result<(), RoutingError> {
        let shard = self.lookup(id)?;
        if shard.unassigned() || shard.relocating() || shard.is_relocation_target() {
            return Err(RoutingError::InvariantViolation(format!(
                "cannot move {} to unassigned",
                shard
            )));
        }
        let unassigned = shard.move_to_unassigned(info);
        if let Some(node) = shard.current_node_id.clone() {
            if let Some(ids) = self.nodes.get_mut(&node) {
                ids.retain(|c| *c != id);
            }
        }
        self.replace(id, unassigned);
        self.unassigned.push(id);
        Ok(())
    }

    /// Flip an active replica to primary, together with its relocation target
    pub fn promote_active_replica(&mut self, id: CopyId) -> Result<(), RoutingError> {
        let shard = self.lookup(id)?;
        if shard.primary || !shard.active() {
            return Err(RoutingError::InvariantViolation(format!(
                "cannot promote {}: not an active replica",
                shard
            )));
        }
        let target = if shard.relocating() { self.relocation_target_of(id) } else { None };
        let promoted = shard.move_active_replica_to_primary();
        self.replace(id, promoted);
        if let Some(target) = target {
            let target_shard = self.lookup(target)?;
            let promoted_target = ShardRouting {
                primary: true,
                ..target_shard.clone()
            };
            self.replace(target, promoted_target);
        }
        Ok(())
    }

    /// Flip an unassigned primary to replica
    pub fn demote_unassigned_primary(&mut self, id: CopyId) -> Result<(), RoutingError> {
        let shard = self.lookup(id)?;
        if !shard.primary || !shard.unassigned() {
            return Err(RoutingError::InvariantViolation(format!(
                "cannot demote {}: not an unassigned primary",
                shard
            )));
        }
        let demoted = shard.move_unassigned_from_primary();
        self.replace(id, demoted);
        Ok(())
    }

    /// Move an unassigned copy to the ignored list for the rest of the pass
    pub fn ignore_shard(
        &mut self,
        id: CopyId,
        status: AllocationStatus,
        decision: Option<Decision>,
    ) -> Result<(), RoutingError> {
        self.update_allocation_status(id, status, decision)?;
        self.unassigned.retain(|c| *c != id);
        if !self.ignored.contains(&id) {
            self.ignored.push(id);
        }
        Ok(())
    }

    /// Record the outcome of an attempt on a copy that stays unassigned
    pub fn update_allocation_status(
        &mut self,
        id: CopyId,
        status: AllocationStatus,
        decision: Option<Decision>,
    ) -> Result<(), RoutingError> {
        let shard = self.lookup(id)?;
        if !shard.unassigned() {
            return Err(RoutingError::InvariantViolation(format!(
                "cannot update allocation status of {}: not unassigned",
                shard
            )));
        }
        let info = shard
            .unassigned_info
            .clone()
            .ok_or_else(|| RoutingError::InvariantViolation(format!("{} has no unassigned info", shard)))?
            .with_status(status, decision);
        let updated = shard.update_unassigned_info(info);
        self.replace(id, updated);
        Ok(())
    }

    /// Drop a node that no longer hosts any copy
    pub fn remove_node(&mut self, node_id: &str) -> Result<(), RoutingError> {
        match self.nodes.get(node_id) {
            Some(ids) if !ids.is_empty() => Err(RoutingError::InvariantViolation(format!(
                "cannot remove node [{}]: it still hosts {} copies",
                node_id,
                ids.len()
            ))),
            Some(_) => {
                self.nodes.remove(node_id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Change where an unassigned copy will recover from
    pub fn update_recovery_source(&mut self, id: CopyId, source: RecoverySource) -> Result<(), RoutingError> {
        let shard = self.lookup(id)?;
        if !shard.unassigned() {
            return Err(RoutingError::InvariantViolation(format!(
                "cannot change recovery source of {}: not unassigned",
                shard
            )));
        }
        let updated = ShardRouting {
            recovery_source: Some(source),
            ..shard.clone()
        };
        self.replace(id, updated);
        Ok(())
    }

    /// Reset failure counters of every unassigned copy; returns how many changed
    pub fn reset_failed_allocations(&mut self) -> usize {
        let mut reset = 0;
        for id in self.unassigned.clone() {
            let Some(shard) = self.get(id) else { continue };
            let Some(info) = shard.unassigned_info.as_ref() else { continue };
            if info.failed_allocations > 0 {
                let mut info = info.clone();
                info.failed_allocations = 0;
                let updated = shard.update_unassigned_info(info);
                self.replace(id, updated);
                reset += 1;
            }
        }
        reset
    }

    // ==================== Invariants & freezing ====================

    /// Check mutual exclusion per node, single primary per group and that
    /// every relocation has both halves.
    pub fn check_invariants(&self) -> Result<(), RoutingError> {
        for (node_id, ids) in &self.nodes {
            let mut seen: HashMap<&ShardId, CopyId> = HashMap::new();
            for id in ids {
                let shard = self.lookup(*id)?;
                if shard.current_node_id.as_deref() != Some(node_id.as_str()) {
                    return Err(RoutingError::InvariantViolation(format!(
                        "{} indexed under node [{}]",
                        shard, node_id
                    )));
                }
                if seen.insert(&shard.shard_id, *id).is_some() {
                    return Err(RoutingError::InvariantViolation(format!(
                        "{} has more than one copy on node [{}]",
                        shard.shard_id, node_id
                    )));
                }
            }
        }

        for (shard_id, ids) in &self.groups {
            let mut flagged = 0;
            let mut assigned_primaries = 0;
            for id in ids {
                let shard = self.lookup(*id)?;
                if shard.is_relocation_target() {
                    if self.relocation_source_of(*id).is_none() {
                        return Err(RoutingError::InvariantViolation(format!(
                            "relocation target {} has no source",
                            shard
                        )));
                    }
                    continue;
                }
                if shard.relocating() && self.relocation_target_of(*id).is_none() {
                    return Err(RoutingError::InvariantViolation(format!(
                        "relocating {} has no target",
                        shard
                    )));
                }
                if shard.primary {
                    flagged += 1;
                    if !shard.unassigned() {
                        assigned_primaries += 1;
                    }
                }
            }
            if flagged != 1 || assigned_primaries > 1 {
                return Err(RoutingError::InvariantViolation(format!(
                    "{} has {} primary copies ({} assigned)",
                    shard_id, flagged, assigned_primaries
                )));
            }
        }

        for id in self.unassigned.iter().chain(self.ignored.iter()) {
            let shard = self.lookup(*id)?;
            if !shard.unassigned() {
                return Err(RoutingError::InvariantViolation(format!(
                    "{} listed as unassigned",
                    shard
                )));
            }
        }
        Ok(())
    }

    /// Freeze into the next version of `base`.
    ///
    /// Relocation targets are folded into their sources and ignored copies
    /// return to plain unassigned entries.
    pub fn into_routing_table(&self, base: &RoutingTable) -> Result<RoutingTable, RoutingError> {
        self.check_invariants()?;
        let mut builder = base.builder();
        builder.clear();
        for (shard_id, ids) in &self.groups {
            let mut group = IndexShardRoutingTable::new(shard_id.clone());
            for id in ids {
                let shard = self.lookup(*id)?;
                if !shard.is_relocation_target() {
                    group.shards.push(shard.clone());
                }
            }
            group.shards.sort_by_key(|s| !s.primary);
            builder.put_shard_table(group);
        }
        builder.build()
    }
}
