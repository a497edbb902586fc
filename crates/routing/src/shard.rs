//! Shard copy definitions
//!
//! A `ShardRouting` is one concrete copy of a shard. All transitions return a
//! new value; the routing table owns every copy and a pass never shares a copy
//! by reference with the previous table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::Decision;

/// Node ID
pub type NodeId = String;

/// Shard identity: (index name, shard number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    /// Index name
    pub index: String,
    /// Shard number within the index
    pub id: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, id: u32) -> Self {
        Self {
            index: index.into(),
            id,
        }
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}]", self.index, self.id)
    }
}

/// Shard copy state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardRoutingState {
    /// Not assigned to any node
    Unassigned,
    /// Assigned, recovering
    Initializing,
    /// Active and serving
    Started,
    /// Active, being moved to another node
    Relocating,
}

impl std::fmt::Display for ShardRoutingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardRoutingState::Unassigned => write!(f, "UNASSIGNED"),
            ShardRoutingState::Initializing => write!(f, "INITIALIZING"),
            ShardRoutingState::Started => write!(f, "STARTED"),
            ShardRoutingState::Relocating => write!(f, "RELOCATING"),
        }
    }
}

/// Token identifying one (re)initialization of a shard copy.
///
/// A relocating source keeps its own id and carries the target's id in
/// `relocation_id`; the relocation target carries the mirror image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationId {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relocation_id: Option<String>,
}

impl AllocationId {
    /// Mint a fresh id for a newly initializing copy
    pub fn new_initializing() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            relocation_id: None,
        }
    }

    /// Reuse an id reported by a node holding existing data
    pub fn with_existing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            relocation_id: None,
        }
    }

    /// Id of a source that starts relocating
    pub fn start_relocation(&self) -> Self {
        Self {
            id: self.id.clone(),
            relocation_id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Id of a source whose relocation was cancelled
    pub fn cancel_relocation(&self) -> Self {
        Self {
            id: self.id.clone(),
            relocation_id: None,
        }
    }

    /// Id of the relocation target derived from the source id
    pub fn target_of(source: &AllocationId) -> Option<Self> {
        source.relocation_id.as_ref().map(|target| Self {
            id: target.clone(),
            relocation_id: Some(source.id.clone()),
        })
    }

    /// Id of a relocation target once it has started
    pub fn finish_relocation(&self) -> Self {
        Self {
            id: self.id.clone(),
            relocation_id: None,
        }
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.relocation_id {
            Some(relocation) => write!(f, "{} (relocation {})", self.id, relocation),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Where a copy recovers its data from when it initializes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecoverySource {
    /// Brand-new, empty primary
    EmptyStore,
    /// Primary recovering from data already on a node's disk
    ExistingStore,
    /// Copy recovering from the active primary
    Peer,
    /// Primary restored from a snapshot repository
    Snapshot { repository: String, snapshot: String },
}

impl RecoverySource {
    /// Whether the primary must be resolved from discovered on-disk data
    pub fn needs_store_data(&self) -> bool {
        matches!(self, RecoverySource::ExistingStore | RecoverySource::Snapshot { .. })
    }
}

/// Why a copy is unassigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnassignedReason {
    IndexCreated,
    ClusterRecovered,
    IndexReopened,
    NewIndexRestored,
    ExistingIndexRestored,
    ReplicaAdded,
    AllocationFailed,
    NodeLeft,
    RerouteCancelled,
    PrimaryFailed,
    ManualAllocation,
}

impl std::fmt::Display for UnassignedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UnassignedReason::IndexCreated => "index_created",
            UnassignedReason::ClusterRecovered => "cluster_recovered",
            UnassignedReason::IndexReopened => "index_reopened",
            UnassignedReason::NewIndexRestored => "new_index_restored",
            UnassignedReason::ExistingIndexRestored => "existing_index_restored",
            UnassignedReason::ReplicaAdded => "replica_added",
            UnassignedReason::AllocationFailed => "allocation_failed",
            UnassignedReason::NodeLeft => "node_left",
            UnassignedReason::RerouteCancelled => "reroute_cancelled",
            UnassignedReason::PrimaryFailed => "primary_failed",
            UnassignedReason::ManualAllocation => "manual_allocation",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of the last allocation attempt for an unassigned copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStatus {
    #[default]
    NoAttempt,
    DecidersNo,
    DecidersThrottled,
    NoValidShardCopy,
    FetchingShardData,
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationStatus::NoAttempt => write!(f, "no_attempt"),
            AllocationStatus::DecidersNo => write!(f, "deciders_no"),
            AllocationStatus::DecidersThrottled => write!(f, "deciders_throttled"),
            AllocationStatus::NoValidShardCopy => write!(f, "no_valid_shard_copy"),
            AllocationStatus::FetchingShardData => write!(f, "fetching_shard_data"),
        }
    }
}

/// Unassigned bookkeeping carried by a copy until it starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnassignedInfo {
    pub reason: UnassignedReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
    /// Consecutive failed allocations of this copy
    #[serde(default)]
    pub failed_allocations: u32,
    #[serde(default)]
    pub last_allocation_status: AllocationStatus,
    /// Representative decision of the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decision: Option<Decision>,
}

impl UnassignedInfo {
    pub fn new(reason: UnassignedReason, message: Option<String>) -> Self {
        Self {
            reason,
            message,
            at: Utc::now(),
            failed_allocations: 0,
            last_allocation_status: AllocationStatus::NoAttempt,
            last_decision: None,
        }
    }

    /// Info for a copy that failed, counting the failure
    pub fn failed(previous: Option<&UnassignedInfo>, message: String) -> Self {
        let failed_allocations = previous.map(|i| i.failed_allocations).unwrap_or(0) + 1;
        Self {
            failed_allocations,
            ..Self::new(UnassignedReason::AllocationFailed, Some(message))
        }
    }

    pub fn with_status(mut self, status: AllocationStatus, decision: Option<Decision>) -> Self {
        self.last_allocation_status = status;
        self.last_decision = decision;
        self
    }
}

/// One concrete copy of a shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    pub primary: bool,
    pub state: ShardRoutingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relocating_node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<AllocationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unassigned_info: Option<UnassignedInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_source: Option<RecoverySource>,
}

impl ShardRouting {
    /// Create an unassigned copy
    pub fn new_unassigned(
        shard_id: ShardId,
        primary: bool,
        recovery_source: RecoverySource,
        info: UnassignedInfo,
    ) -> Self {
        Self {
            shard_id,
            primary,
            state: ShardRoutingState::Unassigned,
            current_node_id: None,
            relocating_node_id: None,
            allocation_id: None,
            unassigned_info: Some(info),
            recovery_source: Some(recovery_source),
        }
    }

    pub fn unassigned(&self) -> bool {
        self.state == ShardRoutingState::Unassigned
    }

    pub fn initializing(&self) -> bool {
        self.state == ShardRoutingState::Initializing
    }

    pub fn started(&self) -> bool {
        self.state == ShardRoutingState::Started
    }

    pub fn relocating(&self) -> bool {
        self.state == ShardRoutingState::Relocating
    }

    /// Started or relocating: the copy holds in-sync data and serves traffic
    pub fn active(&self) -> bool {
        self.started() || self.relocating()
    }

    pub fn assigned_to_node(&self) -> bool {
        self.current_node_id.is_some()
    }

    /// Initializing copy recovering as the target of a relocation
    pub fn is_relocation_target(&self) -> bool {
        self.initializing() && self.relocating_node_id.is_some()
    }

    /// Same shard group and same allocation id
    pub fn is_same_allocation(&self, other: &ShardRouting) -> bool {
        self.shard_id == other.shard_id
            && self.allocation_id.as_ref().map(|a| &a.id)
                == other.allocation_id.as_ref().map(|a| &a.id)
    }

    /// Move an unassigned copy to a node
    pub fn initialize(&self, node_id: &str, existing_allocation_id: Option<String>) -> Self {
        debug_assert!(self.unassigned(), "{} is not unassigned", self);
        let allocation_id = match existing_allocation_id {
            Some(id) => AllocationId::with_existing(id),
            None => AllocationId::new_initializing(),
        };
        Self {
            state: ShardRoutingState::Initializing,
            current_node_id: Some(node_id.to_string()),
            relocating_node_id: None,
            allocation_id: Some(allocation_id),
            ..self.clone()
        }
    }

    /// Mark an initializing copy as started
    pub fn move_to_started(&self) -> Self {
        debug_assert!(self.initializing(), "{} is not initializing", self);
        let allocation_id = self.allocation_id.as_ref().map(|a| a.finish_relocation());
        Self {
            state: ShardRoutingState::Started,
            relocating_node_id: None,
            allocation_id,
            unassigned_info: None,
            recovery_source: None,
            ..self.clone()
        }
    }

    /// Start relocating a started copy to `target_node`
    pub fn relocate(&self, target_node: &str) -> Self {
        debug_assert!(self.started(), "{} is not started", self);
        Self {
            state: ShardRoutingState::Relocating,
            relocating_node_id: Some(target_node.to_string()),
            allocation_id: self.allocation_id.as_ref().map(|a| a.start_relocation()),
            ..self.clone()
        }
    }

    /// Revert a relocating source to started
    pub fn cancel_relocation(&self) -> Self {
        debug_assert!(self.relocating(), "{} is not relocating", self);
        Self {
            state: ShardRoutingState::Started,
            relocating_node_id: None,
            allocation_id: self.allocation_id.as_ref().map(|a| a.cancel_relocation()),
            ..self.clone()
        }
    }

    /// Initializing copy on the relocation target node, derived from the source
    pub fn build_target_relocating_shard(&self) -> Option<Self> {
        if !self.relocating() {
            return None;
        }
        let allocation_id = self.allocation_id.as_ref().and_then(AllocationId::target_of)?;
        Some(Self {
            shard_id: self.shard_id.clone(),
            primary: self.primary,
            state: ShardRoutingState::Initializing,
            current_node_id: self.relocating_node_id.clone(),
            relocating_node_id: self.current_node_id.clone(),
            allocation_id: Some(allocation_id),
            unassigned_info: None,
            recovery_source: Some(RecoverySource::Peer),
        })
    }

    /// Remove the copy from its node
    ///
    /// An active primary will recover from its own store, an active replica
    /// from the primary. Copies that never became active keep their source.
    pub fn move_to_unassigned(&self, info: UnassignedInfo) -> Self {
        let recovery_source = if self.active() {
            if self.primary {
                RecoverySource::ExistingStore
            } else {
                RecoverySource::Peer
            }
        } else {
            self.recovery_source
                .clone()
                .unwrap_or(if self.primary { RecoverySource::ExistingStore } else { RecoverySource::Peer })
        };
        Self {
            shard_id: self.shard_id.clone(),
            primary: self.primary,
            state: ShardRoutingState::Unassigned,
            current_node_id: None,
            relocating_node_id: None,
            allocation_id: None,
            unassigned_info: Some(info),
            recovery_source: Some(recovery_source),
        }
    }

    /// Flip an active replica to primary; state is unchanged
    pub fn move_active_replica_to_primary(&self) -> Self {
        debug_assert!(!self.primary && self.active(), "{} is not an active replica", self);
        Self {
            primary: true,
            ..self.clone()
        }
    }

    /// Flip an unassigned primary to replica
    pub fn move_unassigned_from_primary(&self) -> Self {
        debug_assert!(self.primary && self.unassigned(), "{} is not an unassigned primary", self);
        Self {
            primary: false,
            recovery_source: Some(RecoverySource::Peer),
            ..self.clone()
        }
    }

    /// Replace the unassigned bookkeeping, keeping everything else
    pub fn update_unassigned_info(&self, info: UnassignedInfo) -> Self {
        Self {
            unassigned_info: Some(info),
            ..self.clone()
        }
    }
}

impl std::fmt::Display for ShardRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, node[{}], {}[{}], s[{}]",
            self.shard_id,
            self.current_node_id.as_deref().unwrap_or("-"),
            match &self.relocating_node_id {
                Some(n) => format!("relocating [{}], ", n),
                None => String::new(),
            },
            if self.primary { "P" } else { "R" },
            self.state
        )?;
        if let Some(a) = &self.allocation_id {
            write!(f, ", a[{}]", a)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unassigned_primary() -> ShardRouting {
        ShardRouting::new_unassigned(
            ShardId::new("test", 0),
            true,
            RecoverySource::EmptyStore,
            UnassignedInfo::new(UnassignedReason::IndexCreated, None),
        )
    }

    #[test]
    fn test_initialize_keeps_reported_allocation_id() {
        let shard = unassigned_primary().initialize("node1", Some("abc".to_string()));
        assert!(shard.initializing());
        assert_eq!(shard.current_node_id.as_deref(), Some("node1"));
        assert_eq!(shard.allocation_id.unwrap().id, "abc");
    }

    #[test]
    fn test_relocation_target_mirrors_source() {
        let started = unassigned_primary().initialize("node1", None).move_to_started();
        assert!(started.unassigned_info.is_none());

        let source = started.relocate("node2");
        let target = source.build_target_relocating_shard().unwrap();
        let source_id = source.allocation_id.clone().unwrap();
        let target_id = target.allocation_id.clone().unwrap();

        assert!(target.is_relocation_target());
        assert_eq!(target.current_node_id.as_deref(), Some("node2"));
        assert_eq!(target.relocating_node_id.as_deref(), Some("node1"));
        assert_eq!(source_id.relocation_id.as_ref(), Some(&target_id.id));
        assert_eq!(target_id.relocation_id.as_ref(), Some(&source_id.id));

        let finished = target.move_to_started();
        assert!(finished.started());
        assert!(finished.relocating_node_id.is_none());
        assert!(finished.allocation_id.unwrap().relocation_id.is_none());

        let reverted = source.cancel_relocation();
        assert!(reverted.started());
        assert_eq!(reverted.allocation_id, started.allocation_id);
    }

    #[test]
    fn test_active_primary_recovers_from_existing_store() {
        let started = unassigned_primary().initialize("node1", None).move_to_started();
        let info = UnassignedInfo::failed(None, "disk gone".to_string());
        let unassigned = started.move_to_unassigned(info);

        assert!(unassigned.unassigned());
        assert!(unassigned.allocation_id.is_none());
        assert_eq!(unassigned.recovery_source, Some(RecoverySource::ExistingStore));
        assert_eq!(unassigned.unassigned_info.unwrap().failed_allocations, 1);
    }

    #[test]
    fn test_initializing_primary_keeps_recovery_source() {
        let initializing = unassigned_primary().initialize("node1", None);
        let unassigned = initializing.move_to_unassigned(UnassignedInfo::new(UnassignedReason::NodeLeft, None));
        assert_eq!(unassigned.recovery_source, Some(RecoverySource::EmptyStore));
    }

    #[test]
    fn test_failed_info_counts_failures() {
        let first = UnassignedInfo::failed(None, "a".to_string());
        let second = UnassignedInfo::failed(Some(&first), "b".to_string());
        assert_eq!(second.failed_allocations, 2);
        assert_eq!(second.reason, UnassignedReason::AllocationFailed);
    }
}
