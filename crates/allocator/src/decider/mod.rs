//! Allocation deciders
//!
//! Each decider is an independent, side-effect free constraint answering
//! YES / THROTTLE / NO for one (shard, node) question. `AllocationDeciders`
//! evaluates all of them in order and keeps every answer.

mod enable;
mod filter;
mod max_retry;
mod replica_after_primary_active;
mod same_shard;
mod throttling;

pub use enable::EnableAllocationDecider;
pub use filter::FilterAllocationDecider;
pub use max_retry::MaxRetryAllocationDecider;
pub use replica_after_primary_active::ReplicaAfterPrimaryActiveAllocationDecider;
pub use same_shard::SameShardAllocationDecider;
pub use throttling::ThrottlingAllocationDecider;

use routing::{Decision, Decisions, RoutingNode, ShardRouting};

use crate::allocation::RoutingAllocation;
use crate::config::AllocationSettings;

/// One allocation constraint
///
/// Every method defaults to YES, so a decider only implements the questions
/// it has an opinion on.
pub trait AllocationDecider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// May `shard` be allocated to `node`
    fn can_allocate(&self, _shard: &ShardRouting, _node: &RoutingNode<'_>, _allocation: &RoutingAllocation<'_>) -> Decision {
        Decision::yes(self.name(), "no allocation restriction")
    }

    /// May `shard` be moved away from where it is
    fn can_rebalance(&self, _shard: &ShardRouting, _allocation: &RoutingAllocation<'_>) -> Decision {
        Decision::yes(self.name(), "no rebalance restriction")
    }

    /// May `shard` stay on (or keep serving from) `node`
    fn can_remain(&self, _shard: &ShardRouting, _node: &RoutingNode<'_>, _allocation: &RoutingAllocation<'_>) -> Decision {
        Decision::yes(self.name(), "no restriction on remaining")
    }

    /// May a primary with existing data on `node` be allocated there even
    /// though `can_allocate` said NO.
    ///
    /// Soft constraints turn their NO into YES; deciders whose NO must hold
    /// even for a forced primary override this.
    fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode<'_>,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        let decision = self.can_allocate(shard, node, allocation);
        if decision.is_no() {
            Decision::yes(
                self.name(),
                format!("primary allocation forced over: {}", decision.explanation),
            )
        } else {
            decision
        }
    }
}

const FAILED_IN_PASS: &str = "failed_in_pass";

/// Ordered set of deciders folded into one outcome per question
#[derive(Debug)]
pub struct AllocationDeciders {
    deciders: Vec<Box<dyn AllocationDecider>>,
}

impl AllocationDeciders {
    pub fn new(deciders: Vec<Box<dyn AllocationDecider>>) -> Self {
        Self { deciders }
    }

    /// The standard decider chain configured from `settings`
    pub fn from_settings(settings: &AllocationSettings) -> Self {
        Self::new(vec![
            Box::new(MaxRetryAllocationDecider::new(settings)),
            Box::new(ReplicaAfterPrimaryActiveAllocationDecider),
            Box::new(EnableAllocationDecider::new(settings)),
            Box::new(FilterAllocationDecider::new(settings)),
            Box::new(SameShardAllocationDecider::new(settings)),
            Box::new(ThrottlingAllocationDecider::new(settings)),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.deciders.iter().map(|d| d.name()).collect()
    }

    pub fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode<'_>,
        allocation: &RoutingAllocation<'_>,
    ) -> Decisions {
        if let Some(no) = failed_in_pass(shard, node, allocation) {
            return Decisions::single(no);
        }
        self.collect(|d| d.can_allocate(shard, node, allocation))
    }

    pub fn can_rebalance(&self, shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> Decisions {
        self.collect(|d| d.can_rebalance(shard, allocation))
    }

    pub fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode<'_>,
        allocation: &RoutingAllocation<'_>,
    ) -> Decisions {
        self.collect(|d| d.can_remain(shard, node, allocation))
    }

    pub fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode<'_>,
        allocation: &RoutingAllocation<'_>,
    ) -> Decisions {
        if let Some(no) = failed_in_pass(shard, node, allocation) {
            return Decisions::single(no);
        }
        self.collect(|d| d.can_force_allocate_primary(shard, node, allocation))
    }

    fn collect<F>(&self, decide: F) -> Decisions
    where
        F: Fn(&dyn AllocationDecider) -> Decision,
    {
        let mut decisions = Decisions::new();
        for decider in &self.deciders {
            decisions.push(decide(decider.as_ref()));
        }
        decisions
    }
}

fn failed_in_pass(shard: &ShardRouting, node: &RoutingNode<'_>, allocation: &RoutingAllocation<'_>) -> Option<Decision> {
    allocation
        .should_ignore_shard_for_node(&shard.shard_id, node.node_id())
        .then(|| {
            Decision::no(
                FAILED_IN_PASS,
                format!("{} failed on node [{}] earlier in this pass", shard.shard_id, node.node_id()),
            )
        })
}
