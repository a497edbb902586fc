//! Stops retrying copies that keep failing to allocate.
//!
//! The counter lives in `UnassignedInfo::failed_allocations` and is reset by
//! a reroute with `retry_failed`.

use routing::{Decision, RoutingNode, ShardRouting};

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::config::AllocationSettings;

const NAME: &str = "max_retry";

#[derive(Debug, Clone)]
pub struct MaxRetryAllocationDecider {
    max_retries: u32,
}

impl MaxRetryAllocationDecider {
    pub fn new(settings: &AllocationSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
        }
    }

    fn decide(&self, shard: &ShardRouting) -> Decision {
        match &shard.unassigned_info {
            Some(info) if info.failed_allocations >= self.max_retries => Decision::no(
                NAME,
                format!(
                    "shard has exceeded the maximum number of retries [{}] on failed allocation attempts - manually call reroute with retry_failed to retry, last failure: [{}]",
                    self.max_retries,
                    info.message.as_deref().unwrap_or("unknown")
                ),
            ),
            Some(info) => Decision::yes(
                NAME,
                format!(
                    "shard has failed allocating [{}] times but [{}] retries are allowed",
                    info.failed_allocations, self.max_retries
                ),
            ),
            None => Decision::yes(NAME, "shard has no previous failures"),
        }
    }
}

impl AllocationDecider for MaxRetryAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, shard: &ShardRouting, _node: &RoutingNode<'_>, _allocation: &RoutingAllocation<'_>) -> Decision {
        self.decide(shard)
    }

    fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode<'_>,
        _allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        self.decide(shard)
    }
}
