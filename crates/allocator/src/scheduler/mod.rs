//! Shard scheduling
//!
//! Places the unassigned copies the primary allocator did not resolve.
//! Placement is pluggable; every choice is still gated by the deciders.

mod placement;

pub use placement::PlacementStrategy;

use routing::RoutingError;

use crate::allocation::RoutingAllocation;
use crate::decider::AllocationDeciders;

/// Assigns remaining unassigned copies to nodes
pub trait ShardsAllocator: Send + Sync + std::fmt::Debug {
    /// Assign what can be assigned. Copies that cannot be placed must be
    /// moved to the ignored list with their allocation status.
    fn allocate(&self, allocation: &mut RoutingAllocation<'_>, deciders: &AllocationDeciders) -> Result<(), RoutingError>;
}
