//! Gateway allocation
//!
//! Recovery of primaries that must reuse data already on disk, based on
//! store reports fetched from the nodes.

mod primary;
mod store;

pub use primary::{PrimaryAllocation, PrimaryShardAllocator};
pub use store::{FetchResult, NodeShardState, ShardStoreCache, NO_VERSION};
