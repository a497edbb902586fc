//! Cluster metadata definitions
//!
//! Contains data nodes, index metadata and the cluster state snapshot

mod cluster;
mod index;
mod node;

pub use cluster::{ClusterState, ClusterStats};
pub use index::{IndexMetadata, Metadata};
pub use node::{DiscoveryNode, DiscoveryNodes};
