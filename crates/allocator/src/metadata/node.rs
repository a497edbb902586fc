//! Discovery node definitions

use chrono::{DateTime, Utc};
use routing::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A data node that has joined the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    /// Node ID
    pub id: NodeId,
    /// Host name the node runs on
    pub host_name: String,
    /// Host address (ip) the node runs on
    pub host_address: String,
    /// Node attributes (used by allocation filters)
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Join time
    pub joined_at: DateTime<Utc>,
}

impl DiscoveryNode {
    /// Create new node
    pub fn new(id: impl Into<NodeId>, host_name: impl Into<String>, host_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host_name: host_name.into(),
            host_address: host_address.into(),
            attributes: HashMap::new(),
            joined_at: Utc::now(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Whether both nodes run on the same machine.
    ///
    /// Host address is compared first; the host name is only used when
    /// either side has no address.
    pub fn same_host(&self, other: &DiscoveryNode) -> bool {
        if !self.host_address.is_empty() && !other.host_address.is_empty() {
            return self.host_address == other.host_address;
        }
        !self.host_name.is_empty() && self.host_name == other.host_name
    }

    /// Value of a filterable attribute; `_id`, `_host` and `_ip` are built in
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match key {
            "_id" | "_name" => Some(self.id.as_str()),
            "_host" => Some(self.host_name.as_str()),
            "_ip" => Some(self.host_address.as_str()),
            other => self.attributes.get(other).map(String::as_str),
        }
    }
}

/// Current set of data nodes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    nodes: BTreeMap<NodeId, DiscoveryNode>,
}

impl DiscoveryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node; returns true if it is new
    pub fn add(&mut self, node: DiscoveryNode) -> bool {
        self.nodes.insert(node.id.clone(), node).is_none()
    }

    pub fn remove(&mut self, node_id: &str) -> Option<DiscoveryNode> {
        self.nodes.remove(node_id)
    }

    pub fn get(&self, node_id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl FromIterator<DiscoveryNode> for DiscoveryNodes {
    fn from_iter<T: IntoIterator<Item = DiscoveryNode>>(iter: T) -> Self {
        let mut nodes = DiscoveryNodes::new();
        for node in iter {
            nodes.add(node);
        }
        nodes
    }
}
