//! Node attribute filters
//!
//! `require` entries must all match, at least one `include` entry must match
//! when any is set, and no `exclude` entry may match. Values are comma
//! separated lists; a trailing `*` matches by prefix.

use std::collections::BTreeMap;

use routing::{Decision, RoutingNode, ShardRouting};

use super::AllocationDecider;
use crate::allocation::RoutingAllocation;
use crate::config::AllocationSettings;
use crate::metadata::DiscoveryNode;

const NAME: &str = "filter";

#[derive(Debug, Clone)]
pub struct FilterAllocationDecider {
    require: BTreeMap<String, Vec<String>>,
    include: BTreeMap<String, Vec<String>>,
    exclude: BTreeMap<String, Vec<String>>,
}

fn parse(filters: &BTreeMap<String, String>) -> BTreeMap<String, Vec<String>> {
    filters
        .iter()
        .map(|(key, values)| {
            let values = values
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
                .collect();
            (key.clone(), values)
        })
        .collect()
}

fn value_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

fn attribute_matches(node: Option<&DiscoveryNode>, key: &str, patterns: &[String]) -> bool {
    node.and_then(|n| n.attribute(key))
        .is_some_and(|value| patterns.iter().any(|p| value_matches(p, value)))
}

impl FilterAllocationDecider {
    pub fn new(settings: &AllocationSettings) -> Self {
        Self {
            require: parse(&settings.require),
            include: parse(&settings.include),
            exclude: parse(&settings.exclude),
        }
    }

    fn decide(&self, node_id: &str, allocation: &RoutingAllocation<'_>, verb: &str) -> Decision {
        let node = allocation.nodes().get(node_id);

        for (key, patterns) in &self.require {
            if !attribute_matches(node, key, patterns) {
                return Decision::no(
                    NAME,
                    format!(
                        "node does not match required filter [{}:{}], shard {}",
                        key,
                        patterns.join(","),
                        verb
                    ),
                );
            }
        }

        if !self.include.is_empty()
            && !self
                .include
                .iter()
                .any(|(key, patterns)| attribute_matches(node, key, patterns))
        {
            return Decision::no(
                NAME,
                format!("node does not match any include filter, shard {}", verb),
            );
        }

        for (key, patterns) in &self.exclude {
            if attribute_matches(node, key, patterns) {
                return Decision::no(
                    NAME,
                    format!(
                        "node matches exclude filter [{}:{}], shard {}",
                        key,
                        patterns.join(","),
                        verb
                    ),
                );
            }
        }

        Decision::yes(NAME, "node passes allocation filters")
    }
}

impl AllocationDecider for FilterAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(&self, _shard: &ShardRouting, node: &RoutingNode<'_>, allocation: &RoutingAllocation<'_>) -> Decision {
        self.decide(node.node_id(), allocation, "cannot be allocated here")
    }

    fn can_remain(&self, _shard: &ShardRouting, node: &RoutingNode<'_>, allocation: &RoutingAllocation<'_>) -> Decision {
        self.decide(node.node_id(), allocation, "cannot remain here")
    }
}
