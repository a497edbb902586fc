//! Routing table watch mechanism
//!
//! Lets clients wait for routing updates by version number

use routing::{ClusterHealth, ClusterHealthStatus};
use tokio::sync::watch;
use tracing::debug;

/// Last committed routing version and the health it produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingVersion {
    pub state_version: u64,
    pub routing_version: u64,
    pub status: ClusterHealthStatus,
}

/// Routing table watch manager
#[derive(Debug, Clone)]
pub struct RoutingTableWatcher {
    sender: watch::Sender<RoutingVersion>,
}

impl RoutingTableWatcher {
    pub fn new(initial: RoutingVersion) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<RoutingVersion> {
        self.sender.subscribe()
    }

    /// Publish a committed state; older versions are ignored
    pub fn notify(&self, state_version: u64, health: &ClusterHealth) {
        let next = RoutingVersion {
            state_version,
            routing_version: health.routing_version,
            status: health.status,
        };
        self.sender.send_if_modified(|current| {
            if next.state_version <= current.state_version {
                return false;
            }
            *current = next;
            true
        });
        debug!(
            "Published cluster state version {} (routing version {})",
            state_version, health.routing_version
        );
    }

    pub fn current(&self) -> RoutingVersion {
        *self.sender.borrow()
    }

    /// Wait until the routing version is newer than `version`
    pub async fn wait_for_version(&self, version: u64) -> RoutingVersion {
        let mut receiver = self.subscribe();
        let seen = match receiver.wait_for(|v| v.routing_version > version).await {
            Ok(v) => *v,
            // The sender lives in `self`, so the channel cannot be closed here
            Err(_) => self.current(),
        };
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routing::RoutingTable;
    use std::time::Duration;

    fn initial() -> RoutingVersion {
        RoutingVersion {
            state_version: 0,
            routing_version: 0,
            status: ClusterHealthStatus::Green,
        }
    }

    #[tokio::test]
    async fn test_wait_for_newer_version() {
        let watcher = RoutingTableWatcher::new(initial());
        let waiter = {
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.wait_for_version(0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut table = RoutingTable::new().builder();
        table.add_as_new("idx", 1, 0).unwrap();
        let health = ClusterHealth::from_routing_table(&table.build().unwrap());
        watcher.notify(1, &health);

        let seen = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(seen.routing_version, 1);
        assert_eq!(seen.status, ClusterHealthStatus::Red);
    }

    #[test]
    fn test_stale_notification_is_ignored() {
        let watcher = RoutingTableWatcher::new(RoutingVersion {
            state_version: 5,
            ..initial()
        });
        let health = ClusterHealth::from_routing_table(&RoutingTable::new());
        watcher.notify(3, &health);
        assert_eq!(watcher.current().state_version, 5);
    }
}
