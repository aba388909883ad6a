use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::common::node::{
    now_millis, read_node, write_node, ConnectionState, Node, NodeState, NodeUpdate, SharedNode,
};

pub type ChangeCallback = Arc<dyn Fn(&[Node]) + Send + Sync>;

/// Single source of truth for node identity and attributes.
///
/// Nodes are kept in insertion order. Every mutation goes through a method
/// that takes the map lock (and the node's own lock for merges), so an
/// update is atomic from any reader's point of view. Mutations wake a
/// notifier task which coalesces rapid bursts into one callback invocation
/// per window.
pub struct NodeRegistry {
    nodes: RwLock<IndexMap<String, SharedNode>>,
    subscribers: RwLock<Vec<ChangeCallback>>,
    dirty: AtomicBool,
    changed: Notify,
    coalesce_window: Duration,
}

impl NodeRegistry {
    pub fn new(coalesce_window: Duration) -> NodeRegistry {
        NodeRegistry {
            nodes: RwLock::new(IndexMap::new()),
            subscribers: RwLock::new(Vec::new()),
            dirty: AtomicBool::new(false),
            changed: Notify::new(),
            coalesce_window,
        }
    }

    /// Insert a new node or merge attributes into the existing one.
    ///
    /// Returns the shared cell, which keeps its identity across merges.
    /// An update that carries no usable address is dropped.
    pub fn upsert(&self, update: NodeUpdate) -> Option<SharedNode> {
        let Some(address) = update.address() else {
            log::warn!("dropping node update without address: {:?}", update);
            return None;
        };
        let now = now_millis();
        let node = {
            let mut nodes = self.nodes_write();
            if let Some(existing) = nodes.get(&address) {
                write_node(existing).merge(&update, now);
                existing.clone()
            } else {
                log::info!("registering new node {}", address);
                let node = Arc::new(RwLock::new(Node::from_update(address.clone(), &update, now)));
                nodes.insert(address, node.clone());
                node
            }
        };
        self.mark_changed();
        Some(node)
    }

    /// Delete a node. Idempotent; removing an unknown address is a no-op.
    pub fn remove(&self, address: &str) -> bool {
        let removed = self.nodes_write().shift_remove(address).is_some();
        if removed {
            log::info!("removed node {}", address);
            self.mark_changed();
        }
        removed
    }

    pub fn get(&self, address: &str) -> Option<SharedNode> {
        self.nodes_read().get(address).cloned()
    }

    /// Insertion-ordered snapshot. Each node is copied out under its own
    /// lock, so callers never observe a half-merged node.
    pub fn all(&self) -> Vec<Node> {
        self.nodes_read()
            .values()
            .map(|node| read_node(node).clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes_read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes_read().is_empty()
    }

    pub fn clear(&self) {
        let mut nodes = self.nodes_write();
        if !nodes.is_empty() {
            nodes.clear();
            drop(nodes);
            self.mark_changed();
        }
    }

    /// Reclassify a node's health. Marking a node dead stamps `dead_since`;
    /// any other state clears it. Unknown addresses are absorbed as no-ops.
    pub fn set_node_state(&self, address: &str, state: NodeState) {
        let Some(shared) = self.get(address) else {
            return;
        };
        {
            let mut node = write_node(&shared);
            if node.node_state == state {
                return;
            }
            node.node_state = state;
            node.dead_since = (state == NodeState::Dead).then(now_millis);
        }
        self.mark_changed();
    }

    pub fn set_connection_state(&self, address: &str, state: ConnectionState) {
        let Some(shared) = self.get(address) else {
            return;
        };
        {
            let mut node = write_node(&shared);
            if node.connection_state == state {
                return;
            }
            node.connection_state = state;
        }
        self.mark_changed();
    }

    /// Register a callback invoked with a fresh snapshot after each batch of
    /// mutations. Requires a running notifier task.
    pub fn on_nodes_changed<F>(&self, callback: F)
    where
        F: Fn(&[Node]) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Spawn the coalescing notifier. Mutations within one window collapse
    /// into a single round of subscriber callbacks.
    pub fn spawn_notifier(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = registry.changed.notified() => {}
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(registry.coalesce_window) => {}
                }
                if !registry.dirty.swap(false, Ordering::AcqRel) {
                    continue;
                }
                let snapshot = registry.all();
                let subscribers: Vec<ChangeCallback> = registry
                    .subscribers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for subscriber in subscribers {
                    subscriber(&snapshot);
                }
            }
        })
    }

    fn mark_changed(&self) {
        self.dirty.store(true, Ordering::Release);
        self.changed.notify_one();
    }

    fn nodes_read(&self) -> RwLockReadGuard<'_, IndexMap<String, SharedNode>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn nodes_write(&self) -> RwLockWriteGuard<'_, IndexMap<String, SharedNode>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for NodeRegistry {
    fn default() -> NodeRegistry {
        NodeRegistry::new(Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn update(ip: &str, port: u16) -> NodeUpdate {
        NodeUpdate {
            ip: Some(ip.to_string()),
            port: Some(port),
            ..NodeUpdate::default()
        }
    }

    #[test]
    fn upsert_preserves_node_identity_across_merges() {
        let registry = NodeRegistry::default();
        let first = registry.upsert(update("127.0.0.1", 8100)).unwrap();
        let second = registry
            .upsert(NodeUpdate {
                ip: Some("127.0.0.1".to_string()),
                port: Some(8100),
                used: Some(42.0),
                ..NodeUpdate::default()
            })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(read_node(&first).used, Some(42.0));
    }

    #[test]
    fn merge_updates_attributes_but_not_created_at() {
        let registry = NodeRegistry::default();
        let node = registry.upsert(update("127.0.0.1", 8100)).unwrap();
        let created_at = read_node(&node).created_at;
        registry.upsert(NodeUpdate {
            address: Some("127.0.0.1:8100".to_string()),
            is_leader: Some(true),
            ..NodeUpdate::default()
        });
        let node = read_node(&node);
        assert_eq!(node.created_at, created_at);
        assert!(node.is_leader);
        assert!(node.last_update >= created_at);
    }

    #[test]
    fn upsert_without_address_is_dropped() {
        let registry = NodeRegistry::default();
        assert!(registry.upsert(NodeUpdate::default()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = NodeRegistry::default();
        registry.upsert(update("127.0.0.1", 8100));
        assert!(registry.remove("127.0.0.1:8100"));
        assert!(!registry.remove("127.0.0.1:8100"));
        assert!(registry.get("127.0.0.1:8100").is_none());
    }

    #[test]
    fn all_returns_nodes_in_insertion_order() {
        let registry = NodeRegistry::default();
        registry.upsert(update("10.0.0.3", 1));
        registry.upsert(update("10.0.0.1", 2));
        registry.upsert(update("10.0.0.2", 3));
        registry.remove("10.0.0.1:2");
        registry.upsert(update("10.0.0.4", 4));
        let addresses: Vec<String> = registry.all().into_iter().map(|n| n.address).collect();
        assert_eq!(addresses, vec!["10.0.0.3:1", "10.0.0.2:3", "10.0.0.4:4"]);
    }

    #[test]
    fn clear_removes_everything() {
        let registry = NodeRegistry::default();
        registry.upsert(update("127.0.0.1", 1));
        registry.upsert(update("127.0.0.1", 2));
        registry.clear();
        assert!(registry.all().is_empty());
    }

    #[test]
    fn set_node_state_tracks_dead_since() {
        let registry = NodeRegistry::default();
        let node = registry.upsert(update("127.0.0.1", 8100)).unwrap();
        registry.set_node_state("127.0.0.1:8100", NodeState::Dead);
        assert!(read_node(&node).dead_since.is_some());
        registry.set_node_state("127.0.0.1:8100", NodeState::Alive);
        let node = read_node(&node);
        assert_eq!(node.node_state, NodeState::Alive);
        assert_eq!(node.dead_since, None);
        registry.set_node_state("unknown:1", NodeState::Dead);
    }

    #[tokio::test]
    async fn rapid_upserts_coalesce_into_one_notification() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_millis(50)));
        let shutdown = CancellationToken::new();
        registry.spawn_notifier(shutdown.clone());

        let rounds = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let rounds = rounds.clone();
            let seen = seen.clone();
            registry.on_nodes_changed(move |nodes| {
                rounds.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(nodes.len());
            });
        }

        for port in 0..5 {
            registry.upsert(update("127.0.0.1", 8100 + port));
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(rounds.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap().as_slice(), &[5]);
        shutdown.cancel();
    }
}
