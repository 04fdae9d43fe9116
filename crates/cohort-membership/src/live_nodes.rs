//! Authoritative set of live nodes.
//!
//! [`LiveNodeManager`] owns the one answer to "which nodes are live". Every
//! connect/fail/leave notification is reduced to the nodes that actually
//! changed state; only that delta bumps the state id and reaches observers,
//! so duplicate or retried notifications are harmless.

use crate::node::Node;
use cohort_compartment::{notify_isolated, ProcessorList};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Notified about nodes that stopped being live.
pub trait FailureObserver: Send + Sync {
    fn on_nodes_failed(&self, nodes: &[Node]);

    fn on_nodes_left(&self, nodes: &[Node]);
}

/// Notified about nodes that became live.
pub trait ConnectionObserver: Send + Sync {
    fn on_nodes_connected(&self, nodes: &[Node]);
}

/// Immutable snapshot of the live node set and its indices.
#[derive(Debug, Clone)]
pub struct LiveNodeState {
    id: u64,
    local_node: Node,
    live_nodes: Vec<Node>,
    by_id: HashMap<Uuid, Node>,
    by_name: HashMap<String, Node>,
    by_connection: HashMap<String, Node>,
}

impl LiveNodeState {
    fn new(id: u64, local_node: Node, live_nodes: Vec<Node>) -> Self {
        let by_id = live_nodes.iter().map(|n| (n.id(), n.clone())).collect();
        let by_name = live_nodes
            .iter()
            .map(|n| (n.name().to_string(), n.clone()))
            .collect();
        let by_connection = live_nodes
            .iter()
            .map(|n| (n.address().to_string(), n.clone()))
            .collect();
        Self {
            id,
            local_node,
            live_nodes,
            by_id,
            by_name,
            by_connection,
        }
    }

    /// Version of the live set; changes exactly when the set changes.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_node(&self) -> &Node {
        &self.local_node
    }

    /// Live nodes in the order they became live.
    pub fn live_nodes(&self) -> &[Node] {
        &self.live_nodes
    }

    pub fn find_by_id(&self, id: &Uuid) -> Option<&Node> {
        self.by_id.get(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Node> {
        self.by_name.get(name)
    }

    pub fn find_by_connection(&self, address: &str) -> Option<&Node> {
        self.by_connection.get(address)
    }

    pub fn is_live(&self, id: &Uuid) -> bool {
        self.by_id.contains_key(id)
    }
}

/// Maintains the live node set and fans out changes.
pub struct LiveNodeManager {
    state: RwLock<Arc<LiveNodeState>>,
    update: Mutex<()>,
    failure_observers: ProcessorList<dyn FailureObserver>,
    connection_observers: ProcessorList<dyn ConnectionObserver>,
}

impl LiveNodeManager {
    /// The local node is live from the start.
    pub fn new(local_node: Node) -> Self {
        let live = vec![local_node.clone()];
        Self {
            state: RwLock::new(Arc::new(LiveNodeState::new(1, local_node, live))),
            update: Mutex::new(()),
            failure_observers: ProcessorList::new(),
            connection_observers: ProcessorList::new(),
        }
    }

    /// Consistent snapshot of the current state.
    pub fn state(&self) -> Arc<LiveNodeState> {
        self.state.read().clone()
    }

    pub fn id(&self) -> u64 {
        self.state.read().id
    }

    pub fn local_node(&self) -> Node {
        self.state.read().local_node.clone()
    }

    pub fn live_nodes(&self) -> Vec<Node> {
        self.state.read().live_nodes.clone()
    }

    pub fn is_live(&self, id: &Uuid) -> bool {
        self.state.read().is_live(id)
    }

    pub fn add_failure_observer(&self, observer: Arc<dyn FailureObserver>) {
        self.failure_observers.add(observer);
    }

    pub fn remove_failure_observer(&self, observer: &Arc<dyn FailureObserver>) -> bool {
        self.failure_observers.remove(observer)
    }

    pub fn add_connection_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.connection_observers.add(observer);
    }

    pub fn remove_connection_observer(&self, observer: &Arc<dyn ConnectionObserver>) -> bool {
        self.connection_observers.remove(observer)
    }

    /// Mark nodes live. Returns the nodes that were not live before.
    pub fn on_nodes_connected(&self, nodes: &[Node]) -> Vec<Node> {
        let connected = self.update_state(|state| {
            let mut seen = HashSet::new();
            let added: Vec<Node> = nodes
                .iter()
                .filter(|n| !state.is_live(&n.id()) && seen.insert(n.id()))
                .cloned()
                .collect();
            let mut live = state.live_nodes.clone();
            live.extend(added.iter().cloned());
            (added, live)
        });

        if !connected.is_empty() {
            for observer in self.connection_observers.snapshot().iter() {
                notify_isolated("connection observer", || observer.on_nodes_connected(&connected));
            }
        }
        connected
    }

    /// Mark nodes failed. Returns the nodes that were live before.
    pub fn on_nodes_failed(&self, nodes: &[Node]) -> Vec<Node> {
        let failed = self.remove_nodes(nodes);
        if !failed.is_empty() {
            for observer in self.failure_observers.snapshot().iter() {
                notify_isolated("failure observer", || observer.on_nodes_failed(&failed));
            }
        }
        failed
    }

    /// Mark nodes as gracefully left. Returns the nodes that were live before.
    pub fn on_nodes_left(&self, nodes: &[Node]) -> Vec<Node> {
        let left = self.remove_nodes(nodes);
        if !left.is_empty() {
            for observer in self.failure_observers.snapshot().iter() {
                notify_isolated("failure observer", || observer.on_nodes_left(&left));
            }
        }
        left
    }

    fn remove_nodes(&self, nodes: &[Node]) -> Vec<Node> {
        self.update_state(|state| {
            let removed_ids: HashSet<Uuid> = nodes
                .iter()
                .map(Node::id)
                .filter(|id| *id != state.local_node.id() && state.is_live(id))
                .collect();
            let removed: Vec<Node> = state
                .live_nodes
                .iter()
                .filter(|n| removed_ids.contains(&n.id()))
                .cloned()
                .collect();
            let live = state
                .live_nodes
                .iter()
                .filter(|n| !removed_ids.contains(&n.id()))
                .cloned()
                .collect();
            (removed, live)
        })
    }

    // Computes the delta and the next live list from the current state and
    // publishes a new snapshot if the delta is non-empty.
    fn update_state(
        &self,
        compute: impl FnOnce(&LiveNodeState) -> (Vec<Node>, Vec<Node>),
    ) -> Vec<Node> {
        let _update = self.update.lock();
        let current = self.state();
        let (delta, live) = compute(&current);
        if delta.is_empty() {
            return delta;
        }

        let next = LiveNodeState::new(current.id + 1, current.local_node.clone(), live);
        debug!(
            id = next.id,
            live = next.live_nodes.len(),
            changed = delta.len(),
            "Live node set changed"
        );
        *self.state.write() = Arc::new(next);
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        failed: Mutex<Vec<Vec<Uuid>>>,
        left: Mutex<Vec<Vec<Uuid>>>,
        connected: Mutex<Vec<Vec<Uuid>>>,
    }

    fn ids(nodes: &[Node]) -> Vec<Uuid> {
        nodes.iter().map(Node::id).collect()
    }

    impl FailureObserver for Recorder {
        fn on_nodes_failed(&self, nodes: &[Node]) {
            self.failed.lock().push(ids(nodes));
        }

        fn on_nodes_left(&self, nodes: &[Node]) {
            self.left.lock().push(ids(nodes));
        }
    }

    impl ConnectionObserver for Recorder {
        fn on_nodes_connected(&self, nodes: &[Node]) {
            self.connected.lock().push(ids(nodes));
        }
    }

    fn node(name: &str) -> Node {
        Node::new(name, "core", format!("{}:7000", name))
    }

    #[test]
    fn test_only_actual_changes_are_published() {
        let local = node("local");
        let manager = LiveNodeManager::new(local.clone());
        let recorder = Arc::new(Recorder::default());
        manager.add_failure_observer(recorder.clone());
        manager.add_connection_observer(recorder.clone());

        let a = node("a");
        let b = node("b");
        assert_eq!(manager.on_nodes_connected(&[a.clone(), b.clone(), a.clone()]).len(), 2);
        assert_eq!(manager.id(), 2);

        // Duplicates do not change the state.
        assert!(manager.on_nodes_connected(&[a.clone(), local.clone()]).is_empty());
        assert_eq!(manager.id(), 2);

        assert_eq!(manager.on_nodes_failed(&[a.clone(), node("stranger")]), vec![a.clone()]);
        assert!(manager.on_nodes_failed(&[a.clone()]).is_empty());
        assert_eq!(manager.on_nodes_left(&[b.clone()]), vec![b.clone()]);
        assert_eq!(manager.id(), 4);

        assert_eq!(*recorder.connected.lock(), vec![vec![a.id(), b.id()]]);
        assert_eq!(*recorder.failed.lock(), vec![vec![a.id()]]);
        assert_eq!(*recorder.left.lock(), vec![vec![b.id()]]);
    }

    #[test]
    fn test_indices_follow_list() {
        let local = node("local");
        let manager = LiveNodeManager::new(local.clone());
        let a = node("a");
        manager.on_nodes_connected(&[a.clone()]);

        let state = manager.state();
        assert_eq!(state.live_nodes(), &[local.clone(), a.clone()]);
        assert_eq!(state.find_by_name("a"), Some(&a));
        assert_eq!(state.find_by_connection("a:7000"), Some(&a));
        assert_eq!(state.find_by_id(&a.id()), Some(&a));

        manager.on_nodes_failed(&[a.clone()]);
        // The old snapshot is unaffected.
        assert!(state.is_live(&a.id()));
        let state = manager.state();
        assert!(state.find_by_name("a").is_none());
        assert!(state.find_by_connection("a:7000").is_none());
    }

    #[test]
    fn test_local_node_never_fails() {
        let local = node("local");
        let manager = LiveNodeManager::new(local.clone());
        assert!(manager.on_nodes_failed(&[local.clone()]).is_empty());
        assert!(manager.is_live(&local.id()));
    }

    #[test]
    fn test_panicking_observer_does_not_block_others() {
        struct Broken;

        impl ConnectionObserver for Broken {
            fn on_nodes_connected(&self, _nodes: &[Node]) {
                panic!("broken observer");
            }
        }

        let manager = LiveNodeManager::new(node("local"));
        let recorder = Arc::new(Recorder::default());
        manager.add_connection_observer(Arc::new(Broken));
        manager.add_connection_observer(recorder.clone());

        manager.on_nodes_connected(&[node("a")]);
        assert_eq!(recorder.connected.lock().len(), 1);
    }
}
