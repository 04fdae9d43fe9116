//! Purging of per-node protocol state for dead nodes.
//!
//! A node becomes eligible for purge only after it has been continuously
//! absent from the live set for `node_cleanup_period_ms`. The first time a
//! protocol asks about a non-live node, the manager records when it was first
//! seen dead; a node that comes back live loses its record.

use crate::error::{MembershipError, Result};
use crate::live_nodes::LiveNodeManager;
use cohort_compartment::{notify_isolated, CompartmentTimerProcessor, ProcessorList};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A protocol holding per-node state.
pub trait CleanupAware: Send + Sync {
    /// Drop state for every node for which `is_dead` returns true.
    fn cleanup(&self, is_dead: &dyn Fn(&Uuid) -> bool);
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Interval between cleanup passes.
    pub cleanup_period_ms: u64,

    /// Time a node must stay dead before its state is purged.
    pub node_cleanup_period_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        CleanupConfig {
            cleanup_period_ms: 60_000,
            node_cleanup_period_ms: 300_000,
        }
    }
}

impl CleanupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cleanup_period_ms == 0 {
            return Err(MembershipError::InvalidConfig(
                "cleanup_period_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct CleanupState {
    last_cleanup_time: u64,
    dead_since: HashMap<Uuid, u64>,
}

/// Timer processor asking every registered protocol to purge dead nodes.
pub struct CleanupManager {
    config: CleanupConfig,
    live_nodes: Arc<LiveNodeManager>,
    protocols: ProcessorList<dyn CleanupAware>,
    state: Mutex<CleanupState>,
}

impl CleanupManager {
    pub fn new(config: CleanupConfig, live_nodes: Arc<LiveNodeManager>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            live_nodes,
            protocols: ProcessorList::new(),
            state: Mutex::new(CleanupState::default()),
        })
    }

    pub fn add_protocol(&self, protocol: Arc<dyn CleanupAware>) {
        self.protocols.add(protocol);
    }

    pub fn remove_protocol(&self, protocol: &Arc<dyn CleanupAware>) -> bool {
        self.protocols.remove(protocol)
    }

    /// Number of nodes currently waiting out the cleanup period.
    pub fn pending_nodes(&self) -> usize {
        self.state.lock().dead_since.len()
    }

    /// Run a cleanup pass if the cleanup period has elapsed.
    pub fn on_timer(&self, now: u64) {
        let mut state = self.state.lock();
        if now.saturating_sub(state.last_cleanup_time) < self.config.cleanup_period_ms {
            return;
        }
        state.last_cleanup_time = now;

        let live = self.live_nodes.state();
        let dead_since = RefCell::new(std::mem::take(&mut state.dead_since));
        let queried = RefCell::new(HashSet::new());
        let purged = RefCell::new(HashSet::new());

        let is_dead = |id: &Uuid| -> bool {
            if live.is_live(id) {
                return false;
            }
            queried.borrow_mut().insert(*id);
            let first_seen = *dead_since.borrow_mut().entry(*id).or_insert(now);
            let eligible = now.saturating_sub(first_seen) >= self.config.node_cleanup_period_ms;
            if eligible {
                purged.borrow_mut().insert(*id);
            }
            eligible
        };

        for protocol in self.protocols.snapshot().iter() {
            notify_isolated("cleanup", || protocol.cleanup(&is_dead));
        }

        let queried = queried.into_inner();
        let purged = purged.into_inner();
        let mut dead_since = dead_since.into_inner();
        dead_since.retain(|id, _| queried.contains(id) && !purged.contains(id));
        state.dead_since = dead_since;

        if !purged.is_empty() {
            debug!(nodes = purged.len(), "Purged state of dead nodes");
        }
    }
}

impl CompartmentTimerProcessor for CleanupManager {
    fn on_timer(&self, current_time: u64) {
        CleanupManager::on_timer(self, current_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    struct Holder {
        nodes: Mutex<HashSet<Uuid>>,
    }

    impl CleanupAware for Holder {
        fn cleanup(&self, is_dead: &dyn Fn(&Uuid) -> bool) {
            self.nodes.lock().retain(|id| !is_dead(id));
        }
    }

    fn setup() -> (Arc<LiveNodeManager>, Node, CleanupManager, Arc<Holder>) {
        let local = Node::new("local", "core", "local");
        let peer = Node::new("peer", "core", "peer");
        let live = Arc::new(LiveNodeManager::new(local.clone()));
        live.on_nodes_connected(&[peer.clone()]);

        let manager = CleanupManager::new(
            CleanupConfig {
                cleanup_period_ms: 10,
                node_cleanup_period_ms: 100,
            },
            live.clone(),
        )
        .unwrap();
        let holder = Arc::new(Holder {
            nodes: Mutex::new(HashSet::from([local.id(), peer.id()])),
        });
        manager.add_protocol(holder.clone());
        (live, peer, manager, holder)
    }

    #[test]
    fn test_purge_after_node_cleanup_period() {
        let (live, peer, manager, holder) = setup();
        live.on_nodes_failed(&[peer.clone()]);

        manager.on_timer(1_000);
        assert!(holder.nodes.lock().contains(&peer.id()));
        assert_eq!(manager.pending_nodes(), 1);

        manager.on_timer(1_050);
        assert!(holder.nodes.lock().contains(&peer.id()));

        manager.on_timer(1_100);
        assert!(!holder.nodes.lock().contains(&peer.id()));
        assert_eq!(manager.pending_nodes(), 0);
        assert_eq!(holder.nodes.lock().len(), 1);
    }

    #[test]
    fn test_flapping_node_is_kept() {
        let (live, peer, manager, holder) = setup();
        live.on_nodes_failed(&[peer.clone()]);
        manager.on_timer(1_000);

        live.on_nodes_connected(&[peer.clone()]);
        manager.on_timer(1_050);
        assert_eq!(manager.pending_nodes(), 0);

        live.on_nodes_failed(&[peer.clone()]);
        manager.on_timer(1_120);
        assert!(holder.nodes.lock().contains(&peer.id()));
    }

    #[test]
    fn test_respects_cleanup_period() {
        let (live, peer, manager, _holder) = setup();
        live.on_nodes_failed(&[peer.clone()]);
        manager.on_timer(1_000);
        manager.on_timer(1_005);
        assert_eq!(manager.pending_nodes(), 1);
    }
}
