//! Node tracking strategies.
//!
//! A strategy picks the live nodes the local node monitors with heartbeats.
//! All strategies return an empty set when fewer than two nodes are live or
//! when the local node is not in the live list.
//!
//! | strategy            | fan-out per node                  |
//! |---------------------|-----------------------------------|
//! | Full                | n - 1                             |
//! | None                | 0                                 |
//! | Random(k)           | min(k, n - 1)                     |
//! | CoordinatorCohort   | n - 1 on the coordinator, else 1  |
//! | Ring                | 1, or 2 on sub-ring coordinators  |

use crate::node::Node;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;

/// Largest cluster tracked as a single ring.
pub const SINGLE_RING_LIMIT: usize = 10;

/// Picks the nodes to monitor.
pub trait NodeTrackingStrategy: Send + Sync {
    fn tracked_nodes(&self, local: &Node, live_nodes: &[Node]) -> HashSet<Node>;
}

fn local_index(local: &Node, live_nodes: &[Node]) -> Option<usize> {
    if live_nodes.len() < 2 {
        return None;
    }
    live_nodes.iter().position(|n| n == local)
}

/// Track every other live node.
#[derive(Clone, Copy, Debug, Default)]
pub struct FullNodeTrackingStrategy;

impl NodeTrackingStrategy for FullNodeTrackingStrategy {
    fn tracked_nodes(&self, local: &Node, live_nodes: &[Node]) -> HashSet<Node> {
        if local_index(local, live_nodes).is_none() {
            return HashSet::new();
        }
        live_nodes.iter().filter(|n| *n != local).cloned().collect()
    }
}

/// Track nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoneNodeTrackingStrategy;

impl NodeTrackingStrategy for NoneNodeTrackingStrategy {
    fn tracked_nodes(&self, _local: &Node, _live_nodes: &[Node]) -> HashSet<Node> {
        HashSet::new()
    }
}

/// Track `count` distinct random other nodes.
pub struct RandomNodeTrackingStrategy {
    count: usize,
    rng: Mutex<StdRng>,
}

impl RandomNodeTrackingStrategy {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(count: usize, seed: u64) -> Self {
        Self {
            count,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl NodeTrackingStrategy for RandomNodeTrackingStrategy {
    fn tracked_nodes(&self, local: &Node, live_nodes: &[Node]) -> HashSet<Node> {
        if local_index(local, live_nodes).is_none() {
            return HashSet::new();
        }
        let others: Vec<&Node> = live_nodes.iter().filter(|n| *n != local).collect();
        if self.count >= others.len() {
            return others.into_iter().cloned().collect();
        }
        let mut rng = self.rng.lock();
        others
            .choose_multiple(&mut *rng, self.count)
            .map(|n| (*n).clone())
            .collect()
    }
}

/// Star topology: the coordinator tracks everyone, everyone tracks the
/// coordinator.
#[derive(Clone, Copy, Debug, Default)]
pub struct CoordinatorCohortNodeTrackingStrategy;

impl NodeTrackingStrategy for CoordinatorCohortNodeTrackingStrategy {
    fn tracked_nodes(&self, local: &Node, live_nodes: &[Node]) -> HashSet<Node> {
        match local_index(local, live_nodes) {
            None => HashSet::new(),
            Some(0) => live_nodes[1..].iter().cloned().collect(),
            Some(_) => HashSet::from([live_nodes[0].clone()]),
        }
    }
}

/// Ring topology.
///
/// Up to [`SINGLE_RING_LIMIT`] nodes form one ring. Larger clusters are split
/// into `ceil(sqrt(n))` contiguous sub-rings whose sizes differ by at most one.
/// Each node tracks its sub-ring successor; the first node of each sub-ring
/// also tracks the first node of the next sub-ring.
#[derive(Clone, Copy, Debug, Default)]
pub struct RingNodeTrackingStrategy;

impl RingNodeTrackingStrategy {
    /// Sub-ring boundaries as `(start, len)` pairs.
    pub fn rings(n: usize) -> Vec<(usize, usize)> {
        if n <= SINGLE_RING_LIMIT {
            return vec![(0, n)];
        }
        let count = ceil_sqrt(n);
        let base = n / count;
        let extra = n % count;

        let mut rings = Vec::with_capacity(count);
        let mut start = 0;
        for i in 0..count {
            let len = base + usize::from(i < extra);
            rings.push((start, len));
            start += len;
        }
        rings
    }
}

fn ceil_sqrt(n: usize) -> usize {
    let mut root = (n as f64).sqrt() as usize;
    while root * root < n {
        root += 1;
    }
    while root > 1 && (root - 1) * (root - 1) >= n {
        root -= 1;
    }
    root
}

impl NodeTrackingStrategy for RingNodeTrackingStrategy {
    fn tracked_nodes(&self, local: &Node, live_nodes: &[Node]) -> HashSet<Node> {
        let Some(index) = local_index(local, live_nodes) else {
            return HashSet::new();
        };

        let rings = Self::rings(live_nodes.len());
        let ring = rings
            .iter()
            .position(|(start, len)| index >= *start && index < start + len)
            .unwrap_or(0);
        let (start, len) = rings[ring];

        let mut tracked = HashSet::new();
        let successor = start + (index - start + 1) % len;
        if successor != index {
            tracked.insert(live_nodes[successor].clone());
        }

        if index == start && rings.len() > 1 {
            let (next_start, _) = rings[(ring + 1) % rings.len()];
            tracked.insert(live_nodes[next_start].clone());
        }
        tracked
    }
}
