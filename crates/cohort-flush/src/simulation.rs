//! Deterministic in-process cluster for exercising the flush protocols.
//!
//! Every node owns the full protocol stack (live nodes, membership manager,
//! participant and coordinator protocols, feedback services). Messages are
//! encoded with the wire serializers, queued on one simulated network and
//! delivered one at a time, so runs are reproducible for a given seed.

use crate::coordinator::{FlushConfig, FlushCoordinatorProtocol};
use crate::error::Result;
use crate::feedback::{DataLossFeedbackData, FeedbackService, GroupFeedbackData, NodeFeedbackData};
use crate::messages::{FlushPart, FlushPhase};
use crate::protocol::FlushParticipantProtocol;
use crate::serializers::{decode_part, encode_part};
use bytes::Bytes;
use cohort_compartment::ManualTimeSource;
use cohort_membership::{
    Group, GroupMembership, GroupMembershipChange, GroupMembershipManager, GroupOptions,
    LiveNodeManager, Message, MessageSender, Node,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Network configuration for simulation
#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    /// Probability of message loss (0.0 - 1.0)
    pub loss_rate: f64,
    /// Probability of message duplication (0.0 - 1.0)
    pub dup_rate: f64,
}

impl NetworkConfig {
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Default::default()
        }
    }

    pub fn with_dups(dup_rate: f64) -> Self {
        Self {
            dup_rate,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    source: Node,
    destination: Node,
    bytes: Bytes,
}

#[derive(Debug, Default)]
struct NetworkStats {
    sent: usize,
    lost: usize,
    duplicated: usize,
    delivered: usize,
}

/// Shared message queue between simulated nodes.
pub struct SimulatedNetwork {
    config: NetworkConfig,
    in_flight: Mutex<VecDeque<Envelope>>,
    rng: Mutex<StdRng>,
    stats: Mutex<NetworkStats>,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig, seed: u64) -> Self {
        Self {
            config,
            in_flight: Mutex::new(VecDeque::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            stats: Mutex::new(NetworkStats::default()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn sent(&self) -> usize {
        self.stats.lock().sent
    }

    pub fn lost(&self) -> usize {
        self.stats.lock().lost
    }

    pub fn duplicated(&self) -> usize {
        self.stats.lock().duplicated
    }

    pub fn delivered(&self) -> usize {
        self.stats.lock().delivered
    }

    fn push(&self, envelope: Envelope) {
        let (lose, duplicate) = {
            let mut rng = self.rng.lock();
            (
                rng.gen::<f64>() < self.config.loss_rate,
                rng.gen::<f64>() < self.config.dup_rate,
            )
        };

        let mut stats = self.stats.lock();
        stats.sent += 1;
        if lose {
            stats.lost += 1;
            return;
        }
        let mut in_flight = self.in_flight.lock();
        if duplicate {
            stats.duplicated += 1;
            in_flight.push_back(envelope.clone());
        }
        in_flight.push_back(envelope);
    }

    fn pop(&self) -> Option<Envelope> {
        self.in_flight.lock().pop_front()
    }
}

struct NetworkSender {
    network: Arc<SimulatedNetwork>,
}

impl MessageSender<FlushPart> for NetworkSender {
    fn send(&self, message: Message<FlushPart>) {
        let Some(part) = message.part else {
            return;
        };
        self.network.push(Envelope {
            source: message.source,
            destination: message.destination,
            bytes: encode_part(&part),
        });
    }
}

/// Protocol stack of one simulated node.
pub struct SimulatedNode {
    pub node: Node,
    pub live_nodes: Arc<LiveNodeManager>,
    pub membership: Arc<GroupMembershipManager>,
    pub participant: Arc<FlushParticipantProtocol>,
    pub coordinator: Arc<FlushCoordinatorProtocol>,
    pub node_feedback: Arc<FeedbackService<NodeFeedbackData>>,
    pub group_feedback: Arc<FeedbackService<GroupFeedbackData>>,
    pub data_loss_feedback: Arc<FeedbackService<DataLossFeedbackData>>,
}

impl SimulatedNode {
    fn new(
        node: Node,
        network: &Arc<SimulatedNetwork>,
        time: &Arc<ManualTimeSource>,
        config: &FlushConfig,
    ) -> Result<Self> {
        let sender: Arc<dyn MessageSender<FlushPart>> = Arc::new(NetworkSender {
            network: network.clone(),
        });
        let live_nodes = Arc::new(LiveNodeManager::new(node.clone()));
        let membership = Arc::new(GroupMembershipManager::new(node.clone()));
        let participant = FlushParticipantProtocol::new(membership.clone(), sender.clone());
        let coordinator = Arc::new(FlushCoordinatorProtocol::new(
            config.clone(),
            participant.clone(),
            sender,
            time.clone(),
        )?);

        let node_feedback = Arc::new(FeedbackService::<NodeFeedbackData>::new());
        let group_feedback = Arc::new(FeedbackService::<GroupFeedbackData>::new());
        let data_loss_feedback = Arc::new(FeedbackService::<DataLossFeedbackData>::new());
        participant.add_participant(node_feedback.clone());
        participant.add_participant(group_feedback.clone());
        participant.add_participant(data_loss_feedback.clone());
        membership.add_listener(node_feedback.clone());
        membership.add_listener(group_feedback.clone());
        membership.add_listener(data_loss_feedback.clone());

        live_nodes.add_failure_observer(participant.clone());
        live_nodes.add_failure_observer(coordinator.clone());

        Ok(Self {
            node,
            live_nodes,
            membership,
            participant,
            coordinator,
            node_feedback,
            group_feedback,
            data_loss_feedback,
        })
    }

    fn receive(&self, message: Message<FlushPart>) {
        let for_coordinator = message
            .part
            .as_ref()
            .map_or(false, FlushPart::is_for_coordinator);
        if for_coordinator {
            self.coordinator.receive(message);
        } else {
            self.participant.receive(message);
        }
    }
}

/// A cluster of simulated nodes sharing one network and one clock.
pub struct FlushCluster {
    nodes: Vec<SimulatedNode>,
    crashed: HashSet<Uuid>,
    network: Arc<SimulatedNetwork>,
    time: Arc<ManualTimeSource>,
    group_id: Uuid,
}

impl FlushCluster {
    /// Create `n` mutually connected nodes.
    pub fn new(n: usize, config: NetworkConfig, seed: u64) -> Result<Self> {
        Self::with_flush_config(n, config, seed, FlushConfig::default())
    }

    pub fn with_flush_config(
        n: usize,
        config: NetworkConfig,
        seed: u64,
        flush_config: FlushConfig,
    ) -> Result<Self> {
        let network = Arc::new(SimulatedNetwork::new(config, seed));
        let time = Arc::new(ManualTimeSource::new(0));
        let nodes = (0..n)
            .map(|i| {
                let node = Node::with_id(
                    Uuid::from_u128(i as u128 + 1),
                    format!("node-{}", i),
                    "sim",
                    format!("sim://node-{}", i),
                    BTreeMap::new(),
                );
                SimulatedNode::new(node, &network, &time, &flush_config)
            })
            .collect::<Result<Vec<_>>>()?;

        let all: Vec<Node> = nodes.iter().map(|n| n.node.clone()).collect();
        for node in &nodes {
            node.live_nodes.on_nodes_connected(&all);
        }

        Ok(Self {
            nodes,
            crashed: HashSet::new(),
            network,
            time,
            group_id: Uuid::from_u128(0xc0),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &SimulatedNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[SimulatedNode] {
        &self.nodes
    }

    pub fn network(&self) -> &SimulatedNetwork {
        &self.network
    }

    pub fn time(&self) -> &ManualTimeSource {
        &self.time
    }

    /// Membership `id` made of the nodes at `members`, in that order.
    pub fn membership(&self, id: u64, members: &[usize]) -> GroupMembership {
        let members = members.iter().map(|&i| self.nodes[i].node.clone()).collect();
        GroupMembership::new(
            id,
            Group::new(
                self.group_id,
                "sim-group",
                "sim://group",
                GroupOptions::default(),
                id,
                members,
                true,
            ),
        )
    }

    /// Install `membership` on its members without running a flush.
    pub fn bootstrap(&self, membership: &GroupMembership) -> Result<()> {
        let change = GroupMembershipChange::initial(membership);
        for node in &self.nodes {
            if membership.contains(&node.node.id()) {
                node.membership.install(membership.clone(), change.clone())?;
            }
        }
        Ok(())
    }

    /// Start a transition coordinated by the node at `coordinator`.
    pub fn install(&self, coordinator: usize, membership: GroupMembership) -> Result<()> {
        self.nodes[coordinator].coordinator.install(membership, None)
    }

    /// Deliver the next message. Returns false when nothing is in flight.
    pub fn step(&self) -> bool {
        let Some(envelope) = self.network.pop() else {
            return false;
        };
        if self.crashed.contains(&envelope.source.id())
            || self.crashed.contains(&envelope.destination.id())
        {
            return true;
        }
        let Some(target) = self
            .nodes
            .iter()
            .find(|n| n.node.id() == envelope.destination.id())
        else {
            return true;
        };

        match decode_part(envelope.bytes) {
            Ok(part) => {
                self.network.stats.lock().delivered += 1;
                target.receive(Message::new(envelope.source, envelope.destination, part));
            }
            Err(e) => warn!(error = %e, "Dropping undecodable message"),
        }
        true
    }

    /// Deliver messages until the network is quiet or `max_steps` ran.
    pub fn run(&self, max_steps: usize) -> usize {
        let mut steps = 0;
        while steps < max_steps && self.step() {
            steps += 1;
        }
        steps
    }

    /// Advance the clock and fire the coordinator timers of live nodes.
    pub fn advance(&self, millis: u64) {
        let now = self.time.advance(millis);
        for node in self.live() {
            node.coordinator.on_timer(now);
        }
    }

    /// Stop a node: its messages are dropped and every other node sees it
    /// fail.
    pub fn crash(&mut self, index: usize) {
        let failed = self.nodes[index].node.clone();
        self.crashed.insert(failed.id());
        for node in self.live() {
            node.live_nodes.on_nodes_failed(std::slice::from_ref(&failed));
        }
    }

    pub fn is_crashed(&self, index: usize) -> bool {
        self.crashed.contains(&self.nodes[index].node.id())
    }

    fn live(&self) -> impl Iterator<Item = &SimulatedNode> {
        self.nodes
            .iter()
            .filter(|n| !self.crashed.contains(&n.node.id()))
    }

    /// Check that all live members of `membership` installed it and are idle.
    pub fn converged(&self, membership: &GroupMembership) -> bool {
        self.live()
            .filter(|n| membership.contains(&n.node.id()))
            .all(|n| {
                n.membership.membership_id() == Some(membership.id())
                    && n.participant.phase() == FlushPhase::Ready
            })
    }
}
