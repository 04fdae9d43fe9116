//! A cluster node hosting the membership and flush stack on one compartment.
//!
//! ```text
//!  LocalTransport ──offer──▶ compartment ──▶ heartbeat ──▶ participant
//!                                                     └──▶ coordinator
//!  timers on the compartment: heartbeat, coordinator, cleanup
//! ```
//!
//! Inbound messages are queued on the node's compartment and handled on its
//! thread in arrival order. Parts travel encoded with the wire serializers.

use crate::error::Result;
use bytes::Bytes;
use cohort_compartment::{Compartment, CompartmentConfig, Task};
use cohort_flush::{
    decode_part, encode_part, FeedbackService, FlushConfig, FlushCoordinatorProtocol,
    FlushParticipantProtocol, FlushPart, NodeFeedbackData,
};
use cohort_membership::{
    CleanupConfig, CleanupManager, GroupMembership, GroupMembershipChange, GroupMembershipManager,
    HeartbeatConfig, HeartbeatProtocol, LiveNodeManager, Message, MessageFlags, MessageSender,
    Node, NodeTrackingStrategy,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

/// Configuration of one node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CohortConfig {
    #[serde(default)]
    pub compartment: CompartmentConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub flush: FlushConfig,
}

impl CohortConfig {
    pub fn validate(&self) -> Result<()> {
        self.compartment.validate()?;
        self.heartbeat.validate()?;
        self.cleanup.validate()?;
        self.flush.validate()?;
        Ok(())
    }
}

/// A message as it travels between nodes.
#[derive(Clone, Debug)]
struct WireMessage {
    source: Node,
    destination: Node,
    flags: MessageFlags,
    payload: Option<Bytes>,
}

/// In-process transport connecting nodes of one test or embedding.
#[derive(Default)]
pub struct LocalTransport {
    nodes: RwLock<HashMap<Uuid, Weak<CohortNode>>>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stop delivering to and from `node`.
    pub fn disconnect(&self, node: &Uuid) {
        self.nodes.write().remove(node);
    }

    fn register(&self, node: &Arc<CohortNode>) {
        self.nodes
            .write()
            .insert(node.node.id(), Arc::downgrade(node));
    }

    fn route(&self, message: Message<FlushPart>) {
        let (source, target) = {
            let nodes = self.nodes.read();
            (
                nodes.contains_key(&message.source.id()),
                nodes.get(&message.destination.id()).and_then(Weak::upgrade),
            )
        };
        let Some(target) = target.filter(|_| source) else {
            return;
        };
        let wire = WireMessage {
            source: message.source,
            destination: message.destination,
            flags: message.flags,
            payload: message.part.as_ref().map(encode_part),
        };
        if let Err(e) = target.deliver(wire) {
            debug!(node = %target.node, error = %e, "Dropping message");
        }
    }
}

struct TransportSender {
    transport: Weak<LocalTransport>,
}

impl MessageSender<FlushPart> for TransportSender {
    fn send(&self, message: Message<FlushPart>) {
        if let Some(transport) = self.transport.upgrade() {
            transport.route(message);
        }
    }
}

/// One member of the cluster.
pub struct CohortNode {
    node: Node,
    compartment: Compartment,
    live_nodes: Arc<LiveNodeManager>,
    membership: Arc<GroupMembershipManager>,
    participant: Arc<FlushParticipantProtocol>,
    coordinator: Arc<FlushCoordinatorProtocol>,
    heartbeat: Arc<HeartbeatProtocol<FlushPart>>,
    cleanup: Arc<CleanupManager>,
    node_feedback: Arc<FeedbackService<NodeFeedbackData>>,
}

impl CohortNode {
    pub fn new(
        node: Node,
        config: CohortConfig,
        strategy: Box<dyn NodeTrackingStrategy>,
        transport: &Arc<LocalTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let compartment = Compartment::new(config.compartment)?;
        let time_source = compartment.time_source();
        let sender: Arc<dyn MessageSender<FlushPart>> = Arc::new(TransportSender {
            transport: Arc::downgrade(transport),
        });

        let live_nodes = Arc::new(LiveNodeManager::new(node.clone()));
        let membership = Arc::new(GroupMembershipManager::new(node.clone()));
        let participant = FlushParticipantProtocol::new(membership.clone(), sender.clone());
        let coordinator = Arc::new(FlushCoordinatorProtocol::new(
            config.flush,
            participant.clone(),
            sender.clone(),
            time_source.clone(),
        )?);
        let heartbeat = Arc::new(HeartbeatProtocol::new(
            config.heartbeat,
            live_nodes.clone(),
            strategy,
            sender,
            time_source,
        )?);
        let cleanup = Arc::new(CleanupManager::new(config.cleanup, live_nodes.clone())?);
        let node_feedback = Arc::new(FeedbackService::new());

        participant.add_participant(node_feedback.clone());
        membership.add_listener(node_feedback.clone());
        live_nodes.add_failure_observer(participant.clone());
        live_nodes.add_failure_observer(coordinator.clone());
        cleanup.add_protocol(heartbeat.clone());
        cleanup.add_protocol(participant.clone());
        compartment.add_timer_processor(heartbeat.clone());
        compartment.add_timer_processor(coordinator.clone());
        compartment.add_timer_processor(cleanup.clone());

        let this = Arc::new(Self {
            node,
            compartment,
            live_nodes,
            membership,
            participant,
            coordinator,
            heartbeat,
            cleanup,
            node_feedback,
        });
        transport.register(&this);
        Ok(this)
    }

    pub fn start(&self) -> Result<()> {
        self.compartment.start()?;
        Ok(())
    }

    pub fn stop(&self) {
        self.compartment.stop();
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn compartment(&self) -> &Compartment {
        &self.compartment
    }

    pub fn live_nodes(&self) -> &Arc<LiveNodeManager> {
        &self.live_nodes
    }

    pub fn membership(&self) -> &Arc<GroupMembershipManager> {
        &self.membership
    }

    pub fn participant(&self) -> &Arc<FlushParticipantProtocol> {
        &self.participant
    }

    pub fn coordinator(&self) -> &Arc<FlushCoordinatorProtocol> {
        &self.coordinator
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatProtocol<FlushPart>> {
        &self.heartbeat
    }

    pub fn cleanup(&self) -> &Arc<CleanupManager> {
        &self.cleanup
    }

    pub fn node_feedback(&self) -> &Arc<FeedbackService<NodeFeedbackData>> {
        &self.node_feedback
    }

    /// Report connected nodes from the node's compartment.
    pub fn connect(&self, nodes: Vec<Node>) -> Result<()> {
        let live_nodes = self.live_nodes.clone();
        self.compartment.offer(Task::run(move || {
            live_nodes.on_nodes_connected(&nodes);
        }))?;
        Ok(())
    }

    /// Install an initial membership without a flush.
    pub fn bootstrap(&self, membership: GroupMembership) -> Result<()> {
        let change = GroupMembershipChange::initial(&membership);
        self.membership.install(membership, change)?;
        Ok(())
    }

    /// Start a transition coordinated by this node.
    pub fn install(&self, membership: GroupMembership) -> Result<()> {
        self.coordinator.install(membership, None)?;
        Ok(())
    }

    /// Resume the transition of a failed coordinator.
    pub fn take_over(&self, failed: &[Uuid]) -> Result<()> {
        self.coordinator.take_over(failed)?;
        Ok(())
    }

    fn deliver(self: &Arc<Self>, message: WireMessage) -> Result<()> {
        let this = self.clone();
        self.compartment
            .offer(Task::run(move || this.dispatch(message)))?;
        Ok(())
    }

    fn dispatch(&self, wire: WireMessage) {
        let message = match wire.payload {
            Some(payload) => match decode_part(payload) {
                Ok(part) => Message::new(wire.source, wire.destination, part).with_flags(wire.flags),
                Err(e) => {
                    warn!(from = %wire.source, error = %e, "Dropping undecodable message");
                    return;
                }
            },
            None => Message::signal(wire.source, wire.destination, wire.flags),
        };

        let Some(message) = self.heartbeat.receive(message) else {
            return;
        };
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

impl Drop for CohortNode {
    fn drop(&mut self) {
        self.compartment.stop();
    }
}
