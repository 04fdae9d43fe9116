//! Heartbeat-based failure detection.
//!
//! On every timer tick each tracked node is checked against the time its last
//! message was read:
//!
//! ```text
//! silent >= failure_detection_period            -> declare failed
//! silent >= heartbeat_start_period
//!   and since_last_request >= heartbeat_period  -> send HEARTBEAT_REQUEST
//! ```
//!
//! Any inbound message refreshes the sender's read time. Heartbeat flags are
//! consumed here and never reach upper layers.

use crate::cleanup::CleanupAware;
use crate::error::{MembershipError, Result};
use crate::live_nodes::LiveNodeManager;
use crate::message::{Message, MessageFlags, MessageSender};
use crate::node::Node;
use crate::tracking::NodeTrackingStrategy;
use cohort_compartment::{CompartmentTimerProcessor, TimeSource};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Heartbeat timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval at which the tracked node set is recomputed.
    pub track_period_ms: u64,

    /// Silence after which heartbeat requests start.
    pub heartbeat_start_period_ms: u64,

    /// Minimum interval between two requests to the same node.
    pub heartbeat_period_ms: u64,

    /// Silence after which a node is declared failed.
    pub failure_detection_period_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            track_period_ms: 500,
            heartbeat_start_period_ms: 1000,
            heartbeat_period_ms: 500,
            failure_detection_period_ms: 5000,
        }
    }
}

impl HeartbeatConfig {
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_period_ms == 0 || self.track_period_ms == 0 {
            return Err(MembershipError::InvalidConfig(
                "heartbeat and track periods must be positive".to_string(),
            ));
        }
        if self.failure_detection_period_ms < self.heartbeat_start_period_ms {
            return Err(MembershipError::InvalidConfig(format!(
                "failure_detection_period_ms {} is less than heartbeat_start_period_ms {}",
                self.failure_detection_period_ms, self.heartbeat_start_period_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TrackedNode {
    node: Node,
    last_read_time: u64,
    last_heartbeat_time: u64,
}

#[derive(Debug, Default)]
struct HeartbeatState {
    tracked: HashMap<Uuid, TrackedNode>,
    live_id: u64,
    last_track_time: u64,
    // Read times of senders not currently tracked, carried over when they
    // become tracked.
    last_read: HashMap<Uuid, u64>,
}

/// Failure detector for the nodes picked by a tracking strategy.
pub struct HeartbeatProtocol<P> {
    config: HeartbeatConfig,
    live_nodes: Arc<LiveNodeManager>,
    strategy: Box<dyn NodeTrackingStrategy>,
    sender: Arc<dyn MessageSender<P>>,
    time_source: Arc<dyn TimeSource>,
    state: Mutex<HeartbeatState>,
}

impl<P: Send + 'static> HeartbeatProtocol<P> {
    pub fn new(
        config: HeartbeatConfig,
        live_nodes: Arc<LiveNodeManager>,
        strategy: Box<dyn NodeTrackingStrategy>,
        sender: Arc<dyn MessageSender<P>>,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            live_nodes,
            strategy,
            sender,
            time_source,
            state: Mutex::new(HeartbeatState::default()),
        })
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Ids of the nodes currently tracked.
    pub fn tracked_nodes(&self) -> Vec<Uuid> {
        self.state.lock().tracked.keys().copied().collect()
    }

    /// Handle an inbound message. Returns the message to pass upwards, or
    /// `None` if it only carried heartbeat flags.
    pub fn receive(&self, message: Message<P>) -> Option<Message<P>> {
        let now = self.time_source.current_time();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let sender = message.source.id();
            match state.tracked.get_mut(&sender) {
                Some(tracked) => tracked.last_read_time = now,
                None => {
                    state.last_read.insert(sender, now);
                }
            }
        }

        if !message.flags.intersects(MessageFlags::HEARTBEAT) {
            return Some(message);
        }

        if message.flags.contains(MessageFlags::HEARTBEAT_REQUEST) {
            self.sender.send(Message::signal(
                message.destination.clone(),
                message.source.clone(),
                MessageFlags::HEARTBEAT_RESPONSE,
            ));
        }

        if message.part.is_none() {
            return None;
        }
        Some(Message {
            flags: message.flags.without(MessageFlags::HEARTBEAT),
            ..message
        })
    }

    /// Check tracked nodes, sending requests and declaring failures.
    pub fn on_timer(&self, now: u64) {
        let mut requests = Vec::new();
        let mut failed = Vec::new();
        {
            let mut state = self.state.lock();
            self.refresh_tracked(&mut state, now);

            for tracked in state.tracked.values_mut() {
                let silent = now.saturating_sub(tracked.last_read_time);
                if silent >= self.config.failure_detection_period_ms {
                    failed.push(tracked.node.clone());
                } else if silent >= self.config.heartbeat_start_period_ms
                    && now.saturating_sub(tracked.last_heartbeat_time)
                        >= self.config.heartbeat_period_ms
                {
                    tracked.last_heartbeat_time = now;
                    requests.push(tracked.node.clone());
                }
            }
            for node in &failed {
                state.tracked.remove(&node.id());
            }
        }

        if !requests.is_empty() {
            let local = self.live_nodes.local_node();
            for node in requests {
                self.sender.send(Message::signal(
                    local.clone(),
                    node,
                    MessageFlags::HEARTBEAT_REQUEST,
                ));
            }
        }

        if !failed.is_empty() {
            warn!(
                nodes = ?failed.iter().map(Node::name).collect::<Vec<_>>(),
                "Heartbeat failure detected"
            );
            self.live_nodes.on_nodes_failed(&failed);
        }
    }

    fn refresh_tracked(&self, state: &mut HeartbeatState, now: u64) {
        let live = self.live_nodes.state();
        if live.id() == state.live_id
            && now.saturating_sub(state.last_track_time) < self.config.track_period_ms
        {
            return;
        }
        state.live_id = live.id();
        state.last_track_time = now;

        let targets = self.strategy.tracked_nodes(live.local_node(), live.live_nodes());
        let mut previous = std::mem::take(&mut state.tracked);
        for node in targets {
            let tracked = previous.remove(&node.id()).unwrap_or_else(|| TrackedNode {
                last_read_time: state.last_read.remove(&node.id()).unwrap_or(now),
                last_heartbeat_time: 0,
                node: node.clone(),
            });
            state.tracked.insert(node.id(), tracked);
        }
        state.last_read.retain(|id, _| live.is_live(id));
        debug!(tracked = state.tracked.len(), "Heartbeat targets updated");
    }
}

impl<P: Send + 'static> CompartmentTimerProcessor for HeartbeatProtocol<P> {
    fn on_timer(&self, current_time: u64) {
        HeartbeatProtocol::on_timer(self, current_time);
    }
}

impl<P: Send + 'static> CleanupAware for HeartbeatProtocol<P> {
    fn cleanup(&self, is_dead: &dyn Fn(&Uuid) -> bool) {
        let mut state = self.state.lock();
        state.tracked.retain(|id, _| !is_dead(id));
        state.last_read.retain(|id, _| !is_dead(id));
    }
}
