//! Flush coordinator protocol: drives one membership transition across the
//! members of the new membership.
//!
//! ```text
//! install(new, delta)
//!   │ FlushStart ─▶ all            (delta to holders of old, full to joiners)
//!   │ ◀─ ExchangeGet from all
//!   │ ExchangeSet ─▶ all
//!   │ ◀─ Response(STABILIZE) from all
//!   │ Process ─▶ all               (only if some node required processing)
//!   │ ◀─ Response(PROCESS) from all
//!   │ End ─▶ all
//!   │ ◀─ Response(READY) from all
//!   ▼ listeners notified
//! ```
//!
//! A member failing during stabilization causes the flush start to be resent
//! to the survivors. Later phases stop waiting for the failed member. A phase
//! that makes no progress within `flush_timeout_ms` resends its message to
//! the nodes still awaited.

use crate::error::{FlushError, Result};
use crate::messages::{
    ExchangeSetEntry, FlushExchangeGetMessagePart, FlushExchangeSetMessagePart, FlushMessageType,
    FlushPart, FlushPhase, FlushResponseMessagePart, FlushStartMessagePart,
    FlushStateResponseMessagePart, MembershipUpdate,
};
use crate::protocol::FlushParticipantProtocol;
use bytes::Bytes;
use cohort_compartment::{
    notify_isolated, CompartmentTimerProcessor, ProcessorList, TimeSource,
};
use cohort_membership::{
    FailureObserver, GroupMembership, GroupMembershipDelta, GroupMembershipManager, Message,
    MessageSender, Node,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Coordinator tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlushConfig {
    /// Time without progress after which the current phase message is resent.
    pub flush_timeout_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        FlushConfig {
            flush_timeout_ms: 10_000,
        }
    }
}

impl FlushConfig {
    pub fn validate(&self) -> Result<()> {
        if self.flush_timeout_ms == 0 {
            return Err(FlushError::InvalidConfig(
                "flush_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Notified on the coordinator once every member acknowledged the end.
pub trait FlushCoordinatorListener: Send + Sync {
    fn on_flush_completed(&self, membership: &GroupMembership);
}

/// Stage of the transition driven by this coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorStage {
    RequestingState,
    Stabilizing,
    Processing,
    Ending,
}

#[derive(Debug)]
struct Transition {
    stage: CoordinatorStage,
    old: Option<GroupMembership>,
    new: GroupMembership,
    delta: Option<GroupMembershipDelta>,
    // Membership installed on each member, to choose delta or full starts.
    installed: HashMap<Uuid, Option<u64>>,
    failed: HashSet<Uuid>,
    awaiting: HashSet<Uuid>,
    awaiting_exchange: HashSet<Uuid>,
    exchange: BTreeMap<Uuid, Vec<(Uuid, Bytes)>>,
    exchange_sent: bool,
    processing_required: bool,
    states: HashMap<Uuid, FlushStateResponseMessagePart>,
    last_progress: u64,
}

impl Transition {
    fn new(
        stage: CoordinatorStage,
        old: Option<GroupMembership>,
        new: GroupMembership,
        delta: Option<GroupMembershipDelta>,
        failed: HashSet<Uuid>,
        now: u64,
    ) -> Self {
        let mut transition = Transition {
            stage,
            old,
            new,
            delta,
            installed: HashMap::new(),
            failed,
            awaiting: HashSet::new(),
            awaiting_exchange: HashSet::new(),
            exchange: BTreeMap::new(),
            exchange_sent: false,
            processing_required: false,
            states: HashMap::new(),
            last_progress: now,
        };
        transition.awaiting = transition.survivor_ids();
        transition
    }

    fn membership_id(&self) -> u64 {
        self.new.id()
    }

    fn survivors(&self) -> Vec<Node> {
        self.new
            .members()
            .iter()
            .filter(|n| !self.failed.contains(&n.id()))
            .cloned()
            .collect()
    }

    fn survivor_ids(&self) -> HashSet<Uuid> {
        self.survivors().iter().map(Node::id).collect()
    }

    fn reset_stabilize(&mut self, now: u64) {
        self.stage = CoordinatorStage::Stabilizing;
        self.awaiting = self.survivor_ids();
        self.awaiting_exchange = self.awaiting.clone();
        self.exchange.clear();
        self.exchange_sent = false;
        self.processing_required = false;
        self.last_progress = now;
    }

    fn start_part(&self, member: &Node) -> FlushPart {
        let holds_old = match (&self.old, self.installed.get(&member.id())) {
            (Some(old), Some(installed)) => *installed == Some(old.id()),
            (Some(old), None) => old.contains(&member.id()),
            (None, _) => false,
        };
        let membership = match (&self.delta, holds_old) {
            (Some(delta), true) => MembershipUpdate::Delta(delta.clone()),
            _ => MembershipUpdate::Full(self.new.clone()),
        };
        FlushPart::Start(FlushStartMessagePart {
            group_forming: self.old.is_none(),
            membership,
        })
    }

    fn exchange_set(&self) -> FlushPart {
        FlushPart::ExchangeSet(FlushExchangeSetMessagePart {
            membership_id: self.membership_id(),
            entries: self
                .exchange
                .iter()
                .map(|(participant, nodes)| ExchangeSetEntry {
                    participant: *participant,
                    nodes: nodes.clone(),
                })
                .collect(),
        })
    }
}

enum Progress {
    Pending,
    Completed(GroupMembership),
}

/// Coordinator side of the flush protocol.
pub struct FlushCoordinatorProtocol {
    config: FlushConfig,
    local: Node,
    manager: Arc<GroupMembershipManager>,
    participant: Arc<FlushParticipantProtocol>,
    sender: Arc<dyn MessageSender<FlushPart>>,
    time_source: Arc<dyn TimeSource>,
    listeners: ProcessorList<dyn FlushCoordinatorListener>,
    state: Mutex<Option<Transition>>,
}

impl FlushCoordinatorProtocol {
    pub fn new(
        config: FlushConfig,
        participant: Arc<FlushParticipantProtocol>,
        sender: Arc<dyn MessageSender<FlushPart>>,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            local: participant.local_node().clone(),
            manager: participant.membership_manager().clone(),
            participant,
            sender,
            time_source,
            listeners: ProcessorList::new(),
            state: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    pub fn add_listener(&self, listener: Arc<dyn FlushCoordinatorListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn FlushCoordinatorListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Id of the membership being installed, if a transition is running.
    pub fn in_progress(&self) -> Option<u64> {
        self.state.lock().as_ref().map(Transition::membership_id)
    }

    pub fn stage(&self) -> Option<CoordinatorStage> {
        self.state.lock().as_ref().map(|t| t.stage)
    }

    /// Start a transition to `membership`.
    ///
    /// When a membership is installed, `membership` must succeed it and the
    /// delta is computed if not given. The local node must coordinate the
    /// new membership.
    pub fn install(
        &self,
        membership: GroupMembership,
        delta: Option<GroupMembershipDelta>,
    ) -> Result<()> {
        if membership.coordinator() != Some(&self.local) {
            return Err(FlushError::NotCoordinator);
        }

        let old = self.manager.membership();
        let delta = match &old {
            Some(old) => {
                let delta = match delta {
                    Some(delta) => delta,
                    None => GroupMembershipDelta::between(old, &membership, &HashSet::new())?,
                };
                if delta.apply(old)? != membership {
                    return Err(FlushError::InvalidMembership(format!(
                        "delta {} does not lead to the installed membership",
                        delta.id
                    )));
                }
                Some(delta)
            }
            None => None,
        };

        let messages = {
            let mut state = self.state.lock();
            if let Some(current) = state.as_ref() {
                return Err(FlushError::FlushInProgress(current.membership_id()));
            }
            let mut transition = Transition::new(
                CoordinatorStage::Stabilizing,
                old,
                membership,
                delta,
                HashSet::new(),
                self.time_source.current_time(),
            );
            transition.reset_stabilize(self.time_source.current_time());
            info!(
                membership = transition.membership_id(),
                members = transition.new.members().len(),
                group_forming = transition.old.is_none(),
                "Flush coordination started"
            );
            let messages = self.start_messages(&transition);
            *state = Some(transition);
            messages
        };

        self.send_all(messages);
        Ok(())
    }

    /// Resume a transition interrupted by the failure of its coordinator.
    ///
    /// Every surviving member reports its flush state; the next phase is
    /// chosen once all have answered.
    pub fn take_over(&self, failed: &[Uuid]) -> Result<()> {
        let target = match self.participant.flush() {
            Some(flush) => flush.new_membership().clone(),
            None => self.manager.membership().ok_or(FlushError::NoMembership)?,
        };
        let failed: HashSet<Uuid> = failed.iter().copied().collect();
        let first_survivor = target.members().iter().find(|n| !failed.contains(&n.id()));
        if first_survivor != Some(&self.local) {
            return Err(FlushError::NotCoordinator);
        }

        let messages = {
            let mut state = self.state.lock();
            if let Some(current) = state.as_ref() {
                return Err(FlushError::FlushInProgress(current.membership_id()));
            }
            let now = self.time_source.current_time();
            let transition = Transition::new(
                CoordinatorStage::RequestingState,
                self.manager.membership(),
                target,
                None,
                failed,
                now,
            );
            info!(
                membership = transition.membership_id(),
                failed = transition.failed.len(),
                "Taking over flush coordination"
            );
            let messages = self.broadcast(&transition, &transition.awaiting, || {
                FlushPart::control(FlushMessageType::RequestState, transition.membership_id())
            });
            *state = Some(transition);
            messages
        };

        self.send_all(messages);
        Ok(())
    }

    /// Handle a message addressed to the coordinator side.
    pub fn receive(&self, message: Message<FlushPart>) {
        let Some(part) = message.part else {
            return;
        };
        let source = message.source;

        let (messages, progress) = {
            let mut state = self.state.lock();
            let Some(transition) = state.as_mut() else {
                debug!(from = %source, "Flush part without transition");
                return;
            };
            if transition.failed.contains(&source.id()) {
                return;
            }

            let mut messages = Vec::new();
            match part {
                FlushPart::ExchangeGet(get) => {
                    self.on_exchange_get(transition, &source, get, &mut messages)
                }
                FlushPart::Response(response) => {
                    self.on_response(transition, &source, response)
                }
                FlushPart::StateResponse(response) => {
                    if transition.stage == CoordinatorStage::RequestingState
                        && transition.awaiting.remove(&source.id())
                    {
                        transition.states.insert(source.id(), response);
                    }
                }
                other => {
                    warn!(part = ?other, "Unexpected part for flush coordinator");
                    return;
                }
            }
            transition.last_progress = self.time_source.current_time();

            let progress = self.advance(transition, &mut messages);
            if matches!(progress, Progress::Completed(_)) {
                *state = None;
            }
            (messages, progress)
        };

        self.send_all(messages);
        self.complete(progress);
    }

    fn on_exchange_get(
        &self,
        transition: &mut Transition,
        source: &Node,
        get: FlushExchangeGetMessagePart,
        messages: &mut Vec<Message<FlushPart>>,
    ) {
        if transition.stage != CoordinatorStage::Stabilizing
            || get.membership_id != transition.membership_id()
            || !transition.awaiting_exchange.remove(&source.id())
        {
            return;
        }
        if !get.failed.is_empty() || !get.left.is_empty() {
            debug!(
                from = %source,
                failed = get.failed.len(),
                left = get.left.len(),
                "Member reported departed nodes"
            );
        }
        transition.processing_required |= get.processing_required;
        for data in get.data {
            transition
                .exchange
                .entry(data.participant)
                .or_default()
                .push((source.id(), data.data));
        }

        if transition.awaiting_exchange.is_empty() && !transition.exchange_sent {
            transition.exchange_sent = true;
            let part = transition.exchange_set();
            messages.extend(self.broadcast(transition, &transition.survivor_ids(), || {
                part.clone()
            }));
        }
    }

    fn on_response(
        &self,
        transition: &mut Transition,
        source: &Node,
        response: FlushResponseMessagePart,
    ) {
        if response.membership_id != transition.membership_id() {
            return;
        }
        let expected = match transition.stage {
            CoordinatorStage::Stabilizing => FlushPhase::Stabilize,
            CoordinatorStage::Processing => FlushPhase::Process,
            CoordinatorStage::Ending => FlushPhase::Ready,
            CoordinatorStage::RequestingState => return,
        };
        if response.phase == expected {
            transition.awaiting.remove(&source.id());
        }
    }

    // Moves to the next stage once nothing is awaited.
    fn advance(
        &self,
        transition: &mut Transition,
        messages: &mut Vec<Message<FlushPart>>,
    ) -> Progress {
        if !transition.awaiting.is_empty() {
            return Progress::Pending;
        }
        let id = transition.membership_id();
        let survivors = transition.survivor_ids();
        match transition.stage {
            CoordinatorStage::Stabilizing => {
                if !transition.exchange_sent {
                    return Progress::Pending;
                }
                let kind = if transition.processing_required {
                    transition.stage = CoordinatorStage::Processing;
                    FlushMessageType::Process
                } else {
                    transition.stage = CoordinatorStage::Ending;
                    FlushMessageType::End
                };
                debug!(membership = id, stage = ?transition.stage, "Flush stabilized");
                transition.awaiting = survivors.clone();
                messages.extend(self.broadcast(transition, &survivors, || {
                    FlushPart::control(kind, id)
                }));
                Progress::Pending
            }
            CoordinatorStage::Processing => {
                transition.stage = CoordinatorStage::Ending;
                transition.awaiting = survivors.clone();
                messages.extend(self.broadcast(transition, &survivors, || {
                    FlushPart::control(FlushMessageType::End, id)
                }));
                Progress::Pending
            }
            CoordinatorStage::Ending => {
                info!(membership = id, "Flush completed");
                Progress::Completed(transition.new.clone())
            }
            CoordinatorStage::RequestingState => self.resume(transition, messages),
        }
    }

    // Chooses the phase to resume from the collected member states.
    fn resume(
        &self,
        transition: &mut Transition,
        messages: &mut Vec<Message<FlushPart>>,
    ) -> Progress {
        let states = std::mem::take(&mut transition.states);
        self.restore_coordinator_states(&transition.new, &states);

        let target = transition.new.id();
        let survivors = transition.survivor_ids();
        let installed_anywhere = states
            .values()
            .any(|s| s.installed_membership_id == Some(target));
        let holding: Vec<&FlushStateResponseMessagePart> = states
            .values()
            .filter(|s| s.flush.as_ref().map(|f| f.membership.membership_id()) == Some(target))
            .collect();

        if holding.is_empty() {
            info!(membership = target, "No flush in flight, nothing to resume");
            return Progress::Completed(transition.new.clone());
        }

        transition.installed = states
            .iter()
            .map(|(id, s)| (*id, s.installed_membership_id))
            .collect();
        transition.processing_required = holding
            .iter()
            .any(|s| s.flush.as_ref().map_or(false, |f| f.processing_required));
        if transition.old.as_ref().map(|old| old.id() + 1) == Some(target) {
            transition.delta = transition.old.as_ref().and_then(|old| {
                GroupMembershipDelta::between(old, &transition.new, &transition.failed).ok()
            });
        } else {
            transition.old = None;
        }

        let all_hold = holding.len() == survivors.len();
        let kind = if installed_anywhere {
            transition.stage = CoordinatorStage::Ending;
            Some(FlushMessageType::End)
        } else if all_hold && holding.iter().any(|s| s.phase == FlushPhase::Process) {
            transition.stage = CoordinatorStage::Processing;
            Some(FlushMessageType::Process)
        } else {
            None
        };
        info!(membership = target, stage = ?kind, "Resuming flush");

        match kind {
            Some(kind) => {
                transition.awaiting = survivors.clone();
                messages.extend(self.broadcast(transition, &survivors, || {
                    FlushPart::control(kind, target)
                }));
            }
            None => {
                transition.reset_stabilize(self.time_source.current_time());
                messages.extend(self.start_messages(transition));
            }
        }
        Progress::Pending
    }

    fn restore_coordinator_states(
        &self,
        membership: &GroupMembership,
        states: &HashMap<Uuid, FlushStateResponseMessagePart>,
    ) {
        let mut by_participant: HashMap<Uuid, HashMap<Node, Bytes>> = HashMap::new();
        for (node, state) in states {
            let Some(node) = membership.find_member(node) else {
                continue;
            };
            for data in &state.coordinator_states {
                by_participant
                    .entry(data.participant)
                    .or_default()
                    .insert(node.clone(), data.data.clone());
            }
        }
        for participant in self.participant.participants().iter() {
            let Some(capability) = participant.coordinator_state() else {
                continue;
            };
            let states = by_participant
                .remove(&participant.participant_id())
                .unwrap_or_default();
            notify_isolated("flush coordinator state", || {
                capability.set_coordinator_state(&states)
            });
        }
    }

    fn start_messages(&self, transition: &Transition) -> Vec<Message<FlushPart>> {
        transition
            .survivors()
            .into_iter()
            .filter(|member| transition.awaiting.contains(&member.id()))
            .map(|member| {
                let part = transition.start_part(&member);
                Message::new(self.local.clone(), member, part)
            })
            .collect()
    }

    fn broadcast(
        &self,
        transition: &Transition,
        targets: &HashSet<Uuid>,
        part: impl Fn() -> FlushPart,
    ) -> Vec<Message<FlushPart>> {
        transition
            .survivors()
            .into_iter()
            .filter(|member| targets.contains(&member.id()))
            .map(|member| Message::new(self.local.clone(), member, part()))
            .collect()
    }

    fn send_all(&self, messages: Vec<Message<FlushPart>>) {
        for message in messages {
            self.sender.send(message);
        }
    }

    fn complete(&self, progress: Progress) {
        if let Progress::Completed(membership) = progress {
            for listener in self.listeners.snapshot().iter() {
                notify_isolated("flush coordinator listener", || {
                    listener.on_flush_completed(&membership)
                });
            }
        }
    }

    fn on_members_departed(&self, nodes: &[Node]) {
        let (messages, progress) = {
            let mut state = self.state.lock();
            let Some(transition) = state.as_mut() else {
                return;
            };
            let departed: Vec<Uuid> = nodes
                .iter()
                .map(Node::id)
                .filter(|id| transition.new.contains(id) && !transition.failed.contains(id))
                .collect();
            if departed.is_empty() {
                return;
            }
            transition.failed.extend(departed.iter().copied());
            warn!(
                membership = transition.membership_id(),
                departed = departed.len(),
                stage = ?transition.stage,
                "Members departed during flush"
            );

            let mut messages = Vec::new();
            if transition.stage == CoordinatorStage::Stabilizing {
                transition.reset_stabilize(self.time_source.current_time());
                messages.extend(self.start_messages(transition));
            } else {
                for id in &departed {
                    transition.awaiting.remove(id);
                }
            }

            let progress = self.advance(transition, &mut messages);
            if matches!(progress, Progress::Completed(_)) {
                *state = None;
            }
            (messages, progress)
        };

        self.send_all(messages);
        self.complete(progress);
    }

    /// Resend the current phase message when the transition stalled.
    pub fn on_timer(&self, now: u64) {
        let messages = {
            let mut state = self.state.lock();
            let Some(transition) = state.as_mut() else {
                return;
            };
            if now.saturating_sub(transition.last_progress) < self.config.flush_timeout_ms {
                return;
            }
            transition.last_progress = now;
            let id = transition.membership_id();
            warn!(
                membership = id,
                stage = ?transition.stage,
                awaiting = transition.awaiting.len() + transition.awaiting_exchange.len(),
                "Flush phase timed out, resending"
            );

            match transition.stage {
                CoordinatorStage::Stabilizing => {
                    let mut targets = transition.awaiting_exchange.clone();
                    let mut messages = Vec::new();
                    if transition.exchange_sent {
                        let part = transition.exchange_set();
                        messages.extend(self.broadcast(transition, &transition.awaiting, || {
                            part.clone()
                        }));
                    } else {
                        targets.extend(transition.awaiting.iter().copied());
                    }
                    messages.extend(
                        transition
                            .survivors()
                            .into_iter()
                            .filter(|m| targets.contains(&m.id()))
                            .map(|m| {
                                let part = transition.start_part(&m);
                                Message::new(self.local.clone(), m, part)
                            }),
                    );
                    messages
                }
                stage => {
                    let kind = match stage {
                        CoordinatorStage::Processing => FlushMessageType::Process,
                        CoordinatorStage::Ending => FlushMessageType::End,
                        _ => FlushMessageType::RequestState,
                    };
                    self.broadcast(transition, &transition.awaiting, || {
                        FlushPart::control(kind, id)
                    })
                }
            }
        };
        self.send_all(messages);
    }
}

impl FailureObserver for FlushCoordinatorProtocol {
    fn on_nodes_failed(&self, nodes: &[Node]) {
        self.on_members_departed(nodes);
    }

    fn on_nodes_left(&self, nodes: &[Node]) {
        self.on_members_departed(nodes);
    }
}

impl CompartmentTimerProcessor for FlushCoordinatorProtocol {
    fn on_timer(&self, current_time: u64) {
        FlushCoordinatorProtocol::on_timer(self, current_time);
    }
}
