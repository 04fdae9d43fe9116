//! Flush participant protocol: the per-node membership transition state
//! machine.
//!
//! ```text
//!          FlushStart              Process               End
//! READY ──────────────▶ STABILIZE ────────▶ PROCESS ───────────▶ READY
//!                           │                                     ▲
//!                           └──────────────── End ────────────────┘
//! ```
//!
//! Within a phase, every local participant must grant. When the last grant
//! arrives the node answers the coordinator with one response carrying the
//! failed and left nodes it knows of. State is mutated under the lock;
//! participant callbacks always run after the lock is released, so a
//! participant may grant synchronously from inside a callback.

use crate::error::{FlushError, Result};
use crate::flush::{Flush, GrantSink};
use crate::messages::{
    FlushExchangeGetMessagePart, FlushExchangeSetMessagePart, FlushMessageType, FlushPart,
    FlushPhase, FlushResponseMessagePart, FlushStartMessagePart, FlushStateInfo,
    FlushStateResponseMessagePart, MembershipUpdate, ParticipantData,
};
use crate::participant::FlushParticipant;
use bytes::Bytes;
use cohort_compartment::{notify_isolated, run_guarded, ProcessorList};
use cohort_membership::{
    CleanupAware, FailureObserver, GroupMembership, GroupMembershipChange, GroupMembershipDelta,
    GroupMembershipManager, Message, MessageSender, Node,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct ParticipantState {
    phase: FlushPhase,
    flush: Option<Flush>,
    update: Option<MembershipUpdate>,
    coordinator: Option<Node>,
    processing_required: bool,
    not_granted: HashSet<Uuid>,
    responded: bool,
    // Set while phase callbacks run; grants only update `not_granted`.
    in_callbacks: bool,
    failed: HashSet<Uuid>,
    left: HashSet<Uuid>,
}

impl ParticipantState {
    fn is_current(&self, flush: &Flush) -> bool {
        self.flush.as_ref().map_or(false, |f| f.same(flush))
    }

    fn active_flush(&self, membership_id: u64) -> Option<Flush> {
        self.flush
            .as_ref()
            .filter(|f| f.new_membership().id() == membership_id && !f.is_closed())
            .cloned()
    }
}

fn sorted(ids: &HashSet<Uuid>) -> Vec<Uuid> {
    let mut ids: Vec<Uuid> = ids.iter().copied().collect();
    ids.sort();
    ids
}

struct WeakSink(Weak<FlushParticipantProtocol>);

impl GrantSink for WeakSink {
    fn on_grant(&self, membership_id: u64, participant: Uuid) {
        if let Some(protocol) = self.0.upgrade() {
            protocol.on_grant(membership_id, participant);
        }
    }
}

/// Per-node side of the flush protocol.
pub struct FlushParticipantProtocol {
    local: Node,
    manager: Arc<GroupMembershipManager>,
    participants: ProcessorList<dyn FlushParticipant>,
    sender: Arc<dyn MessageSender<FlushPart>>,
    sink: Arc<dyn GrantSink>,
    state: Mutex<ParticipantState>,
}

impl FlushParticipantProtocol {
    pub fn new(
        manager: Arc<GroupMembershipManager>,
        sender: Arc<dyn MessageSender<FlushPart>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            local: manager.local_node().clone(),
            manager,
            participants: ProcessorList::new(),
            sender,
            sink: Arc::new(WeakSink(weak.clone())),
            state: Mutex::new(ParticipantState::default()),
        })
    }

    pub fn local_node(&self) -> &Node {
        &self.local
    }

    pub fn membership_manager(&self) -> &Arc<GroupMembershipManager> {
        &self.manager
    }

    pub fn add_participant(&self, participant: Arc<dyn FlushParticipant>) {
        self.participants.add(participant);
    }

    pub fn remove_participant(&self, participant: &Arc<dyn FlushParticipant>) -> bool {
        self.participants.remove(participant)
    }

    pub fn participants(&self) -> Arc<Vec<Arc<dyn FlushParticipant>>> {
        self.participants.snapshot()
    }

    pub fn phase(&self) -> FlushPhase {
        self.state.lock().phase
    }

    /// The flush in progress, if any.
    pub fn flush(&self) -> Option<Flush> {
        self.state.lock().flush.clone()
    }

    /// Participants that have not granted the current phase.
    pub fn not_granted(&self) -> usize {
        self.state.lock().not_granted.len()
    }

    /// Graceful exit is only allowed between transitions.
    pub fn request_exit(&self) -> bool {
        self.state.lock().phase == FlushPhase::Ready
    }

    /// Handle a message addressed to the participant side.
    pub fn receive(&self, message: Message<FlushPart>) {
        let Some(part) = message.part else {
            return;
        };
        let source = message.source;

        match part {
            FlushPart::Start(start) => {
                if let Err(e) = self.on_flush_start(source, start) {
                    warn!(error = %e, "Rejected flush start");
                }
            }
            FlushPart::ExchangeSet(set) => self.on_exchange_set(set),
            FlushPart::Control(control) => match control.kind {
                FlushMessageType::Process => self.on_process(source, control.membership_id),
                FlushMessageType::End => self.on_end(source, control.membership_id),
                FlushMessageType::RequestState => self.on_request_state(source),
            },
            other => warn!(part = ?other, "Unexpected part for flush participant"),
        }
    }

    fn on_flush_start(&self, source: Node, start: FlushStartMessagePart) -> Result<()> {
        let current = self.manager.membership();
        let new_membership = match &start.membership {
            MembershipUpdate::Full(membership) => membership.clone(),
            MembershipUpdate::Delta(delta) => {
                let current = current.as_ref().ok_or(FlushError::NoMembership)?;
                delta.apply(current)?
            }
        };
        if let Some(current) = &current {
            if new_membership.id() <= current.id() {
                return Err(FlushError::InvalidMembership(format!(
                    "membership {} is not newer than installed {}",
                    new_membership.id(),
                    current.id()
                )));
            }
        }

        let participants = self.participants.snapshot();
        let flush = {
            let mut state = self.state.lock();
            let existing = state.active_flush(new_membership.id());
            let flush = match existing {
                Some(existing) => {
                    if state.phase != FlushPhase::Stabilize {
                        debug!(
                            membership = new_membership.id(),
                            phase = ?state.phase,
                            "Ignoring flush start outside stabilization"
                        );
                        return Ok(());
                    }
                    debug!(membership = new_membership.id(), "Flush start resent");
                    state.responded = false;
                    existing
                }
                None => {
                    if let Some(previous) = state.flush.take() {
                        previous.close();
                    }
                    let flush = self.create_flush(&start, current.as_ref(), new_membership);
                    state.phase = FlushPhase::Stabilize;
                    state.flush = Some(flush.clone());
                    state.update = Some(start.membership.clone());
                    state.processing_required = false;
                    state.not_granted = participants.iter().map(|p| p.participant_id()).collect();
                    state.responded = false;
                    debug!(
                        membership = flush.new_membership().id(),
                        participants = participants.len(),
                        "Flush started"
                    );
                    flush
                }
            };
            state.coordinator = Some(source);
            state.in_callbacks = true;
            flush
        };

        let processing_required = participants
            .iter()
            .any(|p| run_guarded(|| Ok(p.is_flush_processing_required(&flush))).unwrap_or(false));
        for participant in participants.iter() {
            notify_isolated("flush participant", || participant.start_flush(&flush));
        }
        let data = participants
            .iter()
            .filter_map(|p| {
                let exchange = p.exchange()?;
                run_guarded(|| Ok(exchange.get_exchange_data(&flush)))
                    .ok()
                    .flatten()
                    .map(|data| ParticipantData {
                        participant: p.participant_id(),
                        data,
                    })
            })
            .collect();

        let (coordinator, exchange, response) = {
            let mut state = self.state.lock();
            if !state.is_current(&flush) {
                return Ok(());
            }
            state.processing_required |= processing_required;
            state.in_callbacks = false;
            let exchange = FlushExchangeGetMessagePart {
                membership_id: flush.new_membership().id(),
                processing_required: state.processing_required,
                data,
                failed: sorted(&state.failed),
                left: sorted(&state.left),
            };
            (state.coordinator.clone(), exchange, self.take_response(&mut state))
        };

        if let Some(coordinator) = coordinator {
            self.sender.send(Message::new(
                self.local.clone(),
                coordinator,
                FlushPart::ExchangeGet(exchange),
            ));
        }
        if let Some(response) = response {
            self.sender.send(response);
        }
        Ok(())
    }

    fn create_flush(
        &self,
        start: &FlushStartMessagePart,
        current: Option<&GroupMembership>,
        new_membership: GroupMembership,
    ) -> Flush {
        let predecessor = current.filter(|c| c.id() + 1 == new_membership.id());
        let change = match (&start.membership, predecessor) {
            (MembershipUpdate::Delta(delta), Some(old)) => delta.change(old),
            (MembershipUpdate::Full(_), Some(old)) => {
                GroupMembershipDelta::between(old, &new_membership, &HashSet::new())
                    .map(|delta| delta.change(old))
                    .unwrap_or_else(|_| GroupMembershipChange::initial(&new_membership))
            }
            _ => GroupMembershipChange::initial(&new_membership),
        };
        Flush::new(
            start.group_forming,
            predecessor.cloned(),
            new_membership,
            change,
            self.sink.clone(),
        )
    }

    fn on_exchange_set(&self, set: FlushExchangeSetMessagePart) {
        let flush = {
            let state = self.state.lock();
            match state.active_flush(set.membership_id) {
                Some(flush) if state.phase == FlushPhase::Stabilize => flush,
                _ => {
                    debug!(membership = set.membership_id, "Dropping stale exchange set");
                    return;
                }
            }
        };

        for participant in self.participants.snapshot().iter() {
            let Some(exchange) = participant.exchange() else {
                continue;
            };
            let id = participant.participant_id();
            let Some(entry) = set.entries.iter().find(|e| e.participant == id) else {
                continue;
            };
            let data: HashMap<Node, Bytes> = entry
                .nodes
                .iter()
                .filter_map(|(node, data)| {
                    flush
                        .new_membership()
                        .find_member(node)
                        .map(|n| (n.clone(), data.clone()))
                })
                .collect();
            notify_isolated("flush exchange", || exchange.set_exchange_data(&flush, &data));
        }
    }

    fn on_process(&self, source: Node, membership_id: u64) {
        let flush = {
            let mut state = self.state.lock();
            let Some(flush) = state.active_flush(membership_id) else {
                warn!(membership = membership_id, "Process without matching flush");
                return;
            };
            state.coordinator = Some(source);
            match state.phase {
                FlushPhase::Process => {
                    state.responded = false;
                    let response = self.take_response(&mut state);
                    drop(state);
                    if let Some(response) = response {
                        self.sender.send(response);
                    }
                    return;
                }
                FlushPhase::Stabilize => {}
                FlushPhase::Ready => return,
            }
            state.phase = FlushPhase::Process;
            state.not_granted = self
                .participants
                .snapshot()
                .iter()
                .map(|p| p.participant_id())
                .collect();
            state.responded = false;
            state.in_callbacks = true;
            debug!(membership = membership_id, "Flush processing");
            flush
        };

        let participants = self.participants.snapshot();
        for participant in participants.iter() {
            notify_isolated("flush participant", || participant.before_process_flush(&flush));
        }
        for participant in participants.iter() {
            let required =
                run_guarded(|| Ok(participant.is_flush_processing_required(&flush))).unwrap_or(false);
            if required {
                notify_isolated("flush participant", || participant.process_flush(&flush));
            } else {
                flush.grant_flush(participant.participant_id());
            }
        }

        let response = {
            let mut state = self.state.lock();
            if !state.is_current(&flush) {
                return;
            }
            state.in_callbacks = false;
            self.take_response(&mut state)
        };
        if let Some(response) = response {
            self.sender.send(response);
        }
    }

    fn on_end(&self, source: Node, membership_id: u64) {
        let ended = {
            let mut state = self.state.lock();
            match state.active_flush(membership_id) {
                Some(flush) => {
                    flush.close();
                    let coordinator = state.coordinator.take();
                    *state = ParticipantState {
                        coordinator,
                        ..Default::default()
                    };
                    Some(flush)
                }
                None => None,
            }
        };

        if let Some(flush) = ended {
            if self.manager.membership_id() != Some(membership_id) {
                if let Err(e) = self.manager.install(
                    flush.new_membership().clone(),
                    flush.membership_change().clone(),
                ) {
                    error!(membership = membership_id, error = %e, "Failed to install membership");
                }
            }
            for participant in self.participants.snapshot().iter() {
                notify_isolated("flush participant", || participant.end_flush(&flush));
            }
            debug!(membership = membership_id, "Flush ended");
        } else {
            debug!(membership = membership_id, "End without active flush");
        }

        self.sender.send(Message::new(
            self.local.clone(),
            source,
            FlushPart::Response(FlushResponseMessagePart {
                membership_id,
                phase: FlushPhase::Ready,
                failed: Vec::new(),
                left: Vec::new(),
            }),
        ));
    }

    fn on_request_state(&self, source: Node) {
        let mut response = {
            let mut state = self.state.lock();
            state.coordinator = Some(source.clone());
            let flush = state.flush.as_ref().map(|flush| FlushStateInfo {
                group_forming: flush.is_group_forming(),
                membership: state
                    .update
                    .clone()
                    .unwrap_or_else(|| MembershipUpdate::Full(flush.new_membership().clone())),
                processing_required: state.processing_required,
                granted: state.not_granted.is_empty() && !state.in_callbacks,
            });
            FlushStateResponseMessagePart {
                phase: state.phase,
                installed_membership_id: self.manager.membership_id(),
                flush,
                failed: sorted(&state.failed),
                left: sorted(&state.left),
                coordinator_states: Vec::new(),
            }
        };

        response.coordinator_states = self
            .participants
            .snapshot()
            .iter()
            .filter_map(|p| {
                let capability = p.coordinator_state()?;
                run_guarded(|| Ok(capability.get_coordinator_state()))
                    .ok()
                    .flatten()
                    .map(|data| ParticipantData {
                        participant: p.participant_id(),
                        data,
                    })
            })
            .collect();

        self.sender.send(Message::new(
            self.local.clone(),
            source,
            FlushPart::StateResponse(response),
        ));
    }

    fn on_grant(&self, membership_id: u64, participant: Uuid) {
        let response = {
            let mut state = self.state.lock();
            if state.active_flush(membership_id).is_none() {
                return;
            }
            state.not_granted.remove(&participant);
            self.take_response(&mut state)
        };
        if let Some(response) = response {
            self.sender.send(response);
        }
    }

    // Builds the phase response once every participant granted.
    fn take_response(&self, state: &mut ParticipantState) -> Option<Message<FlushPart>> {
        if state.in_callbacks
            || state.responded
            || !state.not_granted.is_empty()
            || state.phase == FlushPhase::Ready
        {
            return None;
        }
        let flush = state.flush.as_ref()?;
        let coordinator = state.coordinator.clone()?;
        state.responded = true;

        Some(Message::new(
            self.local.clone(),
            coordinator,
            FlushPart::Response(FlushResponseMessagePart {
                membership_id: flush.new_membership().id(),
                phase: state.phase,
                failed: sorted(&state.failed),
                left: sorted(&state.left),
            }),
        ))
    }
}

impl FailureObserver for FlushParticipantProtocol {
    fn on_nodes_failed(&self, nodes: &[Node]) {
        let mut state = self.state.lock();
        state.failed.extend(nodes.iter().map(Node::id));
    }

    fn on_nodes_left(&self, nodes: &[Node]) {
        let mut state = self.state.lock();
        state.left.extend(nodes.iter().map(Node::id));
    }
}

impl CleanupAware for FlushParticipantProtocol {
    fn cleanup(&self, is_dead: &dyn Fn(&Uuid) -> bool) {
        let mut state = self.state.lock();
        if state.phase != FlushPhase::Ready {
            return;
        }
        state.failed.retain(|id| !is_dead(id));
        state.left.retain(|id| !is_dead(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ExchangeSetEntry;
    use cohort_membership::{Group, GroupOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Outbox(Mutex<Vec<Message<FlushPart>>>);

    impl MessageSender<FlushPart> for Outbox {
        fn send(&self, message: Message<FlushPart>) {
            self.0.lock().push(message);
        }
    }

    impl Outbox {
        fn take(&self) -> Vec<FlushPart> {
            self.0.lock().drain(..).filter_map(|m| m.part).collect()
        }
    }

    struct Recorder {
        id: Uuid,
        auto_grant: bool,
        processing: bool,
        starts: AtomicUsize,
        ends: AtomicUsize,
        exchanged: Mutex<Vec<(String, Bytes)>>,
        held: Mutex<Option<Flush>>,
    }

    impl Recorder {
        fn new(auto_grant: bool, processing: bool) -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                auto_grant,
                processing,
                starts: AtomicUsize::new(0),
                ends: AtomicUsize::new(0),
                exchanged: Mutex::new(Vec::new()),
                held: Mutex::new(None),
            })
        }
    }

    impl FlushParticipant for Recorder {
        fn participant_id(&self) -> Uuid {
            self.id
        }

        fn is_flush_processing_required(&self, _flush: &Flush) -> bool {
            self.processing
        }

        fn start_flush(&self, flush: &Flush) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.auto_grant {
                flush.grant_flush(self.id);
            } else {
                *self.held.lock() = Some(flush.clone());
            }
        }

        fn end_flush(&self, _flush: &Flush) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }

        fn exchange(&self) -> Option<&dyn crate::participant::FlushExchange> {
            Some(self)
        }
    }

    impl crate::participant::FlushExchange for Recorder {
        fn get_exchange_data(&self, _flush: &Flush) -> Option<Bytes> {
            Some(Bytes::from_static(b"local"))
        }

        fn set_exchange_data(&self, _flush: &Flush, data: &HashMap<Node, Bytes>) {
            let mut exchanged = self.exchanged.lock();
            for (node, bytes) in data {
                exchanged.push((node.name().to_string(), bytes.clone()));
            }
        }
    }

    fn membership(id: u64, members: Vec<Node>) -> GroupMembership {
        GroupMembership::new(
            id,
            Group::new(
                Uuid::from_u128(5),
                "g",
                "g-addr",
                GroupOptions::default(),
                id,
                members,
                true,
            ),
        )
    }

    struct Fixture {
        coordinator: Node,
        local: Node,
        outbox: Arc<Outbox>,
        protocol: Arc<FlushParticipantProtocol>,
    }

    fn fixture(participants: Vec<Arc<Recorder>>) -> Fixture {
        let coordinator = Node::new("coordinator", "core", "c");
        let local = Node::new("local", "core", "l");
        let manager = Arc::new(GroupMembershipManager::new(local.clone()));
        let initial = membership(1, vec![coordinator.clone(), local.clone()]);
        manager
            .install(initial.clone(), GroupMembershipChange::initial(&initial))
            .unwrap();

        let outbox = Arc::new(Outbox::default());
        let protocol = FlushParticipantProtocol::new(manager, outbox.clone());
        for participant in participants {
            protocol.add_participant(participant);
        }
        Fixture {
            coordinator,
            local,
            outbox,
            protocol,
        }
    }

    fn start_message(f: &Fixture, joiner: &Node) -> Message<FlushPart> {
        let old = f.protocol.membership_manager().membership().unwrap();
        let new = membership(
            2,
            vec![f.coordinator.clone(), f.local.clone(), joiner.clone()],
        );
        let delta = GroupMembershipDelta::between(&old, &new, &HashSet::new()).unwrap();
        Message::new(
            f.coordinator.clone(),
            f.local.clone(),
            FlushPart::Start(FlushStartMessagePart {
                group_forming: false,
                membership: MembershipUpdate::Delta(delta),
            }),
        )
    }

    fn control(f: &Fixture, kind: FlushMessageType, id: u64) -> Message<FlushPart> {
        Message::new(f.coordinator.clone(), f.local.clone(), FlushPart::control(kind, id))
    }

    #[test]
    fn test_stabilize_sends_exchange_then_response() {
        let recorder = Recorder::new(true, false);
        let f = fixture(vec![recorder.clone()]);
        let joiner = Node::new("joiner", "core", "j");

        f.protocol.receive(start_message(&f, &joiner));
        assert_eq!(f.protocol.phase(), FlushPhase::Stabilize);
        assert!(!f.protocol.request_exit());

        let parts = f.outbox.take();
        assert_eq!(parts.len(), 2);
        match &parts[0] {
            FlushPart::ExchangeGet(get) => {
                assert_eq!(get.membership_id, 2);
                assert_eq!(get.data[0].data, Bytes::from_static(b"local"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            &parts[1],
            FlushPart::Response(r) if r.phase == FlushPhase::Stabilize
        ));

        let flush = f.protocol.flush().unwrap();
        assert_eq!(flush.membership_change().joined, vec![joiner.clone()]);
    }

    #[test]
    fn test_resent_start_reuses_flush() {
        let granted_later = Recorder::new(false, false);
        let f = fixture(vec![granted_later.clone(), Recorder::new(true, false)]);
        let joiner = Node::new("joiner", "core", "j");

        f.protocol.receive(start_message(&f, &joiner));
        let first = f.protocol.flush().unwrap();
        assert_eq!(f.protocol.not_granted(), 1);

        f.protocol.receive(start_message(&f, &joiner));
        let second = f.protocol.flush().unwrap();
        assert!(first.same(&second));
        assert_eq!(f.protocol.not_granted(), 1);
        assert_eq!(granted_later.starts.load(Ordering::SeqCst), 2);

        let parts = f.outbox.take();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| matches!(p, FlushPart::ExchangeGet(_))));

        let held = granted_later.held.lock().clone().unwrap();
        held.grant_flush(granted_later.id);
        let parts = f.outbox.take();
        assert_eq!(parts.len(), 1);
        assert!(matches!(&parts[0], FlushPart::Response(_)));
    }

    #[test]
    fn test_exchange_set_maps_nodes_and_drops_stale() {
        let recorder = Recorder::new(true, false);
        let f = fixture(vec![recorder.clone()]);
        let joiner = Node::new("joiner", "core", "j");
        f.protocol.receive(start_message(&f, &joiner));

        let set = |id: u64| {
            Message::new(
                f.coordinator.clone(),
                f.local.clone(),
                FlushPart::ExchangeSet(FlushExchangeSetMessagePart {
                    membership_id: id,
                    entries: vec![ExchangeSetEntry {
                        participant: recorder.id,
                        nodes: vec![
                            (joiner.id(), Bytes::from_static(b"j")),
                            (Uuid::new_v4(), Bytes::from_static(b"unknown")),
                        ],
                    }],
                }),
            )
        };
        f.protocol.receive(set(7));
        assert!(recorder.exchanged.lock().is_empty());

        f.protocol.receive(set(2));
        assert_eq!(
            *recorder.exchanged.lock(),
            vec![("joiner".to_string(), Bytes::from_static(b"j"))]
        );
    }

    #[test]
    fn test_process_then_end_installs_membership() {
        let processing = Recorder::new(true, true);
        let f = fixture(vec![processing.clone(), Recorder::new(true, false)]);
        let joiner = Node::new("joiner", "core", "j");
        f.protocol.receive(start_message(&f, &joiner));
        f.outbox.take();

        f.protocol.receive(control(&f, FlushMessageType::Process, 2));
        assert_eq!(f.protocol.phase(), FlushPhase::Process);
        let parts = f.outbox.take();
        assert!(matches!(
            &parts[..],
            [FlushPart::Response(r)] if r.phase == FlushPhase::Process
        ));

        let flush = f.protocol.flush().unwrap();
        f.protocol.receive(control(&f, FlushMessageType::End, 2));
        assert_eq!(f.protocol.phase(), FlushPhase::Ready);
        assert!(flush.is_closed());
        assert_eq!(f.protocol.membership_manager().membership_id(), Some(2));
        assert_eq!(processing.ends.load(Ordering::SeqCst), 1);

        // Late grants and a duplicate end change nothing.
        flush.grant_flush(processing.id);
        f.protocol.receive(control(&f, FlushMessageType::End, 2));
        assert_eq!(processing.ends.load(Ordering::SeqCst), 1);
        let parts = f.outbox.take();
        assert_eq!(parts.len(), 2);
        assert!(parts
            .iter()
            .all(|p| matches!(p, FlushPart::Response(r) if r.phase == FlushPhase::Ready)));
    }

    #[test]
    fn test_request_state_reports_flush() {
        let f = fixture(vec![Recorder::new(false, false)]);
        let joiner = Node::new("joiner", "core", "j");
        f.protocol.receive(start_message(&f, &joiner));
        f.protocol.on_nodes_failed(&[joiner.clone()]);
        f.outbox.take();

        f.protocol
            .receive(control(&f, FlushMessageType::RequestState, 0));
        let parts = f.outbox.take();
        match &parts[..] {
            [FlushPart::StateResponse(state)] => {
                assert_eq!(state.phase, FlushPhase::Stabilize);
                assert_eq!(state.installed_membership_id, Some(1));
                let info = state.flush.as_ref().unwrap();
                assert!(!info.granted);
                assert!(matches!(info.membership, MembershipUpdate::Delta(_)));
                assert_eq!(state.failed, vec![joiner.id()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stale_start_is_rejected() {
        let f = fixture(vec![Recorder::new(true, false)]);
        let stale = Message::new(
            f.coordinator.clone(),
            f.local.clone(),
            FlushPart::Start(FlushStartMessagePart {
                group_forming: true,
                membership: MembershipUpdate::Full(membership(
                    1,
                    vec![f.coordinator.clone(), f.local.clone()],
                )),
            }),
        );
        f.protocol.receive(stale);
        assert_eq!(f.protocol.phase(), FlushPhase::Ready);
        assert!(f.outbox.take().is_empty());
    }
}
