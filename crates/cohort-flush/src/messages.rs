//! Flush protocol message parts.
//!
//! ```text
//! coordinator                         participant
//!     │ ── FlushStart(full | delta) ──▶ │  READY → STABILIZE
//!     │ ◀── FlushExchangeGet ────────── │
//!     │ ── FlushExchangeSet ──────────▶ │
//!     │ ◀── FlushResponse(STABILIZE) ── │  all participants granted
//!     │ ── Process ───────────────────▶ │  STABILIZE → PROCESS (optional)
//!     │ ◀── FlushResponse(PROCESS) ──── │
//!     │ ── End ───────────────────────▶ │  → READY, membership installed
//!     │ ◀── FlushResponse(READY) ────── │
//! ```
//!
//! A coordinator taking over an interrupted transition sends `RequestState`
//! and receives a [`FlushStateResponseMessagePart`] from every member.

use bytes::Bytes;
use cohort_membership::{GroupMembership, GroupMembershipDelta};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Phase of the flush participant state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlushPhase {
    #[default]
    Ready,
    Stabilize,
    Process,
}

impl FlushPhase {
    pub fn ordinal(self) -> u64 {
        match self {
            FlushPhase::Ready => 0,
            FlushPhase::Stabilize => 1,
            FlushPhase::Process => 2,
        }
    }

    pub fn from_ordinal(ordinal: u64) -> Option<Self> {
        match ordinal {
            0 => Some(FlushPhase::Ready),
            1 => Some(FlushPhase::Stabilize),
            2 => Some(FlushPhase::Process),
            _ => None,
        }
    }
}

/// The membership carried by a flush start: a full snapshot for nodes without
/// the previous membership, a delta for everyone else.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipUpdate {
    Full(GroupMembership),
    Delta(GroupMembershipDelta),
}

impl MembershipUpdate {
    /// Id of the membership this update leads to.
    pub fn membership_id(&self) -> u64 {
        match self {
            MembershipUpdate::Full(membership) => membership.id(),
            MembershipUpdate::Delta(delta) => delta.id,
        }
    }
}

/// Opaque data contributed by one participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticipantData {
    pub participant: Uuid,
    pub data: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushStartMessagePart {
    pub group_forming: bool,
    pub membership: MembershipUpdate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushExchangeGetMessagePart {
    pub membership_id: u64,
    pub processing_required: bool,
    pub data: Vec<ParticipantData>,
    pub failed: Vec<Uuid>,
    pub left: Vec<Uuid>,
}

/// Exchange data of all nodes for one participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeSetEntry {
    pub participant: Uuid,
    pub nodes: Vec<(Uuid, Bytes)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushExchangeSetMessagePart {
    pub membership_id: u64,
    pub entries: Vec<ExchangeSetEntry>,
}

/// Control message kinds without a payload of their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlushMessageType {
    Process,
    End,
    RequestState,
}

impl FlushMessageType {
    pub fn ordinal(self) -> u64 {
        match self {
            FlushMessageType::Process => 0,
            FlushMessageType::End => 1,
            FlushMessageType::RequestState => 2,
        }
    }

    pub fn from_ordinal(ordinal: u64) -> Option<Self> {
        match ordinal {
            0 => Some(FlushMessageType::Process),
            1 => Some(FlushMessageType::End),
            2 => Some(FlushMessageType::RequestState),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushMessagePart {
    pub kind: FlushMessageType,
    pub membership_id: u64,
}

/// Grant of a whole node for a phase. `phase` is the phase that completed;
/// `Ready` acknowledges an end.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushResponseMessagePart {
    pub membership_id: u64,
    pub phase: FlushPhase,
    pub failed: Vec<Uuid>,
    pub left: Vec<Uuid>,
}

/// In-flight flush as seen by a participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushStateInfo {
    pub group_forming: bool,
    pub membership: MembershipUpdate,
    pub processing_required: bool,
    pub granted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushStateResponseMessagePart {
    pub phase: FlushPhase,
    pub installed_membership_id: Option<u64>,
    pub flush: Option<FlushStateInfo>,
    pub failed: Vec<Uuid>,
    pub left: Vec<Uuid>,
    pub coordinator_states: Vec<ParticipantData>,
}

/// Every part exchanged by the flush protocols.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlushPart {
    Start(FlushStartMessagePart),
    ExchangeGet(FlushExchangeGetMessagePart),
    ExchangeSet(FlushExchangeSetMessagePart),
    Control(FlushMessagePart),
    Response(FlushResponseMessagePart),
    StateResponse(FlushStateResponseMessagePart),
}

impl FlushPart {
    /// Check if the part is addressed to the coordinator protocol rather
    /// than the participant protocol.
    pub fn is_for_coordinator(&self) -> bool {
        matches!(
            self,
            FlushPart::ExchangeGet(_) | FlushPart::Response(_) | FlushPart::StateResponse(_)
        )
    }

    pub fn control(kind: FlushMessageType, membership_id: u64) -> Self {
        FlushPart::Control(FlushMessagePart {
            kind,
            membership_id,
        })
    }
}
