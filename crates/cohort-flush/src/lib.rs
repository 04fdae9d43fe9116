//! Cohort Flush - agreed succession of group memberships
//!
//! A flush moves every member of a group from membership `N` to `N + 1`
//! only after all local participants on all members agreed. Participants use
//! the transition to drain in-flight work, so no message gap straddles a
//! membership boundary.
//!
//! This crate provides:
//! - The per-node participant state machine (`READY → STABILIZE → PROCESS → READY`)
//! - The coordinator driving a transition, including take-over after its failure
//! - State exchange between participants during stabilization
//! - Group, node and data-loss feedback services
//! - Wire serializers for every flush message part
//! - A deterministic simulated cluster for scenario tests
//!
//! # Example
//!
//! ```rust,ignore
//! use cohort_flush::simulation::{FlushCluster, NetworkConfig};
//!
//! let cluster = FlushCluster::new(3, NetworkConfig::default(), 42)?;
//! let first = cluster.membership(1, &[0, 1, 2]);
//! cluster.install(0, first.clone())?;
//! cluster.run(1_000);
//! assert!(cluster.converged(&first));
//! ```

pub mod coordinator;
pub mod error;
pub mod feedback;
pub mod flush;
pub mod messages;
pub mod participant;
pub mod protocol;
pub mod serializers;
pub mod simulation;

pub use coordinator::{
    CoordinatorStage, FlushConfig, FlushCoordinatorListener, FlushCoordinatorProtocol,
};
pub use error::{FlushError, Result};
pub use feedback::{
    DataLossFeedbackData, DataLossFeedbackDataSerializer, FeedbackData, FeedbackDataSerializer,
    FeedbackService, GroupFeedbackData, GroupFeedbackDataSerializer, GroupHealth, NodeFeedbackData,
    NodeFeedbackDataSerializer, NodeState,
};
pub use flush::Flush;
pub use messages::{
    ExchangeSetEntry, FlushExchangeGetMessagePart, FlushExchangeSetMessagePart, FlushMessagePart,
    FlushMessageType, FlushPart, FlushPhase, FlushResponseMessagePart, FlushStartMessagePart,
    FlushStateInfo, FlushStateResponseMessagePart, MembershipUpdate, ParticipantData,
};
pub use participant::{FlushCoordinatorState, FlushExchange, FlushParticipant};
pub use protocol::FlushParticipantProtocol;
pub use serializers::{decode_part, encode_part};
