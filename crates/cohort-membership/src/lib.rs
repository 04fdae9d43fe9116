//! Cohort Membership - nodes, groups and liveness
//!
//! This crate provides:
//! - Immutable nodes and group snapshots
//! - Numbered group memberships and the deltas between consecutive ones
//! - The authoritative live node set with change fan-out
//! - Node tracking strategies feeding heartbeat failure detection
//! - Cleanup of per-node protocol state after nodes stay dead
//! - The wire codec used by every message part
//!
//! # Membership succession
//!
//! ```text
//! coordinator:  old(N) ──compute──▶ new(N+1) ──between──▶ delta
//! member:       old(N) ──────────── apply(delta) ───────▶ new(N+1)
//! ```
//!
//! Both sides arrive at equal memberships; ids always grow by one.

pub mod cleanup;
pub mod cluster;
pub mod error;
pub mod group;
pub mod heartbeat;
pub mod live_nodes;
pub mod membership;
pub mod message;
pub mod node;
pub mod tracking;
pub mod wire;

pub use cleanup::{CleanupAware, CleanupConfig, CleanupManager};
pub use cluster::{ClusterMembership, ClusterMembershipListener};
pub use error::{MembershipError, Result, WireError, WireResult};
pub use group::{Group, GroupOption, GroupOptions};
pub use heartbeat::{HeartbeatConfig, HeartbeatProtocol};
pub use live_nodes::{ConnectionObserver, FailureObserver, LiveNodeManager, LiveNodeState};
pub use membership::{
    GroupMembership, GroupMembershipChange, GroupMembershipDelta, GroupMembershipListener,
    GroupMembershipManager,
};
pub use message::{Message, MessageFlags, MessageSender};
pub use node::Node;
pub use tracking::{
    CoordinatorCohortNodeTrackingStrategy, FullNodeTrackingStrategy, NodeTrackingStrategy,
    NoneNodeTrackingStrategy, RandomNodeTrackingStrategy, RingNodeTrackingStrategy,
};
pub use wire::{MessagePartSerializer, WireReader, WireWriter};
