//! Cohort - cluster membership and flush-based group communication
//!
//! Cohort ties three crates together:
//! - `compartment`: single-threaded actor scheduling with timers and flow control
//! - `membership`: nodes, groups, liveness, heartbeat failure detection and cleanup
//! - `flush`: agreed succession of group memberships with state exchange
//!
//! [`CohortNode`] hosts the whole stack of one node on its own compartment.
//! Nodes of one process talk through a [`LocalTransport`].
//!
//! # Example
//!
//! ```rust,ignore
//! use cohort::prelude::*;
//!
//! let transport = LocalTransport::new();
//! let node = CohortNode::new(
//!     Node::new("a", "local", "mem://a"),
//!     CohortConfig::default(),
//!     Box::new(FullNodeTrackingStrategy),
//!     &transport,
//! )?;
//! node.start()?;
//! ```

pub mod error;
pub mod node;

pub use cohort_compartment as compartment;
pub use cohort_flush as flush;
pub use cohort_membership as membership;

pub use error::{CohortError, Result};
pub use node::{CohortConfig, CohortNode, LocalTransport};

/// Commonly used types.
pub mod prelude {
    pub use crate::error::{CohortError, Result};
    pub use crate::node::{CohortConfig, CohortNode, LocalTransport};
    pub use cohort_compartment::{
        Compartment, CompartmentConfig, CompartmentGroup, CompartmentGroupConfig,
        CompartmentTimerProcessor, Task, TimeSource,
    };
    pub use cohort_flush::{
        Flush, FlushConfig, FlushCoordinatorProtocol, FlushParticipant, FlushParticipantProtocol,
        FlushPhase,
    };
    pub use cohort_membership::{
        FullNodeTrackingStrategy, Group, GroupMembership, GroupOptions, HeartbeatConfig,
        LiveNodeManager, Node, NodeTrackingStrategy,
    };
}
