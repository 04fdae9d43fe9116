//! Contracts implemented by components taking part in a flush.

use crate::flush::Flush;
use bytes::Bytes;
use cohort_membership::Node;
use std::collections::HashMap;
use uuid::Uuid;

/// A local component that must agree to every membership transition.
///
/// Each phase ends for a participant when it calls
/// [`Flush::grant_flush`] with its id, synchronously or later.
pub trait FlushParticipant: Send + Sync {
    /// Stable id, also used to route exchange data.
    fn participant_id(&self) -> Uuid;

    /// Check whether this participant needs a process phase.
    fn is_flush_processing_required(&self, _flush: &Flush) -> bool {
        false
    }

    /// Stabilize phase. Must be idempotent: a coordinator resends the flush
    /// start when a member fails during stabilization.
    fn start_flush(&self, flush: &Flush);

    /// Runs on every participant before any `process_flush`.
    fn before_process_flush(&self, _flush: &Flush) {}

    /// Process phase, only called when `is_flush_processing_required`.
    fn process_flush(&self, flush: &Flush) {
        flush.grant_flush(self.participant_id());
    }

    /// The transition is committed.
    fn end_flush(&self, flush: &Flush);

    /// Exchange capability.
    fn exchange(&self) -> Option<&dyn FlushExchange> {
        None
    }

    /// Coordinator state capability.
    fn coordinator_state(&self) -> Option<&dyn FlushCoordinatorState> {
        None
    }
}

/// Participants that share state with their peers during stabilization.
pub trait FlushExchange: Send + Sync {
    /// Local data to send to the coordinator.
    fn get_exchange_data(&self, flush: &Flush) -> Option<Bytes>;

    /// Data of all nodes, keyed by members of the new membership.
    fn set_exchange_data(&self, flush: &Flush, data: &HashMap<Node, Bytes>);
}

/// Participants holding state a new coordinator needs to resume a flush.
pub trait FlushCoordinatorState: Send + Sync {
    fn get_coordinator_state(&self) -> Option<Bytes>;

    fn set_coordinator_state(&self, states: &HashMap<Node, Bytes>);
}
