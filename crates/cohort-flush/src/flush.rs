//! The per-transition flush record.

use cohort_membership::{GroupMembership, GroupMembershipChange};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Receives grants issued through a [`Flush`].
pub(crate) trait GrantSink: Send + Sync {
    fn on_grant(&self, membership_id: u64, participant: Uuid);
}

struct FlushInner {
    group_forming: bool,
    old_membership: Option<GroupMembership>,
    new_membership: GroupMembership,
    change: GroupMembershipChange,
    closed: AtomicBool,
    sink: Arc<dyn GrantSink>,
}

/// One membership transition.
///
/// Created when a flush start is received, closed when the end phase
/// completes. Cloning shares the same flush; participants may keep a clone
/// and grant later from any thread.
#[derive(Clone)]
pub struct Flush {
    inner: Arc<FlushInner>,
}

impl Flush {
    pub(crate) fn new(
        group_forming: bool,
        old_membership: Option<GroupMembership>,
        new_membership: GroupMembership,
        change: GroupMembershipChange,
        sink: Arc<dyn GrantSink>,
    ) -> Self {
        Self {
            inner: Arc::new(FlushInner {
                group_forming,
                old_membership,
                new_membership,
                change,
                closed: AtomicBool::new(false),
                sink,
            }),
        }
    }

    /// Set when the group has no previous membership.
    pub fn is_group_forming(&self) -> bool {
        self.inner.group_forming
    }

    pub fn old_membership(&self) -> Option<&GroupMembership> {
        self.inner.old_membership.as_ref()
    }

    pub fn new_membership(&self) -> &GroupMembership {
        &self.inner.new_membership
    }

    pub fn membership_change(&self) -> &GroupMembershipChange {
        &self.inner.change
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Signal that `participant` completed the current phase. No-op once the
    /// flush is closed.
    pub fn grant_flush(&self, participant: Uuid) {
        if self.is_closed() {
            return;
        }
        self.inner
            .sink
            .on_grant(self.inner.new_membership.id(), participant);
    }

    /// Check if both handles refer to the same flush.
    pub fn same(&self, other: &Flush) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Flush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flush")
            .field("membership", &self.inner.new_membership.id())
            .field("group_forming", &self.inner.group_forming)
            .field("closed", &self.is_closed())
            .finish()
    }
}
