//! Group memberships, membership deltas and the membership manager.
//!
//! A membership transition always moves from id `N` to id `N + 1`. The
//! coordinator computes the new membership and ships a
//! [`GroupMembershipDelta`]; every node that holds membership `N` re-derives
//! the identical membership `N + 1` with [`GroupMembershipDelta::apply`].

use crate::error::{MembershipError, Result};
use crate::group::Group;
use crate::node::Node;
use cohort_compartment::{notify_isolated, ProcessorList};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A numbered group snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMembership {
    id: u64,
    group: Group,
}

impl GroupMembership {
    pub fn new(id: u64, group: Group) -> Self {
        Self { id, group }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn members(&self) -> &[Node] {
        self.group.members()
    }

    pub fn coordinator(&self) -> Option<&Node> {
        self.group.coordinator()
    }

    pub fn find_member(&self, id: &Uuid) -> Option<&Node> {
        self.group.find_member(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.group.contains(id)
    }
}

/// Minimal difference between two consecutive memberships.
///
/// Removed members are listed by id only; joined members carry the full node
/// since receivers do not know them yet. Joined members are appended to the
/// surviving members in order, so they become the youngest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMembershipDelta {
    pub id: u64,
    pub primary: bool,
    pub joined: Vec<Node>,
    pub left: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

impl GroupMembershipDelta {
    /// Compute the delta turning `old` into `new`. Removed members found in
    /// `failed` are reported as failed, the others as left.
    pub fn between(
        old: &GroupMembership,
        new: &GroupMembership,
        failed: &HashSet<Uuid>,
    ) -> Result<Self> {
        check_successor(old, new.id)?;
        if old.group.id() != new.group.id() {
            return Err(MembershipError::GroupMismatch {
                expected: old.group.id(),
                actual: new.group.id(),
            });
        }

        let joined = new
            .members()
            .iter()
            .filter(|n| !old.contains(&n.id()))
            .cloned()
            .collect();

        let (failed_ids, left_ids): (Vec<Uuid>, Vec<Uuid>) = old
            .members()
            .iter()
            .map(Node::id)
            .filter(|id| !new.contains(id))
            .partition(|id| failed.contains(id));

        let delta = Self {
            id: new.id,
            primary: new.group.is_primary(),
            joined,
            left: left_ids,
            failed: failed_ids,
        };

        if delta.apply(old)? != *new {
            return Err(MembershipError::NotDerivable(
                "member order of the new membership does not follow the old one".to_string(),
            ));
        }
        Ok(delta)
    }

    /// Derive the next membership from `old`.
    pub fn apply(&self, old: &GroupMembership) -> Result<GroupMembership> {
        check_successor(old, self.id)?;

        for id in self.left.iter().chain(self.failed.iter()) {
            if !old.contains(id) {
                return Err(MembershipError::UnknownNode(*id));
            }
        }
        if let Some(node) = self.joined.iter().find(|n| old.contains(&n.id())) {
            return Err(MembershipError::NotDerivable(format!(
                "joined node {} is already a member",
                node.id()
            )));
        }

        let removed: HashSet<&Uuid> = self.left.iter().chain(self.failed.iter()).collect();
        let members = old
            .members()
            .iter()
            .filter(|n| !removed.contains(&n.id()))
            .chain(self.joined.iter())
            .cloned()
            .collect();

        Ok(GroupMembership::new(
            self.id,
            old.group.with_members(members, self.primary),
        ))
    }

    /// Resolve the delta into a change against `old`.
    pub fn change(&self, old: &GroupMembership) -> GroupMembershipChange {
        let resolve = |ids: &[Uuid]| -> Vec<Node> {
            ids.iter()
                .filter_map(|id| old.find_member(id).cloned())
                .collect()
        };
        GroupMembershipChange {
            joined: self.joined.clone(),
            left: resolve(&self.left),
            failed: resolve(&self.failed),
        }
    }
}

fn check_successor(old: &GroupMembership, new_id: u64) -> Result<()> {
    if new_id != old.id + 1 {
        return Err(MembershipError::MembershipIdMismatch {
            expected: old.id + 1,
            actual: new_id,
        });
    }
    Ok(())
}

/// Resolved difference between two memberships, handed to listeners.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupMembershipChange {
    pub joined: Vec<Node>,
    pub left: Vec<Node>,
    pub failed: Vec<Node>,
}

impl GroupMembershipChange {
    /// Change for a first install: every member joined.
    pub fn initial(membership: &GroupMembership) -> Self {
        Self {
            joined: membership.members().to_vec(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty() && self.failed.is_empty()
    }
}

/// Notified after a membership is installed.
pub trait GroupMembershipListener: Send + Sync {
    fn on_group_membership_changed(
        &self,
        old: Option<&GroupMembership>,
        new: &GroupMembership,
        change: &GroupMembershipChange,
    );
}

/// Holds the current membership of the local node's group.
pub struct GroupMembershipManager {
    local_node: Node,
    membership: RwLock<Option<GroupMembership>>,
    listeners: ProcessorList<dyn GroupMembershipListener>,
}

impl GroupMembershipManager {
    pub fn new(local_node: Node) -> Self {
        Self {
            local_node,
            membership: RwLock::new(None),
            listeners: ProcessorList::new(),
        }
    }

    pub fn local_node(&self) -> &Node {
        &self.local_node
    }

    pub fn membership(&self) -> Option<GroupMembership> {
        self.membership.read().clone()
    }

    pub fn membership_id(&self) -> Option<u64> {
        self.membership.read().as_ref().map(GroupMembership::id)
    }

    /// Check if the local node coordinates the current membership.
    pub fn is_coordinator(&self) -> bool {
        self.membership
            .read()
            .as_ref()
            .and_then(GroupMembership::coordinator)
            .map_or(false, |c| *c == self.local_node)
    }

    pub fn add_listener(&self, listener: Arc<dyn GroupMembershipListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn GroupMembershipListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Install the next membership. After the first install every membership
    /// must succeed the current one.
    pub fn install(&self, membership: GroupMembership, change: GroupMembershipChange) -> Result<()> {
        let old = {
            let mut current = self.membership.write();
            if let Some(old) = current.as_ref() {
                check_successor(old, membership.id)?;
                if old.group.id() != membership.group.id() {
                    return Err(MembershipError::GroupMismatch {
                        expected: old.group.id(),
                        actual: membership.group.id(),
                    });
                }
            }
            current.replace(membership.clone())
        };

        debug!(
            membership = membership.id(),
            members = membership.members().len(),
            joined = change.joined.len(),
            left = change.left.len(),
            failed = change.failed.len(),
            "Group membership installed"
        );

        for listener in self.listeners.snapshot().iter() {
            notify_isolated("group membership listener", || {
                listener.on_group_membership_changed(old.as_ref(), &membership, &change)
            });
        }
        Ok(())
    }
}
