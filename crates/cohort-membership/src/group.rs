//! Groups and group options.
//!
//! A [`Group`] is an immutable snapshot. Installing a new membership replaces
//! the snapshot; nothing mutates it in place.

use crate::error::{MembershipError, Result};
use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Behavioural options of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupOption {
    Durable,
    Ordered,
    SimpleStateTransfer,
    AsyncStateTransfer,
    CheckState,
}

impl GroupOption {
    pub const ALL: [GroupOption; 5] = [
        GroupOption::Durable,
        GroupOption::Ordered,
        GroupOption::SimpleStateTransfer,
        GroupOption::AsyncStateTransfer,
        GroupOption::CheckState,
    ];

    pub fn ordinal(self) -> u64 {
        self as u64
    }

    pub fn from_ordinal(ordinal: u64) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }
}

/// Validated set of group options.
///
/// `Ordered` requires `Durable`. Exactly one state transfer mode is kept:
/// when both are requested, asynchronous transfer wins.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupOptions(BTreeSet<GroupOption>);

impl GroupOptions {
    pub fn new(options: impl IntoIterator<Item = GroupOption>) -> Result<Self> {
        let mut options: BTreeSet<GroupOption> = options.into_iter().collect();

        if options.contains(&GroupOption::Ordered) && !options.contains(&GroupOption::Durable) {
            return Err(MembershipError::InvalidGroupOptions(
                "ordered group must be durable".to_string(),
            ));
        }

        let simple = options.contains(&GroupOption::SimpleStateTransfer);
        let async_transfer = options.contains(&GroupOption::AsyncStateTransfer);
        match (simple, async_transfer) {
            (false, false) => {
                return Err(MembershipError::InvalidGroupOptions(
                    "a state transfer mode is required".to_string(),
                ))
            }
            (true, true) => {
                options.remove(&GroupOption::SimpleStateTransfer);
            }
            _ => {}
        }

        Ok(Self(options))
    }

    pub fn contains(&self, option: GroupOption) -> bool {
        self.0.contains(&option)
    }

    pub fn iter(&self) -> impl Iterator<Item = GroupOption> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self(BTreeSet::from([GroupOption::SimpleStateTransfer]))
    }
}

/// Immutable group snapshot. Members are ordered oldest to youngest; the
/// first member is the coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    id: Uuid,
    name: String,
    address: String,
    options: GroupOptions,
    change_id: u64,
    members: Vec<Node>,
    primary: bool,
}

impl Group {
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        address: impl Into<String>,
        options: GroupOptions,
        change_id: u64,
        members: Vec<Node>,
        primary: bool,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            address: address.into(),
            options,
            change_id,
            members,
            primary,
        }
    }

    /// Derive the next snapshot with a new member list.
    pub fn with_members(&self, members: Vec<Node>, primary: bool) -> Self {
        Self {
            members,
            primary,
            change_id: self.change_id + 1,
            ..self.clone()
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn options(&self) -> &GroupOptions {
        &self.options
    }

    pub fn change_id(&self) -> u64 {
        self.change_id
    }

    pub fn members(&self) -> &[Node] {
        &self.members
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn coordinator(&self) -> Option<&Node> {
        self.members.first()
    }

    pub fn find_member(&self, id: &Uuid) -> Option<&Node> {
        self.members.iter().find(|n| n.id() == *id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.find_member(id).is_some()
    }
}
