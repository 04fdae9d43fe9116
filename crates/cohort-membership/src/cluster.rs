//! Cluster-wide membership view.

use crate::group::Group;
use crate::membership::GroupMembership;
use crate::node::Node;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Nodes and groups currently present in the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterMembership {
    id: u64,
    nodes: BTreeMap<Uuid, Node>,
    groups: BTreeMap<Uuid, Group>,
}

impl ClusterMembership {
    pub fn new(
        id: u64,
        nodes: impl IntoIterator<Item = Node>,
        groups: impl IntoIterator<Item = Group>,
    ) -> Self {
        Self {
            id,
            nodes: nodes.into_iter().map(|n| (n.id(), n)).collect(),
            groups: groups.into_iter().map(|g| (g.id(), g)).collect(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn node(&self, id: &Uuid) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn group(&self, id: &Uuid) -> Option<&Group> {
        self.groups.get(id)
    }

    pub fn contains_node(&self, id: &Uuid) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn contains_group(&self, id: &Uuid) -> bool {
        self.groups.contains_key(id)
    }
}

impl From<&GroupMembership> for ClusterMembership {
    fn from(membership: &GroupMembership) -> Self {
        Self::new(
            membership.id(),
            membership.members().iter().cloned(),
            std::iter::once(membership.group().clone()),
        )
    }
}

/// Notified when the cluster membership view changes.
pub trait ClusterMembershipListener: Send + Sync {
    fn on_cluster_membership_changed(&self, membership: &ClusterMembership);
}
