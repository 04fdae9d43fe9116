//! Feedback services: per-entity status shared with every member during a
//! flush.
//!
//! Each service keeps one entry per entity id with a modified flag. During
//! stabilization a node ships either its modified entries or, when the group
//! is forming or nodes joined, all of them. Received entries overwrite local
//! ones without merging: every entity has a single authoritative writer.
//! Entries of entities that leave the cluster are pruned.

mod data_loss;
mod group;
mod node;

pub use data_loss::{DataLossFeedbackData, DataLossFeedbackDataSerializer};
pub use group::{GroupFeedbackData, GroupFeedbackDataSerializer, GroupHealth};
pub use node::{NodeFeedbackData, NodeFeedbackDataSerializer, NodeState};

use crate::flush::Flush;
use crate::participant::{FlushExchange, FlushParticipant};
use bytes::Bytes;
use cohort_membership::wire::{decode, encode};
use cohort_membership::{
    ClusterMembership, ClusterMembershipListener, GroupMembership, GroupMembershipChange,
    GroupMembershipListener, MessagePartSerializer, Node, WireReader, WireResult, WireWriter,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use tracing::{debug, warn};
use uuid::Uuid;

/// One kind of feedback entry.
pub trait FeedbackData: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Wire type id. Also identifies the service as a flush participant.
    const ID: Uuid;

    /// Id of the entity the entry describes.
    fn key(&self) -> Uuid;

    /// Check if the entity is still part of the cluster.
    fn is_present(&self, cluster: &ClusterMembership) -> bool;

    fn write(&self, writer: &mut WireWriter);

    fn read(reader: &mut WireReader) -> WireResult<Self>;
}

/// Serializer of a batch of feedback entries: a count followed by records.
pub struct FeedbackDataSerializer<D>(PhantomData<fn() -> D>);

impl<D> FeedbackDataSerializer<D> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<D> Default for FeedbackDataSerializer<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Clone for FeedbackDataSerializer<D> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<D> Copy for FeedbackDataSerializer<D> {}

impl<D> fmt::Debug for FeedbackDataSerializer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FeedbackDataSerializer")
    }
}

impl<D: FeedbackData> MessagePartSerializer for FeedbackDataSerializer<D> {
    type Part = Vec<D>;
    const ID: Uuid = D::ID;

    fn serialize(&self, part: &Vec<D>, writer: &mut WireWriter) {
        writer.put_count(part.len());
        for data in part {
            data.write(writer);
        }
    }

    fn deserialize(&self, reader: &mut WireReader) -> WireResult<Vec<D>> {
        let count = reader.get_count()?;
        (0..count).map(|_| D::read(reader)).collect()
    }
}

#[derive(Debug)]
struct FeedbackEntry<D> {
    data: D,
    modified: bool,
}

/// Holds the feedback entries of one kind and exchanges them during flushes.
pub struct FeedbackService<D: FeedbackData> {
    entries: Mutex<BTreeMap<Uuid, FeedbackEntry<D>>>,
}

impl<D: FeedbackData> FeedbackService<D> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a local change. The entry is shipped with the next exchange.
    pub fn update(&self, data: D) {
        self.entries.lock().insert(
            data.key(),
            FeedbackEntry {
                data,
                modified: true,
            },
        );
    }

    pub fn get(&self, key: &Uuid) -> Option<D> {
        self.entries.lock().get(key).map(|e| e.data.clone())
    }

    pub fn remove(&self, key: &Uuid) -> Option<D> {
        self.entries.lock().remove(key).map(|e| e.data)
    }

    pub fn is_modified(&self, key: &Uuid) -> bool {
        self.entries.lock().get(key).map_or(false, |e| e.modified)
    }

    /// All entries when `force` is set, otherwise only modified ones.
    pub fn get_data(&self, force: bool) -> Vec<D> {
        self.entries
            .lock()
            .values()
            .filter(|e| force || e.modified)
            .map(|e| e.data.clone())
            .collect()
    }

    /// Overwrite local entries with remote ones.
    pub fn set_data(&self, data: Vec<D>) {
        let mut entries = self.entries.lock();
        for data in data {
            entries.insert(
                data.key(),
                FeedbackEntry {
                    data,
                    modified: false,
                },
            );
        }
    }

    /// Drop entries whose entity left the cluster.
    pub fn prune(&self, cluster: &ClusterMembership) {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.data.is_present(cluster));
        let pruned = before - entries.len();
        if pruned > 0 {
            let kind = D::ID;
            debug!(%kind, pruned, "Pruned feedback entries");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn clear_modified(&self) {
        for entry in self.entries.lock().values_mut() {
            entry.modified = false;
        }
    }
}

impl<D: FeedbackData> Default for FeedbackService<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: FeedbackData> FlushParticipant for FeedbackService<D> {
    fn participant_id(&self) -> Uuid {
        D::ID
    }

    fn start_flush(&self, flush: &Flush) {
        flush.grant_flush(D::ID);
    }

    fn end_flush(&self, _flush: &Flush) {
        self.clear_modified();
    }

    fn exchange(&self) -> Option<&dyn FlushExchange> {
        Some(self)
    }
}

impl<D: FeedbackData> FlushExchange for FeedbackService<D> {
    fn get_exchange_data(&self, flush: &Flush) -> Option<Bytes> {
        let force = flush.is_group_forming() || !flush.membership_change().joined.is_empty();
        let data = self.get_data(force);
        if data.is_empty() {
            return None;
        }
        Some(encode(&FeedbackDataSerializer::<D>::new(), &data))
    }

    fn set_exchange_data(&self, _flush: &Flush, data: &HashMap<Node, Bytes>) {
        let mut sources: Vec<(&Node, &Bytes)> = data.iter().collect();
        sources.sort_by_key(|(node, _)| node.id());
        for (node, bytes) in sources {
            match decode(&FeedbackDataSerializer::<D>::new(), bytes.clone()) {
                Ok(entries) => self.set_data(entries),
                Err(e) => warn!(from = %node, error = %e, "Dropping malformed feedback"),
            }
        }
    }
}

impl<D: FeedbackData> ClusterMembershipListener for FeedbackService<D> {
    fn on_cluster_membership_changed(&self, membership: &ClusterMembership) {
        self.prune(membership);
    }
}

impl<D: FeedbackData> GroupMembershipListener for FeedbackService<D> {
    fn on_group_membership_changed(
        &self,
        _old: Option<&GroupMembership>,
        new: &GroupMembership,
        _change: &GroupMembershipChange,
    ) {
        self.prune(&ClusterMembership::from(new));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_membership::{Group, GroupOptions};

    fn cluster(nodes: &[Node]) -> ClusterMembership {
        ClusterMembership::new(1, nodes.iter().cloned(), std::iter::empty::<Group>())
    }

    fn node_data(node: &Node, load: u64) -> NodeFeedbackData {
        NodeFeedbackData {
            node_id: node.id(),
            state: NodeState::Running,
            load,
        }
    }

    #[test]
    fn test_modified_entries_only_unless_forced() {
        let service = FeedbackService::<NodeFeedbackData>::new();
        let a = Node::new("a", "core", "a");
        let b = Node::new("b", "core", "b");

        service.set_data(vec![node_data(&a, 1)]);
        service.update(node_data(&b, 2));

        assert_eq!(service.get_data(false), vec![node_data(&b, 2)]);
        assert_eq!(service.get_data(true).len(), 2);
        assert!(service.is_modified(&b.id()));
        assert!(!service.is_modified(&a.id()));
    }

    #[test]
    fn test_set_data_overwrites() {
        let service = FeedbackService::<NodeFeedbackData>::new();
        let a = Node::new("a", "core", "a");

        service.update(node_data(&a, 1));
        service.set_data(vec![node_data(&a, 7)]);

        assert_eq!(service.get(&a.id()), Some(node_data(&a, 7)));
        assert!(service.get_data(false).is_empty());
    }

    #[test]
    fn test_prune_on_cluster_change() {
        let service = FeedbackService::<NodeFeedbackData>::new();
        let a = Node::new("a", "core", "a");
        let b = Node::new("b", "core", "b");
        service.update(node_data(&a, 1));
        service.update(node_data(&b, 2));

        service.on_cluster_membership_changed(&cluster(&[a.clone()]));

        assert_eq!(service.len(), 1);
        assert!(service.get(&b.id()).is_none());
        assert!(service
            .get_data(false)
            .iter()
            .all(|d| d.node_id != b.id()));
    }

    #[test]
    fn test_prune_on_group_membership_install() {
        let service = FeedbackService::<GroupFeedbackData>::new();
        let a = Node::new("a", "core", "a");
        let kept = Uuid::from_u128(1);
        let dropped = Uuid::from_u128(2);
        for group_id in [kept, dropped] {
            service.update(GroupFeedbackData {
                group_id,
                primary: true,
                members: 1,
                health: GroupHealth::Healthy,
            });
        }

        let membership = GroupMembership::new(
            3,
            Group::new(kept, "g", "g-addr", GroupOptions::default(), 3, vec![a], true),
        );
        service.on_group_membership_changed(
            None,
            &membership,
            &GroupMembershipChange::initial(&membership),
        );

        assert_eq!(service.len(), 1);
        assert!(service.get(&kept).is_some());
    }

    #[test]
    fn test_batch_wire_format() {
        let a = Node::new("a", "core", "a");
        let batch = vec![node_data(&a, 3), node_data(&a, 4)];
        let serializer = NodeFeedbackDataSerializer::new();

        let bytes = encode(&serializer, &batch);
        assert_eq!(decode(&serializer, bytes.clone()).unwrap(), batch);

        // A node batch is not accepted as group feedback.
        let wrong = decode(&GroupFeedbackDataSerializer::new(), bytes);
        assert!(wrong.is_err());
    }
}
