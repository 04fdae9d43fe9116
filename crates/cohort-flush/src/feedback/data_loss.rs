use super::{FeedbackData, FeedbackDataSerializer};
use cohort_membership::{ClusterMembership, WireReader, WireResult, WireWriter};
use uuid::Uuid;

/// Messages a node lost in a group, e.g. after a gap it could not repair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataLossFeedbackData {
    pub node_id: Uuid,
    pub group_id: Uuid,
    pub lost_messages: u64,
    /// Time of the most recent loss, in milliseconds.
    pub last_loss_time: i64,
}

impl DataLossFeedbackData {
    /// Entry key of the report of `node_id` about `group_id`.
    pub fn key_for(node_id: &Uuid, group_id: &Uuid) -> Uuid {
        Uuid::new_v5(group_id, node_id.as_bytes())
    }
}

impl FeedbackData for DataLossFeedbackData {
    const ID: Uuid = Uuid::from_u128(0x3c9b7d14_5e2a_4f61_8d0c_7a1e6b2f4c03);

    /// One entry per (node, group) pair.
    fn key(&self) -> Uuid {
        Self::key_for(&self.node_id, &self.group_id)
    }

    /// Kept while both the reporting node and the group exist.
    fn is_present(&self, cluster: &ClusterMembership) -> bool {
        cluster.contains_node(&self.node_id) && cluster.contains_group(&self.group_id)
    }

    fn write(&self, writer: &mut WireWriter) {
        writer.put_uuid(&self.node_id);
        writer.put_uuid(&self.group_id);
        writer.put_varint(self.lost_messages);
        writer.put_long(self.last_loss_time);
    }

    fn read(reader: &mut WireReader) -> WireResult<Self> {
        Ok(Self {
            node_id: reader.get_uuid()?,
            group_id: reader.get_uuid()?,
            lost_messages: reader.get_varint()?,
            last_loss_time: reader.get_long()?,
        })
    }
}

pub type DataLossFeedbackDataSerializer = FeedbackDataSerializer<DataLossFeedbackData>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::FeedbackService;
    use cohort_membership::{Group, GroupOptions, Node};

    fn group(id: u128, members: &[Node]) -> Group {
        Group::new(
            Uuid::from_u128(id),
            format!("g{}", id),
            format!("g{}-addr", id),
            GroupOptions::default(),
            1,
            members.to_vec(),
            true,
        )
    }

    fn loss(node: &Node, group: &Group, lost_messages: u64) -> DataLossFeedbackData {
        DataLossFeedbackData {
            node_id: node.id(),
            group_id: group.id(),
            lost_messages,
            last_loss_time: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_requires_node_and_group() {
        let node = Node::new("a", "core", "a");
        let group = Group::new(
            Uuid::from_u128(4),
            "g",
            "g-addr",
            GroupOptions::default(),
            1,
            vec![node.clone()],
            true,
        );
        let data = DataLossFeedbackData {
            node_id: node.id(),
            group_id: group.id(),
            lost_messages: 12,
            last_loss_time: 1_700_000_000_000,
        };

        let full = ClusterMembership::new(1, [node.clone()], [group.clone()]);
        let no_group = ClusterMembership::new(2, [node.clone()], Vec::<Group>::new());
        let no_node = ClusterMembership::new(3, Vec::<Node>::new(), [group]);

        assert!(data.is_present(&full));
        assert!(!data.is_present(&no_group));
        assert!(!data.is_present(&no_node));
    }

    #[test]
    fn test_reports_are_kept_per_group() {
        let node = Node::new("a", "core", "a");
        let first = group(5, &[node.clone()]);
        let second = group(6, &[node.clone()]);
        let service: FeedbackService<DataLossFeedbackData> = FeedbackService::new();

        service.set_data(vec![loss(&node, &first, 3), loss(&node, &second, 9)]);
        assert_eq!(service.len(), 2);
        assert_ne!(
            DataLossFeedbackData::key_for(&node.id(), &first.id()),
            DataLossFeedbackData::key_for(&node.id(), &second.id())
        );

        // The second group goes away: only its report is pruned.
        service.prune(&ClusterMembership::new(2, [node.clone()], [first.clone()]));
        let key = DataLossFeedbackData::key_for(&node.id(), &first.id());
        assert_eq!(service.get(&key).map(|d| d.lost_messages), Some(3));
        assert_eq!(service.len(), 1);
        assert!(service
            .get(&DataLossFeedbackData::key_for(&node.id(), &second.id()))
            .is_none());
    }
}
