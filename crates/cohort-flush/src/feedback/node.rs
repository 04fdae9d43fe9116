use super::{FeedbackData, FeedbackDataSerializer};
use cohort_membership::{ClusterMembership, WireError, WireReader, WireResult, WireWriter};
use uuid::Uuid;

/// Lifecycle state a node reports about itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    Starting,
    Running,
    Stopping,
}

impl NodeState {
    pub fn ordinal(self) -> u64 {
        match self {
            NodeState::Starting => 0,
            NodeState::Running => 1,
            NodeState::Stopping => 2,
        }
    }

    pub fn from_ordinal(ordinal: u64) -> Option<Self> {
        match ordinal {
            0 => Some(NodeState::Starting),
            1 => Some(NodeState::Running),
            2 => Some(NodeState::Stopping),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeFeedbackData {
    pub node_id: Uuid,
    pub state: NodeState,
    pub load: u64,
}

impl FeedbackData for NodeFeedbackData {
    const ID: Uuid = Uuid::from_u128(0x3c9b7d14_5e2a_4f61_8d0c_7a1e6b2f4c02);

    fn key(&self) -> Uuid {
        self.node_id
    }

    fn is_present(&self, cluster: &ClusterMembership) -> bool {
        cluster.contains_node(&self.node_id)
    }

    fn write(&self, writer: &mut WireWriter) {
        writer.put_uuid(&self.node_id);
        writer.put_ordinal(self.state.ordinal());
        writer.put_varint(self.load);
    }

    fn read(reader: &mut WireReader) -> WireResult<Self> {
        let node_id = reader.get_uuid()?;
        let ordinal = reader.get_ordinal()?;
        let state = NodeState::from_ordinal(ordinal).ok_or(WireError::InvalidOrdinal {
            kind: "NodeState",
            value: ordinal,
        })?;
        Ok(Self {
            node_id,
            state,
            load: reader.get_varint()?,
        })
    }
}

pub type NodeFeedbackDataSerializer = FeedbackDataSerializer<NodeFeedbackData>;
