use super::{FeedbackData, FeedbackDataSerializer};
use cohort_membership::{ClusterMembership, WireError, WireReader, WireResult, WireWriter};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupHealth {
    Healthy,
    Degraded,
    Failed,
}

impl GroupHealth {
    pub fn ordinal(self) -> u64 {
        match self {
            GroupHealth::Healthy => 0,
            GroupHealth::Degraded => 1,
            GroupHealth::Failed => 2,
        }
    }

    pub fn from_ordinal(ordinal: u64) -> Option<Self> {
        match ordinal {
            0 => Some(GroupHealth::Healthy),
            1 => Some(GroupHealth::Degraded),
            2 => Some(GroupHealth::Failed),
            _ => None,
        }
    }
}

/// Status of a group as reported by its coordinator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupFeedbackData {
    pub group_id: Uuid,
    pub primary: bool,
    pub members: u64,
    pub health: GroupHealth,
}

impl FeedbackData for GroupFeedbackData {
    const ID: Uuid = Uuid::from_u128(0x3c9b7d14_5e2a_4f61_8d0c_7a1e6b2f4c01);

    fn key(&self) -> Uuid {
        self.group_id
    }

    fn is_present(&self, cluster: &ClusterMembership) -> bool {
        cluster.contains_group(&self.group_id)
    }

    // group id, primary, members, health ordinal
    fn write(&self, writer: &mut WireWriter) {
        writer.put_uuid(&self.group_id);
        writer.put_bool(self.primary);
        writer.put_varint(self.members);
        writer.put_ordinal(self.health.ordinal());
    }

    fn read(reader: &mut WireReader) -> WireResult<Self> {
        let group_id = reader.get_uuid()?;
        let primary = reader.get_bool()?;
        let members = reader.get_varint()?;
        let ordinal = reader.get_ordinal()?;
        let health = GroupHealth::from_ordinal(ordinal).ok_or(WireError::InvalidOrdinal {
            kind: "GroupHealth",
            value: ordinal,
        })?;
        Ok(Self {
            group_id,
            primary,
            members,
            health,
        })
    }
}

pub type GroupFeedbackDataSerializer = FeedbackDataSerializer<GroupFeedbackData>;
