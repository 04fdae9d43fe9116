//! Wire serializers of the flush message parts.
//!
//! Every part is prefixed with the id of its serializer. Field order within
//! a part is fixed; a membership update is written as two presence flags
//! followed by the full membership or the delta, and exactly one of them
//! must be set.

use crate::messages::{
    ExchangeSetEntry, FlushExchangeGetMessagePart, FlushExchangeSetMessagePart, FlushMessagePart,
    FlushMessageType, FlushPart, FlushPhase, FlushResponseMessagePart, FlushStartMessagePart,
    FlushStateInfo, FlushStateResponseMessagePart, MembershipUpdate, ParticipantData,
};
use bytes::Bytes;
use cohort_membership::wire::{
    decode, encode, read_delta, read_membership, read_uuids, write_delta, write_membership,
    write_uuids,
};
use cohort_membership::{MessagePartSerializer, WireError, WireReader, WireResult, WireWriter};
use uuid::Uuid;

fn write_update(writer: &mut WireWriter, update: &MembershipUpdate) {
    match update {
        MembershipUpdate::Full(membership) => {
            writer.put_bool(true);
            write_membership(writer, membership);
            writer.put_bool(false);
        }
        MembershipUpdate::Delta(delta) => {
            writer.put_bool(false);
            writer.put_bool(true);
            write_delta(writer, delta);
        }
    }
}

fn read_update(reader: &mut WireReader) -> WireResult<MembershipUpdate> {
    let full = if reader.get_bool()? {
        Some(read_membership(reader)?)
    } else {
        None
    };
    let delta = if reader.get_bool()? {
        Some(read_delta(reader)?)
    } else {
        None
    };
    match (full, delta) {
        (Some(membership), None) => Ok(MembershipUpdate::Full(membership)),
        (None, Some(delta)) => Ok(MembershipUpdate::Delta(delta)),
        (Some(_), Some(_)) => Err(WireError::InvalidMembershipPayload(
            "both membership and delta present".to_string(),
        )),
        (None, None) => Err(WireError::InvalidMembershipPayload(
            "neither membership nor delta present".to_string(),
        )),
    }
}

fn write_phase(writer: &mut WireWriter, phase: FlushPhase) {
    writer.put_ordinal(phase.ordinal());
}

fn read_phase(reader: &mut WireReader) -> WireResult<FlushPhase> {
    let ordinal = reader.get_ordinal()?;
    FlushPhase::from_ordinal(ordinal).ok_or(WireError::InvalidOrdinal {
        kind: "FlushPhase",
        value: ordinal,
    })
}

fn write_participant_data(writer: &mut WireWriter, data: &[ParticipantData]) {
    writer.put_count(data.len());
    for entry in data {
        writer.put_uuid(&entry.participant);
        writer.put_bytes(&entry.data);
    }
}

fn read_participant_data(reader: &mut WireReader) -> WireResult<Vec<ParticipantData>> {
    let count = reader.get_count()?;
    (0..count)
        .map(|_| {
            Ok(ParticipantData {
                participant: reader.get_uuid()?,
                data: reader.get_bytes()?,
            })
        })
        .collect()
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FlushStartMessagePartSerializer;

impl MessagePartSerializer for FlushStartMessagePartSerializer {
    type Part = FlushStartMessagePart;
    const ID: Uuid = Uuid::from_u128(0x8a2d4c6e_1f3b_4d5a_9c7e_0b1d2f3a4e01);

    fn serialize(&self, part: &FlushStartMessagePart, writer: &mut WireWriter) {
        writer.put_bool(part.group_forming);
        write_update(writer, &part.membership);
    }

    fn deserialize(&self, reader: &mut WireReader) -> WireResult<FlushStartMessagePart> {
        Ok(FlushStartMessagePart {
            group_forming: reader.get_bool()?,
            membership: read_update(reader)?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FlushExchangeGetMessagePartSerializer;

impl MessagePartSerializer for FlushExchangeGetMessagePartSerializer {
    type Part = FlushExchangeGetMessagePart;
    const ID: Uuid = Uuid::from_u128(0x8a2d4c6e_1f3b_4d5a_9c7e_0b1d2f3a4e02);

    fn serialize(&self, part: &FlushExchangeGetMessagePart, writer: &mut WireWriter) {
        writer.put_varint(part.membership_id);
        writer.put_bool(part.processing_required);
        write_participant_data(writer, &part.data);
        write_uuids(writer, part.failed.iter());
        write_uuids(writer, part.left.iter());
    }

    fn deserialize(&self, reader: &mut WireReader) -> WireResult<FlushExchangeGetMessagePart> {
        Ok(FlushExchangeGetMessagePart {
            membership_id: reader.get_varint()?,
            processing_required: reader.get_bool()?,
            data: read_participant_data(reader)?,
            failed: read_uuids(reader)?,
            left: read_uuids(reader)?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FlushExchangeSetMessagePartSerializer;

impl MessagePartSerializer for FlushExchangeSetMessagePartSerializer {
    type Part = FlushExchangeSetMessagePart;
    const ID: Uuid = Uuid::from_u128(0x8a2d4c6e_1f3b_4d5a_9c7e_0b1d2f3a4e03);

    fn serialize(&self, part: &FlushExchangeSetMessagePart, writer: &mut WireWriter) {
        writer.put_varint(part.membership_id);
        writer.put_count(part.entries.len());
        for entry in &part.entries {
            writer.put_uuid(&entry.participant);
            writer.put_count(entry.nodes.len());
            for (node, data) in &entry.nodes {
                writer.put_uuid(node);
                writer.put_bytes(data);
            }
        }
    }

    fn deserialize(&self, reader: &mut WireReader) -> WireResult<FlushExchangeSetMessagePart> {
        let membership_id = reader.get_varint()?;
        let count = reader.get_count()?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let participant = reader.get_uuid()?;
            let nodes = reader.get_count()?;
            let nodes = (0..nodes)
                .map(|_| Ok((reader.get_uuid()?, reader.get_bytes()?)))
                .collect::<WireResult<Vec<_>>>()?;
            entries.push(ExchangeSetEntry { participant, nodes });
        }
        Ok(FlushExchangeSetMessagePart {
            membership_id,
            entries,
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FlushMessagePartSerializer;

impl MessagePartSerializer for FlushMessagePartSerializer {
    type Part = FlushMessagePart;
    const ID: Uuid = Uuid::from_u128(0x8a2d4c6e_1f3b_4d5a_9c7e_0b1d2f3a4e04);

    fn serialize(&self, part: &FlushMessagePart, writer: &mut WireWriter) {
        writer.put_ordinal(part.kind.ordinal());
        writer.put_varint(part.membership_id);
    }

    fn deserialize(&self, reader: &mut WireReader) -> WireResult<FlushMessagePart> {
        let ordinal = reader.get_ordinal()?;
        let kind = FlushMessageType::from_ordinal(ordinal).ok_or(WireError::InvalidOrdinal {
            kind: "FlushMessageType",
            value: ordinal,
        })?;
        Ok(FlushMessagePart {
            kind,
            membership_id: reader.get_varint()?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FlushResponseMessagePartSerializer;

impl MessagePartSerializer for FlushResponseMessagePartSerializer {
    type Part = FlushResponseMessagePart;
    const ID: Uuid = Uuid::from_u128(0x8a2d4c6e_1f3b_4d5a_9c7e_0b1d2f3a4e05);

    fn serialize(&self, part: &FlushResponseMessagePart, writer: &mut WireWriter) {
        writer.put_varint(part.membership_id);
        write_phase(writer, part.phase);
        write_uuids(writer, part.failed.iter());
        write_uuids(writer, part.left.iter());
    }

    fn deserialize(&self, reader: &mut WireReader) -> WireResult<FlushResponseMessagePart> {
        Ok(FlushResponseMessagePart {
            membership_id: reader.get_varint()?,
            phase: read_phase(reader)?,
            failed: read_uuids(reader)?,
            left: read_uuids(reader)?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FlushStateResponseMessagePartSerializer;

impl MessagePartSerializer for FlushStateResponseMessagePartSerializer {
    type Part = FlushStateResponseMessagePart;
    const ID: Uuid = Uuid::from_u128(0x8a2d4c6e_1f3b_4d5a_9c7e_0b1d2f3a4e06);

    fn serialize(&self, part: &FlushStateResponseMessagePart, writer: &mut WireWriter) {
        write_phase(writer, part.phase);
        writer.put_bool(part.installed_membership_id.is_some());
        if let Some(id) = part.installed_membership_id {
            writer.put_varint(id);
        }
        writer.put_bool(part.flush.is_some());
        if let Some(flush) = &part.flush {
            writer.put_bool(flush.group_forming);
            write_update(writer, &flush.membership);
            writer.put_bool(flush.processing_required);
            writer.put_bool(flush.granted);
        }
        write_uuids(writer, part.failed.iter());
        write_uuids(writer, part.left.iter());
        write_participant_data(writer, &part.coordinator_states);
    }

    fn deserialize(&self, reader: &mut WireReader) -> WireResult<FlushStateResponseMessagePart> {
        let phase = read_phase(reader)?;
        let installed_membership_id = if reader.get_bool()? {
            Some(reader.get_varint()?)
        } else {
            None
        };
        let flush = if reader.get_bool()? {
            Some(FlushStateInfo {
                group_forming: reader.get_bool()?,
                membership: read_update(reader)?,
                processing_required: reader.get_bool()?,
                granted: reader.get_bool()?,
            })
        } else {
            None
        };
        Ok(FlushStateResponseMessagePart {
            phase,
            installed_membership_id,
            flush,
            failed: read_uuids(reader)?,
            left: read_uuids(reader)?,
            coordinator_states: read_participant_data(reader)?,
        })
    }
}

/// Encode any flush part with the serializer of its type.
pub fn encode_part(part: &FlushPart) -> Bytes {
    match part {
        FlushPart::Start(p) => encode(&FlushStartMessagePartSerializer, p),
        FlushPart::ExchangeGet(p) => encode(&FlushExchangeGetMessagePartSerializer, p),
        FlushPart::ExchangeSet(p) => encode(&FlushExchangeSetMessagePartSerializer, p),
        FlushPart::Control(p) => encode(&FlushMessagePartSerializer, p),
        FlushPart::Response(p) => encode(&FlushResponseMessagePartSerializer, p),
        FlushPart::StateResponse(p) => encode(&FlushStateResponseMessagePartSerializer, p),
    }
}

/// Decode a flush part, selecting the serializer by the leading type id.
pub fn decode_part(buf: Bytes) -> WireResult<FlushPart> {
    let id = WireReader::new(buf.clone()).get_uuid()?;
    if id == FlushStartMessagePartSerializer::ID {
        decode(&FlushStartMessagePartSerializer, buf).map(FlushPart::Start)
    } else if id == FlushExchangeGetMessagePartSerializer::ID {
        decode(&FlushExchangeGetMessagePartSerializer, buf).map(FlushPart::ExchangeGet)
    } else if id == FlushExchangeSetMessagePartSerializer::ID {
        decode(&FlushExchangeSetMessagePartSerializer, buf).map(FlushPart::ExchangeSet)
    } else if id == FlushMessagePartSerializer::ID {
        decode(&FlushMessagePartSerializer, buf).map(FlushPart::Control)
    } else if id == FlushResponseMessagePartSerializer::ID {
        decode(&FlushResponseMessagePartSerializer, buf).map(FlushPart::Response)
    } else if id == FlushStateResponseMessagePartSerializer::ID {
        decode(&FlushStateResponseMessagePartSerializer, buf).map(FlushPart::StateResponse)
    } else {
        Err(WireError::UnknownPart(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_membership::{Group, GroupMembership, GroupMembershipDelta, GroupOptions, Node};

    fn membership() -> GroupMembership {
        let nodes = vec![
            Node::new("a", "core", "a").with_property("zone", "1"),
            Node::new("b", "core", "b"),
        ];
        GroupMembership::new(
            4,
            Group::new(
                Uuid::from_u128(3),
                "g",
                "g-addr",
                GroupOptions::default(),
                4,
                nodes,
                true,
            ),
        )
    }

    #[test]
    fn test_state_response_with_delta() {
        let delta = GroupMembershipDelta {
            id: 5,
            primary: true,
            joined: vec![Node::new("c", "core", "c")],
            left: vec![Uuid::from_u128(11)],
            failed: Vec::new(),
        };
        let part = FlushPart::StateResponse(FlushStateResponseMessagePart {
            phase: FlushPhase::Process,
            installed_membership_id: Some(4),
            flush: Some(FlushStateInfo {
                group_forming: false,
                membership: MembershipUpdate::Delta(delta),
                processing_required: true,
                granted: false,
            }),
            failed: vec![Uuid::from_u128(12)],
            left: Vec::new(),
            coordinator_states: vec![ParticipantData {
                participant: Uuid::from_u128(13),
                data: Bytes::from_static(b"state"),
            }],
        });

        assert_eq!(decode_part(encode_part(&part)).unwrap(), part);
    }

    #[test]
    fn test_start_with_full_membership() {
        let part = FlushPart::Start(FlushStartMessagePart {
            group_forming: true,
            membership: MembershipUpdate::Full(membership()),
        });
        assert_eq!(decode_part(encode_part(&part)).unwrap(), part);
    }

    #[test]
    fn test_start_requires_exactly_one_membership() {
        let mut writer = WireWriter::new();
        writer.put_uuid(&FlushStartMessagePartSerializer::ID);
        writer.put_bool(false);
        writer.put_bool(false);
        writer.put_bool(false);
        let result = decode_part(writer.finish());
        assert!(matches!(result, Err(WireError::InvalidMembershipPayload(_))));

        let mut writer = WireWriter::new();
        writer.put_uuid(&FlushStartMessagePartSerializer::ID);
        writer.put_bool(false);
        writer.put_bool(true);
        write_membership(&mut writer, &membership());
        writer.put_bool(true);
        write_delta(
            &mut writer,
            &GroupMembershipDelta {
                id: 5,
                primary: true,
                joined: Vec::new(),
                left: Vec::new(),
                failed: Vec::new(),
            },
        );
        let result = decode_part(writer.finish());
        assert!(matches!(result, Err(WireError::InvalidMembershipPayload(_))));
    }

    #[test]
    fn test_unknown_and_truncated_parts() {
        let mut writer = WireWriter::new();
        writer.put_uuid(&Uuid::from_u128(99));
        assert!(matches!(
            decode_part(writer.finish()),
            Err(WireError::UnknownPart(_))
        ));

        let bytes = encode_part(&FlushPart::control(FlushMessageType::End, 300));
        let truncated = bytes.slice(..bytes.len() - 1);
        assert!(decode_part(truncated).is_err());
    }

    #[test]
    fn test_invalid_phase_ordinal() {
        let mut writer = WireWriter::new();
        writer.put_uuid(&FlushResponseMessagePartSerializer::ID);
        writer.put_varint(2);
        writer.put_ordinal(9);
        assert!(matches!(
            decode_part(writer.finish()),
            Err(WireError::InvalidOrdinal { kind: "FlushPhase", value: 9 })
        ));
    }
}
