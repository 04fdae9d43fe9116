//! Wire encoding of message parts.
//!
//! Every part type has a [`MessagePartSerializer`] identified by a stable
//! UUID. Records are written field by field in a fixed order:
//!
//! | field      | encoding                                   |
//! |------------|--------------------------------------------|
//! | count/int  | unsigned LEB128 varint                     |
//! | long       | 8 bytes, big endian                        |
//! | bool       | 1 byte (0 or 1)                            |
//! | UUID       | 16 bytes                                   |
//! | UUID?      | presence byte (0 or 1), then 16 bytes       |
//! | string     | varint byte length, then UTF-8 bytes       |
//! | enum       | varint ordinal                             |
//!
//! Collections are a varint count followed by that many records.

use crate::error::{WireError, WireResult};
use crate::group::{Group, GroupOption, GroupOptions};
use crate::membership::{GroupMembership, GroupMembershipDelta};
use crate::node::Node;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Append-only encoder.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.put_u8((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.put_u8(value as u8);
    }

    pub fn put_count(&mut self, count: usize) {
        self.put_varint(count as u64);
    }

    pub fn put_long(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn put_uuid(&mut self, value: &Uuid) {
        self.buf.put_slice(value.as_bytes());
    }

    pub fn put_optional_uuid(&mut self, value: Option<&Uuid>) {
        match value {
            Some(id) => {
                self.buf.put_u8(1);
                self.put_uuid(id);
            }
            None => self.buf.put_u8(0),
        }
    }

    pub fn put_string(&mut self, value: &str) {
        self.put_count(value.len());
        self.buf.put_slice(value.as_bytes());
    }

    pub fn put_bytes(&mut self, value: &[u8]) {
        self.put_count(value.len());
        self.buf.put_slice(value);
    }

    pub fn put_ordinal(&mut self, ordinal: u64) {
        self.put_varint(ordinal);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Decoder over a byte buffer.
#[derive(Debug, Clone)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, needed: usize) -> WireResult<()> {
        if self.buf.remaining() < needed {
            return Err(WireError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_varint(&mut self) -> WireResult<u64> {
        let mut value: u64 = 0;
        for shift in (0..64).step_by(7) {
            self.need(1)?;
            let byte = self.buf.get_u8();
            if shift == 63 && byte > 1 {
                return Err(WireError::InvalidVarint);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WireError::InvalidVarint)
    }

    /// Read a collection count, bounded by the remaining input so a corrupt
    /// count cannot trigger a huge allocation.
    pub fn get_count(&mut self) -> WireResult<usize> {
        let count = self.get_varint()?;
        if count > self.buf.remaining() as u64 {
            return Err(WireError::Truncated {
                needed: count as usize,
                remaining: self.buf.remaining(),
            });
        }
        Ok(count as usize)
    }

    pub fn get_long(&mut self) -> WireResult<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn get_bool(&mut self) -> WireResult<bool> {
        self.need(1)?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidOrdinal {
                kind: "bool",
                value: u64::from(other),
            }),
        }
    }

    pub fn get_uuid(&mut self) -> WireResult<Uuid> {
        self.need(16)?;
        let mut raw = [0u8; 16];
        self.buf.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    pub fn get_optional_uuid(&mut self) -> WireResult<Option<Uuid>> {
        self.need(1)?;
        match self.buf.get_u8() {
            0 => Ok(None),
            1 => Ok(Some(self.get_uuid()?)),
            tag => Err(WireError::InvalidUuidTag(tag)),
        }
    }

    pub fn get_string(&mut self) -> WireResult<String> {
        let raw = self.get_bytes()?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    pub fn get_bytes(&mut self) -> WireResult<Bytes> {
        let len = self.get_count()?;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn get_ordinal(&mut self) -> WireResult<u64> {
        self.get_varint()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Fail if unread input remains.
    pub fn finish(self) -> WireResult<()> {
        if self.buf.has_remaining() {
            return Err(WireError::Invalid(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

/// Serializer of one message part type.
pub trait MessagePartSerializer {
    type Part;

    /// Stable identifier of the part type on the wire.
    const ID: Uuid;

    fn serialize(&self, part: &Self::Part, writer: &mut WireWriter);

    fn deserialize(&self, reader: &mut WireReader) -> WireResult<Self::Part>;
}

/// Encode a part prefixed with its serializer id.
pub fn encode<S: MessagePartSerializer>(serializer: &S, part: &S::Part) -> Bytes {
    let mut writer = WireWriter::new();
    writer.put_uuid(&S::ID);
    serializer.serialize(part, &mut writer);
    writer.finish()
}

/// Decode a part written by [`encode`], checking the type id and that all
/// input was consumed.
pub fn decode<S: MessagePartSerializer>(serializer: &S, buf: Bytes) -> WireResult<S::Part> {
    let mut reader = WireReader::new(buf);
    let id = reader.get_uuid()?;
    if id != S::ID {
        return Err(WireError::UnknownPart(id));
    }
    let part = serializer.deserialize(&mut reader)?;
    reader.finish()?;
    Ok(part)
}

pub fn write_node(writer: &mut WireWriter, node: &Node) {
    writer.put_uuid(&node.id());
    writer.put_string(node.name());
    writer.put_string(node.domain());
    writer.put_string(node.address());
    writer.put_count(node.properties().len());
    for (key, value) in node.properties() {
        writer.put_string(key);
        writer.put_string(value);
    }
}

pub fn read_node(reader: &mut WireReader) -> WireResult<Node> {
    let id = reader.get_uuid()?;
    let name = reader.get_string()?;
    let domain = reader.get_string()?;
    let address = reader.get_string()?;
    let count = reader.get_count()?;
    let mut properties = BTreeMap::new();
    for _ in 0..count {
        let key = reader.get_string()?;
        properties.insert(key, reader.get_string()?);
    }
    Ok(Node::with_id(id, name, domain, address, properties))
}

pub fn write_nodes(writer: &mut WireWriter, nodes: &[Node]) {
    writer.put_count(nodes.len());
    for node in nodes {
        write_node(writer, node);
    }
}

pub fn read_nodes(reader: &mut WireReader) -> WireResult<Vec<Node>> {
    let count = reader.get_count()?;
    (0..count).map(|_| read_node(reader)).collect()
}

pub fn write_uuids<'a>(writer: &mut WireWriter, ids: impl ExactSizeIterator<Item = &'a Uuid>) {
    writer.put_count(ids.len());
    for id in ids {
        writer.put_uuid(id);
    }
}

pub fn read_uuids(reader: &mut WireReader) -> WireResult<Vec<Uuid>> {
    let count = reader.get_count()?;
    (0..count).map(|_| reader.get_uuid()).collect()
}

pub fn write_group(writer: &mut WireWriter, group: &Group) {
    writer.put_uuid(&group.id());
    writer.put_string(group.name());
    writer.put_string(group.address());
    writer.put_count(group.options().len());
    for option in group.options().iter() {
        writer.put_ordinal(option.ordinal());
    }
    writer.put_varint(group.change_id());
    writer.put_bool(group.is_primary());
    write_nodes(writer, group.members());
}

pub fn read_group(reader: &mut WireReader) -> WireResult<Group> {
    let id = reader.get_uuid()?;
    let name = reader.get_string()?;
    let address = reader.get_string()?;
    let count = reader.get_count()?;
    let mut options = Vec::with_capacity(count);
    for _ in 0..count {
        let ordinal = reader.get_ordinal()?;
        options.push(GroupOption::from_ordinal(ordinal).ok_or(WireError::InvalidOrdinal {
            kind: "group option",
            value: ordinal,
        })?);
    }
    let options = GroupOptions::new(options).map_err(|e| WireError::Invalid(e.to_string()))?;
    let change_id = reader.get_varint()?;
    let primary = reader.get_bool()?;
    let members = read_nodes(reader)?;
    Ok(Group::new(id, name, address, options, change_id, members, primary))
}

pub fn write_membership(writer: &mut WireWriter, membership: &GroupMembership) {
    writer.put_varint(membership.id());
    write_group(writer, membership.group());
}

pub fn read_membership(reader: &mut WireReader) -> WireResult<GroupMembership> {
    let id = reader.get_varint()?;
    Ok(GroupMembership::new(id, read_group(reader)?))
}

pub fn write_delta(writer: &mut WireWriter, delta: &GroupMembershipDelta) {
    writer.put_varint(delta.id);
    writer.put_bool(delta.primary);
    write_nodes(writer, &delta.joined);
    write_uuids(writer, delta.left.iter());
    write_uuids(writer, delta.failed.iter());
}

pub fn read_delta(reader: &mut WireReader) -> WireResult<GroupMembershipDelta> {
    Ok(GroupMembershipDelta {
        id: reader.get_varint()?,
        primary: reader.get_bool()?,
        joined: read_nodes(reader)?,
        left: read_uuids(reader)?,
        failed: read_uuids(reader)?,
    })
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NodeSerializer;

impl MessagePartSerializer for NodeSerializer {
    type Part = Node;
    const ID: Uuid = Uuid::from_u128(0x6f1a3e52_0c4d_4a8e_9b1f_2d7c5e8a9b01);

    fn serialize(&self, part: &Node, writer: &mut WireWriter) {
        write_node(writer, part);
    }

    fn deserialize(&self, reader: &mut WireReader) -> WireResult<Node> {
        read_node(reader)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GroupSerializer;

impl MessagePartSerializer for GroupSerializer {
    type Part = Group;
    const ID: Uuid = Uuid::from_u128(0x6f1a3e52_0c4d_4a8e_9b1f_2d7c5e8a9b02);

    fn serialize(&self, part: &Group, writer: &mut WireWriter) {
        write_group(writer, part);
    }

    fn deserialize(&self, reader: &mut WireReader) -> WireResult<Group> {
        read_group(reader)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GroupMembershipSerializer;

impl MessagePartSerializer for GroupMembershipSerializer {
    type Part = GroupMembership;
    const ID: Uuid = Uuid::from_u128(0x6f1a3e52_0c4d_4a8e_9b1f_2d7c5e8a9b03);

    fn serialize(&self, part: &GroupMembership, writer: &mut WireWriter) {
        write_membership(writer, part);
    }

    fn deserialize(&self, reader: &mut WireReader) -> WireResult<GroupMembership> {
        read_membership(reader)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GroupMembershipDeltaSerializer;

impl MessagePartSerializer for GroupMembershipDeltaSerializer {
    type Part = GroupMembershipDelta;
    const ID: Uuid = Uuid::from_u128(0x6f1a3e52_0c4d_4a8e_9b1f_2d7c5e8a9b04);

    fn serialize(&self, part: &GroupMembershipDelta, writer: &mut WireWriter) {
        write_delta(writer, part);
    }

    fn deserialize(&self, reader: &mut WireReader) -> WireResult<GroupMembershipDelta> {
        read_delta(reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_group() -> Group {
        let a = Node::new("a", "core", "10.0.0.1:7000").with_property("zone", "eu");
        let b = Node::new("b", "core", "10.0.0.2:7000");
        Group::new(
            Uuid::new_v4(),
            "orders",
            "orders-addr",
            GroupOptions::new([GroupOption::Durable, GroupOption::AsyncStateTransfer]).unwrap(),
            4,
            vec![a, b],
            true,
        )
    }

    #[test]
    fn test_varint_layout() {
        let mut writer = WireWriter::new();
        writer.put_varint(300);
        assert_eq!(&writer.finish()[..], &[0xac, 0x02]);
    }

    #[test]
    fn test_membership_encoding_preserves_fields() {
        let membership = GroupMembership::new(5, sample_group());
        let decoded = decode(
            &GroupMembershipSerializer,
            encode(&GroupMembershipSerializer, &membership),
        )
        .unwrap();

        assert_eq!(decoded, membership);
        assert_eq!(decoded.members()[0].property("zone"), Some("eu"));
        assert_eq!(decoded.group().name(), "orders");
        assert!(decoded
            .group()
            .options()
            .contains(GroupOption::AsyncStateTransfer));
    }

    #[test]
    fn test_decode_rejects_wrong_part_id() {
        let bytes = encode(&GroupSerializer, &sample_group());
        assert_eq!(
            decode(&GroupMembershipSerializer, bytes).unwrap_err(),
            WireError::UnknownPart(GroupSerializer::ID)
        );
    }

    #[test]
    fn test_truncated_input() {
        let bytes = encode(&NodeSerializer, &Node::new("a", "b", "c"));
        let cut = bytes.slice(..bytes.len() - 1);
        assert!(matches!(
            decode(&NodeSerializer, cut),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_invalid_uuid_tag() {
        let mut reader = WireReader::new(Bytes::from_static(&[7]));
        assert_eq!(reader.get_optional_uuid(), Err(WireError::InvalidUuidTag(7)));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut reader = WireReader::new(Bytes::from_static(&[2, 0xff, 0xfe]));
        assert_eq!(reader.get_string(), Err(WireError::InvalidUtf8));
    }

    #[test]
    fn test_overlong_varint() {
        let mut reader = WireReader::new(Bytes::from(vec![0xffu8; 11]));
        assert_eq!(reader.get_varint(), Err(WireError::InvalidVarint));
    }

    #[test]
    fn test_serializer_ids_are_distinct() {
        let ids = [
            NodeSerializer::ID,
            GroupSerializer::ID,
            GroupMembershipSerializer::ID,
            GroupMembershipDeltaSerializer::ID,
        ];
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    proptest! {
        #[test]
        fn varint_decodes_what_was_written(values in prop::collection::vec(any::<u64>(), 0..16)) {
            let mut writer = WireWriter::new();
            for v in &values {
                writer.put_varint(*v);
            }
            let mut reader = WireReader::new(writer.finish());
            for v in &values {
                prop_assert_eq!(reader.get_varint().unwrap(), *v);
            }
            prop_assert!(reader.finish().is_ok());
        }
    }
}
