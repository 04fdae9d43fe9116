//! Messages exchanged with the transport layer.
//!
//! The transport itself is external: it implements [`MessageSender`] and
//! delivers inbound messages to the protocol stack.

use crate::node::Node;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Set of message flags.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MessageFlags(u32);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    pub const HEARTBEAT_REQUEST: MessageFlags = MessageFlags(1 << 0);
    pub const HEARTBEAT_RESPONSE: MessageFlags = MessageFlags(1 << 1);
    pub const HIGH_PRIORITY: MessageFlags = MessageFlags(1 << 2);
    pub const LOW_PRIORITY: MessageFlags = MessageFlags(1 << 3);

    pub const HEARTBEAT: MessageFlags =
        MessageFlags(Self::HEARTBEAT_REQUEST.0 | Self::HEARTBEAT_RESPONSE.0);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        MessageFlags(bits)
    }

    pub const fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: MessageFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn without(self, other: MessageFlags) -> Self {
        MessageFlags(self.0 & !other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: Self) -> Self {
        MessageFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for MessageFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for MessageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(MessageFlags, &str); 4] = [
            (MessageFlags::HEARTBEAT_REQUEST, "HEARTBEAT_REQUEST"),
            (MessageFlags::HEARTBEAT_RESPONSE, "HEARTBEAT_RESPONSE"),
            (MessageFlags::HIGH_PRIORITY, "HIGH_PRIORITY"),
            (MessageFlags::LOW_PRIORITY, "LOW_PRIORITY"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "MessageFlags({})", set.join(" | "))
    }
}

/// A message between two nodes with an optional protocol part.
#[derive(Clone, Debug)]
pub struct Message<P> {
    pub source: Node,
    pub destination: Node,
    pub flags: MessageFlags,
    pub part: Option<P>,
}

impl<P> Message<P> {
    pub fn new(source: Node, destination: Node, part: P) -> Self {
        Self {
            source,
            destination,
            flags: MessageFlags::NONE,
            part: Some(part),
        }
    }

    /// A message carrying only flags.
    pub fn signal(source: Node, destination: Node, flags: MessageFlags) -> Self {
        Self {
            source,
            destination,
            flags,
            part: None,
        }
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags |= flags;
        self
    }
}

/// Outbound side of the transport.
pub trait MessageSender<P>: Send + Sync {
    fn send(&self, message: Message<P>);
}
