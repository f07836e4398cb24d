//! Packed messages: payload bytes tagged with kind and topic.
//!
//! Payloads stay encoded until a consumer demands the typed value, so
//! forwarding nodes never pay for decoding.

use crate::Topic;

/// Kind of a packed message. Numeric values are wire contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Data = 1,
    Command = 2,
    RoutingUpdate = 3,
    Ping = 4,
    Pong = 5,
}

impl MessageKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Data),
            2 => Some(Self::Command),
            3 => Some(Self::RoutingUpdate),
            4 => Some(Self::Ping),
            5 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// A message as it travels the overlay: kind, topic, and the still-encoded
/// payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedMessage {
    pub kind: MessageKind,
    pub topic: Topic,
    pub payload: Vec<u8>,
}

impl PackedMessage {
    pub fn new(kind: MessageKind, topic: Topic, payload: Vec<u8>) -> Self {
        Self {
            kind,
            topic,
            payload,
        }
    }
}
