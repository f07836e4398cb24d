//! The byte frame carried inside each length-delimited transport message.
//!
//! Frame body: `kind(1) ‖ topic(varbyte string) ‖ payload(varbyte bytes) ‖
//! multipath(varbyte bytes)`. Kinds 1-5 are packed messages traveling the
//! overlay; kind 6 is the handshake hello, which carries no multipath.

use weft_codec::wire::{read_bytes, write_bytes};
use weft_model::{MessageKind, PackedMessage, Topic};
use weft_routing::Multipath;

use crate::error::NetError;
use crate::handshake::Hello;

const KIND_HELLO: u8 = 6;

/// A packed message together with its forwarding plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeMessage {
    pub message: PackedMessage,
    pub multipath: Multipath,
}

impl NodeMessage {
    pub fn new(message: PackedMessage, multipath: Multipath) -> Self {
        Self { message, multipath }
    }
}

/// Everything that can travel a peering link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Node(NodeMessage),
    Hello(Hello),
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Frame::Node(node) => {
                out.push(node.message.kind as u8);
                write_bytes(&mut out, node.message.topic.as_str().as_bytes());
                write_bytes(&mut out, &node.message.payload);
                write_bytes(&mut out, &node.multipath.encode_to_vec());
            }
            Frame::Hello(hello) => {
                out.push(KIND_HELLO);
                write_bytes(&mut out, weft_model::topic::RESERVED.as_bytes());
                write_bytes(&mut out, &hello.encode());
                write_bytes(&mut out, &[]);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, NetError> {
        let mut input = bytes;
        let (&kind, rest) = input
            .split_first()
            .ok_or_else(|| NetError::Malformed("empty frame".into()))?;
        input = rest;

        let topic_bytes = read_bytes(&mut input)?;
        let payload = read_bytes(&mut input)?.to_vec();
        let multipath_bytes = read_bytes(&mut input)?;
        if !input.is_empty() {
            return Err(NetError::Malformed("trailing bytes after frame".into()));
        }

        if kind == KIND_HELLO {
            return Ok(Frame::Hello(Hello::decode(&payload)?));
        }

        let kind = MessageKind::from_u8(kind)
            .ok_or_else(|| NetError::Malformed(format!("unknown frame kind {kind}")))?;
        let topic = std::str::from_utf8(topic_bytes)
            .map_err(|_| NetError::Malformed("topic is not valid utf-8".into()))
            .and_then(|text| {
                Topic::parse(text).map_err(|err| NetError::Malformed(err.to_string()))
            })?;
        let multipath = Multipath::decode(multipath_bytes)?;

        Ok(Frame::Node(NodeMessage {
            message: PackedMessage {
                kind,
                topic,
                payload,
            },
            multipath,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_model::{EndpointId, Filter, LamportTimestamp, VersionInfo};
    use weft_routing::{MultipathNode, RoutingTable};

    fn id(x: u8) -> EndpointId {
        EndpointId::from_bytes([x; 16])
    }

    fn sample_node_message() -> NodeMessage {
        let mut tbl: RoutingTable<()> = RoutingTable::new();
        tbl.add_or_update_path(id(2), vec![id(2)], vec![1u64].into());
        NodeMessage::new(
            PackedMessage::new(
                MessageKind::Data,
                Topic::parse("zeek/events").unwrap(),
                vec![1, 2, 3],
            ),
            Multipath::build(id(1), false, [id(2)], &tbl),
        )
    }

    #[test]
    fn node_frame_roundtrip() {
        let frame = Frame::Node(sample_node_message());
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn hello_frame_roundtrip() {
        let hello = Hello {
            id: id(9),
            version: VersionInfo::CURRENT,
            clock: LamportTimestamp(4),
            filter: [Topic::parse("a/b").unwrap()].into_iter().collect::<Filter>(),
        };
        let frame = Frame::Hello(hello.clone());
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, Frame::Hello(hello));
    }

    #[test]
    fn garbage_is_rejected_not_panicked() {
        assert!(Frame::decode(&[]).is_err());
        assert!(Frame::decode(&[0x00]).is_err());
        assert!(Frame::decode(&[0xFF, 0x01, b'x']).is_err());

        let frame = Frame::Node(sample_node_message());
        let bytes = frame.encode();
        for cut in 0..bytes.len() {
            assert!(Frame::decode(&bytes[..cut]).is_err(), "cut {cut}");
        }
    }

    #[test]
    fn single_node_multipath_is_allowed() {
        let frame = Frame::Node(NodeMessage::new(
            PackedMessage::new(
                MessageKind::Ping,
                Topic::parse("$_broker/ping").unwrap(),
                vec![],
            ),
            Multipath::from_root(MultipathNode::new(id(2), false)),
        ));
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }
}
