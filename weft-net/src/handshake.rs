//! The peering handshake.
//!
//! Both sides send a `hello` frame carrying their endpoint id, version
//! 4-tuple, lamport clock, and current filter, then read the peer's. The
//! exchange happens before the framed reader/writer tasks take over, using
//! the same 4-byte big-endian length prefix as the steady-state framing.
//! Peers are compatible iff their `protocol` integers match.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use weft_codec::{decode, encode_to_vec};
use weft_model::{EndpointId, Filter, LamportTimestamp, Topic, Value, VersionInfo};

use crate::error::NetError;
use crate::frame::Frame;

/// Largest frame accepted during the handshake.
const MAX_HELLO_FRAME: u32 = 1024 * 1024;

/// The introduction each side sends when a connection comes up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub id: EndpointId,
    pub version: VersionInfo,
    pub clock: LamportTimestamp,
    pub filter: Filter,
}

impl Hello {
    pub fn encode(&self) -> Vec<u8> {
        let filter = Value::List(
            self.filter
                .iter()
                .map(|topic| Value::from(topic.as_str()))
                .collect(),
        );
        let items = Value::List(vec![
            Value::String(self.id.to_string()),
            Value::Count(self.version.major as u64),
            Value::Count(self.version.minor as u64),
            Value::Count(self.version.patch as u64),
            Value::Count(self.version.protocol as u64),
            Value::Count(self.clock.value()),
            filter,
        ]);
        encode_to_vec(&items)
    }

    pub fn decode(bytes: &[u8]) -> Result<Hello, NetError> {
        let malformed = || NetError::Malformed("bad hello payload".into());
        let Value::List(items) = decode(bytes)? else {
            return Err(malformed());
        };
        let [id, major, minor, patch, protocol, clock, filter] =
            <[Value; 7]>::try_from(items).map_err(|_| malformed())?;

        let id: EndpointId = id
            .as_str()
            .and_then(|text| text.parse().ok())
            .ok_or_else(malformed)?;
        let version = VersionInfo {
            major: major.as_count().ok_or_else(malformed)? as u32,
            minor: minor.as_count().ok_or_else(malformed)? as u32,
            patch: patch.as_count().ok_or_else(malformed)? as u32,
            protocol: protocol.as_count().ok_or_else(malformed)? as u32,
        };
        let clock = LamportTimestamp(clock.as_count().ok_or_else(malformed)?);

        let Value::List(prefixes) = filter else {
            return Err(malformed());
        };
        let mut parsed = Filter::new();
        for prefix in prefixes {
            let topic = prefix
                .as_str()
                .and_then(|text| Topic::parse(text).ok())
                .ok_or_else(malformed)?;
            parsed.insert(topic);
        }

        Ok(Hello {
            id,
            version,
            clock,
            filter: parsed,
        })
    }
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> Result<(), NetError> {
    stream.write_u32(body.len() as u32).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, NetError> {
    let len = match stream.read_u32().await {
        Ok(len) => len,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(NetError::ClosedEarly)
        }
        Err(err) => return Err(err.into()),
    };
    if len > MAX_HELLO_FRAME {
        return Err(NetError::Malformed(format!("hello frame of {len} bytes")));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Runs the symmetric hello exchange on a fresh connection. Returns the
/// peer's hello, or the reason the peering must be rejected.
pub async fn handshake(
    stream: &mut TcpStream,
    ours: &Hello,
    timeout: Duration,
) -> Result<Hello, NetError> {
    let exchange = async {
        write_frame(stream, &Frame::Hello(ours.clone()).encode()).await?;
        let body = read_frame(stream).await?;
        match Frame::decode(&body)? {
            Frame::Hello(theirs) => Ok(theirs),
            Frame::Node(_) => Err(NetError::Malformed("expected hello frame".into())),
        }
    };
    let theirs: Hello = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| NetError::HandshakeTimeout)??;

    if !ours.version.compatible(&theirs.version) {
        return Err(NetError::Incompatible {
            ours: ours.version,
            theirs: theirs.version,
        });
    }
    if theirs.id == ours.id {
        return Err(NetError::IdCollision);
    }
    Ok(theirs)
}
