//! Per-peer transport flows.
//!
//! After the handshake, each peering gets a writer task (outbound channel →
//! frames) and a reader task (frames → the core's event channel), tied
//! together by one kill-switch. Disposing the kill-switch tears down both
//! directions; the reader reports the loss so the core treats it like a
//! failed direct connection. A malformed frame disconnects the peer.

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use weft_model::EndpointId;

use crate::frame::{Frame, NodeMessage};

/// Outbound backlog per peer before messages are shed.
const OUTBOUND_QUEUE: usize = 256;

/// Why a peering ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the connection or the socket failed.
    ConnectionLost(String),
    /// The peer sent bytes the codec rejects.
    Malformed(String),
    /// The kill-switch was disposed locally.
    Killed,
}

/// What the transport reports into the core actor.
#[derive(Debug)]
pub enum PeerEvent {
    Inbound {
        from: EndpointId,
        message: NodeMessage,
    },
    PeerGone {
        id: EndpointId,
        reason: DisconnectReason,
    },
}

/// The direct handle to one peer: an outbound queue plus the kill-switch
/// that removes both flow directions atomically.
#[derive(Clone)]
pub struct PeerLink {
    id: EndpointId,
    addr: SocketAddr,
    outbound: mpsc::Sender<NodeMessage>,
    kill: CancellationToken,
}

impl PeerLink {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queues a message for this peer. Data traffic is best-effort: when the
    /// peer cannot drain fast enough the message is shed and `false` comes
    /// back.
    pub fn send(&self, message: NodeMessage) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(peer = %self.id, "outbound queue full, shedding message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Disposes the kill-switch: cancels pending frames in both directions
    /// and lets the reader report the loss.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_cancelled()
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerLink({} @ {})", self.id, self.addr)
    }
}

/// Spawns the reader/writer pair for an established peering and returns the
/// link handle. `events` feeds the core actor.
pub fn spawn_peer(
    stream: TcpStream,
    id: EndpointId,
    addr: SocketAddr,
    events: mpsc::Sender<PeerEvent>,
) -> PeerLink {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<NodeMessage>(OUTBOUND_QUEUE);
    let kill = CancellationToken::new();

    let (read_half, write_half) = stream.into_split();
    let mut sink = FramedWrite::new(write_half, LengthDelimitedCodec::new());
    let mut source = FramedRead::new(read_half, LengthDelimitedCodec::new());

    // Writer: drain the outbound queue into frames until killed; flush what
    // is in flight before dropping the socket half.
    let writer_kill = kill.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_kill.cancelled() => break,
                next = outbound_rx.recv() => match next {
                    Some(message) => {
                        let bytes = Frame::Node(message).encode();
                        if sink.send(Bytes::from(bytes)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = sink.flush().await;
        trace!(peer = %id, "writer done");
    });

    // Reader: decode frames into core events until the connection ends, the
    // peer sends garbage, or the kill-switch fires.
    let reader_kill = kill.clone();
    tokio::spawn(async move {
        let reason = loop {
            tokio::select! {
                _ = reader_kill.cancelled() => break DisconnectReason::Killed,
                next = source.next() => match next {
                    Some(Ok(bytes)) => match Frame::decode(&bytes) {
                        Ok(Frame::Node(message)) => {
                            if events
                                .send(PeerEvent::Inbound { from: id, message })
                                .await
                                .is_err()
                            {
                                break DisconnectReason::Killed;
                            }
                        }
                        Ok(Frame::Hello(_)) => {
                            break DisconnectReason::Malformed(
                                "hello after handshake".into(),
                            );
                        }
                        Err(err) => break DisconnectReason::Malformed(err.to_string()),
                    },
                    Some(Err(err)) => break DisconnectReason::ConnectionLost(err.to_string()),
                    None => break DisconnectReason::ConnectionLost("closed by peer".into()),
                },
            }
        };
        // Tear down the writer as well; both directions go together.
        reader_kill.cancel();
        debug!(peer = %id, ?reason, "peer flow ended");
        let _ = events.send(PeerEvent::PeerGone { id, reason }).await;
    });

    PeerLink {
        id,
        addr,
        outbound: outbound_tx,
        kill,
    }
}
