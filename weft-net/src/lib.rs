//! Weft Net
//!
//! Attaches byte streams to the overlay: length-delimited frames carrying
//! node messages, the peering handshake, per-peer reader/writer tasks with a
//! shared kill-switch, and the process-wide peer status map.

pub mod error;
pub mod frame;
pub mod handshake;
pub mod shared_filter;
pub mod status;
pub mod transport;

pub use error::NetError;
pub use frame::{Frame, NodeMessage};
pub use handshake::{handshake, Hello};
pub use shared_filter::SharedFilter;
pub use status::{PeerStatus, PeerStatusMap};
pub use transport::{spawn_peer, DisconnectReason, PeerEvent, PeerLink};
