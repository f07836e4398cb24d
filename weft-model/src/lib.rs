//! Weft Model
//!
//! Pure data types for the weft fabric, decoupled from the codec, the
//! network stack, and the store actors.

pub mod endpoint_id;
pub mod error;
pub mod event;
pub mod message;
pub mod timestamp;
pub mod topic;
pub mod value;
pub mod version;

// Re-exports from dependencies
pub use uuid::Uuid;

pub use endpoint_id::EndpointId;
pub use error::ErrorKind;
pub use event::{Event, Status, StatusKind};
pub use message::{MessageKind, PackedMessage};
pub use timestamp::{LamportTimestamp, VectorTimestamp};
pub use topic::{Filter, Topic, TopicError};
pub use value::{Port, PortProtocol, Subnet, Timespan, Timestamp, Value, ValueTag};
pub use version::VersionInfo;
