//! Weft Store
//!
//! Named, replicated key/value stores. Each name has one writable master and
//! any number of eventually consistent clones. Masters apply mutations to a
//! pluggable backend and emit their command stream under `<name>/_clone`;
//! clones apply that stream, buffer writes while disconnected, and
//! resynchronize through snapshot transfer.
//!
//! Actors follow the handle/actor split used across the tree: a cloneable
//! handle owns an mpsc sender, the actor task owns all state and replies
//! through oneshot channels.

pub mod appliers;
pub mod backend;
pub mod clone;
pub mod command;
pub mod error;
pub mod frontend;
pub mod link;
pub mod master;
pub mod memory;
pub mod sqlite;

pub use backend::{Backend, BackendKind, BackendOptions, Snapshot, SnapshotEntry};
pub use clone::{CloneActor, CloneSettings};
pub use command::{CommandError, CommandOp, Expiry, StoreCommand};
pub use error::StoreError;
pub use frontend::{StoreHandle, StoreMsg, StoreProxy, StoreRequest};
pub use link::NodeLink;
pub use master::MasterActor;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
