//! Weft Node
//!
//! The endpoint: an overlay peer that floods subscriptions, advertises and
//! revokes paths, dispatches published messages along multipath plans, and
//! hosts master/clone stores. [`Endpoint`] is the public surface; one core
//! actor per endpoint owns all overlay state.

pub mod config;
mod core;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod flood;
mod link;
pub mod subscriber;

pub use config::Config;
pub use endpoint::{Endpoint, PeerInfo};
pub use error::EndpointError;
pub use events::EventSubscriber;
pub use subscriber::{Publisher, Subscriber};

// The vocabulary types callers interact with.
pub use weft_model::{
    EndpointId, ErrorKind, Event, Filter, Status, StatusKind, Topic, Value,
};
pub use weft_store::{BackendKind, BackendOptions, StoreError, StoreHandle, StoreProxy};
