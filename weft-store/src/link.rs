//! The boundary between store actors and the overlay node that hosts them.

use tokio::sync::watch;
use weft_model::{EndpointId, Topic};

use crate::command::StoreCommand;

/// What a store actor needs from its endpoint: a way to publish commands and
/// a reachability signal per peer. The node implements this; tests plug in a
/// loopback.
pub trait NodeLink: Send + Sync + 'static {
    /// Publishes `command` to every endpoint whose filter matches `topic`.
    fn publish(&self, topic: &Topic, command: StoreCommand);

    /// Publishes `command` so that only `dst` receives it.
    fn publish_to(&self, dst: EndpointId, topic: &Topic, command: StoreCommand);

    /// A signal that is `true` while a route to `peer` exists.
    fn watch_peer(&self, peer: EndpointId) -> watch::Receiver<bool>;

    /// The id of the hosting endpoint.
    fn local_id(&self) -> EndpointId;
}
