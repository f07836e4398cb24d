//! Glue between store actors and the core actor.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use weft_model::{EndpointId, Topic};
use weft_store::{NodeLink, StoreCommand};

use crate::core::Command;

/// Reachability signals per peer, shared between the core actor (writer)
/// and store actors (readers). Guarded by a mutex; the core updates it after
/// every routing change.
#[derive(Default)]
pub(crate) struct PeerWatches {
    inner: Mutex<WatchState>,
}

#[derive(Default)]
struct WatchState {
    senders: HashMap<EndpointId, watch::Sender<bool>>,
    reachable: HashSet<EndpointId>,
}

impl PeerWatches {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates or clones the signal for `peer`, seeded with the current
    /// reachability.
    pub(crate) fn watch(&self, peer: EndpointId) -> watch::Receiver<bool> {
        let mut state = self.inner.lock().expect("watch state poisoned");
        let up = state.reachable.contains(&peer);
        state
            .senders
            .entry(peer)
            .or_insert_with(|| watch::channel(up).0)
            .subscribe()
    }

    pub(crate) fn set_reachable(&self, peer: EndpointId, up: bool) {
        let mut state = self.inner.lock().expect("watch state poisoned");
        let changed = if up {
            state.reachable.insert(peer)
        } else {
            state.reachable.remove(&peer)
        };
        if changed {
            if let Some(sender) = state.senders.get(&peer) {
                sender.send_replace(up);
            }
        }
    }
}

/// The [`NodeLink`] store actors talk to: publishes go through the core's
/// command channel, reachability comes from [`PeerWatches`].
pub(crate) struct CoreLink {
    id: EndpointId,
    tx: mpsc::UnboundedSender<Command>,
    watches: Arc<PeerWatches>,
}

impl CoreLink {
    pub(crate) fn new(
        id: EndpointId,
        tx: mpsc::UnboundedSender<Command>,
        watches: Arc<PeerWatches>,
    ) -> Arc<Self> {
        Arc::new(Self { id, tx, watches })
    }
}

impl NodeLink for CoreLink {
    fn publish(&self, topic: &Topic, command: StoreCommand) {
        let _ = self.tx.send(Command::StorePublish {
            dst: None,
            topic: topic.clone(),
            command,
        });
    }

    fn publish_to(&self, dst: EndpointId, topic: &Topic, command: StoreCommand) {
        let _ = self.tx.send(Command::StorePublish {
            dst: Some(dst),
            topic: topic.clone(),
            command,
        });
    }

    fn watch_peer(&self, peer: EndpointId) -> watch::Receiver<bool> {
        self.watches.watch(peer)
    }

    fn local_id(&self) -> EndpointId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(x: u8) -> EndpointId {
        EndpointId::from_bytes([x; 16])
    }

    #[test]
    fn watch_seeds_with_current_reachability() {
        let watches = PeerWatches::new();
        watches.set_reachable(id(1), true);
        assert!(*watches.watch(id(1)).borrow());
        assert!(!*watches.watch(id(2)).borrow());
    }

    #[tokio::test]
    async fn watch_observes_transitions() {
        let watches = PeerWatches::new();
        let mut rx = watches.watch(id(1));
        watches.set_reachable(id(1), true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        watches.set_reachable(id(1), false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
