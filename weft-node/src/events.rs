//! The user-facing event stream.

use tokio::sync::broadcast;
use tracing::trace;
use weft_model::Event;

/// Receives status and error items emitted by the endpoint. Created with
/// `receive_statuses = false` it only yields error items.
pub struct EventSubscriber {
    rx: broadcast::Receiver<Event>,
    receive_statuses: bool,
}

impl EventSubscriber {
    pub(crate) fn new(rx: broadcast::Receiver<Event>, receive_statuses: bool) -> Self {
        Self {
            rx,
            receive_statuses,
        }
    }

    /// The next matching event, or `None` once the endpoint is gone. A
    /// lagging subscriber skips over dropped items.
    pub async fn receive(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.is_status() && !self.receive_statuses {
                        continue;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(skipped, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Consumes the subscriber into a plain stream of matching events.
    pub fn into_stream(self) -> impl futures_util::Stream<Item = Event> {
        use futures_util::StreamExt;
        let receive_statuses = self.receive_statuses;
        tokio_stream::wrappers::BroadcastStream::new(self.rx).filter_map(move |item| async move {
            match item {
                Ok(event) if event.is_status() && !receive_statuses => None,
                Ok(event) => Some(event),
                Err(_) => None,
            }
        })
    }

    /// Non-blocking variant of [`receive`](Self::receive).
    pub fn try_receive(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if event.is_status() && !self.receive_statuses {
                        continue;
                    }
                    return Some(event);
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
