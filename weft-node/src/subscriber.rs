//! Local dispatch: subscriber queues and publisher handles.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tracing::warn;
use weft_codec::decode;
use weft_model::{Topic, Value};

/// Emit an overflow status item on the first drop and then every this many.
const OVERFLOW_REPORT_EVERY: u64 = 100;

struct QueueInner {
    items: Mutex<VecDeque<(Topic, Vec<u8>)>>,
    capacity: usize,
    overflows: AtomicU64,
    notify: Notify,
}

/// The producer side held by the core actor.
#[derive(Clone)]
pub(crate) struct SubscriberQueue {
    inner: Arc<QueueInner>,
}

impl SubscriberQueue {
    pub(crate) fn new(capacity: usize) -> (SubscriberQueue, Subscriber) {
        let inner = Arc::new(QueueInner {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            overflows: AtomicU64::new(0),
            notify: Notify::new(),
        });
        (
            SubscriberQueue {
                inner: inner.clone(),
            },
            Subscriber { inner },
        )
    }

    /// Enqueues one message, dropping the oldest on overflow. Returns the
    /// total overflow count if this push dropped a message that warrants a
    /// report.
    pub(crate) fn push(&self, topic: Topic, payload: Vec<u8>) -> Option<u64> {
        let mut report = None;
        {
            let mut items = self.inner.items.lock().expect("queue poisoned");
            if items.len() >= self.inner.capacity {
                items.pop_front();
                let total = self.inner.overflows.fetch_add(1, Ordering::Relaxed) + 1;
                if total == 1 || total % OVERFLOW_REPORT_EVERY == 0 {
                    report = Some(total);
                }
            }
            items.push_back((topic, payload));
        }
        self.inner.notify.notify_one();
        report
    }

    /// True once the consumer side is gone.
    pub(crate) fn is_orphaned(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }
}

/// The consumer side of a subscription: messages whose topic matched the
/// subscriber's filter, decoded on demand.
pub struct Subscriber {
    inner: Arc<QueueInner>,
}

impl Subscriber {
    /// Awaits the next message. Malformed payloads are skipped with a
    /// warning.
    pub async fn recv(&self) -> (Topic, Value) {
        loop {
            if let Some(message) = self.try_recv() {
                return message;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Pops a message if one is ready.
    pub fn try_recv(&self) -> Option<(Topic, Value)> {
        loop {
            let (topic, payload) = {
                let mut items = self.inner.items.lock().expect("queue poisoned");
                items.pop_front()?
            };
            match decode(&payload) {
                Ok(value) => return Some((topic, value)),
                Err(err) => {
                    warn!(%topic, %err, "skipping malformed payload");
                    continue;
                }
            }
        }
    }

    /// Awaits a non-empty queue without consuming, the readiness signal of
    /// the flow-control handle.
    pub async fn ready(&self) {
        loop {
            if self.buffered() > 0 {
                return;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn buffered(&self) -> usize {
        self.inner.items.lock().expect("queue poisoned").len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn free_capacity(&self) -> usize {
        self.capacity().saturating_sub(self.buffered())
    }

    /// Messages dropped to overflow so far.
    pub fn overflow_count(&self) -> u64 {
        self.inner.overflows.load(Ordering::Relaxed)
    }
}

/// What publishers hand to the core actor.
pub(crate) struct PublishOp {
    pub dst: Option<weft_model::EndpointId>,
    pub topic: Topic,
    pub payload: Vec<u8>,
}

/// A handle bound to one topic, with flow-control metrics over the shared
/// publish channel.
pub struct Publisher {
    topic: Topic,
    tx: mpsc::Sender<PublishOp>,
}

impl Publisher {
    pub(crate) fn new(topic: Topic, tx: mpsc::Sender<PublishOp>) -> Self {
        Self { topic, tx }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Publishes one value, awaiting queue space (blocking-producer
    /// backpressure).
    pub async fn publish(&self, value: Value) -> bool {
        let payload = weft_codec::encode_to_vec(&value);
        self.tx
            .send(PublishOp {
                dst: None,
                topic: self.topic.clone(),
                payload,
            })
            .await
            .is_ok()
    }

    /// How many messages the channel can still absorb without blocking.
    pub fn demand(&self) -> usize {
        self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn free_capacity(&self) -> usize {
        self.tx.capacity()
    }

    pub fn buffered(&self) -> usize {
        self.capacity().saturating_sub(self.free_capacity())
    }
}
