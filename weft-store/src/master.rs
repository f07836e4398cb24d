//! The master store actor.
//!
//! Owns the authoritative state of one named store. Every successful
//! mutation is sequenced and published on `<name>/_clone`; snapshot and key
//! requests arriving on `<name>/_master` are answered directly to the
//! requesting endpoint. A single logical timer drives per-key expiry.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use weft_model::value::{Timespan, Timestamp};
use weft_model::{EndpointId, Topic, Value};

use crate::backend::Backend;
use crate::command::{snapshot_to_value, CommandOp, Expiry, StoreCommand};
use crate::error::StoreError;
use crate::frontend::{StoreHandle, StoreMsg, StoreRequest};
use crate::link::NodeLink;

pub struct MasterActor {
    name: String,
    clone_topic: Topic,
    backend: Box<dyn Backend>,
    seq: u64,
    clones: HashSet<EndpointId>,
    link: Arc<dyn NodeLink>,
    rx: mpsc::Receiver<StoreMsg>,
    /// Min-heap of pending expirations. Superseded entries stay queued and
    /// fall through the exact-timestamp check in the backend.
    expirations: BinaryHeap<Reverse<(Timestamp, Value)>>,
    shutdown: CancellationToken,
}

impl MasterActor {
    /// Spawns the actor and returns the frontend handle.
    pub fn spawn(
        name: &str,
        mut backend: Box<dyn Backend>,
        link: Arc<dyn NodeLink>,
        shutdown: CancellationToken,
    ) -> Result<StoreHandle, StoreError> {
        let clone_topic = Topic::store_clone(name)
            .map_err(|err| StoreError::Backend(format!("invalid store name: {err}")))?;
        let (tx, rx) = mpsc::channel(64);

        // Rebuild the timer schedule from persisted state.
        let mut expirations = BinaryHeap::new();
        for (key, ts) in backend.expiries()? {
            expirations.push(Reverse((ts, key)));
        }

        let actor = MasterActor {
            name: name.to_string(),
            clone_topic,
            backend,
            seq: 0,
            clones: HashSet::new(),
            link,
            rx,
            expirations,
            shutdown,
        };
        tokio::spawn(actor.run());
        Ok(StoreHandle::new(name.to_string(), tx))
    }

    async fn run(mut self) {
        debug!(store = %self.name, "master up");
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(StoreMsg::Request(request)) => self.handle_request(request),
                    Some(StoreMsg::Wire(command)) => self.handle_wire(command),
                    None => break,
                },
                _ = tokio::time::sleep(deadline.unwrap_or_default()),
                    if deadline.is_some() => self.handle_expirations(),
            }
        }
        debug!(store = %self.name, "master down");
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.expirations.peek().map(|Reverse((ts, _))| {
            let remaining = ts.nanos().saturating_sub(Timestamp::now().nanos());
            Duration::from_nanos(remaining.max(0) as u64)
        })
    }

    fn resolve_expiry(expiry: Option<Timespan>) -> Option<Timestamp> {
        expiry.map(|span| Timestamp::now() + span)
    }

    /// Publishes a sequenced command on the clone stream and returns the
    /// assigned sequence number.
    fn emit(&mut self, command: StoreCommand) {
        self.seq += 1;
        let command = command.with_seq(self.seq);
        self.link.publish(&self.clone_topic, command);
    }

    fn command(&self, op: CommandOp) -> StoreCommand {
        StoreCommand::new(op, self.link.local_id())
    }

    fn schedule(&mut self, key: &Value, expiry: Option<Timestamp>) {
        if let Some(ts) = expiry {
            self.expirations.push(Reverse((ts, key.clone())));
        }
    }

    fn apply_put(
        &mut self,
        key: Value,
        value: Value,
        expiry: Option<Timestamp>,
    ) -> Result<(), StoreError> {
        self.backend.put(key.clone(), value.clone(), expiry)?;
        self.schedule(&key, expiry);
        let cmd = self
            .command(CommandOp::Put)
            .with_key(key)
            .with_value(value)
            .with_expiry(expiry.map(Expiry::At));
        self.emit(cmd);
        Ok(())
    }

    fn apply_add(
        &mut self,
        key: Value,
        value: Value,
        expiry: Option<Timestamp>,
    ) -> Result<(), StoreError> {
        self.backend.add(key.clone(), &value, expiry)?;
        self.schedule(&key, expiry);
        let cmd = self
            .command(CommandOp::Add)
            .with_key(key)
            .with_value(value)
            .with_expiry(expiry.map(Expiry::At));
        self.emit(cmd);
        Ok(())
    }

    fn apply_subtract(
        &mut self,
        key: Value,
        value: Value,
        expiry: Option<Timestamp>,
    ) -> Result<(), StoreError> {
        self.backend.subtract(&key, &value, expiry)?;
        self.schedule(&key, expiry);
        let cmd = self
            .command(CommandOp::Subtract)
            .with_key(key)
            .with_value(value)
            .with_expiry(expiry.map(Expiry::At));
        self.emit(cmd);
        Ok(())
    }

    fn apply_erase(&mut self, key: Value) -> Result<(), StoreError> {
        self.backend.erase(&key)?;
        let cmd = self.command(CommandOp::Erase).with_key(key);
        self.emit(cmd);
        Ok(())
    }

    fn apply_clear(&mut self) -> Result<(), StoreError> {
        self.backend.clear()?;
        self.expirations.clear();
        let cmd = self.command(CommandOp::Clear);
        self.emit(cmd);
        Ok(())
    }

    fn handle_request(&mut self, request: StoreRequest) {
        match request {
            StoreRequest::Put {
                key,
                value,
                expiry,
                reply,
            } => {
                let expiry = Self::resolve_expiry(expiry);
                let _ = reply.send(self.apply_put(key, value, expiry));
            }
            StoreRequest::Add {
                key,
                value,
                expiry,
                reply,
            } => {
                let expiry = Self::resolve_expiry(expiry);
                let _ = reply.send(self.apply_add(key, value, expiry));
            }
            StoreRequest::Subtract {
                key,
                value,
                expiry,
                reply,
            } => {
                let expiry = Self::resolve_expiry(expiry);
                let _ = reply.send(self.apply_subtract(key, value, expiry));
            }
            StoreRequest::Erase { key, reply } => {
                let _ = reply.send(self.apply_erase(key));
            }
            StoreRequest::Clear { reply } => {
                let _ = reply.send(self.apply_clear());
            }
            StoreRequest::Get { key, reply } => {
                let _ = reply.send(self.backend.get(&key));
            }
            StoreRequest::Exists { key, reply } => {
                let _ = reply.send(self.backend.exists(&key));
            }
            StoreRequest::Size { reply } => {
                let _ = reply.send(self.backend.size());
            }
            StoreRequest::Keys { reply } => {
                let _ = reply.send(self.backend.keys());
            }
        }
    }

    /// Commands arriving on `<name>/_master`: relayed clone writes plus
    /// snapshot and key requests.
    fn handle_wire(&mut self, command: StoreCommand) {
        let now = Timestamp::now();
        let sender = command.sender;
        match command.op {
            CommandOp::Put => {
                let (Some(key), Some(value)) = (command.key, command.value) else {
                    warn!(store = %self.name, "put command without key/value, skipping");
                    return;
                };
                let expiry = command.expiry.map(|e| e.resolve(now));
                if let Err(err) = self.apply_put(key, value, expiry) {
                    debug!(store = %self.name, peer = %sender, %err, "relayed put failed");
                }
            }
            CommandOp::Add => {
                let (Some(key), Some(value)) = (command.key, command.value) else {
                    warn!(store = %self.name, "add command without key/value, skipping");
                    return;
                };
                let expiry = command.expiry.map(|e| e.resolve(now));
                if let Err(err) = self.apply_add(key, value, expiry) {
                    debug!(store = %self.name, peer = %sender, %err, "relayed add failed");
                }
            }
            CommandOp::Subtract => {
                let (Some(key), Some(value)) = (command.key, command.value) else {
                    warn!(store = %self.name, "subtract command without key/value, skipping");
                    return;
                };
                let expiry = command.expiry.map(|e| e.resolve(now));
                if let Err(err) = self.apply_subtract(key, value, expiry) {
                    debug!(store = %self.name, peer = %sender, %err, "relayed subtract failed");
                }
            }
            CommandOp::Erase => {
                let Some(key) = command.key else {
                    warn!(store = %self.name, "erase command without key, skipping");
                    return;
                };
                if let Err(err) = self.apply_erase(key) {
                    debug!(store = %self.name, peer = %sender, %err, "relayed erase failed");
                }
            }
            CommandOp::Clear => {
                if let Err(err) = self.apply_clear() {
                    debug!(store = %self.name, peer = %sender, %err, "relayed clear failed");
                }
            }
            CommandOp::Snapshot => self.handle_snapshot_request(sender),
            CommandOp::Keys if command.value.is_none() => self.handle_keys_request(sender),
            other => {
                warn!(store = %self.name, peer = %sender, op = ?other,
                      "unexpected command on master topic, skipping");
            }
        }
    }

    fn handle_snapshot_request(&mut self, requester: EndpointId) {
        debug!(store = %self.name, peer = %requester, "snapshot requested");
        self.clones.insert(requester);
        match self.backend.snapshot() {
            Ok(snapshot) => {
                let ack = self
                    .command(CommandOp::SnapshotAck)
                    .with_value(snapshot_to_value(&snapshot))
                    .with_seq(self.seq);
                self.link.publish_to(requester, &self.clone_topic, ack);
            }
            Err(err) => {
                warn!(store = %self.name, %err, "snapshot assembly failed");
            }
        }
    }

    fn handle_keys_request(&mut self, requester: EndpointId) {
        match self.backend.keys() {
            Ok(keys) => {
                let response = self
                    .command(CommandOp::Keys)
                    .with_value(keys)
                    .with_seq(self.seq);
                self.link.publish_to(requester, &self.clone_topic, response);
            }
            Err(err) => {
                warn!(store = %self.name, %err, "keys query failed");
            }
        }
    }

    fn handle_expirations(&mut self) {
        let now = Timestamp::now();
        while let Some(Reverse((ts, _))) = self.expirations.peek() {
            if *ts > now {
                break;
            }
            let Reverse((ts, key)) = self.expirations.pop().expect("peeked");
            match self.backend.expire(&key, ts) {
                Ok(true) => {
                    debug!(store = %self.name, key = %key, "key expired");
                    let cmd = self
                        .command(CommandOp::Expire)
                        .with_key(key)
                        .with_expiry(Some(Expiry::At(ts)));
                    self.emit(cmd);
                }
                // Superseded deadline, the newer entry is still queued.
                Ok(false) => {}
                Err(err) => {
                    warn!(store = %self.name, key = %key, %err, "expiry failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use tokio::sync::watch;

    /// Records published commands for inspection.
    struct RecordingLink {
        id: EndpointId,
        sent: mpsc::UnboundedSender<(Option<EndpointId>, Topic, StoreCommand)>,
        reachable_tx: watch::Sender<bool>,
        reachable_rx: watch::Receiver<bool>,
    }

    impl RecordingLink {
        fn new(
            id: EndpointId,
        ) -> (
            Arc<Self>,
            mpsc::UnboundedReceiver<(Option<EndpointId>, Topic, StoreCommand)>,
        ) {
            let (sent, seen) = mpsc::unbounded_channel();
            let (reachable_tx, reachable_rx) = watch::channel(true);
            (
                Arc::new(Self {
                    id,
                    sent,
                    reachable_tx,
                    reachable_rx,
                }),
                seen,
            )
        }

        #[allow(dead_code)]
        fn set_reachable(&self, up: bool) {
            let _ = self.reachable_tx.send(up);
        }
    }

    impl NodeLink for RecordingLink {
        fn publish(&self, topic: &Topic, command: StoreCommand) {
            let _ = self.sent.send((None, topic.clone(), command));
        }

        fn publish_to(&self, dst: EndpointId, topic: &Topic, command: StoreCommand) {
            let _ = self.sent.send((Some(dst), topic.clone(), command));
        }

        fn watch_peer(&self, _peer: EndpointId) -> watch::Receiver<bool> {
            self.reachable_rx.clone()
        }

        fn local_id(&self) -> EndpointId {
            self.id
        }
    }

    fn master_id() -> EndpointId {
        EndpointId::from_bytes([1; 16])
    }

    fn spawn_master() -> (
        StoreHandle,
        mpsc::UnboundedReceiver<(Option<EndpointId>, Topic, StoreCommand)>,
        CancellationToken,
    ) {
        let (link, seen) = RecordingLink::new(master_id());
        let shutdown = CancellationToken::new();
        let handle = MasterActor::spawn(
            "inventory",
            Box::new(MemoryBackend::new()),
            link,
            shutdown.clone(),
        )
        .unwrap();
        (handle, seen, shutdown)
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let (handle, _seen, _guard) = spawn_master();
        handle
            .put(Value::from("k"), Value::from("v"), None)
            .await
            .unwrap();
        assert_eq!(handle.get(Value::from("k")).await.unwrap(), Value::from("v"));
        handle.erase(Value::from("k")).await.unwrap();
        assert_eq!(
            handle.get(Value::from("k")).await,
            Err(StoreError::NoSuchKey)
        );
    }

    #[tokio::test]
    async fn mutations_emit_sequenced_commands() {
        let (handle, mut seen, _guard) = spawn_master();
        handle
            .put(Value::from("k"), Value::Count(1), None)
            .await
            .unwrap();
        handle
            .add(Value::from("k"), Value::Count(2), None)
            .await
            .unwrap();

        let (dst, topic, first) = seen.recv().await.unwrap();
        assert_eq!(dst, None);
        assert_eq!(topic.as_str(), "inventory/_clone");
        assert_eq!(first.op, CommandOp::Put);
        assert_eq!(first.seq, 1);

        let (_, _, second) = seen.recv().await.unwrap();
        assert_eq!(second.op, CommandOp::Add);
        assert_eq!(second.seq, 2);
    }

    #[tokio::test]
    async fn snapshot_request_is_answered_directly() {
        let (handle, mut seen, _guard) = spawn_master();
        handle
            .put(Value::from("a"), Value::Count(1), None)
            .await
            .unwrap();
        let _ = seen.recv().await.unwrap();

        let clone_id = EndpointId::from_bytes([2; 16]);
        let request = StoreCommand::new(CommandOp::Snapshot, clone_id);
        handle
            .command_sender()
            .send(StoreMsg::Wire(request))
            .await
            .unwrap();

        let (dst, topic, ack) = seen.recv().await.unwrap();
        assert_eq!(dst, Some(clone_id));
        assert_eq!(topic.as_str(), "inventory/_clone");
        assert_eq!(ack.op, CommandOp::SnapshotAck);
        assert_eq!(ack.seq, 1);
        let snapshot = crate::command::snapshot_from_value(ack.value.as_ref().unwrap()).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, Value::from("a"));
    }

    #[tokio::test]
    async fn ttl_expires_key_and_emits_expire() {
        let (handle, mut seen, _guard) = spawn_master();
        handle
            .put(
                Value::from("k"),
                Value::Count(1),
                Some(Timespan::from_millis(100)),
            )
            .await
            .unwrap();
        let _ = seen.recv().await.unwrap();

        // Still present halfway through the TTL.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.get(Value::from("k")).await.unwrap(), Value::Count(1));

        // Gone after the deadline, with an expire command on the stream.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(
            handle.get(Value::from("k")).await,
            Err(StoreError::NoSuchKey)
        );
        let (_, _, cmd) = seen.recv().await.unwrap();
        assert_eq!(cmd.op, CommandOp::Expire);
    }

    #[tokio::test]
    async fn overwrite_cancels_pending_expiry() {
        let (handle, _seen, _guard) = spawn_master();
        handle
            .put(
                Value::from("k"),
                Value::Count(1),
                Some(Timespan::from_millis(50)),
            )
            .await
            .unwrap();
        handle
            .put(Value::from("k"), Value::Count(2), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(handle.get(Value::from("k")).await.unwrap(), Value::Count(2));
    }

    #[tokio::test]
    async fn relayed_writes_are_sequenced_like_local_ones() {
        let (handle, mut seen, _guard) = spawn_master();
        let clone_id = EndpointId::from_bytes([2; 16]);
        let relayed = StoreCommand::new(CommandOp::Put, clone_id)
            .with_key(Value::from("k"))
            .with_value(Value::from("w"));
        handle
            .command_sender()
            .send(StoreMsg::Wire(relayed))
            .await
            .unwrap();

        let (_, _, cmd) = seen.recv().await.unwrap();
        assert_eq!(cmd.op, CommandOp::Put);
        assert_eq!(cmd.seq, 1);
        assert_eq!(cmd.sender, master_id());
        assert_eq!(handle.get(Value::from("k")).await.unwrap(), Value::from("w"));
    }
}
