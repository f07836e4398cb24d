//! The clone store actor.
//!
//! A clone mirrors one master: it applies the sequenced command stream from
//! `<name>/_clone`, answers reads from its local copy, and relays writes to
//! the master. While the master is unreachable it buffers writes in a
//! time-bounded queue and keeps retrying the attach; if the outage exceeds
//! the stale interval, reads start returning `store-stale` until a fresh
//! snapshot arrives.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use weft_model::value::Timestamp;
use weft_model::{EndpointId, Topic, Value};

use crate::appliers;
use crate::command::{snapshot_from_value, CommandOp, Expiry, StoreCommand};
use crate::error::StoreError;
use crate::frontend::{StoreHandle, StoreMsg, StoreRequest};
use crate::link::NodeLink;

/// Reads parked before the first snapshot; beyond this they fail fast.
const MAX_PARKED_READS: usize = 128;

/// Timing knobs of a clone.
#[derive(Clone, Copy, Debug)]
pub struct CloneSettings {
    /// How often to retry the attach while out of sync.
    pub resync_interval: Duration,
    /// How long after losing the master reads keep answering locally.
    pub stale_interval: Duration,
    /// Age limit for buffered writes; older entries are discarded on
    /// admission of new ones.
    pub mutation_buffer_interval: Duration,
}

impl Default for CloneSettings {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(1),
            stale_interval: Duration::from_secs(10),
            mutation_buffer_interval: Duration::from_secs(120),
        }
    }
}

pub struct CloneActor {
    name: String,
    master_topic: Topic,
    entries: BTreeMap<Value, (Value, Option<Timestamp>)>,
    settings: CloneSettings,
    link: Arc<dyn NodeLink>,
    rx: mpsc::Receiver<StoreMsg>,
    shutdown: CancellationToken,

    /// Set after the first snapshot; local reads are meaningful from then on.
    synced_once: bool,
    /// Reads fail with `store-stale` while set.
    stale: bool,
    /// A snapshot request is outstanding.
    awaiting_ack: bool,
    /// Sequence of the last applied command from the master's stream.
    last_seq: u64,
    master: Option<EndpointId>,
    reachable: Option<watch::Receiver<bool>>,
    connected: bool,

    buffered: VecDeque<(Instant, StoreCommand)>,
    parked_reads: Vec<StoreRequest>,
    next_resync: Option<Instant>,
    stale_at: Option<Instant>,
    resync_attempts: u32,
}

impl CloneActor {
    pub fn spawn(
        name: &str,
        settings: CloneSettings,
        link: Arc<dyn NodeLink>,
        shutdown: CancellationToken,
    ) -> Result<StoreHandle, StoreError> {
        let master_topic = Topic::store_master(name)
            .map_err(|err| StoreError::Backend(format!("invalid store name: {err}")))?;
        let (tx, rx) = mpsc::channel(64);
        let actor = CloneActor {
            name: name.to_string(),
            master_topic,
            entries: BTreeMap::new(),
            settings,
            link,
            rx,
            shutdown,
            synced_once: false,
            stale: false,
            awaiting_ack: false,
            last_seq: 0,
            master: None,
            reachable: None,
            connected: false,
            buffered: VecDeque::new(),
            parked_reads: Vec::new(),
            next_resync: None,
            stale_at: None,
            resync_attempts: 0,
        };
        tokio::spawn(actor.run());
        Ok(StoreHandle::new(name.to_string(), tx))
    }

    async fn run(mut self) {
        debug!(store = %self.name, "clone up, attaching");
        self.request_snapshot();
        let shutdown = self.shutdown.clone();
        loop {
            let deadline = [self.next_resync, self.stale_at]
                .into_iter()
                .flatten()
                .min();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(StoreMsg::Request(request)) => self.handle_request(request),
                    Some(StoreMsg::Wire(command)) => self.handle_wire(command),
                    None => break,
                },
                changed = watch_changed(&mut self.reachable) => {
                    if changed {
                        self.handle_reachability();
                    } else {
                        self.reachable = None;
                        self.on_disconnected();
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => self.handle_timers(),
            }
        }
        debug!(store = %self.name, "clone down");
    }

    // -- attach & reachability ------------------------------------------------

    fn request_snapshot(&mut self) {
        self.awaiting_ack = true;
        self.resync_attempts += 1;
        if self.resync_attempts == 5 && !self.synced_once {
            warn!(store = %self.name, "no master answered the attach yet");
        }
        let request = StoreCommand::new(CommandOp::Snapshot, self.link.local_id());
        self.link.publish(&self.master_topic, request);
        self.next_resync = Some(Instant::now() + self.settings.resync_interval);
    }

    fn handle_reachability(&mut self) {
        let up = self
            .reachable
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false);
        if up && !self.connected {
            self.connected = true;
            self.on_reconnected();
        } else if !up && self.connected {
            self.connected = false;
            self.on_disconnected();
        }
    }

    fn on_disconnected(&mut self) {
        debug!(store = %self.name, "lost path to master");
        self.stale_at = Some(Instant::now() + self.settings.stale_interval);
        self.next_resync = Some(Instant::now() + self.settings.resync_interval);
    }

    fn on_reconnected(&mut self) {
        debug!(store = %self.name, buffered = self.buffered.len(), "path to master is back");
        self.stale_at = None;
        self.drain_buffer();
        self.request_snapshot();
    }

    fn drain_buffer(&mut self) {
        let cutoff = Instant::now().checked_sub(self.settings.mutation_buffer_interval);
        while let Some((admitted, command)) = self.buffered.pop_front() {
            if cutoff.is_some_and(|cutoff| admitted < cutoff) {
                continue;
            }
            self.link.publish(&self.master_topic, command);
        }
    }

    fn handle_timers(&mut self) {
        let now = Instant::now();
        if self.stale_at.is_some_and(|at| at <= now) {
            self.stale_at = None;
            if self.synced_once {
                debug!(store = %self.name, "entering stale state");
            }
            self.stale = true;
        }
        if self.next_resync.is_some_and(|at| at <= now) {
            self.next_resync = None;
            if self.awaiting_ack || !self.connected {
                self.request_snapshot();
            }
        }
    }

    // -- frontend requests ----------------------------------------------------

    fn handle_request(&mut self, request: StoreRequest) {
        match request {
            StoreRequest::Put {
                key,
                value,
                expiry,
                reply,
            } => {
                self.relay_or_buffer(
                    StoreCommand::new(CommandOp::Put, self.link.local_id())
                        .with_key(key)
                        .with_value(value)
                        .with_expiry(expiry.map(Expiry::In)),
                );
                let _ = reply.send(Ok(()));
            }
            StoreRequest::Add {
                key,
                value,
                expiry,
                reply,
            } => {
                self.relay_or_buffer(
                    StoreCommand::new(CommandOp::Add, self.link.local_id())
                        .with_key(key)
                        .with_value(value)
                        .with_expiry(expiry.map(Expiry::In)),
                );
                let _ = reply.send(Ok(()));
            }
            StoreRequest::Subtract {
                key,
                value,
                expiry,
                reply,
            } => {
                self.relay_or_buffer(
                    StoreCommand::new(CommandOp::Subtract, self.link.local_id())
                        .with_key(key)
                        .with_value(value)
                        .with_expiry(expiry.map(Expiry::In)),
                );
                let _ = reply.send(Ok(()));
            }
            StoreRequest::Erase { key, reply } => {
                self.relay_or_buffer(
                    StoreCommand::new(CommandOp::Erase, self.link.local_id()).with_key(key),
                );
                let _ = reply.send(Ok(()));
            }
            StoreRequest::Clear { reply } => {
                self.relay_or_buffer(StoreCommand::new(CommandOp::Clear, self.link.local_id()));
                let _ = reply.send(Ok(()));
            }
            read => self.handle_read(read),
        }
    }

    fn handle_read(&mut self, read: StoreRequest) {
        if self.stale {
            Self::answer_read(read, Err(StoreError::Stale), &self.entries);
            return;
        }
        if !self.synced_once {
            // Park until the first snapshot; the caller's timeout bounds the
            // wait. Once parking saturates, answer what is actually wrong:
            // no master has shown up.
            if self.parked_reads.len() < MAX_PARKED_READS {
                self.parked_reads.push(read);
            } else {
                Self::answer_read(read, Err(StoreError::NoSuchMaster), &self.entries);
            }
            return;
        }
        Self::answer_read(read, Ok(()), &self.entries);
    }

    /// Answers one read request, either with `forced` as error or from
    /// `entries`.
    fn answer_read(
        read: StoreRequest,
        forced: Result<(), StoreError>,
        entries: &BTreeMap<Value, (Value, Option<Timestamp>)>,
    ) {
        match read {
            StoreRequest::Get { key, reply } => {
                let _ = reply.send(forced.and_then(|_| {
                    entries
                        .get(&key)
                        .map(|(value, _)| value.clone())
                        .ok_or(StoreError::NoSuchKey)
                }));
            }
            StoreRequest::Exists { key, reply } => {
                let _ = reply.send(forced.map(|_| entries.contains_key(&key)));
            }
            StoreRequest::Size { reply } => {
                let _ = reply.send(forced.map(|_| entries.len() as u64));
            }
            StoreRequest::Keys { reply } => {
                let _ =
                    reply.send(forced.map(|_| Value::Set(entries.keys().cloned().collect())));
            }
            // Mutations never reach this path.
            _ => {}
        }
    }

    fn relay_or_buffer(&mut self, command: StoreCommand) {
        if self.connected {
            self.link.publish(&self.master_topic, command);
        } else {
            // Admission prunes entries that outlived the buffer window.
            let cutoff = Instant::now().checked_sub(self.settings.mutation_buffer_interval);
            if let Some(cutoff) = cutoff {
                while self
                    .buffered
                    .front()
                    .is_some_and(|(admitted, _)| *admitted < cutoff)
                {
                    self.buffered.pop_front();
                }
            }
            self.buffered.push_back((Instant::now(), command));
        }
    }

    // -- the master's command stream ------------------------------------------

    fn handle_wire(&mut self, command: StoreCommand) {
        match command.op {
            CommandOp::SnapshotAck => self.handle_snapshot_ack(command),
            CommandOp::Keys => self.handle_keys_response(command),
            op if op.is_mutation() => self.handle_stream_mutation(command),
            other => {
                warn!(store = %self.name, op = ?other,
                      "unexpected command on clone topic, skipping");
            }
        }
    }

    fn handle_snapshot_ack(&mut self, command: StoreCommand) {
        let Some(value) = &command.value else {
            warn!(store = %self.name, "snapshot without state, skipping");
            return;
        };
        let snapshot = match snapshot_from_value(value) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(store = %self.name, %err, "malformed snapshot, skipping");
                return;
            }
        };
        debug!(store = %self.name, entries = snapshot.len(), seq = command.seq,
               "snapshot received, replacing state");

        // Atomic replacement: build the new map, then swap.
        let mut entries = BTreeMap::new();
        for entry in snapshot {
            entries.insert(entry.key, (entry.value, entry.expiry));
        }
        self.entries = entries;
        self.last_seq = command.seq;
        self.synced_once = true;
        self.stale = false;
        self.awaiting_ack = false;
        self.stale_at = None;
        self.next_resync = None;
        self.resync_attempts = 0;

        if self.master != Some(command.sender) {
            self.master = Some(command.sender);
            self.reachable = Some(self.link.watch_peer(command.sender));
        }
        let was_connected = self.connected;
        self.connected = self
            .reachable
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(true);
        if self.connected && !was_connected {
            self.drain_buffer();
        }

        for read in std::mem::take(&mut self.parked_reads) {
            Self::answer_read(read, Ok(()), &self.entries);
        }
    }

    fn handle_stream_mutation(&mut self, command: StoreCommand) {
        if !self.synced_once {
            return;
        }
        if command.seq <= self.last_seq {
            return;
        }
        if command.seq != self.last_seq + 1 {
            debug!(store = %self.name, expected = self.last_seq + 1, got = command.seq,
                   "gap in command stream, requesting fresh snapshot");
            self.request_snapshot();
            return;
        }
        self.last_seq = command.seq;
        self.apply_mutation(command);
    }

    fn apply_mutation(&mut self, command: StoreCommand) {
        let expiry = command.expiry.and_then(|e| match e {
            Expiry::At(ts) => Some(ts),
            // The stream always carries absolute deadlines.
            Expiry::In(_) => None,
        });
        match command.op {
            CommandOp::Put => {
                if let (Some(key), Some(value)) = (command.key, command.value) {
                    self.entries.insert(key, (value, expiry));
                }
            }
            CommandOp::Add => {
                if let (Some(key), Some(value)) = (command.key, command.value) {
                    let slot = self
                        .entries
                        .entry(key)
                        .or_insert_with(|| (Value::neutral(value.tag()), None));
                    if let Err(err) = appliers::add_to(&mut slot.0, &value) {
                        warn!(store = %self.name, %err, "add from stream failed");
                    }
                    slot.1 = expiry;
                }
            }
            CommandOp::Subtract => {
                if let (Some(key), Some(value)) = (command.key, command.value) {
                    if let Some(slot) = self.entries.get_mut(&key) {
                        if let Err(err) = appliers::subtract_from(&mut slot.0, &value) {
                            warn!(store = %self.name, %err, "subtract from stream failed");
                        }
                        slot.1 = expiry;
                    }
                }
            }
            CommandOp::Erase => {
                if let Some(key) = command.key {
                    self.entries.remove(&key);
                }
            }
            CommandOp::Clear => self.entries.clear(),
            CommandOp::Expire => {
                if let (Some(key), Some(ts)) = (command.key, expiry) {
                    if let Some((_, Some(recorded))) = self.entries.get(&key) {
                        if *recorded == ts {
                            self.entries.remove(&key);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// A `keys` response reconciles between snapshots: keys absent upstream
    /// are dropped locally.
    fn handle_keys_response(&mut self, command: StoreCommand) {
        let Some(Value::Set(upstream)) = command.value else {
            return;
        };
        self.entries.retain(|key, _| upstream.contains(key));
    }
}

async fn watch_changed(watch: &mut Option<watch::Receiver<bool>>) -> bool {
    match watch {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::MasterActor;
    use crate::memory::MemoryBackend;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// An in-process fabric connecting store actors by topic, with a
    /// partition switch between the two endpoints.
    struct Fabric {
        routes: Mutex<HashMap<String, Vec<(EndpointId, mpsc::Sender<StoreMsg>)>>>,
        partitioned: Mutex<bool>,
        watches: Mutex<HashMap<EndpointId, watch::Sender<bool>>>,
    }

    impl Fabric {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                routes: Mutex::new(HashMap::new()),
                partitioned: Mutex::new(false),
                watches: Mutex::new(HashMap::new()),
            })
        }

        fn register(&self, id: EndpointId, topic: &Topic, tx: mpsc::Sender<StoreMsg>) {
            self.routes
                .lock()
                .unwrap()
                .entry(topic.as_str().to_string())
                .or_default()
                .push((id, tx));
        }

        fn set_partitioned(&self, yes: bool) {
            *self.partitioned.lock().unwrap() = yes;
            for sender in self.watches.lock().unwrap().values() {
                let _ = sender.send(!yes);
            }
        }

        fn link(self: &Arc<Self>, id: EndpointId) -> Arc<FabricLink> {
            Arc::new(FabricLink {
                fabric: self.clone(),
                id,
            })
        }
    }

    struct FabricLink {
        fabric: Arc<Fabric>,
        id: EndpointId,
    }

    impl FabricLink {
        fn deliver(&self, dst: Option<EndpointId>, topic: &Topic, command: StoreCommand) {
            if *self.fabric.partitioned.lock().unwrap() {
                return;
            }
            let routes = self.fabric.routes.lock().unwrap();
            if let Some(subscribers) = routes.get(topic.as_str()) {
                for (id, tx) in subscribers {
                    if dst.is_some_and(|want| want != *id) {
                        continue;
                    }
                    let _ = tx.try_send(StoreMsg::Wire(command.clone()));
                }
            }
        }
    }

    impl NodeLink for FabricLink {
        fn publish(&self, topic: &Topic, command: StoreCommand) {
            self.deliver(None, topic, command);
        }

        fn publish_to(&self, dst: EndpointId, topic: &Topic, command: StoreCommand) {
            self.deliver(Some(dst), topic, command);
        }

        fn watch_peer(&self, _peer: EndpointId) -> watch::Receiver<bool> {
            let mut watches = self.fabric.watches.lock().unwrap();
            let up = !*self.fabric.partitioned.lock().unwrap();
            let sender = watches
                .entry(self.id)
                .or_insert_with(|| watch::channel(up).0);
            sender.subscribe()
        }

        fn local_id(&self) -> EndpointId {
            self.id
        }
    }

    fn fast_settings() -> CloneSettings {
        CloneSettings {
            resync_interval: Duration::from_millis(50),
            stale_interval: Duration::from_millis(300),
            mutation_buffer_interval: Duration::from_secs(5),
        }
    }

    struct Rig {
        fabric: Arc<Fabric>,
        master: StoreHandle,
        clone: StoreHandle,
        _shutdown: CancellationToken,
    }

    async fn rig() -> Rig {
        let fabric = Fabric::new();
        let master_id = EndpointId::from_bytes([1; 16]);
        let clone_id = EndpointId::from_bytes([2; 16]);
        let shutdown = CancellationToken::new();

        let master = MasterActor::spawn(
            "inventory",
            Box::new(MemoryBackend::new()),
            fabric.link(master_id),
            shutdown.clone(),
        )
        .unwrap();
        fabric.register(
            master_id,
            &Topic::store_master("inventory").unwrap(),
            master.command_sender(),
        );

        let clone = CloneActor::spawn(
            "inventory",
            fast_settings(),
            fabric.link(clone_id),
            shutdown.clone(),
        )
        .unwrap();
        fabric.register(
            clone_id,
            &Topic::store_clone("inventory").unwrap(),
            clone.command_sender(),
        );

        Rig {
            fabric,
            master,
            clone,
            _shutdown: shutdown,
        }
    }

    /// Polls `$cond` until it holds or a couple of seconds pass.
    macro_rules! eventually {
        ($what:expr, $cond:expr) => {{
            let mut ok = false;
            for _ in 0..100 {
                if $cond {
                    ok = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            if !ok {
                panic!("timed out waiting for {}", $what);
            }
        }};
    }

    #[tokio::test]
    async fn clone_converges_to_master_state() {
        let rig = rig().await;
        rig.master
            .put(Value::from("k"), Value::from("v"), None)
            .await
            .unwrap();

        eventually!(
            "clone to see the master's value",
            rig.clone.get(Value::from("k")).await == Ok(Value::from("v"))
        );
    }

    #[tokio::test]
    async fn writes_on_clone_reach_master() {
        let rig = rig().await;
        // Wait for attach.
        rig.clone.get(Value::from("absent")).await.ok();
        rig.clone
            .put(Value::from("k"), Value::from("w"), None)
            .await
            .unwrap();

        eventually!(
            "master to apply the relayed write",
            rig.master.get(Value::from("k")).await == Ok(Value::from("w"))
        );
    }

    #[tokio::test]
    async fn buffered_writes_drain_after_reconnect() {
        let rig = rig().await;
        rig.master
            .put(Value::from("k"), Value::from("v"), None)
            .await
            .unwrap();
        // Let the clone attach and sync.
        eventually!(
            "clone to sync",
            rig.clone.get(Value::from("k")).await == Ok(Value::from("v"))
        );

        rig.fabric.set_partitioned(true);
        rig.clone
            .put(Value::from("k"), Value::from("w"), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Master has not seen the write yet.
        assert_eq!(
            rig.master.get(Value::from("k")).await.unwrap(),
            Value::from("v")
        );

        rig.fabric.set_partitioned(false);
        eventually!(
            "buffered write to drain",
            rig.master.get(Value::from("k")).await == Ok(Value::from("w"))
        );
    }

    #[tokio::test]
    async fn long_partition_turns_reads_stale() {
        let rig = rig().await;
        rig.master
            .put(Value::from("k"), Value::from("v"), None)
            .await
            .unwrap();
        eventually!(
            "clone to sync",
            rig.clone.get(Value::from("k")).await == Ok(Value::from("v"))
        );

        rig.fabric.set_partitioned(true);
        // Within the stale window reads still answer from the local copy.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            rig.clone.get(Value::from("k")).await.unwrap(),
            Value::from("v")
        );

        // Beyond it they return store-stale.
        eventually!(
            "reads to turn stale",
            rig.clone.get(Value::from("k")).await == Err(StoreError::Stale)
        );

        // Reconnect recovers via a fresh snapshot.
        rig.fabric.set_partitioned(false);
        eventually!(
            "clone to recover from stale",
            rig.clone.get(Value::from("k")).await == Ok(Value::from("v"))
        );
    }

    #[tokio::test]
    async fn reads_before_first_snapshot_park_until_live() {
        let fabric = Fabric::new();
        let clone_id = EndpointId::from_bytes([2; 16]);
        let shutdown = CancellationToken::new();
        let clone = CloneActor::spawn(
            "inventory",
            fast_settings(),
            fabric.link(clone_id),
            shutdown.clone(),
        )
        .unwrap();
        fabric.register(
            clone_id,
            &Topic::store_clone("inventory").unwrap(),
            clone.command_sender(),
        );

        // No master at all: a bounded read times out rather than answering
        // from the empty map.
        let bounded = clone.clone().with_timeout(Duration::from_millis(200));
        assert_eq!(
            bounded.get(Value::from("k")).await,
            Err(StoreError::Timeout)
        );
    }
}
