//! The core actor: one task per endpoint owning all overlay state.
//!
//! It consumes four streams: commands from the public handle, publish
//! operations from publishers, connection outcomes from connector/acceptor
//! tasks, and transport events from per-peer readers. Subscription floods,
//! path revocations, and multipath dispatch all live here; nothing else
//! touches the routing table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use weft_model::{
    EndpointId, ErrorKind, Event, Filter, LamportTimestamp, MessageKind, PackedMessage, Status,
    StatusKind, Topic, VectorTimestamp,
};
use weft_net::{
    DisconnectReason, Hello, NodeMessage, PeerEvent, PeerLink, PeerStatus, PeerStatusMap,
    SharedFilter,
};
use weft_routing::{Blacklist, Multipath, MultipathNode, RoutingTable};
use weft_store::{
    backend, BackendKind, BackendOptions, CloneActor, CloneSettings, CommandError, MasterActor,
    StoreCommand, StoreError, StoreHandle, StoreMsg,
};

use crate::config::Config;
use crate::endpoint::PeerInfo;
use crate::error::EndpointError;
use crate::flood::{control_topic, RoutingUpdate};
use crate::link::{CoreLink, PeerWatches};
use crate::subscriber::{PublishOp, Subscriber, SubscriberQueue};

/// Commands from the endpoint handle and from hosted store actors.
pub(crate) enum Command {
    Peer {
        addr: SocketAddr,
        retry: std::time::Duration,
        reply: Option<oneshot::Sender<Result<EndpointId, EndpointError>>>,
    },
    Unpeer {
        addr: SocketAddr,
        reply: Option<oneshot::Sender<bool>>,
    },
    Subscribe {
        filter: Filter,
        queue_size: usize,
        reply: oneshot::Sender<Subscriber>,
    },
    AttachMaster {
        name: String,
        kind: BackendKind,
        options: BackendOptions,
        reply: oneshot::Sender<Result<StoreHandle, StoreError>>,
    },
    AttachClone {
        name: String,
        settings: CloneSettings,
        reply: oneshot::Sender<Result<StoreHandle, StoreError>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    PeerSubscriptions {
        reply: oneshot::Sender<Vec<Topic>>,
    },
    AwaitPeer {
        peer: EndpointId,
        reply: oneshot::Sender<bool>,
    },
    StorePublish {
        dst: Option<EndpointId>,
        topic: Topic,
        command: StoreCommand,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Outcomes of connection attempts, inbound and outbound.
pub(crate) enum ConnEvent {
    Established {
        link: PeerLink,
        hello: Hello,
        reply: Option<oneshot::Sender<Result<EndpointId, EndpointError>>>,
    },
    Failed {
        addr: SocketAddr,
        kind: ErrorKind,
        message: String,
        reply: Option<oneshot::Sender<Result<EndpointId, EndpointError>>>,
        /// The connector gave up; its bookkeeping can go.
        done: bool,
    },
}

struct StoreEntry {
    is_master: bool,
    topic: Topic,
}

pub(crate) struct Core {
    id: EndpointId,
    config: Config,
    clock: LamportTimestamp,
    filter: Filter,
    shared_filter: Arc<SharedFilter>,

    tbl: RoutingTable<PeerLink>,
    peer_filters: HashMap<EndpointId, Filter>,
    last_seen: HashMap<EndpointId, LamportTimestamp>,
    blacklist: Blacklist,
    peers_by_addr: HashMap<SocketAddr, EndpointId>,
    last_contact: HashMap<EndpointId, Instant>,

    subscribers: Vec<(Filter, SubscriberQueue)>,
    stores: HashMap<String, StoreEntry>,
    store_routes: HashMap<Topic, mpsc::Sender<StoreMsg>>,

    watches: Arc<PeerWatches>,
    statuses: Arc<PeerStatusMap>,
    events: broadcast::Sender<Event>,
    connectors: HashMap<SocketAddr, CancellationToken>,
    awaiting_peer: Vec<(EndpointId, oneshot::Sender<bool>)>,

    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    publish_rx: mpsc::Receiver<PublishOp>,
    conn_rx: mpsc::Receiver<ConnEvent>,
    conn_tx: mpsc::Sender<ConnEvent>,
    transport_rx: mpsc::Receiver<PeerEvent>,
    transport_tx: mpsc::Sender<PeerEvent>,

    store_shutdown: CancellationToken,
    shutting_down: bool,
}

pub(crate) struct CoreChannels {
    pub cmd_tx: mpsc::UnboundedSender<Command>,
    pub publish_tx: mpsc::Sender<PublishOp>,
    pub conn_tx: mpsc::Sender<ConnEvent>,
    pub transport_tx: mpsc::Sender<PeerEvent>,
    pub events: broadcast::Sender<Event>,
    pub shared_filter: Arc<SharedFilter>,
    pub statuses: Arc<PeerStatusMap>,
}

impl Core {
    pub(crate) fn spawn(id: EndpointId, config: Config) -> CoreChannels {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (publish_tx, publish_rx) = mpsc::channel(64);
        let (conn_tx, conn_rx) = mpsc::channel(16);
        let (transport_tx, transport_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(128);
        let shared_filter = Arc::new(SharedFilter::new());
        let statuses = Arc::new(PeerStatusMap::new());

        let core = Core {
            id,
            config,
            clock: LamportTimestamp::default(),
            filter: Filter::new(),
            shared_filter: shared_filter.clone(),
            tbl: RoutingTable::new(),
            peer_filters: HashMap::new(),
            last_seen: HashMap::new(),
            blacklist: Blacklist::new(),
            peers_by_addr: HashMap::new(),
            last_contact: HashMap::new(),
            subscribers: Vec::new(),
            stores: HashMap::new(),
            store_routes: HashMap::new(),
            watches: PeerWatches::new(),
            statuses: statuses.clone(),
            events: events.clone(),
            connectors: HashMap::new(),
            awaiting_peer: Vec::new(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            publish_rx,
            conn_rx,
            conn_tx: conn_tx.clone(),
            transport_rx,
            transport_tx: transport_tx.clone(),
            store_shutdown: CancellationToken::new(),
            shutting_down: false,
        };
        tokio::spawn(core.run());

        CoreChannels {
            cmd_tx,
            publish_tx,
            conn_tx,
            transport_tx,
            events,
            shared_filter,
            statuses,
        }
    }

    async fn run(mut self) {
        debug!(endpoint = %self.id, "core actor up");
        let mut tick = tokio::time::interval(self.config.keepalive_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(op) = self.publish_rx.recv() => {
                    self.dispatch(MessageKind::Data, op.topic, op.payload, op.dst).await;
                }
                Some(event) = self.conn_rx.recv() => self.handle_conn_event(event),
                Some(event) = self.transport_rx.recv() => self.handle_transport(event).await,
                _ = tick.tick() => self.handle_tick(),
            }
        }
        debug!(endpoint = %self.id, "core actor down");
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn emit_status(&self, status: Status) {
        trace!(endpoint = %self.id, %status, "status");
        self.emit(Event::Status(status));
    }

    // -- commands -------------------------------------------------------------

    /// Returns `true` once the endpoint should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        if self.shutting_down {
            // Short-circuit everything but the shutdown ack itself.
            if let Command::Shutdown { reply } = cmd {
                let _ = reply.send(());
            }
            return false;
        }
        match cmd {
            Command::Peer { addr, retry, reply } => self.start_connector(addr, retry, reply),
            Command::Unpeer { addr, reply } => {
                let existed = self.unpeer(addr);
                if let Some(reply) = reply {
                    let _ = reply.send(existed);
                }
            }
            Command::Subscribe {
                filter,
                queue_size,
                reply,
            } => {
                let (queue, subscriber) = SubscriberQueue::new(queue_size);
                self.subscribers.push((filter, queue));
                let _ = reply.send(subscriber);
                self.refilter();
            }
            Command::AttachMaster {
                name,
                kind,
                options,
                reply,
            } => {
                let _ = reply.send(self.attach_master(&name, kind, &options));
            }
            Command::AttachClone {
                name,
                settings,
                reply,
            } => {
                let _ = reply.send(self.attach_clone(&name, settings));
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.peer_infos());
            }
            Command::PeerSubscriptions { reply } => {
                let mut topics = Filter::new();
                for filter in self.peer_filters.values() {
                    topics.extend(filter);
                }
                let _ = reply.send(topics.iter().cloned().collect());
            }
            Command::AwaitPeer { peer, reply } => {
                if self.tbl.reachable(&peer) {
                    let _ = reply.send(true);
                } else {
                    self.awaiting_peer.push((peer, reply));
                }
            }
            Command::StorePublish {
                dst,
                topic,
                command,
            } => {
                let payload = command.encode();
                self.dispatch(MessageKind::Command, topic, payload, dst).await;
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn shutdown(&mut self) {
        debug!(endpoint = %self.id, "shutting down");
        self.shutting_down = true;
        self.store_shutdown.cancel();
        for token in self.connectors.values() {
            token.cancel();
        }
        self.connectors.clear();
        // Dropping the links closes their outbound channels; writers drain
        // what is queued, flush, and let the sockets go.
        let peers: Vec<EndpointId> = self.tbl.peers().copied().collect();
        for peer in &peers {
            self.tbl.erase(peer, |_| {});
            self.watches.set_reachable(*peer, false);
        }
        self.peer_filters.clear();
        self.last_seen.clear();
        self.peers_by_addr.clear();
        self.subscribers.clear();
        self.store_routes.clear();
        self.stores.clear();
    }

    // -- peering lifecycle ----------------------------------------------------

    fn start_connector(
        &mut self,
        addr: SocketAddr,
        retry: std::time::Duration,
        reply: Option<oneshot::Sender<Result<EndpointId, EndpointError>>>,
    ) {
        if let Some(id) = self.peers_by_addr.get(&addr) {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(*id));
            }
            return;
        }
        if self.connectors.contains_key(&addr) {
            if let Some(reply) = reply {
                let _ = reply.send(Err(EndpointError::PeerUnavailable(addr)));
            }
            return;
        }
        let token = CancellationToken::new();
        self.connectors.insert(addr, token.clone());
        self.statuses.set(addr, PeerStatus::Connecting);
        crate::endpoint::spawn_connector(
            addr,
            retry,
            reply,
            token,
            self.connector_context(),
        );
    }

    fn connector_context(&self) -> crate::endpoint::ConnContext {
        crate::endpoint::ConnContext {
            id: self.id,
            shared_filter: self.shared_filter.clone(),
            statuses: self.statuses.clone(),
            handshake_timeout: self.config.handshake_timeout,
            conn_tx: self.conn_tx.clone(),
            transport_tx: self.transport_tx.clone(),
        }
    }

    fn handle_conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Established { link, hello, reply } => {
                if self.shutting_down {
                    link.kill();
                    return;
                }
                let peer = hello.id;
                let addr = link.addr();
                self.connectors.remove(&addr);

                // A second connection to a known peer replaces the old flow.
                if let Some(old) = self.tbl.handle(&peer) {
                    debug!(peer = %peer, "duplicate connection, replacing flow");
                    old.kill();
                }

                self.tbl.set_handle(peer, link);
                self.tbl.add_or_update_path(
                    peer,
                    vec![peer],
                    VectorTimestamp::singleton(hello.clock),
                );
                self.peer_filters.insert(peer, hello.filter.clone());
                self.last_seen.insert(peer, hello.clock);
                self.peers_by_addr.insert(addr, peer);
                self.last_contact.insert(peer, Instant::now());
                self.statuses.set(addr, PeerStatus::Up);
                self.watches.set_reachable(peer, true);

                self.emit_status(
                    Status::new(StatusKind::PeerAdded, "peering established")
                        .with_endpoint(peer)
                        .with_address(addr),
                );
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(peer));
                }
                self.resolve_awaiting(peer);

                // Announce ourselves and graft what we already know onto the
                // new link.
                self.flood_own_filter();
                self.graft_known_routes(peer);
            }
            ConnEvent::Failed {
                addr,
                kind,
                message,
                reply,
                done,
            } => {
                if done {
                    self.connectors.remove(&addr);
                }
                let (end_state, status_kind) = match kind {
                    ErrorKind::PeerIncompatible => {
                        (PeerStatus::Revoked, StatusKind::PeerIncompatible)
                    }
                    ErrorKind::PeerInvalid | ErrorKind::CodecMalformed => {
                        (PeerStatus::Revoked, StatusKind::PeerInvalid)
                    }
                    _ => (PeerStatus::Disconnected, StatusKind::PeerUnavailable),
                };
                self.statuses.set(addr, end_state);
                self.emit_status(
                    Status::new(status_kind, message.clone()).with_address(addr),
                );
                if let Some(reply) = reply {
                    let _ = reply.send(Err(EndpointError::PeerRejected {
                        addr,
                        kind,
                        message,
                    }));
                }
            }
        }
    }

    fn resolve_awaiting(&mut self, peer: EndpointId) {
        let mut kept = Vec::new();
        for (wanted, reply) in self.awaiting_peer.drain(..) {
            if wanted == peer {
                let _ = reply.send(true);
            } else {
                kept.push((wanted, reply));
            }
        }
        self.awaiting_peer = kept;
    }

    fn unpeer(&mut self, addr: SocketAddr) -> bool {
        if let Some(token) = self.connectors.remove(&addr) {
            token.cancel();
            self.statuses.remove(addr);
            return true;
        }
        if let Some(peer) = self.peers_by_addr.get(&addr).copied() {
            if let Some(link) = self.tbl.handle(&peer) {
                self.statuses.set(addr, PeerStatus::Draining);
                link.kill();
                // The reader reports PeerGone and the shared teardown runs
                // there.
                return true;
            }
        }
        false
    }

    async fn handle_transport(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Inbound { from, message } => {
                self.last_contact.insert(from, Instant::now());
                self.handle_inbound(from, message).await;
            }
            PeerEvent::PeerGone { id, reason } => self.drop_peer(id, reason),
        }
    }

    /// Tears down a direct peering: scrubs the table, floods a revocation,
    /// and reports the loss.
    fn drop_peer(&mut self, peer: EndpointId, reason: DisconnectReason) {
        if !self.tbl.is_direct(&peer) {
            return;
        }
        // A replaced flow reports its death after the successor took over;
        // only a killed current link means the peering is really gone.
        if self.tbl.handle(&peer).is_some_and(|link| !link.is_killed()) {
            trace!(peer = %peer, "stale flow report, current link is alive");
            return;
        }
        let addr = self.tbl.handle(&peer).map(|link| {
            link.kill();
            link.addr()
        });

        let mut cascaded = Vec::new();
        self.tbl.erase_direct(&peer, |gone| cascaded.push(gone));

        self.clock.tick();
        let revoke_ts = self.clock;
        self.blacklist
            .insert(self.id, revoke_ts, peer, Instant::now());
        self.flood(RoutingUpdate::Revoke {
            path: vec![self.id],
            ts: VectorTimestamp::singleton(revoke_ts),
            revoker: self.id,
            revoke_ts,
            hop: peer,
            filter: self.filter.clone(),
        });

        if let Some(addr) = addr {
            self.peers_by_addr.remove(&addr);
            let end_state = if matches!(reason, DisconnectReason::Malformed(_)) {
                PeerStatus::Revoked
            } else {
                PeerStatus::Disconnected
            };
            self.statuses.set(addr, end_state);
        }
        let status = match &reason {
            DisconnectReason::Killed => {
                Status::new(StatusKind::PeerRemoved, "peering removed")
            }
            DisconnectReason::ConnectionLost(message) => {
                Status::new(StatusKind::PeerLost, message.clone())
            }
            DisconnectReason::Malformed(message) => {
                self.emit(Event::error(ErrorKind::CodecMalformed, message.clone()));
                Status::new(StatusKind::PeerInvalid, message.clone())
            }
        };
        let mut status = status.with_endpoint(peer);
        if let Some(addr) = addr {
            status = status.with_address(addr);
        }
        self.emit_status(status);

        self.forget_peers(cascaded);
        self.watches
            .set_reachable(peer, self.tbl.reachable(&peer));
        self.last_contact.remove(&peer);
    }

    fn forget_peers(&mut self, peers: Vec<EndpointId>) {
        for gone in peers {
            self.peer_filters.remove(&gone);
            self.last_seen.remove(&gone);
            self.last_contact.remove(&gone);
            self.watches.set_reachable(gone, false);
            self.emit_status(
                Status::new(StatusKind::EndpointUnreachable, "no remaining path")
                    .with_endpoint(gone),
            );
        }
    }

    // -- subscription flooding & revocation -----------------------------------

    /// Recomputes the local filter from subscribers and hosted stores, and
    /// floods it when it changed.
    fn refilter(&mut self) {
        let mut filter = Filter::new();
        for (sub_filter, _) in &self.subscribers {
            filter.extend(sub_filter);
        }
        for entry in self.stores.values() {
            filter.insert(entry.topic.clone());
        }
        if filter == self.filter {
            return;
        }
        self.filter = filter;
        self.flood_own_filter();
    }

    fn flood_own_filter(&mut self) {
        self.clock.tick();
        self.shared_filter.update(self.clock, self.filter.clone());
        let update = RoutingUpdate::Subscribe {
            path: vec![self.id],
            ts: VectorTimestamp::singleton(self.clock),
            filter: self.filter.clone(),
        };
        self.flood(update);
    }

    /// Sends `update` to every direct peer that is not already on its path.
    fn flood(&self, update: RoutingUpdate) {
        let payload = update.encode();
        self.tbl.for_each_direct(|peer, link| {
            if update.path().contains(peer) {
                return;
            }
            link.send(control_message(*peer, payload.clone()));
        });
    }

    /// Replays stored knowledge to a freshly connected peer, one subscribe
    /// update per known origin, so new links converge without waiting for
    /// third parties to reflood.
    fn graft_known_routes(&mut self, new_peer: EndpointId) {
        let origins: Vec<EndpointId> = self
            .peer_filters
            .keys()
            .filter(|origin| **origin != new_peer && **origin != self.id)
            .copied()
            .collect();
        let mut updates = Vec::new();
        for origin in origins {
            let Some((route, route_ts)) = self.tbl.shortest_versioned(&origin) else {
                continue;
            };
            // The stored route runs from here to the origin; the flood path
            // travels origin-to-here.
            let mut path: Vec<EndpointId> = route.iter().rev().copied().collect();
            let mut ts = route_ts.reversed();
            if path.contains(&new_peer) {
                continue;
            }
            let Some(filter) = self.peer_filters.get(&origin) else {
                continue;
            };
            self.clock.tick();
            path.push(self.id);
            ts.push(self.clock);
            updates.push(RoutingUpdate::Subscribe {
                path,
                ts,
                filter: filter.clone(),
            });
        }
        if let Some(link) = self.tbl.handle(&new_peer) {
            for update in updates {
                link.send(control_message(new_peer, update.encode()));
            }
        }
    }

    fn handle_routing_update(&mut self, from: EndpointId, payload: &[u8]) {
        let Some(update) = RoutingUpdate::decode(payload) else {
            warn!(peer = %from, "undecodable routing update, skipping");
            return;
        };
        match update {
            RoutingUpdate::Subscribe { path, ts, filter } => {
                self.handle_subscribe_flood(path, ts, filter)
            }
            RoutingUpdate::Revoke {
                path,
                ts,
                revoker,
                revoke_ts,
                hop,
                filter,
            } => self.handle_revoke_flood(path, ts, revoker, revoke_ts, hop, filter),
        }
    }

    fn handle_subscribe_flood(
        &mut self,
        mut path: Vec<EndpointId>,
        mut ts: VectorTimestamp,
        filter: Filter,
    ) {
        if path.is_empty() || path.len() != ts.len() {
            warn!("subscribe flood with mismatched path, dropping");
            return;
        }
        if path.contains(&self.id) {
            return;
        }
        // Keep the table loop-free even against bogus advertisements.
        if has_duplicates(&path) {
            warn!("subscribe flood with a looping path, dropping");
            return;
        }
        let origin = path[0];
        let origin_ts = ts.origin().expect("non-empty ts");
        let seen = self.last_seen.get(&origin).copied();
        // Strictly older advertisements are dropped. A copy of the current
        // advertisement that traveled another route still teaches us an
        // alternate path, but only the first copy gets forwarded.
        if seen.is_some_and(|seen| origin_ts < seen) {
            return;
        }
        let first_copy = seen.is_none_or(|seen| origin_ts > seen);
        if first_copy {
            self.last_seen.insert(origin, origin_ts);
            self.peer_filters.insert(origin, filter.clone());
        }

        // The route to the origin is the traveled path, reversed.
        let route: Vec<EndpointId> = path.iter().rev().copied().collect();
        let route_ts = ts.reversed();
        if self.blacklist.covers(&route, &route_ts) {
            trace!(origin = %origin, "path is revoked, not installing");
            return;
        }
        let discovered = self.tbl.add_or_update_path(origin, route, route_ts);
        self.watches.set_reachable(origin, true);
        if discovered {
            self.emit_status(
                Status::new(StatusKind::EndpointDiscovered, "new endpoint in the overlay")
                    .with_endpoint(origin),
            );
            self.resolve_awaiting(origin);
        }

        if first_copy && self.config.forward {
            self.clock.tick();
            path.push(self.id);
            ts.push(self.clock);
            self.flood(RoutingUpdate::Subscribe { path, ts, filter });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_revoke_flood(
        &mut self,
        mut path: Vec<EndpointId>,
        mut ts: VectorTimestamp,
        revoker: EndpointId,
        revoke_ts: LamportTimestamp,
        hop: EndpointId,
        filter: Filter,
    ) {
        if path.is_empty() || path.len() != ts.len() {
            warn!("revoke flood with mismatched path, dropping");
            return;
        }
        if path.contains(&self.id) {
            return;
        }
        // Deduplicate: an already-known revocation stops the flood here.
        if !self
            .blacklist
            .insert(revoker, revoke_ts, hop, Instant::now())
        {
            return;
        }
        if self
            .last_seen
            .get(&revoker)
            .is_none_or(|seen| revoke_ts > *seen)
        {
            self.last_seen.insert(revoker, revoke_ts);
            self.peer_filters.insert(revoker, filter.clone());
        }

        let mut cascaded = Vec::new();
        self.tbl
            .revoke(&revoker, revoke_ts, &hop, |gone| cascaded.push(gone));
        for gone in &cascaded {
            self.watches.set_reachable(*gone, false);
        }
        self.forget_peers(cascaded);

        if self.config.forward {
            self.clock.tick();
            path.push(self.id);
            ts.push(self.clock);
            self.flood(RoutingUpdate::Revoke {
                path,
                ts,
                revoker,
                revoke_ts,
                hop,
                filter,
            });
        }
    }

    // -- dispatch -------------------------------------------------------------

    /// Sends one message into the overlay (and locally where it applies).
    async fn dispatch(
        &mut self,
        kind: MessageKind,
        topic: Topic,
        payload: Vec<u8>,
        dst: Option<EndpointId>,
    ) {
        let message = PackedMessage::new(kind, topic, payload);

        let receivers: Vec<EndpointId> = match dst {
            Some(dst) if dst == self.id => {
                self.deliver_local(&message).await;
                return;
            }
            Some(dst) => {
                if !self.tbl.reachable(&dst) {
                    self.emit_status(
                        Status::new(StatusKind::EndpointUnreachable, "no route for publish")
                            .with_endpoint(dst),
                    );
                    return;
                }
                vec![dst]
            }
            None => {
                if self.local_filter_matches(&message) {
                    self.deliver_local(&message).await;
                }
                self.peer_filters
                    .iter()
                    .filter(|(peer, filter)| {
                        **peer != self.id && filter.matches(&message.topic)
                    })
                    .map(|(peer, _)| *peer)
                    .collect()
            }
        };
        if receivers.is_empty() {
            return;
        }

        let plan = Multipath::build(self.id, false, receivers, &self.tbl);
        self.send_children(plan.root(), &message);
    }

    fn local_filter_matches(&self, message: &PackedMessage) -> bool {
        match message.kind {
            MessageKind::Data => self
                .subscribers
                .iter()
                .any(|(filter, _)| filter.matches(&message.topic)),
            MessageKind::Command => self.store_routes.contains_key(&message.topic),
            _ => false,
        }
    }

    /// Forwards every child subtree of `root` toward its branch, re-rooting
    /// onto the best next hop when the child is not directly connected.
    fn send_children(&self, root: &MultipathNode, message: &PackedMessage) {
        for child in root.children() {
            let node_message = |plan: Multipath| NodeMessage::new(message.clone(), plan);
            if let Some(link) = self.tbl.handle(&child.id) {
                link.send(node_message(Multipath::from_root(child.clone())));
            } else if let Some(route) = self.tbl.shortest_path(&child.id) {
                let Some(plan) = Multipath::reroot(route, child.clone()) else {
                    continue;
                };
                let next_hop = plan.root().id;
                match self.tbl.handle(&next_hop) {
                    Some(link) => {
                        link.send(node_message(plan));
                    }
                    None => trace!(peer = %child.id, "next hop has no handle, dropping"),
                }
            } else {
                trace!(peer = %child.id, "subtree head unreachable, dropping");
            }
        }
    }

    async fn handle_inbound(&mut self, from: EndpointId, incoming: NodeMessage) {
        let NodeMessage { message, multipath } = incoming;
        match message.kind {
            MessageKind::RoutingUpdate => {
                self.handle_routing_update(from, &message.payload);
                return;
            }
            MessageKind::Ping => {
                if let Some(link) = self.tbl.handle(&from) {
                    link.send(NodeMessage::new(
                        PackedMessage::new(MessageKind::Pong, message.topic, message.payload),
                        Multipath::from_root(MultipathNode::new(from, false)),
                    ));
                }
                return;
            }
            MessageKind::Pong => return,
            MessageKind::Data | MessageKind::Command => {}
        }

        let root = multipath.root();
        if root.id != self.id {
            trace!(peer = %from, "subtree rooted elsewhere, dropping");
            return;
        }
        if root.is_receiver {
            self.deliver_local(&message).await;
        }
        if self.config.forward {
            self.send_children(root, &message);
        }
    }

    async fn deliver_local(&mut self, message: &PackedMessage) {
        match message.kind {
            MessageKind::Data => {
                for (filter, queue) in &self.subscribers {
                    if !filter.matches(&message.topic) {
                        continue;
                    }
                    if let Some(total) = queue.push(message.topic.clone(), message.payload.clone())
                    {
                        self.emit(Event::error(
                            ErrorKind::Unspecified,
                            format!(
                                "subscriber on {} dropped {total} message(s) to overflow",
                                message.topic
                            ),
                        ));
                    }
                }
            }
            MessageKind::Command => {
                let command = match StoreCommand::decode(&message.payload) {
                    Ok(command) => command,
                    Err(CommandError::UnknownOp(op)) => {
                        // Skipped, not fatal: minor protocol extensions may
                        // introduce kinds we do not know yet.
                        self.emit(Event::error(
                            ErrorKind::Unspecified,
                            format!("skipping unknown store command kind {op}"),
                        ));
                        return;
                    }
                    Err(err) => {
                        self.emit(Event::error(ErrorKind::CodecMalformed, err.to_string()));
                        return;
                    }
                };
                if let Some(tx) = self.store_routes.get(&message.topic) {
                    // Store command queues block the producer instead of
                    // shedding.
                    if tx.send(StoreMsg::Wire(command)).await.is_err() {
                        warn!(topic = %message.topic, "store actor is gone");
                    }
                } else {
                    trace!(topic = %message.topic, "command for unattached store, dropping");
                }
            }
            _ => {}
        }
    }

    // -- stores ---------------------------------------------------------------

    fn attach_master(
        &mut self,
        name: &str,
        kind: BackendKind,
        options: &BackendOptions,
    ) -> Result<StoreHandle, StoreError> {
        if let Some(existing) = self.stores.get(name) {
            return Err(if existing.is_master {
                StoreError::MasterExists
            } else {
                StoreError::Backend(format!(
                    "endpoint already hosts a clone of {name:?}"
                ))
            });
        }
        let backend = backend::open(kind, options)?;
        let link = CoreLink::new(self.id, self.cmd_tx.clone(), self.watches.clone());
        let handle = MasterActor::spawn(name, backend, link, self.store_shutdown.child_token())?;

        let topic = Topic::store_master(name)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        self.store_routes.insert(topic.clone(), handle.command_sender());
        self.stores.insert(
            name.to_string(),
            StoreEntry {
                is_master: true,
                topic,
            },
        );
        self.refilter();
        Ok(handle)
    }

    fn attach_clone(
        &mut self,
        name: &str,
        settings: CloneSettings,
    ) -> Result<StoreHandle, StoreError> {
        if let Some(existing) = self.stores.get(name) {
            return Err(if existing.is_master {
                StoreError::MasterExists
            } else {
                StoreError::Backend(format!("endpoint already hosts a clone of {name:?}"))
            });
        }
        let link = CoreLink::new(self.id, self.cmd_tx.clone(), self.watches.clone());
        let handle = CloneActor::spawn(name, settings, link, self.store_shutdown.child_token())?;

        let topic = Topic::store_clone(name)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        self.store_routes.insert(topic.clone(), handle.command_sender());
        self.stores.insert(
            name.to_string(),
            StoreEntry {
                is_master: false,
                topic,
            },
        );
        self.refilter();
        Ok(handle)
    }

    // -- housekeeping ---------------------------------------------------------

    fn handle_tick(&mut self) {
        if self.shutting_down {
            return;
        }
        // Keepalive pings on every direct link.
        let ping_payload: Vec<u8> = Vec::new();
        self.tbl.for_each_direct(|peer, link| {
            link.send(NodeMessage::new(
                PackedMessage::new(MessageKind::Ping, control_topic(), ping_payload.clone()),
                Multipath::from_root(MultipathNode::new(*peer, false)),
            ));
        });

        // Old revocations age out.
        if let Some(cutoff) = Instant::now().checked_sub(self.config.blacklist_max_age) {
            self.blacklist.expire(cutoff);
        }

        // Subscribers whose consumer went away release their filter share.
        let before = self.subscribers.len();
        self.subscribers.retain(|(_, queue)| !queue.is_orphaned());
        if self.subscribers.len() != before {
            self.refilter();
        }
    }

    fn peer_infos(&self) -> Vec<PeerInfo> {
        let addr_of: HashMap<EndpointId, SocketAddr> = self
            .peers_by_addr
            .iter()
            .map(|(addr, id)| (*id, *addr))
            .collect();
        self.tbl
            .peers()
            .map(|peer| {
                let address = addr_of.get(peer).copied();
                let status = address
                    .and_then(|addr| self.statuses.get(addr))
                    .unwrap_or(PeerStatus::Up);
                PeerInfo {
                    id: *peer,
                    address,
                    is_direct: self.tbl.is_direct(peer),
                    distance: self.tbl.distance_to(peer),
                    status,
                    filter: self.peer_filters.get(peer).cloned().unwrap_or_default(),
                }
            })
            .collect()
    }
}

fn has_duplicates(path: &[EndpointId]) -> bool {
    let mut sorted = path.to_vec();
    sorted.sort_unstable();
    sorted.windows(2).any(|pair| pair[0] == pair[1])
}

fn control_message(dst: EndpointId, payload: Vec<u8>) -> NodeMessage {
    NodeMessage::new(
        PackedMessage::new(MessageKind::RoutingUpdate, control_topic(), payload),
        Multipath::from_root(MultipathNode::new(dst, false)),
    )
}
