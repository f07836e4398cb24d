//! The public endpoint surface.
//!
//! An [`Endpoint`] spawns one core actor and talks to it over channels.
//! Listening sockets and outbound connectors run as their own tasks; they
//! perform the hello exchange and hand established flows to the core.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use weft_model::{EndpointId, ErrorKind, Filter, Topic, Value, VersionInfo};
use weft_net::{
    handshake, spawn_peer, Hello, NetError, PeerEvent, PeerLink, PeerStatus, PeerStatusMap,
    SharedFilter,
};
use weft_store::{BackendKind, BackendOptions, CloneSettings, StoreHandle};

use crate::config::Config;
use crate::core::{Command, ConnEvent, Core, CoreChannels};
use crate::error::EndpointError;
use crate::events::EventSubscriber;
use crate::subscriber::{PublishOp, Publisher, Subscriber};

/// One row of [`Endpoint::peers`].
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: EndpointId,
    pub address: Option<SocketAddr>,
    pub is_direct: bool,
    /// Hop count of the shortest path.
    pub distance: Option<usize>,
    pub status: PeerStatus,
    pub filter: Filter,
}

/// Everything a connection-establishment task needs.
#[derive(Clone)]
pub(crate) struct ConnContext {
    pub id: EndpointId,
    pub shared_filter: Arc<SharedFilter>,
    pub statuses: Arc<PeerStatusMap>,
    pub handshake_timeout: Duration,
    pub conn_tx: mpsc::Sender<ConnEvent>,
    pub transport_tx: mpsc::Sender<PeerEvent>,
}

/// Runs the hello exchange on a fresh connection and, on success, spawns
/// the peer flows.
async fn establish(
    mut stream: TcpStream,
    addr: SocketAddr,
    ctx: &ConnContext,
) -> Result<(PeerLink, Hello), NetError> {
    let (clock, filter) = ctx.shared_filter.read();
    let ours = Hello {
        id: ctx.id,
        version: VersionInfo::CURRENT,
        clock,
        filter,
    };
    let theirs = handshake(&mut stream, &ours, ctx.handshake_timeout).await?;
    let link = spawn_peer(stream, theirs.id, addr, ctx.transport_tx.clone());
    Ok((link, theirs))
}

/// Dials `addr` with exponential backoff capped at `retry`. A zero `retry`
/// means a single attempt. Version or identity rejections are terminal.
pub(crate) fn spawn_connector(
    addr: SocketAddr,
    retry: Duration,
    mut reply: Option<oneshot::Sender<Result<EndpointId, EndpointError>>>,
    token: CancellationToken,
    ctx: ConnContext,
) {
    tokio::spawn(async move {
        let mut delay = if retry.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_millis(250).min(retry)
        };
        loop {
            let attempt = tokio::select! {
                _ = token.cancelled() => return,
                attempt = TcpStream::connect(addr) => attempt,
            };
            match attempt {
                Ok(stream) => {
                    ctx.statuses.set(addr, PeerStatus::Handshaking);
                    match establish(stream, addr, &ctx).await {
                        Ok((link, hello)) => {
                            let _ = ctx
                                .conn_tx
                                .send(ConnEvent::Established {
                                    link,
                                    hello,
                                    reply: reply.take(),
                                })
                                .await;
                            return;
                        }
                        Err(err) => {
                            let terminal = matches!(
                                err,
                                NetError::Incompatible { .. } | NetError::IdCollision
                            );
                            let _ = ctx
                                .conn_tx
                                .send(ConnEvent::Failed {
                                    addr,
                                    kind: err.kind(),
                                    message: err.to_string(),
                                    reply: reply.take(),
                                    done: terminal || retry.is_zero(),
                                })
                                .await;
                            if terminal {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    debug!(%addr, %err, "connect attempt failed");
                    if reply.is_some() {
                        let _ = ctx
                            .conn_tx
                            .send(ConnEvent::Failed {
                                addr,
                                kind: ErrorKind::PeerUnavailable,
                                message: err.to_string(),
                                reply: reply.take(),
                                done: retry.is_zero(),
                            })
                            .await;
                    }
                }
            }
            if retry.is_zero() {
                return;
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(retry);
        }
    });
}

/// Accepts inbound connections and hands each to its own establishment
/// task.
fn spawn_acceptor(listener: TcpListener, ctx: ConnContext, token: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => return,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        ctx.statuses.set(addr, PeerStatus::Handshaking);
                        match establish(stream, addr, &ctx).await {
                            Ok((link, hello)) => {
                                let _ = ctx
                                    .conn_tx
                                    .send(ConnEvent::Established {
                                        link,
                                        hello,
                                        reply: None,
                                    })
                                    .await;
                            }
                            Err(err) => {
                                let _ = ctx
                                    .conn_tx
                                    .send(ConnEvent::Failed {
                                        addr,
                                        kind: err.kind(),
                                        message: err.to_string(),
                                        reply: None,
                                        done: true,
                                    })
                                    .await;
                            }
                        }
                    });
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });
}

/// A participant in the overlay. Cheap to share; all state lives in the
/// core actor.
pub struct Endpoint {
    id: EndpointId,
    config: Config,
    channels: CoreChannels,
    listener_token: CancellationToken,
    shutdown_started: AtomicBool,
}

impl Endpoint {
    /// Creates an endpoint with a random id. Spawns the core actor, so this
    /// must run inside a tokio runtime.
    pub fn new(config: Config) -> Self {
        Self::with_id(EndpointId::random(), config)
    }

    /// Creates an endpoint with a fixed id, mainly for tests and tooling.
    pub fn with_id(id: EndpointId, config: Config) -> Self {
        let channels = Core::spawn(id, config.clone());
        Self {
            id,
            config,
            channels,
            listener_token: CancellationToken::new(),
            shutdown_started: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn conn_context(&self) -> ConnContext {
        ConnContext {
            id: self.id,
            shared_filter: self.channels.shared_filter.clone(),
            statuses: self.channels.statuses.clone(),
            handshake_timeout: self.config.handshake_timeout,
            conn_tx: self.channels.conn_tx.clone(),
            transport_tx: self.channels.transport_tx.clone(),
        }
    }

    fn send_command(&self, command: Command) -> Result<(), EndpointError> {
        self.channels
            .cmd_tx
            .send(command)
            .map_err(|_| EndpointError::ShuttingDown)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EndpointError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(build(reply))?;
        rx.await.map_err(|_| EndpointError::ShuttingDown)
    }

    // -- listening & peering --------------------------------------------------

    /// Binds a listening socket and returns the bound port.
    pub async fn listen(&self, addr: IpAddr, port: u16) -> Result<u16, EndpointError> {
        if self.shutdown_started.load(Ordering::SeqCst) {
            return Err(EndpointError::ShuttingDown);
        }
        let listener = TcpListener::bind(SocketAddr::new(addr, port))
            .await
            .map_err(EndpointError::Listen)?;
        let bound = listener
            .local_addr()
            .map_err(EndpointError::Listen)?
            .port();
        spawn_acceptor(
            listener,
            self.conn_context(),
            self.listener_token.child_token(),
        );
        debug!(endpoint = %self.id, port = bound, "listening");
        Ok(bound)
    }

    /// Initiates a peering and awaits the outcome of the first attempt.
    /// On failure, retries continue in the background with exponential
    /// backoff capped at `retry` (zero disables retrying).
    pub async fn peer(
        &self,
        addr: IpAddr,
        port: u16,
        retry: Duration,
    ) -> Result<EndpointId, EndpointError> {
        self.request(|reply| Command::Peer {
            addr: SocketAddr::new(addr, port),
            retry,
            reply: Some(reply),
        })
        .await?
    }

    /// Fire-and-forget variant of [`peer`](Self::peer).
    pub fn peer_nosync(&self, addr: IpAddr, port: u16, retry: Duration) {
        let _ = self.send_command(Command::Peer {
            addr: SocketAddr::new(addr, port),
            retry,
            reply: None,
        });
    }

    /// Removes a peering (or cancels a pending one). Returns `true` iff one
    /// existed.
    pub async fn unpeer(&self, addr: IpAddr, port: u16) -> bool {
        self.request(|reply| Command::Unpeer {
            addr: SocketAddr::new(addr, port),
            reply: Some(reply),
        })
        .await
        .unwrap_or(false)
    }

    /// Fire-and-forget variant of [`unpeer`](Self::unpeer).
    pub fn unpeer_nosync(&self, addr: IpAddr, port: u16) {
        let _ = self.send_command(Command::Unpeer {
            addr: SocketAddr::new(addr, port),
            reply: None,
        });
    }

    /// Waits until `peer` becomes reachable, bounded by `timeout` (default
    /// from the configuration).
    pub async fn await_peer(&self, peer: EndpointId, timeout: Option<Duration>) -> bool {
        let limit = timeout.unwrap_or(self.config.await_peer_timeout);
        let request = self.request(|reply| Command::AwaitPeer { peer, reply });
        match tokio::time::timeout(limit, request).await {
            Ok(Ok(found)) => found,
            _ => false,
        }
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.request(|reply| Command::Peers { reply })
            .await
            .unwrap_or_default()
    }

    /// Topics any known peer subscribes to.
    pub async fn peer_subscriptions(&self) -> Vec<Topic> {
        self.request(|reply| Command::PeerSubscriptions { reply })
            .await
            .unwrap_or_default()
    }

    // -- publishing & subscribing ---------------------------------------------

    /// Publishes one value under `topic` to every matching receiver.
    pub async fn publish(&self, topic: Topic, value: Value) -> Result<(), EndpointError> {
        self.publish_op(None, topic, value).await
    }

    /// Publishes to exactly one endpoint, regardless of filters.
    pub async fn publish_to(
        &self,
        dst: EndpointId,
        topic: Topic,
        value: Value,
    ) -> Result<(), EndpointError> {
        self.publish_op(Some(dst), topic, value).await
    }

    /// Publishes a batch in order.
    pub async fn publish_batch(
        &self,
        batch: impl IntoIterator<Item = (Topic, Value)>,
    ) -> Result<(), EndpointError> {
        for (topic, value) in batch {
            self.publish_op(None, topic, value).await?;
        }
        Ok(())
    }

    async fn publish_op(
        &self,
        dst: Option<EndpointId>,
        topic: Topic,
        value: Value,
    ) -> Result<(), EndpointError> {
        if self.shutdown_started.load(Ordering::SeqCst) {
            return Err(EndpointError::ShuttingDown);
        }
        self.channels
            .publish_tx
            .send(PublishOp {
                dst,
                topic,
                payload: weft_codec::encode_to_vec(&value),
            })
            .await
            .map_err(|_| EndpointError::ShuttingDown)
    }

    /// A handle bound to one topic, sharing the publish channel and its
    /// flow-control metrics.
    pub fn make_publisher(&self, topic: Topic) -> Publisher {
        Publisher::new(topic, self.channels.publish_tx.clone())
    }

    /// Subscribes to every topic some prefix in `filter` covers.
    pub async fn make_subscriber(
        &self,
        filter: Filter,
        queue_size: Option<usize>,
    ) -> Result<Subscriber, EndpointError> {
        let queue_size = queue_size.unwrap_or(self.config.subscriber_queue_size);
        self.request(|reply| Command::Subscribe {
            filter,
            queue_size,
            reply,
        })
        .await
    }

    /// Yields status and/or error items as they happen.
    pub fn make_event_subscriber(&self, receive_statuses: bool) -> EventSubscriber {
        EventSubscriber::new(self.channels.events.subscribe(), receive_statuses)
    }

    // -- stores ---------------------------------------------------------------

    /// Hosts the authoritative master for `name` on this endpoint.
    pub async fn attach_master(
        &self,
        name: &str,
        kind: BackendKind,
        options: BackendOptions,
    ) -> Result<StoreHandle, EndpointError> {
        let handle = self
            .request(|reply| Command::AttachMaster {
                name: name.to_string(),
                kind,
                options,
                reply,
            })
            .await??;
        Ok(handle)
    }

    /// Hosts an eventually consistent clone of `name` on this endpoint.
    pub async fn attach_clone(
        &self,
        name: &str,
        resync_interval: Duration,
        stale_interval: Duration,
        mutation_buffer_interval: Duration,
    ) -> Result<StoreHandle, EndpointError> {
        let settings = CloneSettings {
            resync_interval,
            stale_interval,
            mutation_buffer_interval,
        };
        let handle = self
            .request(|reply| Command::AttachClone {
                name: name.to_string(),
                settings,
                reply,
            })
            .await??;
        Ok(handle)
    }

    // -- lifecycle ------------------------------------------------------------

    /// Drains and tears everything down. Idempotent; later API calls fail
    /// with `shutdown-in-progress`.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listener_token.cancel();
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Endpoint({})", self.id)
    }
}
