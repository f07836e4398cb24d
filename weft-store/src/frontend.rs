//! Client-facing store handles.
//!
//! A [`StoreHandle`] issues typed requests to the local master or clone
//! actor and awaits the answer, optionally bounded by a timeout. A
//! [`StoreProxy`] assigns request ids immediately and yields `(id, answer)`
//! pairs in completion order.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use weft_model::value::Timespan;
use weft_model::Value;

use crate::command::StoreCommand;
use crate::error::StoreError;

/// A typed request from a frontend to its store actor.
pub enum StoreRequest {
    Put {
        key: Value,
        value: Value,
        expiry: Option<Timespan>,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Add {
        key: Value,
        value: Value,
        expiry: Option<Timespan>,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Subtract {
        key: Value,
        value: Value,
        expiry: Option<Timespan>,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Erase {
        key: Value,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Clear {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Get {
        key: Value,
        reply: oneshot::Sender<Result<Value, StoreError>>,
    },
    Exists {
        key: Value,
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
    Size {
        reply: oneshot::Sender<Result<u64, StoreError>>,
    },
    Keys {
        reply: oneshot::Sender<Result<Value, StoreError>>,
    },
}

/// Everything a store actor consumes: frontend requests plus commands that
/// arrived over the wire on the store's topic.
pub enum StoreMsg {
    Request(StoreRequest),
    Wire(StoreCommand),
}

/// Handle to a local master or clone actor.
#[derive(Clone)]
pub struct StoreHandle {
    name: String,
    tx: mpsc::Sender<StoreMsg>,
    timeout: Option<Duration>,
}

impl StoreHandle {
    pub(crate) fn new(name: String, tx: mpsc::Sender<StoreMsg>) -> Self {
        Self {
            name,
            tx,
            timeout: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a handle whose requests fail with `request-timeout` after
    /// `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The raw actor channel, used by the hosting endpoint to feed commands
    /// that arrived over the wire.
    pub fn command_sender(&self) -> mpsc::Sender<StoreMsg> {
        self.tx.clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, StoreError>>) -> StoreRequest,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreMsg::Request(build(reply)))
            .await
            .map_err(|_| StoreError::Shutdown)?;
        let answer = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| StoreError::Timeout)?,
            None => rx.await,
        };
        answer.map_err(|_| StoreError::Shutdown)?
    }

    pub async fn put(
        &self,
        key: Value,
        value: Value,
        expiry: Option<Timespan>,
    ) -> Result<(), StoreError> {
        self.request(|reply| StoreRequest::Put {
            key,
            value,
            expiry,
            reply,
        })
        .await
    }

    pub async fn add(
        &self,
        key: Value,
        value: Value,
        expiry: Option<Timespan>,
    ) -> Result<(), StoreError> {
        self.request(|reply| StoreRequest::Add {
            key,
            value,
            expiry,
            reply,
        })
        .await
    }

    pub async fn subtract(
        &self,
        key: Value,
        value: Value,
        expiry: Option<Timespan>,
    ) -> Result<(), StoreError> {
        self.request(|reply| StoreRequest::Subtract {
            key,
            value,
            expiry,
            reply,
        })
        .await
    }

    pub async fn erase(&self, key: Value) -> Result<(), StoreError> {
        self.request(|reply| StoreRequest::Erase { key, reply }).await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.request(|reply| StoreRequest::Clear { reply }).await
    }

    pub async fn get(&self, key: Value) -> Result<Value, StoreError> {
        self.request(|reply| StoreRequest::Get { key, reply }).await
    }

    pub async fn exists(&self, key: Value) -> Result<bool, StoreError> {
        self.request(|reply| StoreRequest::Exists { key, reply })
            .await
    }

    pub async fn size(&self) -> Result<u64, StoreError> {
        self.request(|reply| StoreRequest::Size { reply }).await
    }

    /// All keys as a set value.
    pub async fn keys(&self) -> Result<Value, StoreError> {
        self.request(|reply| StoreRequest::Keys { reply }).await
    }

    /// Turns this handle into a proxy frontend.
    pub fn into_proxy(self) -> StoreProxy {
        StoreProxy::new(self)
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Answers flow back as plain values: `exists` maps to a boolean, `size` to
/// a count, mutations to `none`.
pub type ProxyAnswer = Result<Value, StoreError>;

/// Fire-and-collect frontend: every submission returns a fresh id, answers
/// arrive through [`StoreProxy::receive`] in completion order.
pub struct StoreProxy {
    handle: StoreHandle,
    next_id: u64,
    results_tx: mpsc::Sender<(u64, ProxyAnswer)>,
    results_rx: mpsc::Receiver<(u64, ProxyAnswer)>,
}

impl StoreProxy {
    fn new(handle: StoreHandle) -> Self {
        let (results_tx, results_rx) = mpsc::channel(64);
        Self {
            handle,
            next_id: 0,
            results_tx,
            results_rx,
        }
    }

    fn submit(
        &mut self,
        run: impl std::future::Future<Output = ProxyAnswer> + Send + 'static,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        let results = self.results_tx.clone();
        tokio::spawn(async move {
            let answer = run.await;
            let _ = results.send((id, answer)).await;
        });
        id
    }

    pub fn get(&mut self, key: Value) -> u64 {
        let handle = self.handle.clone();
        self.submit(async move { handle.get(key).await })
    }

    pub fn exists(&mut self, key: Value) -> u64 {
        let handle = self.handle.clone();
        self.submit(async move { handle.exists(key).await.map(Value::Boolean) })
    }

    pub fn size(&mut self) -> u64 {
        let handle = self.handle.clone();
        self.submit(async move { handle.size().await.map(Value::Count) })
    }

    pub fn keys(&mut self) -> u64 {
        let handle = self.handle.clone();
        self.submit(async move { handle.keys().await })
    }

    pub fn put(&mut self, key: Value, value: Value, expiry: Option<Timespan>) -> u64 {
        let handle = self.handle.clone();
        self.submit(async move { handle.put(key, value, expiry).await.map(|_| Value::None) })
    }

    pub fn erase(&mut self, key: Value) -> u64 {
        let handle = self.handle.clone();
        self.submit(async move { handle.erase(key).await.map(|_| Value::None) })
    }

    /// The next completed `(id, answer)` pair, or `None` once the proxy is
    /// unusable.
    pub async fn receive(&mut self) -> Option<(u64, ProxyAnswer)> {
        self.results_rx.recv().await
    }
}
