//! The process-wide peer status map.
//!
//! Shared between the core actor and the transport-establishment tasks;
//! guarded by a mutex, values are copied out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

/// Lifecycle of a directed peer relation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Handshaking,
    Up,
    Draining,
    Revoked,
    Disconnected,
}

#[derive(Default)]
pub struct PeerStatusMap {
    inner: Mutex<HashMap<SocketAddr, PeerStatus>>,
}

impl PeerStatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, addr: SocketAddr, status: PeerStatus) {
        self.inner
            .lock()
            .expect("status map poisoned")
            .insert(addr, status);
    }

    pub fn get(&self, addr: SocketAddr) -> Option<PeerStatus> {
        self.inner
            .lock()
            .expect("status map poisoned")
            .get(&addr)
            .copied()
    }

    pub fn remove(&self, addr: SocketAddr) {
        self.inner.lock().expect("status map poisoned").remove(&addr);
    }

    pub fn snapshot(&self) -> Vec<(SocketAddr, PeerStatus)> {
        self.inner
            .lock()
            .expect("status map poisoned")
            .iter()
            .map(|(addr, status)| (*addr, *status))
            .collect()
    }
}
