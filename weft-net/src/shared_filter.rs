//! The process-wide shared filter.
//!
//! The core actor owns the filter; the transport-establishment tasks need a
//! consistent copy of it (plus the clock that versions it) when greeting a
//! new peer. Reads lock, copy out, and release.

use std::sync::Mutex;

use weft_model::{Filter, LamportTimestamp};

#[derive(Default)]
pub struct SharedFilter {
    inner: Mutex<(LamportTimestamp, Filter)>,
}

impl SharedFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current `(version, filter)` pair, copied out under the lock.
    pub fn read(&self) -> (LamportTimestamp, Filter) {
        self.inner.lock().expect("shared filter poisoned").clone()
    }

    /// Installs a newer filter. Stale versions are ignored so racing
    /// updates cannot move the filter backwards.
    pub fn update(&self, version: LamportTimestamp, filter: Filter) {
        let mut inner = self.inner.lock().expect("shared filter poisoned");
        if version >= inner.0 {
            *inner = (version, filter);
        }
    }
}
