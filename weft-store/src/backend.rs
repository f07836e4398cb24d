//! The interface a storage plugin must satisfy.

use std::path::PathBuf;

use weft_model::value::Timestamp;
use weft_model::Value;

use crate::error::StoreError;

/// One key of a snapshot: value plus the recorded expiry, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: Value,
    pub value: Value,
    pub expiry: Option<Timestamp>,
}

/// A point-in-time complete copy of a store's state.
pub type Snapshot = Vec<SnapshotEntry>;

/// Keys with a recorded expiry, for rebuilding the timer schedule.
pub type Expirables = Vec<(Value, Timestamp)>;

/// Authoritative storage behind a master.
///
/// All operations return typed results; a failing backend never panics the
/// actor. Implementations are synchronous, the owning actor serializes
/// access.
pub trait Backend: Send {
    /// Overwrites `key`, resetting any recorded expiry.
    fn put(&mut self, key: Value, value: Value, expiry: Option<Timestamp>) -> Result<(), StoreError>;

    /// Adds `value` to the entry under `key`, initializing an absent key to
    /// the neutral element of the operand's tag first.
    fn add(&mut self, key: Value, value: &Value, expiry: Option<Timestamp>)
        -> Result<(), StoreError>;

    /// Subtracts `value` from the entry under `key`.
    fn subtract(
        &mut self,
        key: &Value,
        value: &Value,
        expiry: Option<Timestamp>,
    ) -> Result<(), StoreError>;

    fn erase(&mut self, key: &Value) -> Result<(), StoreError>;

    fn clear(&mut self) -> Result<(), StoreError>;

    /// Removes `key` iff its recorded expiry equals `ts`, so a late-running
    /// timer never clobbers a newer value. Returns whether the key was
    /// removed.
    fn expire(&mut self, key: &Value, ts: Timestamp) -> Result<bool, StoreError>;

    fn get(&self, key: &Value) -> Result<Value, StoreError>;

    fn exists(&self, key: &Value) -> Result<bool, StoreError>;

    fn size(&self) -> Result<u64, StoreError>;

    /// All keys as a set value.
    fn keys(&self) -> Result<Value, StoreError>;

    fn snapshot(&self) -> Result<Snapshot, StoreError>;

    fn expiries(&self) -> Result<Expirables, StoreError>;
}

/// Built-in backend implementations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Sqlite,
}

/// Options handed to a backend at open time.
#[derive(Clone, Debug, Default)]
pub struct BackendOptions {
    /// Database file for on-disk backends.
    pub path: Option<PathBuf>,
}

/// Opens one of the built-in backends.
pub fn open(kind: BackendKind, options: &BackendOptions) -> Result<Box<dyn Backend>, StoreError> {
    match kind {
        BackendKind::Memory => Ok(Box::new(crate::memory::MemoryBackend::new())),
        BackendKind::Sqlite => {
            let path = options
                .path
                .as_ref()
                .ok_or_else(|| StoreError::Backend("sqlite backend requires a path".into()))?;
            Ok(Box::new(crate::sqlite::SqliteBackend::open(path)?))
        }
    }
}
