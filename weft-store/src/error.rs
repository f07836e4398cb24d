//! Store-level errors, returned to callers as values.

use thiserror::Error;
use weft_model::ErrorKind;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    #[error("no such key")]
    NoSuchKey,
    #[error("store is stale")]
    Stale,
    #[error("request timed out")]
    Timeout,
    #[error("operand type does not match the stored value")]
    TypeClash,
    #[error("backend failure: {0}")]
    Backend(String),
    #[error("no master found for the store")]
    NoSuchMaster,
    #[error("a master for this store already exists")]
    MasterExists,
    #[error("endpoint is shutting down")]
    Shutdown,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NoSuchKey => ErrorKind::NoSuchKey,
            StoreError::Stale => ErrorKind::StoreStale,
            StoreError::Timeout => ErrorKind::RequestTimeout,
            StoreError::TypeClash => ErrorKind::TypeClash,
            StoreError::Backend(_) => ErrorKind::BackendFailure,
            StoreError::NoSuchMaster => ErrorKind::NoSuchMaster,
            StoreError::MasterExists => ErrorKind::MasterExists,
            StoreError::Shutdown => ErrorKind::ShutdownInProgress,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}
