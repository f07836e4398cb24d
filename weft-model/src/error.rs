//! The fabric-wide error taxonomy. Errors are surfaced as values, never by
//! unwinding.

use thiserror::Error;

/// Machine-readable error codes shared by the overlay, the stores, and the
/// user-facing event stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("unspecified")]
    Unspecified,
    #[error("peer-incompatible")]
    PeerIncompatible,
    #[error("peer-invalid")]
    PeerInvalid,
    #[error("peer-unavailable")]
    PeerUnavailable,
    #[error("peer-timeout")]
    PeerTimeout,
    #[error("master-exists")]
    MasterExists,
    #[error("no-such-master")]
    NoSuchMaster,
    #[error("no-such-key")]
    NoSuchKey,
    #[error("request-timeout")]
    RequestTimeout,
    #[error("type-clash")]
    TypeClash,
    #[error("backend-failure")]
    BackendFailure,
    #[error("store-stale")]
    StoreStale,
    #[error("codec-malformed")]
    CodecMalformed,
    #[error("shutdown-in-progress")]
    ShutdownInProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_kebab_case() {
        assert_eq!(ErrorKind::NoSuchKey.to_string(), "no-such-key");
        assert_eq!(ErrorKind::StoreStale.to_string(), "store-stale");
    }
}
