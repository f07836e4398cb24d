//! Endpoint-level errors.

use std::net::SocketAddr;

use thiserror::Error;
use weft_model::{ErrorKind, TopicError};
use weft_store::StoreError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EndpointError {
    #[error("cannot reach {0}")]
    PeerUnavailable(SocketAddr),

    #[error("peering with {addr} failed: {message}")]
    PeerRejected {
        addr: SocketAddr,
        kind: ErrorKind,
        message: String,
    },

    #[error("no route to endpoint {0}")]
    Unreachable(weft_model::EndpointId),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("listen failed: {0}")]
    Listen(std::io::Error),

    #[error("endpoint is shutting down")]
    ShuttingDown,
}

impl EndpointError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EndpointError::PeerUnavailable(_) => ErrorKind::PeerUnavailable,
            EndpointError::PeerRejected { kind, .. } => *kind,
            EndpointError::Unreachable(_) => ErrorKind::PeerUnavailable,
            EndpointError::Topic(_) => ErrorKind::Unspecified,
            EndpointError::Store(err) => err.kind(),
            EndpointError::Listen(_) => ErrorKind::Unspecified,
            EndpointError::ShuttingDown => ErrorKind::ShutdownInProgress,
        }
    }
}
