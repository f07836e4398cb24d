//! Transport-layer errors.

use thiserror::Error;
use weft_model::{ErrorKind, VersionInfo};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("peer speaks protocol {} but we require {}", theirs.protocol, ours.protocol)]
    Incompatible { ours: VersionInfo, theirs: VersionInfo },

    #[error("peer presented our own endpoint id")]
    IdCollision,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connection closed during handshake")]
    ClosedEarly,
}

impl NetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::Io(_) => ErrorKind::PeerUnavailable,
            NetError::Malformed(_) => ErrorKind::CodecMalformed,
            NetError::Incompatible { .. } => ErrorKind::PeerIncompatible,
            NetError::IdCollision => ErrorKind::PeerInvalid,
            NetError::HandshakeTimeout => ErrorKind::PeerTimeout,
            NetError::ClosedEarly => ErrorKind::PeerUnavailable,
        }
    }
}

impl From<weft_codec::CodecError> for NetError {
    fn from(err: weft_codec::CodecError) -> Self {
        NetError::Malformed(err.to_string())
    }
}
