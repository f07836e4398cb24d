//! Codec failure modes. All of them map to the `codec-malformed` error kind
//! at the protocol surface.

use thiserror::Error;
use weft_model::ErrorKind;

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    #[error("input truncated")]
    Truncated,
    #[error("unknown value tag {0}")]
    BadTag(u8),
    #[error("malformed varbyte length")]
    BadVarbyte,
    #[error("string payload is not valid utf-8")]
    Utf8,
    #[error("unknown address family {0}")]
    BadFamily(u8),
    #[error("subnet prefix length {0} exceeds address width")]
    BadPrefix(u8),
    #[error("unknown port protocol {0}")]
    BadProtocol(u8),
    #[error("container elements out of canonical order")]
    NonCanonicalOrder,
    #[error("trailing bytes after value")]
    TrailingBytes,
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::CodecMalformed
    }
}
