//! User-facing status and error items, delivered through event subscribers.

use std::fmt;
use std::net::SocketAddr;

use crate::{EndpointId, ErrorKind};

/// Discriminates the status items an endpoint can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StatusKind {
    PeerAdded,
    PeerRemoved,
    PeerLost,
    PeerUnavailable,
    PeerInvalid,
    PeerIncompatible,
    EndpointDiscovered,
    EndpointUnreachable,
}

/// A single status item: what happened, to whom, and where.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub kind: StatusKind,
    pub endpoint: Option<EndpointId>,
    pub address: Option<SocketAddr>,
    pub message: String,
}

impl Status {
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: None,
            address: None,
            message: message.into(),
        }
    }

    pub fn with_endpoint(mut self, id: EndpointId) -> Self {
        self.endpoint = Some(id);
        self
    }

    pub fn with_address(mut self, addr: SocketAddr) -> Self {
        self.address = Some(addr);
        self
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(id) = &self.endpoint {
            write!(f, " peer={id}")?;
        }
        if let Some(addr) = &self.address {
            write!(f, " addr={addr}")?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

/// An item on the event stream: either a status or a non-fatal error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Status(Status),
    Error { kind: ErrorKind, message: String },
}

impl Event {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Event::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_status(&self) -> bool {
        matches!(self, Event::Status(_))
    }
}
