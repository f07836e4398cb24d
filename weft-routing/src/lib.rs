//! Weft Routing
//!
//! The per-endpoint routing state of the overlay: a table of versioned paths
//! per known peer, the revocation blacklist, and the multipath descriptor
//! that encodes one aggregated forwarding plan per outgoing message.

pub mod blacklist;
pub mod multipath;
pub mod table;

pub use blacklist::{blacklisted, Blacklist, BlacklistEntry};
pub use multipath::{Multipath, MultipathNode};
pub use table::{Path, RoutingTable};
