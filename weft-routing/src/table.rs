//! The per-peer routing table.
//!
//! Each row stores an optional direct handle plus every known path to the
//! peer, versioned by a vector timestamp and kept sorted by (length, lex).
//! The lexicographic tie-break between equal-length paths makes both ends of
//! a link pick the same routes.

use std::cmp::Ordering;
use std::collections::HashMap;

use weft_model::{EndpointId, LamportTimestamp, VectorTimestamp};

use crate::blacklist;

/// An ordered, loop-free sequence of hops ending at the destination. The
/// first element is always a directly connected peer of the owner.
pub type Path = Vec<EndpointId>;

fn path_less(x: &Path, y: &Path) -> Ordering {
    x.len().cmp(&y.len()).then_with(|| x.cmp(y))
}

struct Row<H> {
    handle: Option<H>,
    /// Sorted by `path_less`, deduplicated by path value. Stores only the
    /// latest timestamp version per path.
    versioned_paths: Vec<(Path, VectorTimestamp)>,
}

impl<H> Default for Row<H> {
    fn default() -> Self {
        Self {
            handle: None,
            versioned_paths: Vec::new(),
        }
    }
}

/// Stores direct connections as well as multi-hop paths to all peers that
/// are reachable indirectly.
pub struct RoutingTable<H> {
    rows: HashMap<EndpointId, Row<H>>,
}

impl<H> Default for RoutingTable<H> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }
}

impl<H> RoutingTable<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn reachable(&self, peer: &EndpointId) -> bool {
        self.rows.contains_key(peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = &EndpointId> {
        self.rows.keys()
    }

    /// All hops to the destination (including the destination itself), or
    /// `None` if unreachable.
    pub fn shortest_path(&self, peer: &EndpointId) -> Option<&Path> {
        self.rows
            .get(peer)
            .and_then(|row| row.versioned_paths.first())
            .map(|(path, _)| path)
    }

    /// The shortest path together with its timestamp vector.
    pub fn shortest_versioned(&self, peer: &EndpointId) -> Option<(&Path, &VectorTimestamp)> {
        self.rows
            .get(peer)
            .and_then(|row| row.versioned_paths.first())
            .map(|(path, ts)| (path, ts))
    }

    /// Hop count of the shortest path, or `None` if unreachable.
    pub fn distance_to(&self, peer: &EndpointId) -> Option<usize> {
        self.shortest_path(peer).map(Vec::len)
    }

    pub fn is_direct(&self, peer: &EndpointId) -> bool {
        self.rows
            .get(peer)
            .map(|row| row.handle.is_some())
            .unwrap_or(false)
    }

    pub fn handle(&self, peer: &EndpointId) -> Option<&H> {
        self.rows.get(peer).and_then(|row| row.handle.as_ref())
    }

    /// Installs or replaces the direct handle for `peer`.
    pub fn set_handle(&mut self, peer: EndpointId, handle: H) {
        self.rows.entry(peer).or_default().handle = Some(handle);
    }

    pub fn for_each_direct(&self, mut fun: impl FnMut(&EndpointId, &H)) {
        for (peer, row) in &self.rows {
            if let Some(handle) = &row.handle {
                fun(peer, handle);
            }
        }
    }

    /// Adds a path to `peer`, inserting a new row if none exists yet. An
    /// existing entry for the same path is only replaced when the stored
    /// timestamp vector is strictly older. Returns `true` if a new row was
    /// created for the peer.
    pub fn add_or_update_path(
        &mut self,
        peer: EndpointId,
        path: Path,
        ts: VectorTimestamp,
    ) -> bool {
        debug_assert_eq!(path.len(), ts.len());
        debug_assert_eq!(path.last(), Some(&peer));
        let added = !self.rows.contains_key(&peer);
        let row = self.rows.entry(peer).or_default();
        let paths = &mut row.versioned_paths;
        match paths.binary_search_by(|(stored, _)| path_less(stored, &path)) {
            Ok(pos) => {
                if paths[pos].1.strictly_less(&ts) {
                    paths[pos].1 = ts;
                }
            }
            Err(pos) => paths.insert(pos, (path, ts)),
        }
        added
    }

    /// Erases all state for `whom` and scrubs every other row of paths that
    /// include `whom`. Peers that lose their last path cascade: they are
    /// reported through `on_remove` and erased in turn. Terminates because
    /// every iteration strictly shrinks the table. `on_remove` observes but
    /// cannot touch the table.
    pub fn erase(&mut self, whom: &EndpointId, mut on_remove: impl FnMut(EndpointId)) {
        let mut unreachable = Vec::new();
        self.erase_impl(whom, &mut unreachable);
        while let Some(peer) = unreachable.pop() {
            self.erase_impl(&peer, &mut unreachable);
            on_remove(peer);
        }
    }

    fn erase_impl(&mut self, whom: &EndpointId, unreachable: &mut Vec<EndpointId>) {
        self.rows.remove(whom);
        for (peer, row) in &mut self.rows {
            let before = row.versioned_paths.len();
            row.versioned_paths
                .retain(|(path, _)| !path.contains(whom));
            if before != row.versioned_paths.len() && row.versioned_paths.is_empty() {
                unreachable.push(*peer);
            }
        }
    }

    /// Clears the direct handle of `whom` and drops every path whose first
    /// hop is `whom`. Rows left without paths are reported and erased.
    /// Returns `true` iff a row for `whom` existed.
    pub fn erase_direct(
        &mut self,
        whom: &EndpointId,
        mut on_remove: impl FnMut(EndpointId),
    ) -> bool {
        match self.rows.get_mut(whom) {
            None => return false,
            Some(row) => row.handle = None,
        }
        self.rows.retain(|peer, row| {
            row.versioned_paths
                .retain(|(path, _)| path.first() != Some(whom));
            if row.versioned_paths.is_empty() {
                on_remove(*peer);
                false
            } else {
                true
            }
        });
        true
    }

    /// Drops every path that the blacklist predicate matches for the given
    /// revocation. Rows left without paths are reported and erased.
    pub fn revoke(
        &mut self,
        revoker: &EndpointId,
        ts: LamportTimestamp,
        hop: &EndpointId,
        mut on_remove: impl FnMut(EndpointId),
    ) {
        self.rows.retain(|peer, row| {
            row.versioned_paths
                .retain(|(path, path_ts)| !blacklist::blacklisted(path, path_ts, revoker, ts, hop));
            if row.versioned_paths.is_empty() {
                on_remove(*peer);
                false
            } else {
                true
            }
        });
    }
}
