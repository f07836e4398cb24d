//! Path revocations.
//!
//! A revocation names a severed link (`revoker`, `hop`) together with the
//! revoker's clock at the time of the loss. A path is affected iff it routes
//! through the two ids adjacently and was advertised no later than the
//! revocation.

use std::time::Instant;

use weft_model::{EndpointId, LamportTimestamp, VectorTimestamp};

/// A revoked link between two peers with the logical time of the loss.
#[derive(Clone, Debug)]
pub struct BlacklistEntry {
    /// The endpoint that observed the connection loss.
    pub revoker: EndpointId,
    /// The revoker's clock when the link went down.
    pub ts: LamportTimestamp,
    /// The peer on the other end of the severed link.
    pub hop: EndpointId,
    /// When this entry was recorded locally, for aging out.
    pub first_seen: Instant,
}

impl BlacklistEntry {
    fn key(&self) -> (EndpointId, LamportTimestamp, EndpointId) {
        (self.revoker, self.ts, self.hop)
    }
}

/// Checks whether `path` routes through `revoker -> hop` or `hop -> revoker`
/// with the path's component timestamp for `revoker` at most `ts`.
pub fn blacklisted(
    path: &[EndpointId],
    path_ts: &VectorTimestamp,
    revoker: &EndpointId,
    ts: LamportTimestamp,
    hop: &EndpointId,
) -> bool {
    debug_assert_eq!(path.len(), path_ts.len());
    if path.len() <= 1 {
        return false;
    }
    if path[0] == *revoker {
        return path_ts.get(0).is_some_and(|t| t <= ts) && path[1] == *hop;
    }
    for index in 1..path.len() - 1 {
        if path[index] == *revoker {
            return path_ts.get(index).is_some_and(|t| t <= ts)
                && (path[index - 1] == *hop || path[index + 1] == *hop);
        }
    }
    let last = path.len() - 1;
    if path[last] == *revoker {
        return path_ts.get(last).is_some_and(|t| t <= ts) && path[last - 1] == *hop;
    }
    false
}

/// The set of revocations seen by an endpoint, sorted by (revoker, ts, hop).
#[derive(Default)]
pub struct Blacklist {
    entries: Vec<BlacklistEntry>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a revocation. Returns `false` if an equal entry exists.
    pub fn insert(
        &mut self,
        revoker: EndpointId,
        ts: LamportTimestamp,
        hop: EndpointId,
        now: Instant,
    ) -> bool {
        let key = (revoker, ts, hop);
        match self.entries.binary_search_by(|entry| entry.key().cmp(&key)) {
            Ok(_) => false,
            Err(pos) => {
                self.entries.insert(
                    pos,
                    BlacklistEntry {
                        revoker,
                        ts,
                        hop,
                        first_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Checks `path` against every recorded revocation.
    pub fn covers(&self, path: &[EndpointId], path_ts: &VectorTimestamp) -> bool {
        self.entries
            .iter()
            .any(|entry| blacklisted(path, path_ts, &entry.revoker, entry.ts, &entry.hop))
    }

    /// Drops entries first seen before `cutoff`. Returns how many were
    /// removed.
    pub fn expire(&mut self, cutoff: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.first_seen >= cutoff);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlacklistEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(x: u8) -> EndpointId {
        EndpointId::from_bytes([x; 16])
    }

    fn vts(entries: &[u64]) -> VectorTimestamp {
        VectorTimestamp::from(entries.to_vec())
    }

    #[test]
    fn adjacency_is_required() {
        let path = [id(1), id(2), id(3)];
        let ts = vts(&[1, 1, 1]);
        // Revoker adjacent to hop in either direction.
        assert!(blacklisted(&path, &ts, &id(2), LamportTimestamp(1), &id(3)));
        assert!(blacklisted(&path, &ts, &id(2), LamportTimestamp(1), &id(1)));
        // Not adjacent.
        assert!(!blacklisted(&path, &ts, &id(1), LamportTimestamp(1), &id(3)));
    }

    #[test]
    fn newer_paths_survive() {
        let path = [id(1), id(2)];
        assert!(blacklisted(
            &path,
            &vts(&[3, 1]),
            &id(1),
            LamportTimestamp(3),
            &id(2)
        ));
        assert!(!blacklisted(
            &path,
            &vts(&[4, 1]),
            &id(1),
            LamportTimestamp(3),
            &id(2)
        ));
    }

    #[test]
    fn single_hop_paths_are_never_blacklisted() {
        let path = [id(1)];
        assert!(!blacklisted(
            &path,
            &vts(&[1]),
            &id(1),
            LamportTimestamp(9),
            &id(2)
        ));
    }

    #[test]
    fn revoker_at_path_end() {
        let path = [id(1), id(2), id(3)];
        let ts = vts(&[1, 1, 1]);
        assert!(blacklisted(&path, &ts, &id(3), LamportTimestamp(1), &id(2)));
        assert!(!blacklisted(&path, &ts, &id(3), LamportTimestamp(1), &id(1)));
    }

    #[test]
    fn insert_deduplicates_and_expires() {
        let mut list = Blacklist::new();
        let t0 = Instant::now();
        assert!(list.insert(id(1), LamportTimestamp(1), id(2), t0));
        assert!(!list.insert(id(1), LamportTimestamp(1), id(2), t0));
        assert!(list.insert(id(1), LamportTimestamp(2), id(2), t0));
        assert_eq!(list.len(), 2);

        assert_eq!(list.expire(t0 + Duration::from_secs(1)), 2);
        assert!(list.is_empty());
    }

    #[test]
    fn covers_checks_all_entries() {
        let mut list = Blacklist::new();
        list.insert(id(2), LamportTimestamp(5), id(3), Instant::now());
        assert!(list.covers(&[id(1), id(2), id(3)], &vts(&[1, 1, 1])));
        assert!(!list.covers(&[id(1), id(2)], &vts(&[1, 1])));
    }
}
