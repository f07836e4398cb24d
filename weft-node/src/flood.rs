//! Wire form of flooded routing updates.
//!
//! Subscription and revocation floods travel as packed messages of kind
//! `routing-update` on the reserved control topic. The payload is a codec
//! list; paths and timestamp vectors stay aligned index-wise.

use weft_codec::{decode, encode_to_vec};
use weft_model::{EndpointId, Filter, LamportTimestamp, Topic, Value, VectorTimestamp};

/// The control topic all routing updates ride on.
pub fn control_topic() -> Topic {
    Topic::parse(format!("{}/routing", weft_model::topic::RESERVED)).expect("static topic")
}

const TYPE_SUBSCRIBE: u64 = 1;
const TYPE_REVOKE: u64 = 2;

/// A flooded routing update as defined by the overlay protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingUpdate {
    /// `(subscribe, path, ts, new_filter)`: the origin's current filter,
    /// carried along the path the flood traveled.
    Subscribe {
        path: Vec<EndpointId>,
        ts: VectorTimestamp,
        filter: Filter,
    },
    /// `(revoke, path, ts, revoker, revoke_ts, hop, new_filter)`: the
    /// severed link and the revoker's filter after the loss.
    Revoke {
        path: Vec<EndpointId>,
        ts: VectorTimestamp,
        revoker: EndpointId,
        revoke_ts: LamportTimestamp,
        hop: EndpointId,
        filter: Filter,
    },
}

fn ids_to_value(ids: &[EndpointId]) -> Value {
    Value::List(ids.iter().map(|id| Value::from(id.to_string())).collect())
}

fn ts_to_value(ts: &VectorTimestamp) -> Value {
    Value::List(ts.iter().map(|t| Value::Count(t.value())).collect())
}

fn filter_to_value(filter: &Filter) -> Value {
    Value::List(
        filter
            .iter()
            .map(|topic| Value::from(topic.as_str()))
            .collect(),
    )
}

fn ids_from_value(value: &Value) -> Option<Vec<EndpointId>> {
    let Value::List(items) = value else {
        return None;
    };
    items
        .iter()
        .map(|item| item.as_str().and_then(|text| text.parse().ok()))
        .collect()
}

fn ts_from_value(value: &Value) -> Option<VectorTimestamp> {
    let Value::List(items) = value else {
        return None;
    };
    let entries: Option<Vec<u64>> = items.iter().map(Value::as_count).collect();
    Some(VectorTimestamp::from(entries?))
}

fn filter_from_value(value: &Value) -> Option<Filter> {
    let Value::List(items) = value else {
        return None;
    };
    let mut filter = Filter::new();
    for item in items {
        filter.insert(item.as_str().and_then(|text| Topic::parse(text).ok())?);
    }
    Some(filter)
}

impl RoutingUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let items = match self {
            RoutingUpdate::Subscribe { path, ts, filter } => vec![
                Value::Count(TYPE_SUBSCRIBE),
                ids_to_value(path),
                ts_to_value(ts),
                filter_to_value(filter),
            ],
            RoutingUpdate::Revoke {
                path,
                ts,
                revoker,
                revoke_ts,
                hop,
                filter,
            } => vec![
                Value::Count(TYPE_REVOKE),
                ids_to_value(path),
                ts_to_value(ts),
                filter_to_value(filter),
                Value::from(revoker.to_string()),
                Value::Count(revoke_ts.value()),
                Value::from(hop.to_string()),
            ],
        };
        encode_to_vec(&Value::List(items))
    }

    pub fn decode(bytes: &[u8]) -> Option<RoutingUpdate> {
        let Ok(Value::List(items)) = decode(bytes) else {
            return None;
        };
        let update_type = items.first()?.as_count()?;
        match update_type {
            TYPE_SUBSCRIBE if items.len() == 4 => Some(RoutingUpdate::Subscribe {
                path: ids_from_value(&items[1])?,
                ts: ts_from_value(&items[2])?,
                filter: filter_from_value(&items[3])?,
            }),
            TYPE_REVOKE if items.len() == 7 => Some(RoutingUpdate::Revoke {
                path: ids_from_value(&items[1])?,
                ts: ts_from_value(&items[2])?,
                filter: filter_from_value(&items[3])?,
                revoker: items[4].as_str()?.parse().ok()?,
                revoke_ts: LamportTimestamp(items[5].as_count()?),
                hop: items[6].as_str()?.parse().ok()?,
            }),
            _ => None,
        }
    }

    /// The endpoints this update already visited.
    pub fn path(&self) -> &[EndpointId] {
        match self {
            RoutingUpdate::Subscribe { path, .. } => path,
            RoutingUpdate::Revoke { path, .. } => path,
        }
    }

    /// Extends the path with the local hop before forwarding.
    pub fn extend(&mut self, id: EndpointId, clock: LamportTimestamp) {
        match self {
            RoutingUpdate::Subscribe { path, ts, .. } => {
                path.push(id);
                ts.push(clock);
            }
            RoutingUpdate::Revoke { path, ts, .. } => {
                path.push(id);
                ts.push(clock);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(x: u8) -> EndpointId {
        EndpointId::from_bytes([x; 16])
    }

    fn filter() -> Filter {
        [Topic::parse("a/b").unwrap()].into_iter().collect()
    }

    #[test]
    fn subscribe_roundtrip() {
        let update = RoutingUpdate::Subscribe {
            path: vec![id(1), id(2)],
            ts: vec![3u64, 4].into(),
            filter: filter(),
        };
        assert_eq!(RoutingUpdate::decode(&update.encode()), Some(update));
    }

    #[test]
    fn revoke_roundtrip() {
        let update = RoutingUpdate::Revoke {
            path: vec![id(1)],
            ts: vec![9u64].into(),
            revoker: id(1),
            revoke_ts: LamportTimestamp(9),
            hop: id(5),
            filter: Filter::new(),
        };
        assert_eq!(RoutingUpdate::decode(&update.encode()), Some(update));
    }

    #[test]
    fn extend_keeps_path_and_ts_aligned() {
        let mut update = RoutingUpdate::Subscribe {
            path: vec![id(1)],
            ts: vec![1u64].into(),
            filter: Filter::new(),
        };
        update.extend(id(2), LamportTimestamp(7));
        let RoutingUpdate::Subscribe { path, ts, .. } = update else {
            unreachable!()
        };
        assert_eq!(path.len(), ts.len());
        assert_eq!(ts.get(1), Some(LamportTimestamp(7)));
    }

    #[test]
    fn garbage_decodes_to_none() {
        assert_eq!(RoutingUpdate::decode(&[1, 2, 3]), None);
        assert_eq!(
            RoutingUpdate::decode(&encode_to_vec(&Value::Count(1))),
            None
        );
    }

    #[test]
    fn control_topic_is_reserved() {
        assert!(control_topic().is_reserved());
    }
}
