//! The wire form of store commands.
//!
//! Commands ride the overlay as packed messages of kind `command` under the
//! store's `_master` or `_clone` topic. The payload is a codec list:
//! `[op, key, value, expiry, seq, sender]`, with absent slots encoded as
//! `none`. Unknown op numbers decode into an error the receiver skips with a
//! warning, so minor protocol extensions do not drop connections.

use thiserror::Error;
use weft_codec::{decode, encode_to_vec, CodecError};
use weft_model::value::{Timespan, Timestamp};
use weft_model::{EndpointId, Value};

/// The mutation or control operation a command carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandOp {
    Put = 1,
    Add = 2,
    Subtract = 3,
    Erase = 4,
    Clear = 5,
    Expire = 6,
    /// Snapshot request; doubles as clone attach/resync announcement.
    Snapshot = 7,
    /// Snapshot response carrying the full state.
    SnapshotAck = 8,
    /// Key-set reconciliation request/response.
    Keys = 9,
}

impl CommandOp {
    pub fn from_u64(raw: u64) -> Option<Self> {
        match raw {
            1 => Some(Self::Put),
            2 => Some(Self::Add),
            3 => Some(Self::Subtract),
            4 => Some(Self::Erase),
            5 => Some(Self::Clear),
            6 => Some(Self::Expire),
            7 => Some(Self::Snapshot),
            8 => Some(Self::SnapshotAck),
            9 => Some(Self::Keys),
            _ => None,
        }
    }

    /// True for the ops a master emits on its command stream.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Put | Self::Add | Self::Subtract | Self::Erase | Self::Clear | Self::Expire
        )
    }
}

/// Expiry attached to a mutation: absolute on the master's command stream,
/// relative in client requests relayed by clones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expiry {
    At(Timestamp),
    In(Timespan),
}

impl Expiry {
    fn to_value(self) -> Value {
        match self {
            Expiry::At(ts) => Value::Timestamp(ts),
            Expiry::In(span) => Value::Timespan(span),
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Timestamp(ts) => Some(Expiry::At(*ts)),
            Value::Timespan(span) => Some(Expiry::In(*span)),
            _ => None,
        }
    }

    /// Resolves to an absolute deadline relative to `now`.
    pub fn resolve(self, now: Timestamp) -> Timestamp {
        match self {
            Expiry::At(ts) => ts,
            Expiry::In(span) => now + span,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command kind {0}")]
    UnknownOp(u64),
    #[error("malformed command payload: {0}")]
    Malformed(#[from] CodecError),
    #[error("command payload has unexpected shape")]
    BadShape,
}

/// One store command as shipped between endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreCommand {
    pub op: CommandOp,
    pub key: Option<Value>,
    pub value: Option<Value>,
    pub expiry: Option<Expiry>,
    /// Position in the master's command stream; zero for client-originated
    /// commands that have not been sequenced yet.
    pub seq: u64,
    /// The endpoint that produced this command.
    pub sender: EndpointId,
}

impl StoreCommand {
    pub fn new(op: CommandOp, sender: EndpointId) -> Self {
        Self {
            op,
            key: None,
            value: None,
            expiry: None,
            seq: 0,
            sender,
        }
    }

    pub fn with_key(mut self, key: Value) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_expiry(mut self, expiry: Option<Expiry>) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let items = vec![
            Value::Count(self.op as u64),
            self.key.clone().unwrap_or(Value::None),
            self.value.clone().unwrap_or(Value::None),
            self.expiry.map(Expiry::to_value).unwrap_or(Value::None),
            Value::Count(self.seq),
            Value::String(self.sender.to_string()),
        ];
        encode_to_vec(&Value::List(items))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        let Value::List(items) = decode(bytes)? else {
            return Err(CommandError::BadShape);
        };
        let [op, key, value, expiry, seq, sender] = <[Value; 6]>::try_from(items)
            .map_err(|_| CommandError::BadShape)?;

        let raw_op = op.as_count().ok_or(CommandError::BadShape)?;
        let op = CommandOp::from_u64(raw_op).ok_or(CommandError::UnknownOp(raw_op))?;
        let expiry = match &expiry {
            Value::None => None,
            other => Some(Expiry::from_value(other).ok_or(CommandError::BadShape)?),
        };
        let seq = seq.as_count().ok_or(CommandError::BadShape)?;
        let sender = sender
            .as_str()
            .and_then(|text| text.parse().ok())
            .ok_or(CommandError::BadShape)?;

        Ok(Self {
            op,
            key: (!key.is_none()).then_some(key),
            value: (!value.is_none()).then_some(value),
            expiry,
            seq,
            sender,
        })
    }
}

/// Packs a snapshot into the `value` slot of a `snapshot-ack`: a table
/// mapping each key to `[value, expiry]`.
pub fn snapshot_to_value(snapshot: &crate::backend::Snapshot) -> Value {
    let table = snapshot
        .iter()
        .map(|entry| {
            let expiry = entry
                .expiry
                .map(Value::Timestamp)
                .unwrap_or(Value::None);
            (
                entry.key.clone(),
                Value::List(vec![entry.value.clone(), expiry]),
            )
        })
        .collect();
    Value::Table(table)
}

/// Unpacks a `snapshot-ack` value back into snapshot entries.
pub fn snapshot_from_value(value: &Value) -> Result<crate::backend::Snapshot, CommandError> {
    let Value::Table(table) = value else {
        return Err(CommandError::BadShape);
    };
    let mut snapshot = Vec::with_capacity(table.len());
    for (key, packed) in table {
        let Value::List(items) = packed else {
            return Err(CommandError::BadShape);
        };
        let [stored, expiry] = <&[Value; 2]>::try_from(items.as_slice())
            .map_err(|_| CommandError::BadShape)?;
        let expiry = match expiry {
            Value::None => None,
            Value::Timestamp(ts) => Some(*ts),
            _ => return Err(CommandError::BadShape),
        };
        snapshot.push(crate::backend::SnapshotEntry {
            key: key.clone(),
            value: stored.clone(),
            expiry,
        });
    }
    Ok(snapshot)
}
