//! The in-memory backend.

use std::collections::BTreeMap;

use weft_model::value::Timestamp;
use weft_model::Value;

use crate::appliers;
use crate::backend::{Backend, Expirables, Snapshot, SnapshotEntry};
use crate::error::StoreError;

/// Keeps everything in an ordered map; iteration order doubles as the
/// canonical order for `keys` and `snapshot`.
#[derive(Default)]
pub struct MemoryBackend {
    entries: BTreeMap<Value, (Value, Option<Timestamp>)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn put(&mut self, key: Value, value: Value, expiry: Option<Timestamp>) -> Result<(), StoreError> {
        self.entries.insert(key, (value, expiry));
        Ok(())
    }

    fn add(
        &mut self,
        key: Value,
        value: &Value,
        expiry: Option<Timestamp>,
    ) -> Result<(), StoreError> {
        let slot = self
            .entries
            .entry(key)
            .or_insert_with(|| (Value::neutral(value.tag()), None));
        appliers::add_to(&mut slot.0, value)?;
        slot.1 = expiry;
        Ok(())
    }

    fn subtract(
        &mut self,
        key: &Value,
        value: &Value,
        expiry: Option<Timestamp>,
    ) -> Result<(), StoreError> {
        let slot = self.entries.get_mut(key).ok_or(StoreError::NoSuchKey)?;
        appliers::subtract_from(&mut slot.0, value)?;
        slot.1 = expiry;
        Ok(())
    }

    fn erase(&mut self, key: &Value) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }

    fn expire(&mut self, key: &Value, ts: Timestamp) -> Result<bool, StoreError> {
        match self.entries.get(key) {
            Some((_, Some(recorded))) if *recorded == ts => {
                self.entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn get(&self, key: &Value) -> Result<Value, StoreError> {
        self.entries
            .get(key)
            .map(|(value, _)| value.clone())
            .ok_or(StoreError::NoSuchKey)
    }

    fn exists(&self, key: &Value) -> Result<bool, StoreError> {
        Ok(self.entries.contains_key(key))
    }

    fn size(&self) -> Result<u64, StoreError> {
        Ok(self.entries.len() as u64)
    }

    fn keys(&self) -> Result<Value, StoreError> {
        Ok(Value::Set(self.entries.keys().cloned().collect()))
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        Ok(self
            .entries
            .iter()
            .map(|(key, (value, expiry))| SnapshotEntry {
                key: key.clone(),
                value: value.clone(),
                expiry: *expiry,
            })
            .collect())
    }

    fn expiries(&self) -> Result<Expirables, StoreError> {
        Ok(self
            .entries
            .iter()
            .filter_map(|(key, (_, expiry))| expiry.map(|ts| (key.clone(), ts)))
            .collect())
    }
}
