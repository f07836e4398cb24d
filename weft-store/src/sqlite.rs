//! The sqlite backend.
//!
//! One table, keys and values stored in their codec encoding so that key
//! equality is byte equality. Read-modify-write operations run inside a
//! transaction.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use weft_codec::{decode, encode_to_vec};
use weft_model::value::Timestamp;
use weft_model::Value;

use crate::appliers;
use crate::backend::{Backend, Expirables, Snapshot, SnapshotEntry};
use crate::error::StoreError;

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS store (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL,
                expiry INTEGER
            )",
        )?;
        Ok(Self { conn })
    }

    fn decode_value(bytes: &[u8]) -> Result<Value, StoreError> {
        decode(bytes).map_err(|err| StoreError::Backend(format!("corrupt row: {err}")))
    }
}

fn expiry_nanos(expiry: Option<Timestamp>) -> Option<i64> {
    expiry.map(|ts| ts.nanos())
}

impl Backend for SqliteBackend {
    fn put(&mut self, key: Value, value: Value, expiry: Option<Timestamp>) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO store (key, value, expiry) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expiry = ?3",
            params![encode_to_vec(&key), encode_to_vec(&value), expiry_nanos(expiry)],
        )?;
        Ok(())
    }

    fn add(
        &mut self,
        key: Value,
        value: &Value,
        expiry: Option<Timestamp>,
    ) -> Result<(), StoreError> {
        let key_bytes = encode_to_vec(&key);
        let tx = self.conn.transaction()?;
        let stored: Option<Vec<u8>> = tx
            .query_row(
                "SELECT value FROM store WHERE key = ?1",
                params![key_bytes],
                |row| row.get(0),
            )
            .optional()?;
        let mut current = match stored {
            Some(bytes) => Self::decode_value(&bytes)?,
            None => Value::neutral(value.tag()),
        };
        appliers::add_to(&mut current, value)?;
        tx.execute(
            "INSERT INTO store (key, value, expiry) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, expiry = ?3",
            params![key_bytes, encode_to_vec(&current), expiry_nanos(expiry)],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn subtract(
        &mut self,
        key: &Value,
        value: &Value,
        expiry: Option<Timestamp>,
    ) -> Result<(), StoreError> {
        let key_bytes = encode_to_vec(key);
        let tx = self.conn.transaction()?;
        let stored: Option<Vec<u8>> = tx
            .query_row(
                "SELECT value FROM store WHERE key = ?1",
                params![key_bytes],
                |row| row.get(0),
            )
            .optional()?;
        let mut current = match stored {
            Some(bytes) => Self::decode_value(&bytes)?,
            None => return Err(StoreError::NoSuchKey),
        };
        appliers::subtract_from(&mut current, value)?;
        tx.execute(
            "UPDATE store SET value = ?2, expiry = ?3 WHERE key = ?1",
            params![key_bytes, encode_to_vec(&current), expiry_nanos(expiry)],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn erase(&mut self, key: &Value) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM store WHERE key = ?1",
            params![encode_to_vec(key)],
        )?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM store", [])?;
        Ok(())
    }

    fn expire(&mut self, key: &Value, ts: Timestamp) -> Result<bool, StoreError> {
        let affected = self.conn.execute(
            "DELETE FROM store WHERE key = ?1 AND expiry = ?2",
            params![encode_to_vec(key), ts.nanos()],
        )?;
        Ok(affected > 0)
    }

    fn get(&self, key: &Value) -> Result<Value, StoreError> {
        let stored: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT value FROM store WHERE key = ?1",
                params![encode_to_vec(key)],
                |row| row.get(0),
            )
            .optional()?;
        match stored {
            Some(bytes) => Self::decode_value(&bytes),
            None => Err(StoreError::NoSuchKey),
        }
    }

    fn exists(&self, key: &Value) -> Result<bool, StoreError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM store WHERE key = ?1",
                params![encode_to_vec(key)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn size(&self) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM store", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn keys(&self) -> Result<Value, StoreError> {
        let mut stmt = self.conn.prepare("SELECT key FROM store")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut keys = std::collections::BTreeSet::new();
        for row in rows {
            keys.insert(Self::decode_value(&row?)?);
        }
        Ok(Value::Set(keys))
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, expiry FROM store")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })?;
        let mut snapshot = Vec::new();
        for row in rows {
            let (key, value, expiry) = row?;
            snapshot.push(SnapshotEntry {
                key: Self::decode_value(&key)?,
                value: Self::decode_value(&value)?,
                expiry: expiry.map(Timestamp),
            });
        }
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(snapshot)
    }

    fn expiries(&self) -> Result<Expirables, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, expiry FROM store WHERE expiry IS NOT NULL")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut expirables = Vec::new();
        for row in rows {
            let (key, expiry) = row?;
            expirables.push((Self::decode_value(&key)?, Timestamp(expiry)));
        }
        Ok(expirables)
    }
}
