//! In-memory cache, CRC32 canonicalization, and the notification payload
//! schema. Everything here is pure state manipulation so the cache
//! semantics stay testable without a database.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A change applied to the cache. `value: None` means the key was deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub key: String,
    pub value: Option<Value>,
}

/// Payloads travelling over the NOTIFY channel. Data changes come from the
/// table trigger; heartbeats are emitted by instances themselves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Notification {
    Insert { key: String, value: Value },
    Update { key: String, value: Value },
    Delete { key: String },
    Heartbeat { crc: u32 },
}

/// CRC32/IEEE over the canonicalized entries: keys sorted
/// lexicographically, `"key:json(value);"` concatenated.
pub fn checksum(entries: &BTreeMap<String, Value>) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for (key, value) in entries {
        hasher.update(key.as_bytes());
        hasher.update(b":");
        let json = serde_json::to_string(value).unwrap_or_default();
        hasher.update(json.as_bytes());
        hasher.update(b";");
    }
    hasher.finalize()
}

/// The cache proper. The checksum is recomputed on every mutation.
#[derive(Debug, Default)]
pub struct ConfigCache {
    entries: BTreeMap<String, Value>,
    crc: u32,
}

impl ConfigCache {
    pub fn from_entries(entries: BTreeMap<String, Value>) -> Self {
        let crc = checksum(&entries);
        Self { entries, crc }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.clone()
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply an insert/update. Returns false when the stored value already
    /// equals the new one, which is how an instance's own trigger
    /// notification avoids double-notifying local subscribers.
    pub fn apply_set(&mut self, key: &str, value: Value) -> bool {
        if self.entries.get(key) == Some(&value) {
            return false;
        }
        self.entries.insert(key.to_string(), value);
        self.crc = checksum(&self.entries);
        true
    }

    pub fn apply_delete(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        self.crc = checksum(&self.entries);
        true
    }

    /// Replace the whole cache and return one event per difference:
    /// changed or added keys with their new value, removed keys with
    /// `None`.
    pub fn replace_all(&mut self, fresh: BTreeMap<String, Value>) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        for (key, value) in &fresh {
            if self.entries.get(key) != Some(value) {
                events.push(ChangeEvent {
                    key: key.clone(),
                    value: Some(value.clone()),
                });
            }
        }
        for key in self.entries.keys() {
            if !fresh.contains_key(key) {
                events.push(ChangeEvent {
                    key: key.clone(),
                    value: None,
                });
            }
        }
        self.entries = fresh;
        self.crc = checksum(&self.entries);
        events
    }
}

/// Typed read with coercion: strings only.
pub fn string_or(value: Option<&Value>, default: &str) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        _ => default.to_string(),
    }
}

/// Typed read with coercion: a number or a numeric string.
pub fn int_or(value: Option<&Value>, default: i64) -> i64 {
    value.and_then(flotilla::value::coerce_i64).unwrap_or(default)
}

/// Typed read with coercion: booleans only.
pub fn bool_or(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        _ => default,
    }
}
