//! The key store capability shared by every layer.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Kind of record held under a keyed entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum KeyType {
    PreKey,
    Session,
    SenderKey,
    SenderKeyMemory,
    AppStateSyncKey,
    AppStateSyncVersion,
    Other(String),
}

impl KeyType {
    pub fn as_str(&self) -> &str {
        match self {
            KeyType::PreKey => "pre-key",
            KeyType::Session => "session",
            KeyType::SenderKey => "sender-key",
            KeyType::SenderKeyMemory => "sender-key-memory",
            KeyType::AppStateSyncKey => "app-state-sync-key",
            KeyType::AppStateSyncVersion => "app-state-sync-version",
            KeyType::Other(name) => name,
        }
    }
}

impl From<&str> for KeyType {
    fn from(value: &str) -> Self {
        match value {
            "pre-key" => KeyType::PreKey,
            "session" => KeyType::Session,
            "sender-key" => KeyType::SenderKey,
            "sender-key-memory" => KeyType::SenderKeyMemory,
            "app-state-sync-key" => KeyType::AppStateSyncKey,
            "app-state-sync-version" => KeyType::AppStateSyncVersion,
            other => KeyType::Other(other.to_string()),
        }
    }
}

impl From<String> for KeyType {
    fn from(value: String) -> Self {
        KeyType::from(value.as_str())
    }
}

impl From<KeyType> for String {
    fn from(value: KeyType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writes grouped by kind then id. `None` asks for the entry to be removed.
pub type KeyData = HashMap<KeyType, HashMap<String, Option<Bytes>>>;

/// Composite key of a keyed entry: `"{type}.{id}"`.
pub fn unique_id(kind: &KeyType, id: &str) -> String {
    format!("{}.{}", kind.as_str(), id)
}

/// Number of `(type, id)` pairs in a write set.
pub fn entry_count(data: &KeyData) -> usize {
    data.values().map(HashMap::len).sum()
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Fetch the given ids. Ids without a value are omitted from the map.
    async fn get(&self, kind: &KeyType, ids: &[String]) -> Result<HashMap<String, Bytes>>;

    async fn set(&self, data: KeyData) -> Result<()>;
}

/// A key store that can also drop everything it holds.
#[async_trait]
pub trait ClearableKeyStore: KeyStore {
    async fn clear(&self) -> Result<()>;
}

/// Process-local key store backed by a hash map.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    entries: parking_lot::RwLock<HashMap<String, Bytes>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn get(&self, kind: &KeyType, ids: &[String]) -> Result<HashMap<String, Bytes>> {
        let guard = self.entries.read();
        Ok(ids
            .iter()
            .filter_map(|id| {
                guard
                    .get(&unique_id(kind, id))
                    .map(|value| (id.clone(), value.clone()))
            })
            .collect())
    }

    async fn set(&self, data: KeyData) -> Result<()> {
        let mut guard = self.entries.write();
        for (kind, entries) in data {
            for (id, value) in entries {
                let key = unique_id(&kind, &id);
                match value {
                    Some(value) => {
                        guard.insert(key, value);
                    }
                    None => {
                        guard.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClearableKeyStore for MemoryKeyStore {
    async fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }
}
