use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::SIGNAL_STORE_TTL;
use crate::codec::JsonCodec;
use crate::crypto::CurvePrimitives;
use crate::error::Result;
use crate::file_store::{EntryPersistence, FileStoreOptions};
use crate::paths::{self, AUTH_DIR_ENV};
use crate::transaction::TransactionOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystashConfig {
    pub auth_dir: Option<PathBuf>,
    pub signal_cache_ttl_secs: u64,
    pub entry_cache_ttl_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub persistence: EntryPersistence,
    pub transaction: TransactionOptions,
}

impl Default for KeystashConfig {
    fn default() -> Self {
        Self {
            auth_dir: None,
            signal_cache_ttl_secs: SIGNAL_STORE_TTL.as_secs(),
            entry_cache_ttl_secs: None,
            sweep_interval_secs: None,
            persistence: EntryPersistence::Ephemeral,
            transaction: TransactionOptions::default(),
        }
    }
}

impl KeystashConfig {
    /// Read a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read(path) {
            Ok(raw) => {
                debug!(path = %path.display(), "loaded config");
                serde_json::from_slice(&raw)?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        if let Ok(dir) = std::env::var(AUTH_DIR_ENV) {
            config.auth_dir = Some(PathBuf::from(dir));
        }
        Ok(config)
    }

    pub fn auth_dir(&self) -> Result<PathBuf> {
        match &self.auth_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::default_auth_dir(),
        }
    }

    /// TTL of the cache in front of the signal key store.
    pub fn signal_cache_ttl(&self) -> Option<Duration> {
        match self.signal_cache_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn file_store_options(&self) -> FileStoreOptions {
        FileStoreOptions {
            persistence: self.persistence,
            entry_ttl: self.entry_cache_ttl_secs.map(Duration::from_secs),
            sweep_interval: self.sweep_interval_secs.map(Duration::from_secs),
            codec: Arc::new(JsonCodec),
            primitives: Arc::new(CurvePrimitives),
        }
    }
}
