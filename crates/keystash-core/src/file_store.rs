//! Directory-backed auth state.
//!
//! One flat directory per client. The credential bundle lives in
//! `creds.json` and is replaced atomically on every save. Keyed entries are
//! held in an in-process cache; with [`EntryPersistence::Durable`] each entry
//! is also written to its own `{type}.{id}.json` file.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::cache::{CacheStore, ExpiringCache};
use crate::caching::CachingKeyStore;
use crate::codec::{Codec, JsonCodec};
use crate::creds::{init_auth_creds, AuthCreds};
use crate::crypto::{CurvePrimitives, KeyPrimitives};
use crate::error::{Result, StoreError};
use crate::key_store::{entry_count, unique_id, ClearableKeyStore, KeyData, KeyStore, KeyType};
use crate::mutex::{KeyedMutex, Mutex};
use crate::transaction::{TransactionOptions, TransactionalKeyStore};

pub const CREDS_FILE: &str = "creds.json";
const STAGING_SUFFIX: &str = ".staging";
const ENTRY_SUFFIX: &str = ".json";

/// Where keyed entries live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryPersistence {
    /// In-process cache only; entries are lost on restart.
    #[default]
    Ephemeral,
    /// Cache plus one file per entry.
    Durable,
}

#[derive(Clone)]
pub struct FileStoreOptions {
    pub persistence: EntryPersistence,
    /// TTL of cached entries; `None` keeps them for the process lifetime.
    pub entry_ttl: Option<Duration>,
    pub sweep_interval: Option<Duration>,
    pub codec: Arc<dyn Codec>,
    pub primitives: Arc<dyn KeyPrimitives>,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            persistence: EntryPersistence::Ephemeral,
            entry_ttl: None,
            sweep_interval: None,
            codec: Arc::new(JsonCodec),
            primitives: Arc::new(CurvePrimitives),
        }
    }
}

/// Make an identifier safe to use as a file name.
pub fn fix_file_name(file: &str) -> String {
    file.replace('/', "__").replace(':', "-")
}

fn entry_file_name(kind: &KeyType, id: &str) -> String {
    fix_file_name(&format!("{}{}", unique_id(kind, id), ENTRY_SUFFIX))
}

// ── Key store ─────────────────────────────────────────────────────────────────

pub struct DurableFileKeyStore {
    root: PathBuf,
    persistence: EntryPersistence,
    cache: Arc<ExpiringCache>,
    codec: Arc<dyn Codec>,
    /// Serialises writes and deletes of the same entry file.
    file_locks: KeyedMutex,
}

impl DurableFileKeyStore {
    fn new(root: PathBuf, options: &FileStoreOptions) -> Self {
        let cache = Arc::new(ExpiringCache::new(options.entry_ttl));
        if let Some(interval) = options.sweep_interval {
            cache.spawn_sweeper(interval);
        }
        Self {
            root,
            persistence: options.persistence,
            cache,
            codec: options.codec.clone(),
            file_locks: KeyedMutex::new(),
        }
    }

    pub fn persistence(&self) -> EntryPersistence {
        self.persistence
    }

    pub fn cache(&self) -> &Arc<ExpiringCache> {
        &self.cache
    }

    async fn read_entry(&self, file_name: &str) -> Result<Option<Bytes>> {
        match fs::read(self.root.join(file_name)).await {
            Ok(raw) => Ok(Some(self.codec.decode_entry(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_entry(&self, file_name: &str, value: &[u8]) -> Result<()> {
        let encoded = self.codec.encode_entry(value)?;
        self.file_locks
            .mutex(file_name, || write_atomic(&self.root, file_name, &encoded))
            .await
    }

    async fn remove_entry(&self, file_name: &str) -> Result<()> {
        self.file_locks
            .mutex(file_name, || async {
                match fs::remove_file(self.root.join(file_name)).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }
}

#[async_trait]
impl KeyStore for DurableFileKeyStore {
    async fn get(&self, kind: &KeyType, ids: &[String]) -> Result<HashMap<String, Bytes>> {
        let mut data = HashMap::with_capacity(ids.len());
        for id in ids {
            let key = unique_id(kind, id);
            if let Some(value) = self.cache.get(&key) {
                data.insert(id.clone(), value);
                continue;
            }
            if self.persistence == EntryPersistence::Durable {
                if let Some(value) = self.read_entry(&entry_file_name(kind, id)).await? {
                    self.cache.set(&key, value.clone());
                    data.insert(id.clone(), value);
                }
            }
        }
        Ok(data)
    }

    async fn set(&self, data: KeyData) -> Result<()> {
        let keys = entry_count(&data);
        for (kind, entries) in data {
            for (id, value) in entries {
                let key = unique_id(&kind, &id);
                match (value, self.persistence) {
                    (Some(value), EntryPersistence::Ephemeral) => self.cache.set(&key, value),
                    (Some(value), EntryPersistence::Durable) => {
                        self.write_entry(&entry_file_name(&kind, &id), &value).await?;
                        self.cache.set(&key, value);
                    }
                    // Absent values are neither stored nor deleted in memory.
                    (None, EntryPersistence::Ephemeral) => {}
                    (None, EntryPersistence::Durable) => {
                        self.cache.del(&key);
                        self.remove_entry(&entry_file_name(&kind, &id)).await?;
                    }
                }
            }
        }
        trace!(keys, "stored entries");
        Ok(())
    }
}

#[async_trait]
impl ClearableKeyStore for DurableFileKeyStore {
    async fn clear(&self) -> Result<()> {
        self.cache.flush_all();
        if self.persistence == EntryPersistence::Durable {
            let mut dir = fs::read_dir(&self.root).await?;
            while let Some(entry) = dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name != CREDS_FILE && name.ends_with(ENTRY_SUFFIX) {
                    self.remove_entry(&name).await?;
                }
            }
        }
        debug!(root = %self.root.display(), "cleared key entries");
        Ok(())
    }
}

// ── Auth state ────────────────────────────────────────────────────────────────

pub struct FileAuthState {
    root: PathBuf,
    creds: RwLock<AuthCreds>,
    bootstrapped: bool,
    keys: Arc<DurableFileKeyStore>,
    codec: Arc<dyn Codec>,
    save_lock: Mutex,
}

/// Open `folder` with default options.
pub async fn use_multi_file_auth_state(folder: impl AsRef<Path>) -> Result<FileAuthState> {
    FileAuthState::open(folder, FileStoreOptions::default()).await
}

impl FileAuthState {
    /// Open or create the auth-state directory and load its credentials,
    /// bootstrapping fresh ones when none can be read. Fresh credentials are
    /// not written until [`FileAuthState::save_creds`].
    pub async fn open(folder: impl AsRef<Path>, options: FileStoreOptions) -> Result<Self> {
        let root = folder.as_ref().to_path_buf();
        prepare_dir(&root).await?;
        cleanup_staging_files(&root).await;

        let (creds, bootstrapped) = match read_creds(&root, options.codec.as_ref()).await {
            Some(creds) => {
                debug!(root = %root.display(), "loaded credentials");
                (creds, false)
            }
            None => (init_auth_creds(options.primitives.as_ref())?, true),
        };

        Ok(Self {
            keys: Arc::new(DurableFileKeyStore::new(root.clone(), &options)),
            root,
            creds: RwLock::new(creds),
            bootstrapped,
            codec: options.codec,
            save_lock: Mutex::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the credentials were generated by this open rather than loaded.
    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    pub fn creds(&self) -> AuthCreds {
        self.creds.read().clone()
    }

    /// Mutate the in-memory credentials. Call [`FileAuthState::save_creds`]
    /// to persist.
    pub fn update_creds<R>(&self, f: impl FnOnce(&mut AuthCreds) -> R) -> R {
        f(&mut self.creds.write())
    }

    pub fn keys(&self) -> Arc<DurableFileKeyStore> {
        self.keys.clone()
    }

    /// The usual client stack: a transaction layer over an expiring cache
    /// over this directory's entries.
    pub fn signal_key_store(
        &self,
        cache_ttl: Option<Duration>,
        options: TransactionOptions,
    ) -> TransactionalKeyStore {
        let cache: Arc<dyn CacheStore> = Arc::new(ExpiringCache::new(cache_ttl));
        let cached = CachingKeyStore::clearable_with_cache(self.keys(), cache);
        TransactionalKeyStore::new(Arc::new(cached), options)
    }

    /// Overwrite `creds.json` with the current credentials.
    pub async fn save_creds(&self) -> Result<()> {
        self.save_lock
            .run_exclusive(|| async {
                let encoded = self.codec.encode_creds(&self.creds())?;
                write_atomic(&self.root, CREDS_FILE, &encoded).await?;
                debug!(root = %self.root.display(), "saved credentials");
                Ok(())
            })
            .await
    }
}

// ── Filesystem helpers ────────────────────────────────────────────────────────

async fn prepare_dir(root: &Path) -> Result<()> {
    match fs::metadata(root).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(StoreError::NotADirectory(root.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(root).await?;
            restrict_dir_permissions(root).await;
            debug!(root = %root.display(), "created auth state directory");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn read_creds(root: &Path, codec: &dyn Codec) -> Option<AuthCreds> {
    let path = root.join(CREDS_FILE);
    let raw = match fs::read(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no stored credentials, generating new ones");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read credentials, generating new ones");
            return None;
        }
    };
    match codec.decode_creds(&raw) {
        Ok(creds) => Some(creds),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot decode credentials, generating new ones");
            None
        }
    }
}

/// Write `bytes` to `root/file_name` so readers only ever see a complete file.
async fn write_atomic(root: &Path, file_name: &str, bytes: &[u8]) -> Result<()> {
    let staging_path = root.join(format!(".{}{}", Uuid::new_v4(), STAGING_SUFFIX));
    {
        let mut file = fs::File::create(&staging_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
    }
    if let Err(e) = fs::rename(&staging_path, root.join(file_name)).await {
        let _ = fs::remove_file(&staging_path).await;
        return Err(e.into());
    }
    fsync_dir(root).await
}

async fn fsync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = fs::File::open(path).await?;
        dir.sync_all().await?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

async fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Remove leftover staging files from an interrupted write.
async fn cleanup_staging_files(root: &Path) {
    let Ok(mut dir) = fs::read_dir(root).await else {
        return;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        if entry.file_name().to_string_lossy().ends_with(STAGING_SUFFIX) {
            warn!(path = %entry.path().display(), "removing orphaned staging file");
            let _ = fs::remove_file(entry.path()).await;
        }
    }
}
