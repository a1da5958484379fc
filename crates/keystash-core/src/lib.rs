//! keystash_core: cached, lock-guarded key storage for end-to-end encrypted
//! protocol clients
//!
//! # Module layout
//! - `key_store`: the `KeyStore` capability and an in-memory store
//! - `cache`: expiring in-process byte cache
//! - `caching`: read-through, write-through cache over any key store
//! - `mutex`: async critical sections, per key or global
//! - `transaction`: buffered writes committed through a `CommitStrategy`
//! - `file_store`: directory-backed credentials and key entries
//! - `creds`: the credential bundle and its bootstrap
//! - `crypto`: X25519 key pairs, XEdDSA signatures, identifiers
//! - `codec`: byte encodings for credentials and entries
//! - `config`: JSON configuration
//! - `paths`: platform data directories
//! - `error`: unified error type

pub mod cache;
pub mod caching;
pub mod codec;
pub mod config;
pub mod creds;
pub mod crypto;
pub mod error;
pub mod file_store;
pub mod key_store;
pub mod mutex;
pub mod paths;
pub mod transaction;

pub use cache::{CacheStore, ExpiringCache, SIGNAL_STORE_TTL};
pub use caching::CachingKeyStore;
pub use codec::{Codec, JsonCodec};
pub use config::KeystashConfig;
pub use creds::{init_auth_creds, AuthCreds};
pub use crypto::{CurvePrimitives, KeyPair, KeyPrimitives, SignedKeyPair};
pub use error::{Result, StoreError};
pub use file_store::{
    fix_file_name, use_multi_file_auth_state, DurableFileKeyStore, EntryPersistence,
    FileAuthState, FileStoreOptions,
};
pub use key_store::{ClearableKeyStore, KeyData, KeyStore, KeyType, MemoryKeyStore};
pub use mutex::{KeyedMutex, Mutex};
pub use transaction::{
    CommitStrategy, Immediate, RetryingCommit, TransactionOptions, TransactionalKeyStore,
};
