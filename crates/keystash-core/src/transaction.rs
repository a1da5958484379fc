//! Transaction boundary over a [`KeyStore`].
//!
//! Inside [`TransactionalKeyStore::transaction`] reads are memoised and writes
//! are buffered; the buffered write set is handed to a [`CommitStrategy`] once
//! the work succeeds. The transaction scope is task-local: work spawned onto
//! other tasks does not join it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::{Result, StoreError};
use crate::key_store::{entry_count, KeyData, KeyStore, KeyType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOptions {
    pub max_commit_retries: u32,
    pub delay_between_tries_ms: u64,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_commit_retries: 10,
            delay_between_tries_ms: 3000,
        }
    }
}

// ── Commit strategies ─────────────────────────────────────────────────────────

#[async_trait]
pub trait CommitStrategy: Send + Sync {
    /// Whether writes made inside a transaction wait for the commit.
    fn defers_writes(&self) -> bool {
        true
    }

    async fn commit(&self, store: &dyn KeyStore, mutations: KeyData) -> Result<()>;
}

/// No buffering: transactions run their work directly against the store.
#[derive(Debug, Default, Clone, Copy)]
pub struct Immediate;

#[async_trait]
impl CommitStrategy for Immediate {
    fn defers_writes(&self) -> bool {
        false
    }

    async fn commit(&self, store: &dyn KeyStore, mutations: KeyData) -> Result<()> {
        store.set(mutations).await
    }
}

/// Commit the write set, retrying conflicts with a fixed delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryingCommit {
    options: TransactionOptions,
}

impl RetryingCommit {
    pub fn new(options: TransactionOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl CommitStrategy for RetryingCommit {
    async fn commit(&self, store: &dyn KeyStore, mutations: KeyData) -> Result<()> {
        let attempts = self.options.max_commit_retries.max(1);
        let delay = Duration::from_millis(self.options.delay_between_tries_ms);
        for attempt in 1..=attempts {
            match store.set(mutations.clone()).await {
                Ok(()) => {
                    trace!(attempt, "committed transaction");
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    warn!(attempt, attempts, error = %err, "failed to commit mutations");
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::TransactionConflict { attempts })
    }
}

// ── Transaction scope ─────────────────────────────────────────────────────────

#[derive(Default)]
struct TxState {
    /// Values seen so far; `None` marks an id known to be absent.
    reads: HashMap<KeyType, HashMap<String, Option<Bytes>>>,
    mutations: KeyData,
}

struct TxContext {
    state: Mutex<TxState>,
}

/// Open transactions of the current task, by store id.
type ActiveTransactions = Arc<HashMap<u64, Arc<TxContext>>>;

tokio::task_local! {
    static ACTIVE: ActiveTransactions;
}

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

pub struct TransactionalKeyStore {
    store: Arc<dyn KeyStore>,
    strategy: Arc<dyn CommitStrategy>,
    id: u64,
}

impl TransactionalKeyStore {
    /// Buffered transactions committed with [`RetryingCommit`].
    pub fn new<S>(store: Arc<S>, options: TransactionOptions) -> Self
    where
        S: KeyStore + 'static,
    {
        Self::with_strategy(store, Arc::new(RetryingCommit::new(options)))
    }

    /// Transactions that run their work directly against `store`.
    pub fn pass_through<S>(store: Arc<S>) -> Self
    where
        S: KeyStore + 'static,
    {
        Self::with_strategy(store, Arc::new(Immediate))
    }

    pub fn with_strategy<S>(store: Arc<S>, strategy: Arc<dyn CommitStrategy>) -> Self
    where
        S: KeyStore + 'static,
    {
        Self {
            store,
            strategy,
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn is_in_transaction(&self) -> bool {
        self.active().is_some()
    }

    /// Run `work` as one transaction. A transaction opened while another is
    /// active on this store joins the outer one. Nothing is committed if
    /// `work` fails.
    pub async fn transaction<F, Fut, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.strategy.defers_writes() {
            return work().await;
        }
        if self.is_in_transaction() {
            trace!("joining open transaction");
            return work().await;
        }

        let ctx = Arc::new(TxContext {
            state: Mutex::new(TxState::default()),
        });
        let mut scope: HashMap<u64, Arc<TxContext>> =
            ACTIVE.try_with(|active| (**active).clone()).unwrap_or_default();
        scope.insert(self.id, ctx.clone());

        let result = ACTIVE.scope(Arc::new(scope), async move { work().await }).await?;

        let mutations = std::mem::take(&mut ctx.state.lock().mutations);
        let keys = entry_count(&mutations);
        if keys == 0 {
            trace!("no mutations in transaction");
        } else {
            debug!(keys, "committing transaction");
            self.strategy.commit(self.store.as_ref(), mutations).await?;
        }
        Ok(result)
    }

    fn active(&self) -> Option<Arc<TxContext>> {
        ACTIVE
            .try_with(|active| active.get(&self.id).cloned())
            .ok()
            .flatten()
    }
}

#[async_trait]
impl KeyStore for TransactionalKeyStore {
    async fn get(&self, kind: &KeyType, ids: &[String]) -> Result<HashMap<String, Bytes>> {
        let Some(ctx) = self.active() else {
            return self.store.get(kind, ids).await;
        };

        let missing: Vec<String> = {
            let state = ctx.state.lock();
            let seen = state.reads.get(kind);
            ids.iter()
                .filter(|id| !seen.is_some_and(|seen| seen.contains_key(*id)))
                .cloned()
                .collect()
        };
        if !missing.is_empty() {
            trace!(items = missing.len(), "fetching for transaction");
            let mut fetched = self.store.get(kind, &missing).await?;
            let mut state = ctx.state.lock();
            let seen = state.reads.entry(kind.clone()).or_default();
            for id in missing {
                let value = fetched.remove(&id);
                seen.entry(id).or_insert(value);
            }
        }

        let state = ctx.state.lock();
        let seen = state.reads.get(kind);
        Ok(ids
            .iter()
            .filter_map(|id| {
                seen.and_then(|seen| seen.get(id))
                    .and_then(|value| value.clone())
                    .map(|value| (id.clone(), value))
            })
            .collect())
    }

    async fn set(&self, data: KeyData) -> Result<()> {
        let Some(ctx) = self.active() else {
            return self.store.set(data).await;
        };

        let mut state = ctx.state.lock();
        for (kind, entries) in data {
            for (id, value) in entries {
                state
                    .reads
                    .entry(kind.clone())
                    .or_default()
                    .insert(id.clone(), value.clone());
                state
                    .mutations
                    .entry(kind.clone())
                    .or_default()
                    .insert(id, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_store::MemoryKeyStore;
    use std::sync::atomic::AtomicUsize;

    fn write(kind: KeyType, id: &str, value: Option<&'static [u8]>) -> KeyData {
        let mut data = KeyData::new();
        data.entry(kind)
            .or_default()
            .insert(id.to_string(), value.map(Bytes::from_static));
        data
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Fails the first `conflicts` writes with a conflict, or every write
    /// with a backend error when `broken`.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryKeyStore,
        conflicts: AtomicUsize,
        broken: bool,
        gets: AtomicUsize,
        sets: AtomicUsize,
    }

    #[async_trait]
    impl KeyStore for FlakyStore {
        async fn get(&self, kind: &KeyType, ids: &[String]) -> Result<HashMap<String, Bytes>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(kind, ids).await
        }

        async fn set(&self, data: KeyData) -> Result<()> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                return Err(StoreError::Backend("read-only".into()));
            }
            let left = self.conflicts.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Conflict("version moved".into()));
            }
            self.inner.set(data).await
        }
    }

    #[tokio::test]
    async fn pass_through_forwards_immediately() {
        let backing = Arc::new(MemoryKeyStore::new());
        let store = TransactionalKeyStore::pass_through(backing.clone());

        let value = store
            .transaction(|| async {
                assert!(!store.is_in_transaction());
                store.set(write(KeyType::Session, "a", Some(b"1"))).await?;
                let direct = backing.get(&KeyType::Session, &ids(&["a"])).await?;
                assert_eq!(direct.len(), 1);
                Ok::<_, StoreError>(5)
            })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert!(!store.is_in_transaction());
    }

    #[tokio::test]
    async fn writes_are_buffered_until_commit() {
        let backing = Arc::new(FlakyStore::default());
        let store = TransactionalKeyStore::new(backing.clone(), TransactionOptions::default());

        store
            .transaction(|| async {
                assert!(store.is_in_transaction());
                store.set(write(KeyType::PreKey, "1", Some(b"k1"))).await?;

                // Visible inside the transaction, not yet in the backing store.
                let inside = store.get(&KeyType::PreKey, &ids(&["1"])).await?;
                assert_eq!(&inside["1"][..], b"k1");
                assert!(backing.inner.is_empty());
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();

        assert!(!store.is_in_transaction());
        assert_eq!(backing.sets.load(Ordering::SeqCst), 1);
        let after = backing.inner.get(&KeyType::PreKey, &ids(&["1"])).await.unwrap();
        assert_eq!(&after["1"][..], b"k1");
    }

    #[tokio::test]
    async fn reads_are_memoised_within_transaction() {
        let backing = Arc::new(FlakyStore::default());
        backing
            .inner
            .set(write(KeyType::Session, "a", Some(b"s")))
            .await
            .unwrap();
        let store = TransactionalKeyStore::new(backing.clone(), TransactionOptions::default());

        store
            .transaction(|| async {
                store.get(&KeyType::Session, &ids(&["a", "missing"])).await?;
                let again = store.get(&KeyType::Session, &ids(&["a", "missing"])).await?;
                assert_eq!(again.len(), 1);
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
        assert_eq!(backing.gets.load(Ordering::SeqCst), 1);
        // Nothing written, nothing committed.
        assert_eq!(backing.sets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn buffered_delete_hides_value() {
        let backing = Arc::new(FlakyStore::default());
        backing
            .inner
            .set(write(KeyType::PreKey, "7", Some(b"old")))
            .await
            .unwrap();
        let store = TransactionalKeyStore::new(backing.clone(), TransactionOptions::default());

        store
            .transaction(|| async {
                store.set(write(KeyType::PreKey, "7", None)).await?;
                assert!(store.get(&KeyType::PreKey, &ids(&["7"])).await?.is_empty());
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
        assert!(backing.inner.is_empty());
    }

    #[tokio::test]
    async fn failed_work_commits_nothing() {
        let backing = Arc::new(FlakyStore::default());
        let store = TransactionalKeyStore::new(backing.clone(), TransactionOptions::default());

        let err = store
            .transaction(|| async {
                store.set(write(KeyType::Session, "a", Some(b"x"))).await?;
                Err::<(), _>(StoreError::Backend("protocol error".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(backing.sets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn nested_transactions_commit_once() {
        let backing = Arc::new(FlakyStore::default());
        let store = TransactionalKeyStore::new(backing.clone(), TransactionOptions::default());

        store
            .transaction(|| async {
                store.set(write(KeyType::Session, "a", Some(b"1"))).await?;
                store
                    .transaction(|| async {
                        store.set(write(KeyType::Session, "b", Some(b"2"))).await
                    })
                    .await?;
                assert!(backing.inner.is_empty());
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
        assert_eq!(backing.sets.load(Ordering::SeqCst), 1);
        assert_eq!(backing.inner.len(), 2);
    }

    #[tokio::test]
    async fn transactions_on_two_stores_stay_separate() {
        let first = Arc::new(MemoryKeyStore::new());
        let second = Arc::new(MemoryKeyStore::new());
        let a = TransactionalKeyStore::new(first.clone(), TransactionOptions::default());
        let b = TransactionalKeyStore::new(second.clone(), TransactionOptions::default());

        a.transaction(|| async {
            b.transaction(|| async {
                assert!(a.is_in_transaction());
                assert!(b.is_in_transaction());
                a.set(write(KeyType::Session, "x", Some(b"a"))).await?;
                b.set(write(KeyType::Session, "y", Some(b"b"))).await
            })
            .await?;
            assert_eq!(second.len(), 1);
            assert!(first.is_empty());
            Ok::<_, StoreError>(())
        })
        .await
        .unwrap();
        assert_eq!(first.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn conflicts_are_retried_with_delay() {
        let backing = Arc::new(FlakyStore {
            conflicts: AtomicUsize::new(2),
            ..Default::default()
        });
        let options = TransactionOptions {
            max_commit_retries: 3,
            delay_between_tries_ms: 1000,
        };
        let store = TransactionalKeyStore::new(backing.clone(), options);

        let started = tokio::time::Instant::now();
        store
            .transaction(|| async { store.set(write(KeyType::Session, "a", Some(b"1"))).await })
            .await
            .unwrap();
        assert_eq!(backing.sets.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert_eq!(backing.inner.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_conflict() {
        let backing = Arc::new(FlakyStore {
            conflicts: AtomicUsize::new(100),
            ..Default::default()
        });
        let options = TransactionOptions {
            max_commit_retries: 2,
            delay_between_tries_ms: 10,
        };
        let store = TransactionalKeyStore::new(backing.clone(), options);

        let err = store
            .transaction(|| async { store.set(write(KeyType::Session, "a", Some(b"1"))).await })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TransactionConflict { attempts: 2 }));
        assert_eq!(backing.sets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_commit_errors_propagate_at_once() {
        let backing = Arc::new(FlakyStore {
            broken: true,
            ..Default::default()
        });
        let store = TransactionalKeyStore::new(backing.clone(), TransactionOptions::default());

        let err = store
            .transaction(|| async { store.set(write(KeyType::Session, "a", Some(b"1"))).await })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(backing.sets.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn options_deserialize_camel_case() {
        let options: TransactionOptions =
            serde_json::from_str(r#"{"maxCommitRetries":4,"delayBetweenTriesMs":250}"#).unwrap();
        assert_eq!(options.max_commit_retries, 4);
        assert_eq!(options.delay_between_tries_ms, 250);
    }
}
