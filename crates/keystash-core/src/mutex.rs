//! Async critical sections, optionally scoped to a string key.
//!
//! Tasks sharing a key run one at a time in arrival order; tasks with
//! different keys do not wait for each other. The per-key lock table only
//! holds keys that currently have a running or queued task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex as TableLock;
use tokio::sync::Mutex as AsyncMutex;

/// A single async lock around arbitrary tasks.
#[derive(Debug, Default)]
pub struct Mutex {
    inner: AsyncMutex<()>,
}

impl Mutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once every earlier task has finished.
    pub async fn run_exclusive<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.inner.lock().await;
        task().await
    }
}

type LockTable = TableLock<HashMap<String, Arc<AsyncMutex<()>>>>;

#[derive(Debug, Default)]
pub struct KeyedMutex {
    locks: LockTable,
}

/// A claim on one key's lock. Dropping the last claim removes the key.
struct Lease<'a> {
    table: &'a LockTable,
    key: String,
    lock: Arc<AsyncMutex<()>>,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        // One reference in the table, one here: nobody else holds or waits.
        if Arc::strong_count(&self.lock) == 2 {
            table.remove(&self.key);
        }
    }
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` with exclusive ownership of `key`.
    ///
    /// The lock is released when the task completes, fails, panics, or is
    /// cancelled; the next queued task for the key then starts.
    pub async fn mutex<F, Fut, T>(&self, key: &str, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.lease(key);
        let _guard = lease.lock.lock().await;
        task().await
    }

    /// Number of keys with a running or queued task.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lease(&self, key: &str) -> Lease<'_> {
        let lock = self
            .locks
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        Lease {
            table: &self.locks,
            key: key.to_string(),
            lock,
        }
    }
}
