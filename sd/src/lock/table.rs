//! LockTable - named refcounted counters with change broadcast

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tracing::{debug, warn};

/// Default broadcast capacity for lock change notifications
pub const DEFAULT_LOCK_EVENT_CAPACITY: usize = 256;

/// A single count change, broadcast on every acquire/release/abort
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockChange {
    pub key: String,
    pub count: usize,
}

struct Entry {
    count: usize,
    /// Woken whenever the count drops to zero
    zeroed: Arc<Notify>,
}

impl Entry {
    fn new() -> Self {
        Self {
            count: 0,
            zeroed: Arc::new(Notify::new()),
        }
    }
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    tx: broadcast::Sender<LockChange>,
}

/// Table of named refcounts
///
/// Cheap to clone; all clones share the same counters.
#[derive(Clone)]
pub struct LockTable {
    inner: Arc<Inner>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_EVENT_CAPACITY)
    }
}

impl LockTable {
    /// Create an empty table with the given broadcast capacity
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "LockTable::new: called");
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                tx,
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn broadcast(&self, key: &str, count: usize) {
        // No subscribers is fine
        let _ = self.inner.tx.send(LockChange {
            key: key.to_string(),
            count,
        });
    }

    /// Subscribe to every count change
    pub fn subscribe(&self) -> broadcast::Receiver<LockChange> {
        self.inner.tx.subscribe()
    }

    /// Increment the refcount for `key`, returning the new count
    pub fn acquire(&self, key: &str) -> usize {
        let mut entries = self.entries();
        let entry = entries.entry(key.to_string()).or_insert_with(Entry::new);
        entry.count += 1;
        let count = entry.count;
        debug!(%key, count, "LockTable::acquire");
        self.broadcast(key, count);
        count
    }

    /// Decrement the refcount for `key`, returning the new count
    ///
    /// Releasing a key that is already at zero is logged and leaves it at zero.
    /// A key that was never acquired is not created.
    pub fn release(&self, key: &str) -> usize {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            warn!(%key, "LockTable::release: released a key that was never acquired");
            return 0;
        };
        if entry.count == 0 {
            warn!(%key, "LockTable::release: released a key that is not held");
            self.broadcast(key, 0);
            return 0;
        }
        entry.count -= 1;
        let count = entry.count;
        debug!(%key, count, "LockTable::release");
        if count == 0 {
            entry.zeroed.notify_waiters();
        }
        self.broadcast(key, count);
        count
    }

    /// Acquire `key` only if every key in `blockers` is at zero
    ///
    /// The check and the increment happen under the same table lock, so two
    /// callers cannot both observe "free" and both acquire.
    pub fn acquire_if_free(&self, key: &str, blockers: &[&str]) -> bool {
        let mut entries = self.entries();
        let blocked = blockers
            .iter()
            .any(|b| entries.get(*b).is_some_and(|entry| entry.count > 0));
        if blocked {
            debug!(%key, ?blockers, "LockTable::acquire_if_free: blocked");
            return false;
        }
        let entry = entries.entry(key.to_string()).or_insert_with(Entry::new);
        entry.count += 1;
        let count = entry.count;
        debug!(%key, count, "LockTable::acquire_if_free: acquired");
        self.broadcast(key, count);
        true
    }

    /// Acquire `key` and return a guard that releases it on drop
    pub fn guard(&self, key: &str) -> LockGuard {
        self.acquire(key);
        LockGuard {
            table: self.clone(),
            key: key.to_string(),
        }
    }

    /// Current refcount for `key` (zero if never acquired)
    pub fn count(&self, key: &str) -> usize {
        self.entries().get(key).map(|e| e.count).unwrap_or(0)
    }

    /// Whether `key` currently has any holder
    pub fn is_busy(&self, key: &str) -> bool {
        self.count(key) > 0
    }

    /// Snapshot of every known key and its count, including keys at zero
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.entries()
            .iter()
            .map(|(k, e)| (k.clone(), e.count))
            .collect()
    }

    /// Force `key` back to zero
    ///
    /// This is an operator escape hatch for leaked holders. Waiters are woken
    /// and the change is broadcast like any other. Unknown keys are logged and
    /// left out of the table.
    pub fn abort(&self, key: &str) -> usize {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(key) else {
            warn!(%key, "LockTable::abort: no such lock key (abnormal intervention)");
            return 0;
        };
        let previous = entry.count;
        warn!(
            %key,
            previous,
            "LockTable::abort: forcing lock count to zero (abnormal intervention)"
        );
        entry.count = 0;
        entry.zeroed.notify_waiters();
        self.broadcast(key, 0);
        previous
    }

    /// Wait until `key` has no holders
    ///
    /// Resolves immediately if the count is already zero. Otherwise waits for
    /// the count to reach zero, yields once, and re-checks, so a release that
    /// is immediately followed by another acquire is not reported as free.
    pub async fn wait(&self, key: &str) {
        debug!(%key, "LockTable::wait: called");
        loop {
            let notify = {
                let entries = self.entries();
                match entries.get(key) {
                    Some(entry) if entry.count > 0 => entry.zeroed.clone(),
                    _ => {
                        debug!(%key, "LockTable::wait: key is free");
                        return;
                    }
                }
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so a release between the two is not missed
            notified.as_mut().enable();
            if self.count(key) > 0 {
                notified.await;
            }
            tokio::task::yield_now().await;
            if self.count(key) == 0 {
                debug!(%key, "LockTable::wait: key released");
                return;
            }
            debug!(%key, "LockTable::wait: re-acquired before wake-up, waiting again");
        }
    }
}

/// Releases its key when dropped
pub struct LockGuard {
    table: LockTable,
    key: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}
