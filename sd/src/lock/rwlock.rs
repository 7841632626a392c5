//! ReadWriteLock - shared/exclusive pair composed over a LockTable

use std::sync::Arc;

use tracing::debug;

use super::table::LockTable;

type DeltaCallback = Arc<dyn Fn(&str, i32) + Send + Sync>;

/// Shared/exclusive lock built from two counters in a [`LockTable`]
///
/// The counters live under `<key>:shared` and `<key>:exclusive`, so their
/// counts are visible remotely like any other key. Acquisition waits on the
/// table; the check-and-increment is atomic inside the table.
#[derive(Clone)]
pub struct ReadWriteLock {
    table: LockTable,
    key: String,
    shared_key: String,
    exclusive_key: String,
    on_delta: Option<DeltaCallback>,
}

impl ReadWriteLock {
    pub fn new(table: LockTable, key: impl Into<String>) -> Self {
        let key = key.into();
        debug!(%key, "ReadWriteLock::new: called");
        Self {
            shared_key: format!("{}:shared", key),
            exclusive_key: format!("{}:exclusive", key),
            table,
            key,
            on_delta: None,
        }
    }

    /// Invoke `callback(key, delta)` with +1 on every acquire and -1 on every release
    pub fn with_delta_callback(mut self, callback: impl Fn(&str, i32) + Send + Sync + 'static) -> Self {
        self.on_delta = Some(Arc::new(callback));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn shared_key(&self) -> &str {
        &self.shared_key
    }

    pub fn exclusive_key(&self) -> &str {
        &self.exclusive_key
    }

    fn delta(&self, delta: i32) {
        if let Some(callback) = &self.on_delta {
            callback(&self.key, delta);
        }
    }

    /// Whether anyone holds either side of the lock
    pub fn is_busy(&self) -> bool {
        self.table.is_busy(&self.shared_key) || self.table.is_busy(&self.exclusive_key)
    }

    /// Acquire shared access, waiting for any exclusive holder to leave
    pub async fn acquire_read(&self) -> ReadGuard {
        debug!(key = %self.key, "ReadWriteLock::acquire_read: called");
        loop {
            self.table.wait(&self.exclusive_key).await;
            if self.table.acquire_if_free(&self.shared_key, &[self.exclusive_key.as_str()]) {
                break;
            }
        }
        self.delta(1);
        ReadGuard { lock: self.clone() }
    }

    /// Acquire exclusive access, waiting for every shared and exclusive holder to leave
    pub async fn acquire_write(&self) -> WriteGuard {
        debug!(key = %self.key, "ReadWriteLock::acquire_write: called");
        loop {
            self.table.wait(&self.exclusive_key).await;
            self.table.wait(&self.shared_key).await;
            if self
                .table
                .acquire_if_free(&self.exclusive_key, &[self.exclusive_key.as_str(), self.shared_key.as_str()])
            {
                break;
            }
        }
        self.delta(1);
        WriteGuard { lock: self.clone() }
    }
}

fn ordered_keys<'a>(keys: &[&'a str]) -> Vec<&'a str> {
    let mut keys = keys.to_vec();
    keys.sort_unstable();
    keys.dedup();
    keys
}

/// Acquire shared access to every key in `keys`
///
/// Keys are taken one at a time in sorted order, so two callers asking for
/// overlapping sets cannot each hold part of the other's. Duplicates are
/// acquired once. The guards release everything on drop.
pub async fn read_many(table: &LockTable, keys: &[&str]) -> Vec<ReadGuard> {
    let keys = ordered_keys(keys);
    debug!(?keys, "read_many: called");
    let mut guards = Vec::with_capacity(keys.len());
    for key in keys {
        guards.push(ReadWriteLock::new(table.clone(), key).acquire_read().await);
    }
    guards
}

/// Acquire exclusive access to every key in `keys`, in sorted order
pub async fn write_many(table: &LockTable, keys: &[&str]) -> Vec<WriteGuard> {
    let keys = ordered_keys(keys);
    debug!(?keys, "write_many: called");
    let mut guards = Vec::with_capacity(keys.len());
    for key in keys {
        guards.push(ReadWriteLock::new(table.clone(), key).acquire_write().await);
    }
    guards
}

/// Shared access; released on drop
pub struct ReadGuard {
    lock: ReadWriteLock,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        debug!(key = %self.lock.key, "ReadGuard::drop: releasing shared");
        self.lock.table.release(&self.lock.shared_key);
        self.lock.delta(-1);
    }
}

/// Exclusive access; released on drop
pub struct WriteGuard {
    lock: ReadWriteLock,
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        debug!(key = %self.lock.key, "WriteGuard::drop: releasing exclusive");
        self.lock.table.release(&self.lock.exclusive_key);
        self.lock.delta(-1);
    }
}
