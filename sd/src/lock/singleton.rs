//! Singleton - one in-flight run per key
//!
//! The first caller for a key starts the work and counts the key up in the
//! [`LockTable`]; callers arriving while it runs share its result instead of
//! starting their own. The key is counted down when the work settles.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;
use tracing::{debug, info};

use super::table::LockTable;

/// Failure of a shared run, as seen by every caller that joined it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SingletonError(pub String);

type InFlight<T> = Shared<BoxFuture<'static, Result<T, SingletonError>>>;

/// Deduplicates concurrent runs by key
///
/// Cheap to clone; clones share the in-flight map.
pub struct Singleton<T> {
    table: LockTable,
    in_flight: Arc<Mutex<HashMap<String, InFlight<T>>>>,
}

impl<T> Clone for Singleton<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<T> Singleton<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(table: LockTable) -> Self {
        Self {
            table,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight<T>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a run for `key` is in flight
    pub fn is_running(&self, key: &str) -> bool {
        self.in_flight().contains_key(key)
    }

    /// Run `work` under `key`, or join the run already in flight
    ///
    /// The work runs on its own tokio task, so it finishes and counts the key
    /// down even if every caller stops waiting. Must be called from inside a
    /// tokio runtime.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> Result<T, SingletonError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = eyre::Result<T>> + Send + 'static,
    {
        let shared = {
            let mut in_flight = self.in_flight();
            match in_flight.get(key) {
                Some(running) => {
                    debug!(%key, "Singleton::run: joining run in flight");
                    running.clone()
                }
                None => {
                    info!(%key, "Acquire singleton");
                    let guard = self.table.guard(key);
                    let map = self.in_flight.clone();
                    let owned_key = key.to_string();

                    let handle = tokio::spawn(async move {
                        let result = match std::panic::AssertUnwindSafe(async move { work().await })
                            .catch_unwind()
                            .await
                        {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(report)) => Err(SingletonError(format!("{report:#}"))),
                            Err(_) => Err(SingletonError("singleton work panicked".to_string())),
                        };
                        map.lock().unwrap_or_else(|e| e.into_inner()).remove(&owned_key);
                        drop(guard);
                        info!(key = %owned_key, ok = result.is_ok(), "Release singleton");
                        result
                    });

                    let shared = async move {
                        handle
                            .await
                            .unwrap_or_else(|e| Err(SingletonError(e.to_string())))
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key.to_string(), shared.clone());
                    shared
                }
            }
        };
        shared.await
    }
}
