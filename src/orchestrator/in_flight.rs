// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-flight sync table.
//!
//! Collapses concurrent requests for the same key into one unit of work. The
//! work runs on a spawned task, so it settles and updates caches even when
//! every caller has stopped waiting; the task clears its own entry when done.
//!
//! Flights are bound to the session epoch they started in, so a new session
//! never joins work whose results the old session will discard. A forced
//! request only joins a forced flight; a plain request joins either.

use crate::error::{BoxFuture, SyncError};
use futures::future::{FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::error;

pub(crate) type Flight<T> = Shared<BoxFuture<'static, T>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct FlightKey {
    pub(crate) address: String,
    pub(crate) epoch: u64,
    pub(crate) forced: bool,
}

impl FlightKey {
    pub(crate) fn new(address: &str, epoch: u64, forced: bool) -> Self {
        Self {
            address: address.to_string(),
            epoch,
            forced,
        }
    }

    fn as_forced(&self) -> Self {
        Self {
            forced: true,
            ..self.clone()
        }
    }
}

pub(crate) struct InFlight<T> {
    table: Arc<Mutex<HashMap<FlightKey, Flight<T>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join a pending flight compatible with `key`, or start `work` as a new one.
    ///
    /// Returns the flight and whether an existing one was joined. `work` is
    /// only built when no flight is pending.
    pub(crate) fn join_or_start<F, Fut>(&self, key: FlightKey, work: F) -> (Flight<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::error::Result<T>> + Send + 'static,
    {
        let mut table = lock(&self.table);
        let existing = table
            .get(&key)
            .or_else(|| if key.forced { None } else { table.get(&key.as_forced()) });
        if let Some(existing) = existing {
            return (existing.clone(), true);
        }

        // The task cannot clear its entry before it is inserted: removal
        // needs the lock held here.
        let fut = work();
        let cleanup = Arc::clone(&self.table);
        let owned_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            lock(&cleanup).remove(&owned_key);
            result
        });

        let flight: BoxFuture<'static, T> = Box::pin(async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Sync task aborted");
                    Err(SyncError::Internal(format!("sync task aborted: {}", e)))
                }
            }
        });
        let flight = flight.shared();
        table.insert(key, flight.clone());
        (flight, false)
    }

    /// Whether any flight for `address` is pending, whatever its epoch.
    pub(crate) fn contains(&self, address: &str) -> bool {
        lock(&self.table).keys().any(|key| key.address == address)
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.table).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let flights: InFlight<u32> = InFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let start = |runs: Arc<AtomicUsize>| {
            move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(7)
            }
        };

        let (a, joined_a) = flights.join_or_start(FlightKey::new("k", 1, false), start(runs.clone()));
        let (b, joined_b) = flights.join_or_start(FlightKey::new("k", 1, false), start(runs.clone()));
        assert!(!joined_a);
        assert!(joined_b);
        assert!(flights.contains("k"));

        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra, Ok(7));
        assert_eq!(rb, Ok(7));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entry_cleared_on_failure() {
        let flights: InFlight<u32> = InFlight::new();
        let (flight, _) = flights.join_or_start(FlightKey::new("k", 1, false), || async {
            Err(SyncError::server("op", "boom"))
        });
        assert!(flight.await.is_err());
        tokio::task::yield_now().await;
        assert_eq!(flights.len(), 0);
    }

    #[tokio::test]
    async fn test_work_completes_without_callers() {
        let flights: InFlight<u32> = InFlight::new();
        let done = Arc::new(AtomicUsize::new(0));
        let marker = done.clone();

        let (flight, _) = flights.join_or_start(FlightKey::new("k", 1, false), move || async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            marker.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });
        drop(flight);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!flights.contains("k"));
    }

    #[tokio::test]
    async fn test_forced_request_does_not_join_plain_flight() {
        let flights: InFlight<u32> = InFlight::new();
        let slow = || async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(1)
        };

        let (plain, _) = flights.join_or_start(FlightKey::new("k", 1, false), slow);
        let (forced, joined) = flights.join_or_start(FlightKey::new("k", 1, true), slow);
        assert!(!joined);
        assert_eq!(flights.len(), 2);

        // A plain request may ride on the forced one.
        let (_, joined) = flights.join_or_start(FlightKey::new("k", 1, false), slow);
        assert!(joined);
        let (_, joined) = flights.join_or_start(FlightKey::new("k", 1, true), slow);
        assert!(joined);

        let _ = tokio::join!(plain, forced);
    }

    #[tokio::test]
    async fn test_new_epoch_starts_new_flight() {
        let flights: InFlight<u32> = InFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let start = |runs: Arc<AtomicUsize>| {
            move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(1)
            }
        };

        let (old, _) = flights.join_or_start(FlightKey::new("k", 1, true), start(runs.clone()));
        let (new, joined) = flights.join_or_start(FlightKey::new("k", 3, true), start(runs.clone()));
        assert!(!joined);
        assert!(flights.contains("k"));
        assert!(!flights.contains("other"));

        let _ = tokio::join!(old, new);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
