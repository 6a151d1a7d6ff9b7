// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed pub/sub for sync lifecycle events.
//!
//! Handlers subscribe to one [`SyncEventType`] and are invoked synchronously,
//! in subscription order, on every matching [`emit`](EventBus::emit). Each
//! handler runs isolated: returning `Err` or panicking is logged and counted,
//! and the remaining handlers still run.
//!
//! Every emitted event is also appended to a bounded history ring (oldest
//! dropped first, irrespective of type) and forwarded to a broadcast channel
//! for async consumers such as the presentation layer.
//!
//! ```rust
//! use profile_sync_engine::events::{EventBus, SyncEventType};
//!
//! let bus = EventBus::new(100);
//! let sub = bus.subscribe(SyncEventType::WalletConnected, |event| {
//!     println!("connected: {}", event.payload);
//!     Ok(())
//! });
//! bus.emit(SyncEventType::WalletConnected, serde_json::json!({"address": "0xABC"}), "wallet");
//! sub.unsubscribe();
//! ```

use crate::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tracing::{error, trace, warn};

/// Kinds of sync lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncEventType {
    WalletConnected,
    WalletDisconnected,
    ProfileSyncStarted,
    ProfileSyncCompleted,
    ProfileSyncFailed,
    NftSyncStarted,
    NftSyncCompleted,
    NftSyncFailed,
    StatsSyncStarted,
    StatsSyncCompleted,
    StatsSyncFailed,
    NetworkStatusChanged,
    ConnectionRestored,
    OfflineOperationQueued,
    OfflineOperationCompleted,
    OfflineOperationFailed,
    CacheInvalidated,
    PerformanceAlert,
}

impl SyncEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WalletConnected => "WALLET_CONNECTED",
            Self::WalletDisconnected => "WALLET_DISCONNECTED",
            Self::ProfileSyncStarted => "PROFILE_SYNC_STARTED",
            Self::ProfileSyncCompleted => "PROFILE_SYNC_COMPLETED",
            Self::ProfileSyncFailed => "PROFILE_SYNC_FAILED",
            Self::NftSyncStarted => "NFT_SYNC_STARTED",
            Self::NftSyncCompleted => "NFT_SYNC_COMPLETED",
            Self::NftSyncFailed => "NFT_SYNC_FAILED",
            Self::StatsSyncStarted => "STATS_SYNC_STARTED",
            Self::StatsSyncCompleted => "STATS_SYNC_COMPLETED",
            Self::StatsSyncFailed => "STATS_SYNC_FAILED",
            Self::NetworkStatusChanged => "NETWORK_STATUS_CHANGED",
            Self::ConnectionRestored => "CONNECTION_RESTORED",
            Self::OfflineOperationQueued => "OFFLINE_OPERATION_QUEUED",
            Self::OfflineOperationCompleted => "OFFLINE_OPERATION_COMPLETED",
            Self::OfflineOperationFailed => "OFFLINE_OPERATION_FAILED",
            Self::CacheInvalidated => "CACHE_INVALIDATED",
            Self::PerformanceAlert => "PERFORMANCE_ALERT",
        }
    }

    /// Whether this is one of the `*_FAILED` events.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::ProfileSyncFailed
                | Self::NftSyncFailed
                | Self::StatsSyncFailed
                | Self::OfflineOperationFailed
        )
    }
}

impl std::fmt::Display for SyncEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable, timestamped event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub event_type: SyncEventType,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub source: String,
}

/// Error a handler may return; it is logged and never reaches the emitter.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&SyncEvent) -> Result<(), HandlerError> + Send + Sync>;

struct BusInner {
    handlers: Mutex<HashMap<SyncEventType, Vec<(u64, Handler)>>>,
    history: Mutex<VecDeque<SyncEvent>>,
    history_size: usize,
    next_id: AtomicU64,
    handler_failures: AtomicU64,
    broadcast: broadcast::Sender<SyncEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Event bus shared by every sync component. Cloning is cheap.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus keeping the last `history_size` events.
    pub fn new(history_size: usize) -> Self {
        Self::with_capacity(history_size, 256)
    }

    pub fn with_capacity(history_size: usize, broadcast_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                handlers: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(history_size)),
                history_size,
                next_id: AtomicU64::new(1),
                handler_failures: AtomicU64::new(0),
                broadcast: tx,
            }),
        }
    }

    /// Register `handler` for `event_type`. Handlers run in subscription order.
    pub fn subscribe<F>(&self, event_type: SyncEventType, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.handlers)
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            id,
            event_type,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Receive every event asynchronously (lagging receivers drop old events).
    pub fn subscribe_all(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.broadcast.subscribe()
    }

    /// Number of handlers registered for `event_type`.
    pub fn handler_count(&self, event_type: SyncEventType) -> usize {
        lock(&self.inner.handlers)
            .get(&event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Publish an event to history, handlers and broadcast receivers.
    pub fn emit(
        &self,
        event_type: SyncEventType,
        payload: serde_json::Value,
        source: &str,
    ) -> SyncEvent {
        let event = SyncEvent {
            event_type,
            timestamp: Utc::now(),
            payload,
            source: source.to_string(),
        };

        {
            let mut history = lock(&self.inner.history);
            if self.inner.history_size > 0 {
                while history.len() >= self.inner.history_size {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
        }

        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<Handler> = lock(&self.inner.handlers)
            .get(&event_type)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        trace!(event = %event_type, source, handlers = handlers.len(), "Emitting event");
        metrics::record_event_emitted(event_type.as_str());

        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.inner.handler_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::record_handler_failure(event_type.as_str());
                    warn!(event = %event_type, error = %e, "Event handler failed");
                }
                Err(_) => {
                    self.inner.handler_failures.fetch_add(1, Ordering::Relaxed);
                    metrics::record_handler_failure(event_type.as_str());
                    error!(event = %event_type, "Event handler panicked");
                }
            }
        }

        let _ = self.inner.broadcast.send(event.clone());
        event
    }

    /// Retained events, oldest first, optionally filtered by type.
    pub fn get_event_history(&self, event_type: Option<SyncEventType>) -> Vec<SyncEvent> {
        lock(&self.inner.history)
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        lock(&self.inner.history).clear();
    }

    /// Handlers that returned an error or panicked since creation.
    pub fn handler_failures(&self) -> u64 {
        self.inner.handler_failures.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it keeps the handler registered; call [`unsubscribe`](Self::unsubscribe)
/// to remove it.
pub struct Subscription {
    id: u64,
    event_type: SyncEventType,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn event_type(&self) -> SyncEventType {
        self.event_type
    }

    /// Remove the handler. No-op if the bus is gone.
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            if let Some(list) = lock(&bus.handlers).get_mut(&self.event_type) {
                list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_delivers_only_to_matching_type() {
        let bus = EventBus::new(10);
        let connected = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&connected);
        let _sub = bus.subscribe(SyncEventType::WalletConnected, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(SyncEventType::WalletDisconnected, json!({}), "test");
        bus.emit(SyncEventType::WalletConnected, json!({}), "test");

        assert_eq!(connected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_order() {
        let bus = EventBus::new(10);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            let _ = bus.subscribe(SyncEventType::ProfileSyncCompleted, move |_| {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        bus.emit(SyncEventType::ProfileSyncCompleted, json!({}), "test");
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let bus = EventBus::new(10);
        let reached = Arc::new(AtomicUsize::new(0));

        let _ = bus.subscribe(SyncEventType::NftSyncFailed, |_| Err("boom".into()));
        let _ = bus.subscribe(SyncEventType::NftSyncFailed, |_| panic!("handler panic"));
        let r = Arc::clone(&reached);
        let _ = bus.subscribe(SyncEventType::NftSyncFailed, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(SyncEventType::NftSyncFailed, json!({"error": "x"}), "test");
        bus.emit(SyncEventType::NftSyncFailed, json!({"error": "y"}), "test");

        assert_eq!(reached.load(Ordering::SeqCst), 2);
        assert_eq!(bus.handler_failures(), 4);
        assert_eq!(bus.get_event_history(None).len(), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new(10);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = bus.subscribe(SyncEventType::CacheInvalidated, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(SyncEventType::CacheInvalidated, json!({}), "test");
        sub.unsubscribe();
        bus.emit(SyncEventType::CacheInvalidated, json!({}), "test");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.handler_count(SyncEventType::CacheInvalidated), 0);
    }

    #[test]
    fn test_history_ring_drops_oldest_across_types() {
        let bus = EventBus::new(3);
        bus.emit(SyncEventType::WalletConnected, json!({"n": 1}), "test");
        bus.emit(SyncEventType::ProfileSyncStarted, json!({"n": 2}), "test");
        bus.emit(SyncEventType::ProfileSyncCompleted, json!({"n": 3}), "test");
        bus.emit(SyncEventType::WalletConnected, json!({"n": 4}), "test");

        let history = bus.get_event_history(None);
        let ns: Vec<i64> = history.iter().map(|e| e.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![2, 3, 4]);

        let connected = bus.get_event_history(Some(SyncEventType::WalletConnected));
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].payload["n"], 4);
    }

    #[test]
    fn test_handler_may_subscribe_during_emit() {
        let bus = EventBus::new(10);
        let inner_bus = bus.clone();
        let _ = bus.subscribe(SyncEventType::WalletConnected, move |_| {
            let _ = inner_bus.subscribe(SyncEventType::WalletDisconnected, |_| Ok(()));
            Ok(())
        });

        bus.emit(SyncEventType::WalletConnected, json!({}), "test");
        assert_eq!(bus.handler_count(SyncEventType::WalletDisconnected), 1);
    }

    #[tokio::test]
    async fn test_broadcast_receiver() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe_all();
        bus.emit(SyncEventType::ConnectionRestored, json!({}), "connection");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, SyncEventType::ConnectionRestored);
        assert_eq!(event.source, "connection");
    }

    #[test]
    fn test_event_type_labels() {
        assert_eq!(SyncEventType::ProfileSyncFailed.to_string(), "PROFILE_SYNC_FAILED");
        assert!(SyncEventType::ProfileSyncFailed.is_failure());
        assert!(!SyncEventType::ProfileSyncCompleted.is_failure());
        assert_eq!(
            serde_json::to_string(&SyncEventType::NftSyncStarted).unwrap(),
            "\"NFT_SYNC_STARTED\""
        );
    }
}
