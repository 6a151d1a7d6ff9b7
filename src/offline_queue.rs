// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable, priority-ordered queue of deferred mutations.
//!
//! # Persistence
//!
//! Records are data-only descriptors (`type` + `data`), persisted as one JSON
//! array under a single storage key after every mutation. The executable
//! behaviour is resolved at replay time through the [`OperationRegistry`], so
//! a reloaded queue can be replayed as soon as the host registers its handlers.
//! Records whose type has no handler stay queued untouched.
//!
//! ```text
//! [{"id": "…", "type": "update_avatar", "data": {…}, "timestamp": "…",
//!   "retryCount": 0, "priority": "normal"}]
//! ```
//!
//! # Replay
//!
//! [`process_queue`](OfflineQueue::process_queue) runs only while online and
//! executes records sequentially in (priority desc, enqueue time asc) order,
//! each through the retry executor:
//!
//! - success → removed, `OFFLINE_OPERATION_COMPLETED`
//! - non-retryable error, or `retry_count` reaching `max_attempts` → removed,
//!   `OFFLINE_OPERATION_FAILED`
//! - connectivity lost mid-run → the run stops, the rest stays queued except
//!   records whose budget is already spent, which fail right away
//!
//! `retry_count` counts every execution attempt across runs and never
//! decreases, so no record executes more than `max_attempts` times.
//!
//! # Capacity
//!
//! Enqueue never rejects. Beyond `max_size`, the oldest record of the lowest
//! priority present is evicted and reported with `OFFLINE_OPERATION_FAILED`.

use crate::config::OfflineQueueConfig;
use crate::connection::ConnectionMonitor;
use crate::error::{BoxFuture, Result, SyncError};
use crate::events::{EventBus, SyncEventType};
use crate::metrics;
use crate::resilience::{execute_with_retry, RetryPolicy};
use crate::storage::KeyValueStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Replay priority. Higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A deferred mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(rename = "data")]
    pub payload: Value,
    #[serde(rename = "timestamp")]
    pub enqueued_at: DateTime<Utc>,
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
    pub priority: Priority,
}

/// Executes one kind of queued operation.
pub trait OperationHandler: Send + Sync + 'static {
    fn execute<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, ()>;
}

struct FnHandler<F>(F);

impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn execute<'a>(&'a self, payload: &'a Value) -> BoxFuture<'a, ()> {
        Box::pin((self.0)(payload.clone()))
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn OperationHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Maps operation types to handlers.
#[derive(Default)]
pub struct OperationRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn OperationHandler>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `op_type`.
    pub fn register(&self, op_type: &str, handler: Arc<dyn OperationHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(op_type.to_string(), handler);
        debug!(op_type, "Registered offline operation handler");
    }

    pub fn unregister(&self, op_type: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(op_type)
            .is_some()
    }

    pub fn get(&self, op_type: &str) -> Option<Arc<dyn OperationHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(op_type)
            .cloned()
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.get(op_type).is_some()
    }
}

/// Snapshot returned by [`OfflineQueue::status`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub count: usize,
    pub operations: Vec<OfflineOperation>,
}

/// Outcome of one replay run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueReport {
    pub completed: usize,
    pub failed: usize,
    /// Records left untouched because no handler is registered.
    pub skipped: usize,
    pub remaining: usize,
    /// The run ended early because connectivity was lost.
    pub stopped_offline: bool,
    /// Another run was already in progress; this call did nothing.
    pub coalesced: bool,
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OfflineQueue {
    config: OfflineQueueConfig,
    policy: RetryPolicy,
    storage: Arc<dyn KeyValueStore>,
    registry: Arc<OperationRegistry>,
    connection: Arc<ConnectionMonitor>,
    events: EventBus,
    operations: Mutex<Vec<OfflineOperation>>,
    persist_lock: tokio::sync::Mutex<()>,
    processing: AtomicBool,
}

impl OfflineQueue {
    pub fn new(
        config: OfflineQueueConfig,
        policy: RetryPolicy,
        storage: Arc<dyn KeyValueStore>,
        registry: Arc<OperationRegistry>,
        connection: Arc<ConnectionMonitor>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            policy,
            storage,
            registry,
            connection,
            events,
            operations: Mutex::new(Vec::new()),
            persist_lock: tokio::sync::Mutex::new(()),
            processing: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    fn ops(&self) -> MutexGuard<'_, Vec<OfflineOperation>> {
        self.operations.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn len(&self) -> usize {
        self.ops().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops().is_empty()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    pub fn status(&self) -> QueueStatus {
        let operations = self.ops().clone();
        QueueStatus {
            count: operations.len(),
            operations,
        }
    }

    /// Queue a mutation for later replay. Returns its id.
    pub async fn enqueue(&self, op_type: &str, payload: Value, priority: Priority) -> Result<Uuid> {
        if !self.config.enabled {
            return Err(SyncError::InvalidState {
                expected: "offline queue enabled".to_string(),
                actual: "disabled".to_string(),
            });
        }

        let operation = OfflineOperation {
            id: Uuid::new_v4(),
            op_type: op_type.to_string(),
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            priority,
        };
        let id = operation.id;

        let evicted = {
            let mut ops = self.ops();
            ops.push(operation);
            let mut evicted = Vec::new();
            while ops.len() > self.config.max_size.max(1) {
                match Self::eviction_index(&ops) {
                    Some(index) => evicted.push(ops.remove(index)),
                    None => break,
                }
            }
            evicted
        };

        info!(id = %id, op_type, ?priority, "Queued offline operation");
        metrics::record_offline_operation(op_type, "queued");
        self.events.emit(
            SyncEventType::OfflineOperationQueued,
            json!({ "id": id, "type": op_type, "priority": priority }),
            "offline_queue",
        );

        for op in evicted {
            warn!(id = %op.id, op_type = %op.op_type, "Queue full, evicted offline operation");
            metrics::record_offline_operation(&op.op_type, "evicted");
            self.emit_failed(&op, "queue capacity exceeded", "evicted");
        }

        self.persist().await;
        Ok(id)
    }

    /// Oldest record among the lowest priority present.
    fn eviction_index(ops: &[OfflineOperation]) -> Option<usize> {
        let lowest = ops.iter().map(|op| op.priority).min()?;
        ops.iter()
            .enumerate()
            .filter(|(_, op)| op.priority == lowest)
            .min_by_key(|(index, op)| (op.enqueued_at, *index))
            .map(|(index, _)| index)
    }

    /// Replay queued operations. See module docs for the rules.
    pub async fn process_queue(&self) -> QueueReport {
        if self
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Queue replay already in progress");
            return QueueReport {
                coalesced: true,
                remaining: self.len(),
                ..QueueReport::default()
            };
        }
        let _guard = ProcessingGuard(&self.processing);

        let mut report = QueueReport::default();
        if !self.connection.is_online() {
            debug!("Offline, skipping queue replay");
            report.stopped_offline = true;
            report.failed = self.drop_exhausted().await;
            report.remaining = self.len();
            return report;
        }

        let mut batch = self.ops().clone();
        if batch.is_empty() {
            return report;
        }
        // Stable sort keeps insertion order for identical timestamps.
        batch.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.enqueued_at.cmp(&b.enqueued_at)));

        let started = Instant::now();
        info!(count = batch.len(), "Replaying offline queue");

        for op in batch {
            if !self.connection.is_online() {
                info!("Connectivity lost, stopping queue replay");
                report.stopped_offline = true;
                report.failed += self.drop_exhausted().await;
                break;
            }

            let Some(handler) = self.registry.get(&op.op_type) else {
                warn!(id = %op.id, op_type = %op.op_type, "No handler registered, leaving queued");
                report.skipped += 1;
                continue;
            };

            if op.retry_count >= self.config.max_attempts {
                self.finish_failed(&op, "retry budget exhausted", "exhausted").await;
                report.failed += 1;
                continue;
            }

            match self.run_operation(&op, handler.as_ref()).await {
                RunOutcome::Completed => {
                    self.remove(op.id);
                    debug!(id = %op.id, op_type = %op.op_type, "Offline operation completed");
                    metrics::record_offline_operation(&op.op_type, "completed");
                    self.events.emit(
                        SyncEventType::OfflineOperationCompleted,
                        json!({ "id": op.id, "type": op.op_type }),
                        "offline_queue",
                    );
                    self.persist().await;
                    report.completed += 1;
                }
                RunOutcome::Failed(e) => {
                    self.finish_failed(&op, &e.to_string(), e.kind().as_str()).await;
                    report.failed += 1;
                }
                RunOutcome::WentOffline => {
                    self.persist().await;
                    report.stopped_offline = true;
                    report.failed += self.drop_exhausted().await;
                    break;
                }
            }
        }

        report.remaining = self.len();
        metrics::record_queue_replay(report.completed, report.failed, report.remaining, started.elapsed());
        info!(
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            remaining = report.remaining,
            "Offline queue replay finished"
        );
        report
    }

    async fn run_operation(&self, op: &OfflineOperation, handler: &dyn OperationHandler) -> RunOutcome {
        let remaining = self.config.max_attempts.saturating_sub(op.retry_count).max(1);
        let policy = self.policy.clone().with_max_attempts(remaining);
        let mut attempts = 0u32;
        let mut went_offline = false;
        let operation_name = format!("offline:{}", op.op_type);
        let payload = &op.payload;

        let result = execute_with_retry(&policy, &operation_name, || {
            if !self.connection.is_online() {
                went_offline = true;
                let offline: BoxFuture<'_, ()> = Box::pin(async {
                    Err(SyncError::InvalidState {
                        expected: "online".to_string(),
                        actual: "offline".to_string(),
                    })
                });
                return offline;
            }
            attempts += 1;
            handler.execute(payload)
        })
        .await;

        if attempts > 0 {
            self.bump_retry_count(op.id, attempts);
        }

        match result {
            Ok(()) => RunOutcome::Completed,
            Err(_) if went_offline => RunOutcome::WentOffline,
            Err(e) => RunOutcome::Failed(e),
        }
    }

    /// Fail every record whose retry budget is already spent. Used when a
    /// replay stops offline so spent records don't wait for the next run.
    async fn drop_exhausted(&self) -> usize {
        let max_attempts = self.config.max_attempts;
        let spent: Vec<OfflineOperation> = self
            .ops()
            .iter()
            .filter(|op| op.retry_count >= max_attempts)
            .cloned()
            .collect();
        for op in &spent {
            self.finish_failed(op, "retry budget exhausted", "exhausted").await;
        }
        spent.len()
    }

    fn bump_retry_count(&self, id: Uuid, attempts: u32) {
        if let Some(op) = self.ops().iter_mut().find(|op| op.id == id) {
            op.retry_count = op.retry_count.saturating_add(attempts);
        }
    }

    async fn finish_failed(&self, op: &OfflineOperation, error: &str, error_kind: &str) {
        self.remove(op.id);
        warn!(id = %op.id, op_type = %op.op_type, error, "Offline operation failed permanently");
        metrics::record_offline_operation(&op.op_type, "failed");
        self.emit_failed(op, error, error_kind);
        self.persist().await;
    }

    fn emit_failed(&self, op: &OfflineOperation, error: &str, error_kind: &str) {
        self.events.emit(
            SyncEventType::OfflineOperationFailed,
            json!({
                "id": op.id,
                "type": op.op_type,
                "error": error,
                "error_kind": error_kind,
            }),
            "offline_queue",
        );
    }

    fn remove(&self, id: Uuid) {
        self.ops().retain(|op| op.id != id);
    }

    /// Write the current contents to storage. Failures are logged only.
    async fn persist(&self) {
        let _lock = self.persist_lock.lock().await;
        let snapshot = self.ops().clone();
        metrics::set_offline_queue_depth(snapshot.len());

        let json = match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize offline queue");
                return;
            }
        };
        if let Err(e) = self.storage.set_item(&self.config.storage_key, json).await {
            metrics::record_storage_error("offline_queue_persist");
            warn!(error = %e, "Failed to persist offline queue");
        }
    }

    /// Load persisted records, merging with anything queued in memory.
    /// Returns the number of records restored.
    pub async fn restore(&self) -> usize {
        let raw = match self.storage.get_item(&self.config.storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(e) => {
                metrics::record_storage_error("offline_queue_restore");
                warn!(error = %e, "Failed to read persisted offline queue");
                return 0;
            }
        };

        let restored: Vec<OfflineOperation> = match serde_json::from_str(&raw) {
            Ok(ops) => ops,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable persisted offline queue");
                return 0;
            }
        };

        let count = {
            let mut ops = self.ops();
            let mut added = 0;
            for op in restored {
                if !ops.iter().any(|existing| existing.id == op.id) {
                    ops.push(op);
                    added += 1;
                }
            }
            added
        };

        if count > 0 {
            info!(count, "Restored offline operations from previous run");
        }
        self.persist().await;
        count
    }

    /// Drop every queued record.
    pub async fn clear(&self) {
        self.ops().clear();
        self.persist().await;
    }
}

enum RunOutcome {
    Completed,
    Failed(SyncError),
    WentOffline,
}
