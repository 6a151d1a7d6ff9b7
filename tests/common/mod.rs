//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A scriptable NFT ownership source that records calls
//! - A connectivity probe that tests can switch off and on
//! - Context and handler helpers

#![allow(dead_code)]

pub mod mock_source;

pub use mock_source::*;

use profile_sync_engine::{handler_fn, MemoryStore, OperationHandler, SyncConfig, SyncContext, SyncEvent, SyncEventType};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Context on in-memory storage with fast test timings and no periodic timer.
pub async fn test_context(source: Arc<MockOwnershipSource>) -> SyncContext {
    test_context_with(source, Arc::new(MemoryStore::new()), test_config()).await
}

pub async fn test_context_with(
    source: Arc<MockOwnershipSource>,
    storage: Arc<MemoryStore>,
    config: SyncConfig,
) -> SyncContext {
    SyncContext::new(config, source, storage).await
}

pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::for_testing();
    config.orchestrator.periodic_enabled = false;
    config
}

/// Handler that counts executions and always succeeds.
pub fn counting_handler() -> (Arc<dyn OperationHandler>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let handler = handler_fn(move |_payload| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    (handler, count)
}

/// Types of the retained events, oldest first.
pub fn event_types(events: &[SyncEvent]) -> Vec<SyncEventType> {
    events.iter().map(|e| e.event_type).collect()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
