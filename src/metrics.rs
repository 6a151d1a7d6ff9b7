// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Sync operations (duration, outcome, deduplication)
//! - Retry attempts and circuit breaker state
//! - Connection status and quality tier
//! - Offline queue depth and replay
//! - Cache hits, misses and evictions
//! - Event bus throughput and handler failures
//! - Performance alerts
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `profile_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed by this crate; the host application chooses one.
//!
//! # Usage
//!
//! ```rust,no_run
//! use profile_sync_engine::metrics;
//! use std::time::Duration;
//!
//! metrics::record_sync("profile", "success", Duration::from_millis(420));
//! metrics::set_offline_queue_depth(3);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Sync Metrics
// =============================================================================

/// Record a finished sync call (`kind` = profile / nft / stats).
pub fn record_sync(kind: &str, outcome: &str, duration: Duration) {
    counter!(
        "profile_sync_syncs_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("profile_sync_sync_duration_seconds", "kind" => kind.to_string())
        .record(duration.as_secs_f64());
}

/// Record a caller joining an already in-flight sync.
pub fn record_sync_deduplicated(kind: &str) {
    counter!("profile_sync_syncs_deduplicated_total", "kind" => kind.to_string()).increment(1);
}

/// Record a failed sync that was answered from cache or fallback data.
pub fn record_stale_served(kind: &str, source: &str) {
    counter!(
        "profile_sync_stale_served_total",
        "kind" => kind.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

/// Gauge for orchestrator state.
pub fn set_sync_state(state: &str) {
    let value = match state {
        "Disconnected" => 0.0,
        "Connecting" => 1.0,
        "Syncing" => 2.0,
        "Idle" => 3.0,
        _ => -1.0,
    };
    gauge!("profile_sync_state").set(value);
}

// =============================================================================
// Retry Metrics
// =============================================================================

/// Record a failed attempt that will be retried.
pub fn record_retry_attempt(operation: &str, error_kind: &str) {
    counter!(
        "profile_sync_retries_total",
        "operation" => operation.to_string(),
        "error_kind" => error_kind.to_string()
    )
    .increment(1);
}

/// Record an operation that ran out of attempts.
pub fn record_retry_exhausted(operation: &str) {
    counter!("profile_sync_retries_exhausted_total", "operation" => operation.to_string())
        .increment(1);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "profile_sync_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("profile_sync_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "profile_sync_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}

// =============================================================================
// Connection Metrics
// =============================================================================

/// Set online flag and quality tier gauges.
pub fn set_network_status(online: bool, tier: &str) {
    gauge!("profile_sync_network_online").set(if online { 1.0 } else { 0.0 });
    let value = match tier {
        "excellent" => 4.0,
        "good" => 3.0,
        "fair" => 2.0,
        "poor" => 1.0,
        "offline" => 0.0,
        _ => -1.0,
    };
    gauge!("profile_sync_network_tier").set(value);
}

/// Record a connectivity probe.
pub fn record_probe(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("profile_sync_probes_total", "status" => status).increment(1);
    histogram!("profile_sync_probe_duration_seconds").record(duration.as_secs_f64());
}

/// Record an offline → online transition.
pub fn record_connection_restored() {
    counter!("profile_sync_connection_restored_total").increment(1);
}

// =============================================================================
// Offline Queue Metrics
// =============================================================================

/// Gauge for pending offline operations.
pub fn set_offline_queue_depth(depth: usize) {
    gauge!("profile_sync_offline_queue_depth").set(depth as f64);
}

/// Record the fate of one offline operation (queued / completed / failed / evicted).
pub fn record_offline_operation(op_type: &str, outcome: &str) {
    counter!(
        "profile_sync_offline_operations_total",
        "op_type" => op_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a finished queue replay pass.
pub fn record_queue_replay(completed: usize, failed: usize, remaining: usize, duration: Duration) {
    counter!("profile_sync_queue_replays_total").increment(1);
    counter!("profile_sync_queue_replay_completed_total").increment(completed as u64);
    if failed > 0 {
        counter!("profile_sync_queue_replay_failed_total").increment(failed as u64);
    }
    gauge!("profile_sync_offline_queue_depth").set(remaining as f64);
    histogram!("profile_sync_queue_replay_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Storage Metrics
// =============================================================================

/// Record a durable storage failure that was absorbed.
pub fn record_storage_error(operation: &str) {
    counter!("profile_sync_storage_errors_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn storage_retries_total(operation: &str) {
    counter!("profile_sync_storage_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record a fallback store lookup.
pub fn record_fallback_read(hit: bool) {
    let status = if hit { "hit" } else { "miss" };
    counter!("profile_sync_fallback_reads_total", "status" => status).increment(1);
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Record cache lookup result (hit / miss / stale).
pub fn record_cache_lookup(result: &str) {
    counter!("profile_sync_cache_lookups_total", "result" => result.to_string()).increment(1);
}

/// Record evictions by reason (lru / expired / corrupt).
pub fn record_cache_eviction(reason: &str, count: usize) {
    if count > 0 {
        counter!("profile_sync_cache_evictions_total", "reason" => reason.to_string())
            .increment(count as u64);
    }
}

/// Record entries removed by an explicit invalidation.
pub fn record_cache_invalidation(trigger: &str, count: usize) {
    counter!("profile_sync_cache_invalidations_total", "trigger" => trigger.to_string())
        .increment(count as u64);
}

/// Gauges for cache occupancy.
pub fn set_cache_size(entries: usize, bytes: usize) {
    gauge!("profile_sync_cache_entries").set(entries as f64);
    gauge!("profile_sync_cache_bytes").set(bytes as f64);
}

// =============================================================================
// Event Bus Metrics
// =============================================================================

/// Record an emitted event.
pub fn record_event_emitted(event_type: &str) {
    counter!("profile_sync_events_total", "event_type" => event_type.to_string()).increment(1);
}

/// Record a handler that returned an error or panicked.
pub fn record_handler_failure(event_type: &str) {
    counter!(
        "profile_sync_event_handler_failures_total",
        "event_type" => event_type.to_string()
    )
    .increment(1);
}

// =============================================================================
// Performance Metrics
// =============================================================================

/// Record a raised performance alert.
pub fn record_performance_alert(alert_type: &str) {
    counter!("profile_sync_performance_alerts_total", "alert_type" => alert_type.to_string())
        .increment(1);
}

/// Set rolling-window sync health gauges.
pub fn set_sync_health(error_rate: f64, p95_ms: u64) {
    gauge!("profile_sync_error_rate").set(error_rate);
    gauge!("profile_sync_p95_duration_ms").set(p95_ms as f64);
}
