// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the profile sync engine.
//!
//! Configuration is passed to [`SyncContext::new()`](crate::SyncContext::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Configuration Structure
//!
//! ```text
//! SyncConfig
//! ├── retry: RetrySettings             # Backoff for ownership queries and replay
//! ├── circuit: CircuitSettings         # Per-endpoint fast-fail
//! ├── connection: ConnectionConfig     # Liveness probe cadence
//! ├── offline_queue: OfflineQueueConfig
//! ├── cache: CacheConfig               # TTL/LRU/compression bounds
//! ├── events: EventBusConfig           # History ring size
//! ├── orchestrator: OrchestratorConfig # TTLs, periodic sync, focus threshold
//! ├── performance: PerformanceConfig   # Alert thresholds
//! └── storage: StorageConfig           # SQLite durable key/value store
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "orchestrator": { "periodic_interval": "5m", "focus_resync_threshold": "1m" },
//!   "cache": { "max_entries": 1000, "default_ttl": "10m" },
//!   "offline_queue": { "max_size": 200 }
//! }
//! ```
//!
//! Every field has a default, so partial documents are valid.

use crate::circuit_breaker::CircuitConfig;
use crate::resilience::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `SyncContext::new()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub circuit: CircuitSettings,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub offline_queue: OfflineQueueConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub events: EventBusConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl SyncConfig {
    /// Fast timings and in-memory storage for tests.
    pub fn for_testing() -> Self {
        Self {
            retry: RetrySettings {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
                jitter: 0.0,
            },
            circuit: CircuitSettings {
                failure_threshold: 5,
                reset_timeout: "50ms".to_string(),
            },
            connection: ConnectionConfig {
                probe_interval: "50ms".to_string(),
                probe_timeout_ms: 200,
            },
            offline_queue: OfflineQueueConfig {
                replay_rate_per_sec: 1000,
                replay_burst: 100,
                ..OfflineQueueConfig::default()
            },
            cache: CacheConfig::default(),
            events: EventBusConfig::default(),
            orchestrator: OrchestratorConfig {
                periodic_interval: "1h".to_string(),
                focus_resync_threshold: "100ms".to_string(),
                ..OrchestratorConfig::default()
            },
            performance: PerformanceConfig::default(),
            storage: StorageConfig::in_memory(),
        }
    }

    /// Parse a JSON config document.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

fn default_true() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry / circuit
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry backoff settings for ownership-source calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Fraction of the computed delay added as random jitter (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetrySettings {
    /// Build a retry policy with the default (kind-based) predicate.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter.clamp(0.0, 1.0),
            ..RetryPolicy::default()
        }
    }
}

/// Circuit breaker settings applied to every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe (e.g. "30s").
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout: String,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout() -> String {
    "30s".to_string()
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: "30s".to_string(),
        }
    }
}

impl CircuitSettings {
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold.max(1),
            reset_timeout: parse_duration_or(&self.reset_timeout, Duration::from_secs(30)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Connection monitor
// ═══════════════════════════════════════════════════════════════════════════════

/// Liveness probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// How often to probe connectivity (e.g. "30s").
    #[serde(default = "default_probe_interval")]
    pub probe_interval: String,
    /// Deadline for a single probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_probe_interval() -> String {
    "30s".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            probe_interval: "30s".to_string(),
            probe_timeout_ms: 5000,
        }
    }
}

impl ConnectionConfig {
    pub fn probe_interval(&self) -> Duration {
        parse_duration_or(&self.probe_interval, Duration::from_secs(30))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Offline queue
// ═══════════════════════════════════════════════════════════════════════════════

/// Offline operation queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueueConfig {
    /// Whether failed-while-offline mutations are deferred.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Entries beyond this trim the oldest lowest-priority record.
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,
    /// Replay runs an operation may fail before it is dropped with a failure event.
    #[serde(default = "default_queue_max_attempts")]
    pub max_attempts: u32,
    /// Storage key under which the queue is persisted.
    #[serde(default = "default_queue_storage_key")]
    pub storage_key: String,
    /// Replay pacing after reconnect (operations per second).
    #[serde(default = "default_replay_rate")]
    pub replay_rate_per_sec: u32,
    #[serde(default = "default_replay_burst")]
    pub replay_burst: u32,
}

fn default_queue_max_size() -> usize {
    100
}

fn default_queue_max_attempts() -> u32 {
    3
}

fn default_queue_storage_key() -> String {
    "offline_operations".to_string()
}

fn default_replay_rate() -> u32 {
    10
}

fn default_replay_burst() -> u32 {
    5
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100,
            max_attempts: 3,
            storage_key: default_queue_storage_key(),
            replay_rate_per_sec: 10,
            replay_burst: 5,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache
// ═══════════════════════════════════════════════════════════════════════════════

/// Intelligent cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// Upper bound on the sum of stored payload sizes.
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: usize,
    /// TTL used when `set` is called without one (e.g. "5m").
    #[serde(default = "default_cache_ttl")]
    pub default_ttl: String,
    /// Payloads larger than this are zstd-compressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

fn default_cache_max_entries() -> usize {
    500
}

fn default_cache_max_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_cache_ttl() -> String {
    "5m".to_string()
}

fn default_compression_threshold() -> usize {
    10 * 1024
}

fn default_compression_level() -> i32 {
    3
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            max_bytes: 10 * 1024 * 1024,
            default_ttl: "5m".to_string(),
            compression_threshold_bytes: 10 * 1024,
            compression_level: 3,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        parse_duration_or(&self.default_ttl, Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Event bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Events retained in the history ring (oldest dropped first).
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Capacity of the broadcast channel for async consumers.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_history_size() -> usize {
    100
}

fn default_broadcast_capacity() -> usize {
    256
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_size: 100,
            broadcast_capacity: 256,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════════════

/// Sync orchestrator timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How long a synced profile is served without a network call.
    #[serde(default = "default_profile_ttl")]
    pub profile_ttl: String,
    /// How long a synced NFT collection is served without a network call.
    #[serde(default = "default_collection_ttl")]
    pub collection_ttl: String,
    /// Periodic sync cadence while a wallet is connected.
    #[serde(default = "default_periodic_interval")]
    pub periodic_interval: String,
    /// Minimum blur duration before focus triggers a forced sync.
    #[serde(default = "default_focus_threshold")]
    pub focus_resync_threshold: String,
    /// Whether connecting a wallet starts the periodic timer.
    #[serde(default = "default_true")]
    pub periodic_enabled: bool,
}

fn default_profile_ttl() -> String {
    "5m".to_string()
}

fn default_collection_ttl() -> String {
    "2m".to_string()
}

fn default_periodic_interval() -> String {
    "5m".to_string()
}

fn default_focus_threshold() -> String {
    "1m".to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            profile_ttl: default_profile_ttl(),
            collection_ttl: default_collection_ttl(),
            periodic_interval: default_periodic_interval(),
            focus_resync_threshold: default_focus_threshold(),
            periodic_enabled: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn profile_ttl(&self) -> Duration {
        parse_duration_or(&self.profile_ttl, Duration::from_secs(300))
    }

    pub fn collection_ttl(&self) -> Duration {
        parse_duration_or(&self.collection_ttl, Duration::from_secs(120))
    }

    pub fn periodic_interval(&self) -> Duration {
        parse_duration_or(&self.periodic_interval, Duration::from_secs(300))
    }

    pub fn focus_resync_threshold(&self) -> Duration {
        parse_duration_or(&self.focus_resync_threshold, Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Performance monitor
// ═══════════════════════════════════════════════════════════════════════════════

/// Thresholds for performance alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Samples retained in the rolling window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// A single sync slower than this raises an alert.
    #[serde(default = "default_slow_sync_ms")]
    pub slow_sync_threshold_ms: u64,
    /// Error rate over the window above which an alert is raised.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Minimum samples before the error rate is evaluated.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Alerts retained for inspection.
    #[serde(default = "default_max_alerts")]
    pub max_alerts: usize,
}

fn default_window_size() -> usize {
    50
}

fn default_slow_sync_ms() -> u64 {
    5000
}

fn default_error_rate_threshold() -> f64 {
    0.25
}

fn default_min_samples() -> usize {
    4
}

fn default_max_alerts() -> usize {
    50
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            slow_sync_threshold_ms: 5000,
            error_rate_threshold: 0.25,
            min_samples: 4,
            max_alerts: 50,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Storage
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable key/value storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    pub sqlite_path: String,
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "profile_sync.db".to_string(),
            wal_mode: true,
        }
    }
}

impl StorageConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
