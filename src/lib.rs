//! # Profile Sync Engine
//!
//! Keeps a wallet's NFT holdings and the derived profile view in sync with an
//! ownership source, and keeps working when the network does not.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            profile-sync-engine                            │
//! │                                                                           │
//! │  ┌──────────────────┐   ┌──────────────────────────────┐   ┌───────────┐  │
//! │  │ SyncOrchestrator │──►│ CircuitBreaker → Retry →     │──►│ Ownership │  │
//! │  │ (dedup, state)   │   │ tier timeout                 │   │ source    │  │
//! │  └──────────────────┘   └──────────────────────────────┘   └───────────┘  │
//! │     │         │                                                           │
//! │     ▼         ▼                                                           │
//! │  ┌───────┐ ┌──────────┐  ┌───────────────────┐  ┌──────────────────────┐  │
//! │  │ Cache │ │ Fallback │  │ ConnectionMonitor │─►│ OfflineQueue (replay)│  │
//! │  │ (LRU) │ │ (SQLite) │  │ (probe, tiers)    │  │ (SQLite)             │  │
//! │  └───────┘ └──────────┘  └───────────────────┘  └──────────────────────┘  │
//! │                                                                           │
//! │  EventBus ──► PerformanceMonitor, presentation layer                      │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Degraded operation
//!
//! 1. **Stale-while-fallback**: a failed sync returns the last cached or
//!    persisted snapshot marked [`Freshness::Stale`] instead of an error.
//! 2. **Offline queue**: mutations made while offline are persisted as
//!    `{type, data}` descriptors and replayed through a handler registry once
//!    the connection returns.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use profile_sync_engine::{SyncConfig, SyncContext, MemoryStore, NftOwnershipSource};
//! use std::sync::Arc;
//!
//! async fn run(source: Arc<dyn NftOwnershipSource>) {
//!     let context = SyncContext::new(SyncConfig::default(), source, Arc::new(MemoryStore::new())).await;
//!     context.start().await;
//!
//!     let profile = context
//!         .orchestrator()
//!         .on_wallet_connect("0xABC", Some("dapper"))
//!         .await;
//!     println!("{:?}", profile.map(|p| p.stats));
//!
//!     context.shutdown().await;
//! }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod events;
pub mod fallback;
pub mod metrics;
pub mod offline_queue;
pub mod orchestrator;
pub mod performance;
pub mod resilience;
pub mod storage;

// Re-exports for convenience
pub use cache::{
    CacheEvent, CacheOptions, CacheStats, IntelligentCache, InvalidationRule, WarmupEntry, WarmupReport,
};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitRegistry, CircuitState};
pub use config::{
    CacheConfig, CircuitSettings, ConnectionConfig, EventBusConfig, OfflineQueueConfig,
    OrchestratorConfig, PerformanceConfig, RetrySettings, StorageConfig, SyncConfig,
};
pub use connection::{ConnectionMonitor, ConnectivityProbe, LinkQuality, LinkQualitySource, NetworkStatus, QualityTier};
pub use context::{MutationOutcome, SyncContext};
pub use error::{BoxFuture, ErrorKind, Result, SyncError};
pub use events::{EventBus, Subscription, SyncEvent, SyncEventType};
pub use fallback::{FallbackEntry, FallbackStore};
pub use offline_queue::{handler_fn, OfflineOperation, OfflineQueue, OperationHandler, OperationRegistry, Priority, QueueReport};
pub use orchestrator::{
    Freshness, Moment, NftCollection, NftOwnershipSource, Ownership, ProfileData, ProfileStats,
    SyncOrchestrator, SyncState, SyncStatus,
};
pub use performance::{PerformanceMonitor, PerformanceReport, Trend};
pub use resilience::{execute_with_retry, RetryPolicy};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
