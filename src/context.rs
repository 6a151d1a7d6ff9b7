// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-wide sync context.
//!
//! Owns one instance of every service and wires them together. There are no
//! globals: tests build as many isolated contexts as they like.
//!
//! # Lifecycle
//!
//! 1. [`SyncContext::new`] builds the services, restores the persisted
//!    offline queue and attaches the performance monitor.
//! 2. [`SyncContext::start`] launches the connection probe loop and the
//!    reconnect-replay task (a restored connection triggers a rate-limited
//!    offline queue replay).
//! 3. [`SyncContext::shutdown`] disconnects the wallet and stops every task.

use crate::cache::IntelligentCache;
use crate::circuit_breaker::CircuitRegistry;
use crate::config::SyncConfig;
use crate::connection::{AlwaysOnline, ConnectionMonitor, ConnectivityProbe, LinkQualitySource};
use crate::error::{Result, SyncError};
use crate::events::EventBus;
use crate::fallback::FallbackStore;
use crate::offline_queue::{OfflineQueue, OperationHandler, OperationRegistry, Priority, QueueReport};
use crate::orchestrator::{
    NftCollection, NftOwnershipSource, OrchestratorServices, ProfileData, SyncOrchestrator,
};
use crate::performance::PerformanceMonitor;
use crate::resilience::{execute_with_retry, RateLimitConfig, RateLimiter};
use crate::storage::{KeyValueStore, SqliteStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long shutdown waits for background tasks.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of [`SyncContext::execute_mutation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The handler ran and succeeded.
    Applied,
    /// Deferred to the offline queue under this id.
    Queued(Uuid),
}

pub struct SyncContext {
    config: SyncConfig,
    events: EventBus,
    storage: Arc<dyn KeyValueStore>,
    connection: Arc<ConnectionMonitor>,
    circuits: Arc<CircuitRegistry>,
    cache: Arc<IntelligentCache>,
    fallback: Arc<FallbackStore>,
    queue: Arc<OfflineQueue>,
    orchestrator: Arc<SyncOrchestrator>,
    performance: Arc<PerformanceMonitor>,
    replay_limiter: Arc<RateLimiter>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncContext {
    /// Build a context that relies on host `set_online` signals only.
    pub async fn new(
        config: SyncConfig,
        source: Arc<dyn NftOwnershipSource>,
        storage: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self::with_connectivity(config, source, storage, Arc::new(AlwaysOnline), None).await
    }

    /// Build a context on the SQLite store named by `config.storage`.
    pub async fn open(config: SyncConfig, source: Arc<dyn NftOwnershipSource>) -> Result<Self> {
        let storage = SqliteStore::from_config(&config.storage).await?;
        Ok(Self::new(config, source, Arc::new(storage)).await)
    }

    /// Build a context with an explicit connectivity probe and link source.
    pub async fn with_connectivity(
        config: SyncConfig,
        source: Arc<dyn NftOwnershipSource>,
        storage: Arc<dyn KeyValueStore>,
        probe: Arc<dyn ConnectivityProbe>,
        link: Option<Arc<dyn LinkQualitySource>>,
    ) -> Self {
        let events = EventBus::with_capacity(
            config.events.history_size,
            config.events.broadcast_capacity,
        );
        let connection = Arc::new(ConnectionMonitor::new(
            probe,
            link,
            events.clone(),
            config.connection.clone(),
        ));
        let circuits = Arc::new(CircuitRegistry::new(config.circuit.circuit_config()));
        let retry = config.retry.policy();
        let cache = Arc::new(IntelligentCache::new(config.cache.clone()));
        let fallback = Arc::new(FallbackStore::new(Arc::clone(&storage)));

        let queue = Arc::new(OfflineQueue::new(
            config.offline_queue.clone(),
            retry.clone(),
            Arc::clone(&storage),
            Arc::new(OperationRegistry::new()),
            Arc::clone(&connection),
            events.clone(),
        ));
        let restored = queue.restore().await;

        let orchestrator = Arc::new(SyncOrchestrator::new(
            config.orchestrator.clone(),
            OrchestratorServices {
                source,
                cache: Arc::clone(&cache),
                fallback: Arc::clone(&fallback),
                events: events.clone(),
                connection: Arc::clone(&connection),
                circuits: Arc::clone(&circuits),
                retry,
            },
        ));

        let performance = Arc::new(PerformanceMonitor::new(
            config.performance.clone(),
            events.clone(),
        ));
        performance.attach();

        let replay_limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            burst_size: config.offline_queue.replay_burst,
            refill_rate: config.offline_queue.replay_rate_per_sec,
        }));

        let (shutdown_tx, _) = watch::channel(false);

        info!(restored_operations = restored, "Sync context initialized");

        Self {
            config,
            events,
            storage,
            connection,
            circuits,
            cache,
            fallback,
            queue,
            orchestrator,
            performance,
            replay_limiter,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the probe loop and the reconnect-replay task. No-op if running.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            debug!("Sync context already started");
            return;
        }
        self.shutdown_tx.send_replace(false);

        self.connection.start();
        tasks.push(self.spawn_replay_task());
        info!("Sync context started");
    }

    fn spawn_replay_task(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let limiter = Arc::clone(&self.replay_limiter);
        let mut status_rx = self.connection.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut was_online = status_rx.borrow().is_online;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = status_rx.borrow_and_update().is_online;
                        let restored = online && !was_online;
                        was_online = online;
                        if !restored || queue.is_empty() {
                            continue;
                        }

                        limiter.acquire().await;
                        let report = queue.process_queue().await;
                        info!(
                            completed = report.completed,
                            failed = report.failed,
                            remaining = report.remaining,
                            "Offline queue replayed after reconnect"
                        );
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Reconnect replay task exited");
        })
    }

    /// Disconnect the wallet and stop every background task.
    pub async fn shutdown(&self) {
        info!("Shutting down sync context");
        self.orchestrator.on_wallet_disconnect().await;
        self.shutdown_tx.send_replace(true);
        self.connection.stop().await;

        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Background task ended abnormally"),
                Err(_) => warn!("Background task did not stop in time"),
            }
        }

        self.performance.detach();
        info!("Sync context stopped");
    }

    // =========================================================================
    // Presentation pass-throughs
    // =========================================================================

    /// Forced full sync of the connected wallet.
    pub async fn force_sync_profile(&self) -> Result<ProfileData> {
        let address = self.require_wallet()?;
        self.orchestrator.sync_wallet_to_profile(&address, true).await
    }

    /// Forced NFT-only sync of the connected wallet.
    pub async fn refresh_nft_collection(&self) -> Result<NftCollection> {
        let address = self.require_wallet()?;
        self.orchestrator.sync_nft_collection(&address, true).await
    }

    pub async fn process_offline_queue(&self) -> QueueReport {
        self.queue.process_queue().await
    }

    /// Register the executor for a mutation type.
    pub fn register_operation(&self, op_type: &str, handler: Arc<dyn OperationHandler>) {
        self.queue.registry().register(op_type, handler);
    }

    /// Run a mutation now, or defer it to the offline queue when the device
    /// is offline or the live attempt fails with a network-class error.
    ///
    /// The live attempt goes through the retry policy and a per-operation
    /// circuit (`mutation:<op_type>`); an open circuit defers like a
    /// network failure.
    pub async fn execute_mutation(
        &self,
        op_type: &str,
        payload: Value,
        priority: Priority,
    ) -> Result<MutationOutcome> {
        let handler = self
            .queue
            .registry()
            .get(op_type)
            .ok_or_else(|| SyncError::NotFound(format!("no handler registered for '{}'", op_type)))?;

        if !self.connection.is_online() {
            if !self.queue.is_enabled() {
                return Err(SyncError::network(op_type, "device is offline"));
            }
            debug!(op_type, "Offline, queueing mutation");
            return self.defer(op_type, payload, priority).await;
        }

        let policy = self.config.retry.policy();
        let breaker = self.circuits.get(&format!("mutation:{}", op_type));
        let attempt = {
            let (handler, payload) = (&handler, &payload);
            breaker
                .call(|| execute_with_retry(&policy, op_type, move || handler.execute(payload)))
                .await
        };

        match attempt {
            Ok(()) => Ok(MutationOutcome::Applied),
            Err(e) if (e.kind().is_connectivity() || e.is_circuit_open()) && self.queue.is_enabled() => {
                warn!(op_type, error = %e, "Mutation failed on the network, queueing");
                self.defer(op_type, payload, priority).await
            }
            Err(e) => Err(e),
        }
    }

    async fn defer(&self, op_type: &str, payload: Value, priority: Priority) -> Result<MutationOutcome> {
        self.queue
            .enqueue(op_type, payload, priority)
            .await
            .map(MutationOutcome::Queued)
    }

    fn require_wallet(&self) -> Result<String> {
        self.orchestrator
            .connected_address()
            .ok_or_else(|| SyncError::InvalidState {
                expected: "wallet connected".to_string(),
                actual: self.orchestrator.state().to_string(),
            })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn storage(&self) -> &Arc<dyn KeyValueStore> {
        &self.storage
    }

    pub fn connection(&self) -> &Arc<ConnectionMonitor> {
        &self.connection
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    pub fn cache(&self) -> &Arc<IntelligentCache> {
        &self.cache
    }

    pub fn fallback(&self) -> &Arc<FallbackStore> {
        &self.fallback
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn performance(&self) -> &Arc<PerformanceMonitor> {
        &self.performance
    }
}
