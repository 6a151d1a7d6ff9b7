// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestrator.
//!
//! Drives the wallet session state machine and the three sync scopes:
//! - full profile sync (ownership + eligible moments + stats)
//! - NFT collection sync (ownership only)
//! - stats sync (eligible moments, derived counts)
//!
//! # Call path
//!
//! Every ownership-source call goes through the endpoint's circuit breaker,
//! then the retry executor, then a timeout derived from the current link
//! quality tier. Offline devices fail fast without touching the source.
//!
//! # Failure handling
//!
//! A failed sync bumps `failure_count` and emits the scope's `*_FAILED`
//! event. If the cache still holds an entry (even an expired one) or the
//! fallback store has a snapshot, that value is returned marked
//! [`Freshness::Stale`]; otherwise the error reaches the caller.
//!
//! # Concurrency
//!
//! Concurrent requests for the same scope and address join one in-flight
//! task (see `in_flight`). The task completes and updates caches even if every
//! caller stops waiting.

mod in_flight;
mod periodic;
mod source;
mod types;

pub use source::{Moment, NftOwnershipSource, Ownership};
pub use types::{
    summarize_collections, CollectionSummary, Freshness, NftCollection, ProfileData, ProfileStats,
    SessionActivity, SyncKind, SyncState, SyncStatus,
};

use crate::cache::{CacheEvent, CacheOptions, IntelligentCache, WarmupEntry, WarmupReport};
use crate::circuit_breaker::CircuitRegistry;
use crate::config::OrchestratorConfig;
use crate::connection::ConnectionMonitor;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEventType};
use crate::fallback::FallbackStore;
use crate::metrics;
use crate::resilience::{execute_with_retry, with_timeout, RetryPolicy};
use chrono::Utc;
use in_flight::{FlightKey, InFlight};
use periodic::PeriodicTask;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

const EVENT_SOURCE: &str = "sync_orchestrator";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn wallet_tag(address: &str) -> String {
    format!("wallet:{}", address)
}

fn normalize_address(address: &str) -> Result<String> {
    let address = address.trim();
    if address.is_empty() {
        return Err(SyncError::Validation("wallet address is empty".to_string()));
    }
    Ok(address.to_string())
}

/// Services the orchestrator depends on.
#[derive(Clone)]
pub struct OrchestratorServices {
    pub source: Arc<dyn NftOwnershipSource>,
    pub cache: Arc<IntelligentCache>,
    pub fallback: Arc<FallbackStore>,
    pub events: EventBus,
    pub connection: Arc<ConnectionMonitor>,
    pub circuits: Arc<CircuitRegistry>,
    pub retry: RetryPolicy,
}

struct Session {
    address: String,
    wallet_type: Option<String>,
    activity: SessionActivity,
    blurred_at: Option<Instant>,
}

/// Publishes [`SyncState`] and [`SyncStatus`] and counts running syncs.
struct StatusTracker {
    state_tx: watch::Sender<SyncState>,
    status_tx: watch::Sender<SyncStatus>,
    active: AtomicUsize,
}

impl StatusTracker {
    fn new() -> Self {
        let (state_tx, _) = watch::channel(SyncState::Disconnected);
        let (status_tx, _) = watch::channel(SyncStatus::default());
        Self {
            state_tx,
            status_tx,
            active: AtomicUsize::new(0),
        }
    }

    fn set_state(&self, state: SyncState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Sync state changed");
            metrics::set_sync_state(state.as_str());
        }
    }

    fn begin(self: &Arc<Self>, kind: SyncKind) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.status_tx.send_modify(|status| {
            status.is_active = true;
            status.current_operation = Some(kind.as_str().to_string());
        });
        let changed = self.state_tx.send_if_modified(|state| match state {
            SyncState::Connecting | SyncState::Idle => {
                *state = SyncState::Syncing;
                true
            }
            _ => false,
        });
        if changed {
            metrics::set_sync_state(SyncState::Syncing.as_str());
        }
        ActiveGuard {
            tracker: Arc::clone(self),
        }
    }

    fn finish(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        self.status_tx.send_modify(|status| {
            status.is_active = false;
            status.current_operation = None;
        });
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == SyncState::Syncing {
                *state = SyncState::Idle;
                true
            } else {
                false
            }
        });
        if changed {
            metrics::set_sync_state(SyncState::Idle.as_str());
        }
    }

    fn record_success(&self) {
        self.status_tx.send_modify(|status| status.last_sync = Some(Utc::now()));
    }

    fn record_failure(&self) {
        self.status_tx
            .send_modify(|status| status.failure_count = status.failure_count.saturating_add(1));
    }

    fn reset(&self) {
        self.status_tx.send_modify(|status| {
            status.is_active = false;
            status.current_operation = None;
        });
        self.set_state(SyncState::Disconnected);
    }
}

/// Clears `is_active` on every exit path, including panics and aborts.
struct ActiveGuard {
    tracker: Arc<StatusTracker>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.tracker.finish();
    }
}

/// Values that can be served stale.
trait Snapshot: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn with_freshness(self, freshness: Freshness) -> Self;
}

impl Snapshot for ProfileData {
    fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self.stats.freshness = freshness;
        self
    }
}

impl Snapshot for NftCollection {
    fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }
}

impl Snapshot for ProfileStats {
    fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }
}

/// Coordinates wallet syncs.
///
/// Methods that may start background work take `self: &Arc<Self>`.
pub struct SyncOrchestrator {
    config: OrchestratorConfig,
    source: Arc<dyn NftOwnershipSource>,
    cache: Arc<IntelligentCache>,
    fallback: Arc<FallbackStore>,
    events: EventBus,
    connection: Arc<ConnectionMonitor>,
    circuits: Arc<CircuitRegistry>,
    retry: RetryPolicy,
    tracker: Arc<StatusTracker>,
    session: Mutex<Option<Session>>,
    /// Addresses connected at least once; a repeat connect is a reconnect.
    seen_addresses: Mutex<HashSet<String>>,
    /// Bumped on connect/disconnect; stale sessions do not write caches.
    epoch: AtomicU64,
    /// Cache write versions; a slower, older sync never overwrites a newer one.
    write_seq: AtomicU64,
    profile_flights: InFlight<ProfileData>,
    nft_flights: InFlight<NftCollection>,
    stats_flights: InFlight<ProfileStats>,
    periodic: tokio::sync::Mutex<Option<PeriodicTask>>,
}

impl SyncOrchestrator {
    pub fn new(config: OrchestratorConfig, services: OrchestratorServices) -> Self {
        Self {
            config,
            source: services.source,
            cache: services.cache,
            fallback: services.fallback,
            events: services.events,
            connection: services.connection,
            circuits: services.circuits,
            retry: services.retry,
            tracker: Arc::new(StatusTracker::new()),
            session: Mutex::new(None),
            seen_addresses: Mutex::new(HashSet::new()),
            epoch: AtomicU64::new(0),
            write_seq: AtomicU64::new(0),
            profile_flights: InFlight::new(),
            nft_flights: InFlight::new(),
            stats_flights: InFlight::new(),
            periodic: tokio::sync::Mutex::new(None),
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    #[must_use]
    pub fn state(&self) -> SyncState {
        *self.tracker.state_tx.borrow()
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.tracker.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.tracker.status_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.tracker.state_tx.subscribe()
    }

    /// Address of the connected wallet, if any.
    pub fn connected_address(&self) -> Option<String> {
        lock(&self.session).as_ref().map(|s| s.address.clone())
    }

    /// Fresh cached profile for `address`, without touching the network.
    pub fn get_cached_profile(&self, address: &str) -> Option<ProfileData> {
        self.cached(SyncKind::Profile, address.trim())
    }

    /// Fresh cached collection for `address`, without touching the network.
    pub fn get_cached_collection(&self, address: &str) -> Option<NftCollection> {
        self.cached(SyncKind::Nft, address.trim())
    }

    /// Whether a sync of any scope is in flight for `address`.
    pub fn is_syncing(&self, address: &str) -> bool {
        self.profile_flights.contains(address)
            || self.nft_flights.contains(address)
            || self.stats_flights.contains(address)
    }

    fn cached<T: Snapshot>(&self, kind: SyncKind, address: &str) -> Option<T> {
        self.cache
            .get::<T>(&kind.cache_key(address))
            .map(|value| value.with_freshness(Freshness::Cached))
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Connect a wallet and run a full sync.
    ///
    /// Connecting a different wallet first tears down the current session.
    /// Reconnecting a wallet seen before invalidates the whole cache.
    #[instrument(skip(self))]
    pub async fn on_wallet_connect(
        self: &Arc<Self>,
        address: &str,
        wallet_type: Option<&str>,
    ) -> Result<ProfileData> {
        let address = normalize_address(address)?;

        if let Some(current) = self.connected_address() {
            if current != address {
                info!(previous = %current, "Switching wallets");
                self.on_wallet_disconnect().await;
            }
        }

        let reconnect = !lock(&self.seen_addresses).insert(address.clone());
        *lock(&self.session) = Some(Session {
            address: address.clone(),
            wallet_type: wallet_type.map(str::to_string),
            activity: SessionActivity::Foreground,
            blurred_at: None,
        });
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.tracker.set_state(SyncState::Connecting);

        info!(wallet_type = ?wallet_type, reconnect, "Wallet connected");
        self.events.emit(
            SyncEventType::WalletConnected,
            json!({ "address": address, "walletType": wallet_type }),
            EVENT_SOURCE,
        );

        if reconnect {
            let event = CacheEvent::WalletReconnected;
            let removed = self.cache.invalidate_by_event(&event);
            self.emit_invalidated(event.name(), &address, removed);
        }

        let result = self.sync_wallet_to_profile(&address, true).await;

        if self.config.periodic_enabled {
            self.start_periodic_sync().await;
        }

        result
    }

    /// Tear down the session: stop the periodic timer, drop cached data for
    /// the wallet and reset the status. Returns the disconnected address.
    ///
    /// Fallback snapshots are kept so a later offline reconnect can still
    /// show last-known-good data.
    pub async fn on_wallet_disconnect(&self) -> Option<String> {
        let session = lock(&self.session).take();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.stop_periodic_sync().await;
        self.tracker.reset();

        let Some(session) = session else {
            debug!("Disconnect requested with no wallet connected");
            return None;
        };
        let address = session.address;

        let event = CacheEvent::WalletDisconnected {
            address: address.clone(),
        };
        let mut removed = self.cache.invalidate_by_event(&event);
        for kind in [SyncKind::Profile, SyncKind::Nft, SyncKind::Stats] {
            if self.cache.invalidate(&kind.cache_key(&address)) {
                removed += 1;
            }
        }
        self.emit_invalidated(event.name(), &address, removed);

        info!(address = %address, removed, "Wallet disconnected");
        self.events.emit(
            SyncEventType::WalletDisconnected,
            json!({ "address": address }),
            EVENT_SOURCE,
        );
        Some(address)
    }

    fn emit_invalidated(&self, reason: &str, address: &str, removed: usize) {
        self.events.emit(
            SyncEventType::CacheInvalidated,
            json!({ "reason": reason, "address": address, "removed": removed }),
            EVENT_SOURCE,
        );
    }

    /// Record that the app lost focus.
    pub fn on_app_blur(&self) {
        if let Some(session) = lock(&self.session).as_mut() {
            session.activity = SessionActivity::Background;
            session.blurred_at = Some(Instant::now());
            debug!(address = %session.address, "App blurred");
        }
    }

    /// Record that the app regained focus. Runs a forced sync when the app
    /// was in the background longer than the configured threshold.
    ///
    /// Returns `Ok(None)` when no sync was needed.
    pub async fn on_app_focus(self: &Arc<Self>) -> Result<Option<ProfileData>> {
        let (address, away) = {
            let mut guard = lock(&self.session);
            let Some(session) = guard.as_mut() else {
                return Ok(None);
            };
            session.activity = SessionActivity::Foreground;
            let away = session.blurred_at.take().map(|at| at.elapsed());
            (session.address.clone(), away)
        };

        let threshold = self.config.focus_resync_threshold();
        match away {
            Some(away) if away >= threshold => {
                info!(
                    address = %address,
                    away_ms = away.as_millis() as u64,
                    "App refocused after threshold, syncing"
                );
                self.sync_wallet_to_profile(&address, true).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    fn session_snapshot(&self) -> Option<(String, SessionActivity)> {
        lock(&self.session)
            .as_ref()
            .map(|s| (s.address.clone(), s.activity))
    }

    fn wallet_type_for(&self, address: &str) -> Option<String> {
        lock(&self.session)
            .as_ref()
            .filter(|s| s.address == address)
            .and_then(|s| s.wallet_type.clone())
    }

    // =========================================================================
    // Sync entry points
    // =========================================================================

    /// Full sync of ownership, eligible moments and stats.
    ///
    /// With `force == false` a fresh cached profile is returned without a
    /// network call. Concurrent calls for one address share a single fetch.
    pub async fn sync_wallet_to_profile(
        self: &Arc<Self>,
        address: &str,
        force: bool,
    ) -> Result<ProfileData> {
        let address = normalize_address(address)?;
        if !force {
            if let Some(profile) = self.cached(SyncKind::Profile, &address) {
                debug!(address = %address, "Serving cached profile");
                return Ok(profile);
            }
        }

        let this = Arc::clone(self);
        let key = address.clone();
        let epoch = self.epoch.load(Ordering::SeqCst);
        let (flight, joined) = self.profile_flights.join_or_start(
            FlightKey::new(&address, epoch, force),
            move || async move { this.run_profile_sync(&key, force, epoch).await },
        );
        if joined {
            debug!(address = %address, "Joined in-flight profile sync");
            metrics::record_sync_deduplicated(SyncKind::Profile.as_str());
        }
        flight.await
    }

    /// Ownership-only sync.
    pub async fn sync_nft_collection(
        self: &Arc<Self>,
        address: &str,
        force: bool,
    ) -> Result<NftCollection> {
        let address = normalize_address(address)?;
        if !force {
            if let Some(collection) = self.cached(SyncKind::Nft, &address) {
                return Ok(collection);
            }
        }

        let this = Arc::clone(self);
        let key = address.clone();
        let epoch = self.epoch.load(Ordering::SeqCst);
        let (flight, joined) = self.nft_flights.join_or_start(
            FlightKey::new(&address, epoch, force),
            move || async move { this.run_nft_sync(&key, force, epoch).await },
        );
        if joined {
            debug!(address = %address, "Joined in-flight NFT sync");
            metrics::record_sync_deduplicated(SyncKind::Nft.as_str());
        }
        flight.await
    }

    /// Recompute stats from the current collection and eligible moments.
    ///
    /// With `force == false` fresh cached stats are returned without a
    /// network call.
    pub async fn sync_profile_stats(
        self: &Arc<Self>,
        address: &str,
        force: bool,
    ) -> Result<ProfileStats> {
        let address = normalize_address(address)?;
        if !force {
            if let Some(stats) = self.cached(SyncKind::Stats, &address) {
                return Ok(stats);
            }
        }

        let this = Arc::clone(self);
        let key = address.clone();
        let epoch = self.epoch.load(Ordering::SeqCst);
        let (flight, joined) = self.stats_flights.join_or_start(
            FlightKey::new(&address, epoch, force),
            move || async move { this.run_stats_sync(&key, force, epoch).await },
        );
        if joined {
            debug!(address = %address, "Joined in-flight stats sync");
            metrics::record_sync_deduplicated(SyncKind::Stats.as_str());
        }
        flight.await
    }

    /// The wallet's holdings changed: force an NFT sync, recompute stats and
    /// patch the cached profile without a reconnect.
    #[instrument(skip(self))]
    pub async fn on_nft_collection_change(self: &Arc<Self>, address: &str) -> Result<ProfileData> {
        let address = normalize_address(address)?;
        let collection = self.sync_nft_collection(&address, true).await?;
        let stats = self.sync_profile_stats(&address, true).await?;

        let mut profile = match self.cache.get_stale::<ProfileData>(&SyncKind::Profile.cache_key(&address)) {
            Some(read) => read.data,
            None => self.new_profile(&address),
        };
        // Counts follow the holdings in hand; only eligibility can lag.
        let mut patched = compute_stats(&collection, stats.eligible_moments);
        patched.freshness = stats.freshness;
        profile.apply_collection(&collection, patched);

        if profile.freshness.is_stale() {
            debug!(address = %address, "Collection change applied from stale data, not persisting");
            return Ok(profile);
        }

        let version = self.next_version();
        self.cache_put(SyncKind::Profile, &address, &profile, version);
        self.fallback
            .set(&SyncKind::Profile.cache_key(&address), &profile)
            .await;
        Ok(profile)
    }

    /// Preload NFT collections for `addresses` that are not cached yet.
    ///
    /// Fetches run with the concurrency of the current link quality tier and
    /// one failing address does not affect the others.
    pub async fn warm_collections(self: &Arc<Self>, addresses: &[String]) -> WarmupReport {
        let kind = SyncKind::Nft;
        let version = self.next_version();
        let mut entries = Vec::with_capacity(addresses.len());
        for address in addresses {
            let Ok(address) = normalize_address(address) else {
                continue;
            };
            let this = Arc::clone(self);
            let options = self.cache_options(kind, &address, version);
            let key = kind.cache_key(&address);
            entries.push(WarmupEntry {
                key,
                options,
                fetch: Box::pin(async move {
                    let addr = address.as_str();
                    let source = &this.source;
                    let ownership = this
                        .call_source("get_ownership", move || source.get_ownership(addr, false))
                        .await?;
                    Ok::<_, SyncError>(build_collection(addr, ownership))
                }),
            });
        }

        let concurrency = self.connection.quality_tier().concurrency();
        let report = self.cache.warmup_cache(entries, concurrency).await;
        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            failed = report.failed,
            concurrency,
            "Collection cache warmed"
        );
        report
    }

    fn new_profile(&self, address: &str) -> ProfileData {
        ProfileData {
            address: address.to_string(),
            wallet_type: self.wallet_type_for(address),
            collections: Vec::new(),
            moments: Vec::new(),
            stats: ProfileStats::default(),
            last_updated: Utc::now(),
            freshness: Freshness::Live,
        }
    }

    // =========================================================================
    // Sync bodies (run on spawned tasks)
    // =========================================================================

    async fn run_profile_sync(&self, address: &str, force: bool, epoch: u64) -> Result<ProfileData> {
        let kind = SyncKind::Profile;
        let started = Instant::now();
        let version = self.next_version();
        self.emit_started(kind, address, force);
        let _active = self.tracker.begin(kind);

        let fetched = async {
            let ownership = self
                .call_source("get_ownership", move || self.source.get_ownership(address, force))
                .await?;
            let eligible = self
                .call_source("get_eligible_moments", move || self.source.get_eligible_moments(address))
                .await?;
            Ok::<_, SyncError>((ownership, eligible))
        }
        .await;

        let (ownership, eligible) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => return self.recover(kind, address, e, started).await,
        };

        let collection = build_collection(address, ownership);
        let stats = compute_stats(&collection, eligible.len());
        let mut profile = self.new_profile(address);
        profile.apply_collection(&collection, stats);

        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.cache_put(SyncKind::Nft, address, &collection, version);
            self.cache_put(SyncKind::Stats, address, &profile.stats, version);
            self.cache_put(kind, address, &profile, version);
            self.fallback.set(&kind.cache_key(address), &profile).await;
            self.fallback.set(&SyncKind::Nft.cache_key(address), &collection).await;
        } else {
            debug!(address, "Session changed during sync, not caching result");
        }

        self.complete(
            kind,
            address,
            started,
            json!({
                "totalNfts": profile.stats.total_nfts,
                "eligibleMoments": profile.stats.eligible_moments,
            }),
        );
        Ok(profile)
    }

    async fn run_nft_sync(&self, address: &str, force: bool, epoch: u64) -> Result<NftCollection> {
        let kind = SyncKind::Nft;
        let started = Instant::now();
        let version = self.next_version();
        self.emit_started(kind, address, force);
        let _active = self.tracker.begin(kind);

        let ownership = match self
            .call_source("get_ownership", move || self.source.get_ownership(address, force))
            .await
        {
            Ok(ownership) => ownership,
            Err(e) => return self.recover(kind, address, e, started).await,
        };

        let collection = build_collection(address, ownership);
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.cache_put(kind, address, &collection, version);
            self.fallback.set(&kind.cache_key(address), &collection).await;
        }

        self.complete(
            kind,
            address,
            started,
            json!({ "totalCount": collection.total_count }),
        );
        Ok(collection)
    }

    async fn run_stats_sync(&self, address: &str, force: bool, epoch: u64) -> Result<ProfileStats> {
        let kind = SyncKind::Stats;
        let started = Instant::now();
        let version = self.next_version();
        self.emit_started(kind, address, force);
        let _active = self.tracker.begin(kind);

        let fetched = async {
            let collection = match self.cache.get::<NftCollection>(&SyncKind::Nft.cache_key(address)) {
                Some(collection) => collection,
                None => {
                    let ownership = self
                        .call_source("get_ownership", move || self.source.get_ownership(address, false))
                        .await?;
                    build_collection(address, ownership)
                }
            };
            let eligible = self
                .call_source("get_eligible_moments", move || self.source.get_eligible_moments(address))
                .await?;
            Ok::<_, SyncError>(compute_stats(&collection, eligible.len()))
        }
        .await;

        let stats = match fetched {
            Ok(stats) => stats,
            Err(e) => return self.recover(kind, address, e, started).await,
        };

        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.cache_put(kind, address, &stats, version);
            self.fallback.set(&kind.cache_key(address), &stats).await;
            if let Some(mut profile) = self.cache.get::<ProfileData>(&SyncKind::Profile.cache_key(address)) {
                profile.stats = stats.clone();
                self.cache_put(SyncKind::Profile, address, &profile, version);
            }
        }

        self.complete(
            kind,
            address,
            started,
            json!({ "totalNfts": stats.total_nfts, "eligibleMoments": stats.eligible_moments }),
        );
        Ok(stats)
    }

    // =========================================================================
    // Pipeline pieces
    // =========================================================================

    /// Circuit breaker, then retries, then a per-attempt tier timeout.
    async fn call_source<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.connection.is_online() {
            return Err(SyncError::network(operation, "device is offline"));
        }

        let breaker = self.circuits.get(self.source.endpoint());
        breaker
            .call(|| {
                execute_with_retry(&self.retry, operation, || {
                    let timeout = self.connection.request_timeout();
                    with_timeout(operation, timeout, call())
                })
            })
            .await
    }

    /// Count the failure, emit `*_FAILED`, and serve stale data if any.
    async fn recover<T: Snapshot>(
        &self,
        kind: SyncKind,
        address: &str,
        error: SyncError,
        started: Instant,
    ) -> Result<T> {
        self.tracker.record_failure();
        metrics::record_sync(kind.as_str(), "failure", started.elapsed());

        let key = kind.cache_key(address);
        let stale = match self.cache.get_stale::<T>(&key) {
            Some(read) => Some((read.data, read.stored_at, "cache")),
            None => self
                .fallback
                .get::<T>(&key)
                .await
                .map(|entry| (entry.data, entry.timestamp, "fallback")),
        };

        self.events.emit(
            kind.failed_event(),
            json!({
                "address": address,
                "error": error.to_string(),
                "errorKind": error.kind().as_str(),
                "retryable": error.is_retryable(),
                "servedStale": stale.is_some(),
                "durationMs": started.elapsed().as_millis() as u64,
            }),
            EVENT_SOURCE,
        );

        match stale {
            Some((data, as_of, origin)) => {
                warn!(
                    kind = %kind,
                    address,
                    error = %error,
                    origin,
                    as_of = %as_of,
                    "Sync failed, serving stale data"
                );
                metrics::record_stale_served(kind.as_str(), origin);
                Ok(data.with_freshness(Freshness::Stale { as_of }))
            }
            None => {
                warn!(kind = %kind, address, error = %error, "Sync failed with no fallback");
                Err(error)
            }
        }
    }

    fn emit_started(&self, kind: SyncKind, address: &str, force: bool) {
        debug!(kind = %kind, address, force, "Sync started");
        self.events.emit(
            kind.started_event(),
            json!({ "address": address, "force": force }),
            EVENT_SOURCE,
        );
    }

    fn complete(&self, kind: SyncKind, address: &str, started: Instant, mut payload: serde_json::Value) {
        let elapsed = started.elapsed();
        self.tracker.record_success();
        metrics::record_sync(kind.as_str(), "success", elapsed);
        info!(
            kind = %kind,
            address,
            duration_ms = elapsed.as_millis() as u64,
            "Sync completed"
        );
        if let Some(fields) = payload.as_object_mut() {
            fields.insert("address".to_string(), json!(address));
            fields.insert("durationMs".to_string(), json!(elapsed.as_millis() as u64));
        }
        self.events.emit(kind.completed_event(), payload, EVENT_SOURCE);
    }

    fn next_version(&self) -> u64 {
        self.write_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn cache_options(&self, kind: SyncKind, address: &str, version: u64) -> CacheOptions {
        let ttl = match kind {
            SyncKind::Nft => self.config.collection_ttl(),
            SyncKind::Profile | SyncKind::Stats => self.config.profile_ttl(),
        };
        CacheOptions::new()
            .ttl(ttl)
            .tags([kind.as_str().to_string(), wallet_tag(address)])
            .version(version)
    }

    fn cache_put<T: Serialize>(&self, kind: SyncKind, address: &str, value: &T, version: u64) {
        let options = self.cache_options(kind, address, version);
        if let Err(e) = self.cache.set(&kind.cache_key(address), value, options) {
            warn!(kind = %kind, address, error = %e, "Failed to cache sync result");
        }
    }
}

fn build_collection(address: &str, ownership: Ownership) -> NftCollection {
    let collections = summarize_collections(&ownership.moments, &ownership.collections);
    NftCollection {
        address: address.to_string(),
        total_count: ownership.total_count.max(ownership.moments.len()),
        moments: ownership.moments,
        collections,
        is_eligible: ownership.is_eligible,
        last_updated: Utc::now(),
        freshness: Freshness::Live,
    }
}

fn compute_stats(collection: &NftCollection, eligible_moments: usize) -> ProfileStats {
    ProfileStats {
        total_nfts: collection.total_count,
        eligible_moments,
        collection_count: collection.collections.len(),
        is_eligible: collection.is_eligible,
        freshness: Freshness::Live,
    }
}
