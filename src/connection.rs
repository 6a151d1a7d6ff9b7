// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection monitoring.
//!
//! Tracks online/offline transitions and a discretized [`QualityTier`].
//!
//! # Signals
//!
//! - A periodic liveness probe ([`ConnectivityProbe`]). A failing or slow
//!   probe marks the device offline; probe errors never propagate.
//! - Runtime online/offline signals from the host via [`ConnectionMonitor::set_online`].
//! - Optional link-quality samples ([`LinkQualitySource`]). Without them an
//!   online device is rated `Good`.
//!
//! `NETWORK_STATUS_CHANGED` is emitted only when `(is_online, tier)` changes,
//! not on every poll. An offline → online transition additionally emits
//! `CONNECTION_RESTORED`, which triggers offline queue replay.
//!
//! # Tier Buckets
//!
//! | Tier | Condition |
//! |------|-----------|
//! | Poor | `slow-2g`/`2g`, or RTT > 1000ms, or downlink < 0.5 Mbps |
//! | Fair | `3g`, or RTT > 300ms, or downlink < 2 Mbps |
//! | Excellent | `4g` with RTT ≤ 100ms and downlink ≥ 10 Mbps |
//! | Good | anything else, including no signal |

use crate::config::ConnectionConfig;
use crate::error::BoxFuture;
use crate::events::{EventBus, SyncEventType};
use crate::metrics;
use crate::resilience::with_timeout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Discretized network quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Excellent,
    Good,
    Fair,
    Poor,
    Offline,
}

impl QualityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Offline => "offline",
        }
    }

    /// Deadline for a single network call at this tier.
    pub fn request_timeout(self) -> Duration {
        match self {
            Self::Excellent => Duration::from_secs(5),
            Self::Good => Duration::from_secs(10),
            Self::Fair => Duration::from_secs(20),
            Self::Poor => Duration::from_secs(30),
            Self::Offline => Duration::from_secs(5),
        }
    }

    /// Concurrent network calls worth issuing at this tier.
    pub fn concurrency(self) -> usize {
        match self {
            Self::Excellent => 6,
            Self::Good => 4,
            Self::Fair => 2,
            Self::Poor | Self::Offline => 1,
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A link-quality sample. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkQuality {
    /// Effective connection type (`slow-2g`, `2g`, `3g`, `4g`).
    pub effective_type: Option<String>,
    pub downlink_mbps: Option<f64>,
    pub round_trip_ms: Option<u64>,
}

impl LinkQuality {
    /// Bucket this sample for an online device.
    pub fn tier(&self) -> QualityTier {
        let effective = self.effective_type.as_deref();
        let rtt = self.round_trip_ms;
        let downlink = self.downlink_mbps;

        if matches!(effective, Some("slow-2g") | Some("2g"))
            || rtt.map_or(false, |r| r > 1000)
            || downlink.map_or(false, |d| d < 0.5)
        {
            return QualityTier::Poor;
        }
        if effective == Some("3g")
            || rtt.map_or(false, |r| r > 300)
            || downlink.map_or(false, |d| d < 2.0)
        {
            return QualityTier::Fair;
        }
        if effective == Some("4g")
            && rtt.map_or(false, |r| r <= 100)
            && downlink.map_or(false, |d| d >= 10.0)
        {
            return QualityTier::Excellent;
        }
        QualityTier::Good
    }
}

/// Classify connectivity into a tier.
pub fn classify(is_online: bool, link: Option<&LinkQuality>) -> QualityTier {
    if !is_online {
        return QualityTier::Offline;
    }
    link.map_or(QualityTier::Good, LinkQuality::tier)
}

/// Current connectivity snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub is_online: bool,
    pub quality_tier: QualityTier,
    pub effective_type: Option<String>,
    pub downlink_mbps: Option<f64>,
    pub round_trip_ms: Option<u64>,
    pub last_checked: DateTime<Utc>,
}

impl NetworkStatus {
    fn build(is_online: bool, link: Option<LinkQuality>) -> Self {
        let quality_tier = classify(is_online, link.as_ref());
        let link = link.unwrap_or_default();
        Self {
            is_online,
            quality_tier,
            effective_type: link.effective_type,
            downlink_mbps: link.downlink_mbps,
            round_trip_ms: link.round_trip_ms,
            last_checked: Utc::now(),
        }
    }
}

/// Lightweight liveness probe.
pub trait ConnectivityProbe: Send + Sync + 'static {
    /// Succeeds when the backend is reachable.
    fn probe(&self) -> BoxFuture<'_, ()>;
}

/// Optional link-quality signal.
pub trait LinkQualitySource: Send + Sync + 'static {
    /// Latest sample, `None` when the platform exposes nothing.
    fn sample(&self) -> Option<LinkQuality>;
}

/// Probe that always succeeds, for hosts that only push `set_online` signals.
pub struct AlwaysOnline;

impl ConnectivityProbe for AlwaysOnline {
    fn probe(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

struct ProbeTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Tracks connectivity and publishes transitions.
pub struct ConnectionMonitor {
    probe: Arc<dyn ConnectivityProbe>,
    link: Option<Arc<dyn LinkQualitySource>>,
    events: EventBus,
    config: ConnectionConfig,
    status_tx: watch::Sender<NetworkStatus>,
    task: Mutex<Option<ProbeTask>>,
}

impl ConnectionMonitor {
    /// Create a monitor. The device is assumed online until a probe says otherwise.
    pub fn new(
        probe: Arc<dyn ConnectivityProbe>,
        link: Option<Arc<dyn LinkQualitySource>>,
        events: EventBus,
        config: ConnectionConfig,
    ) -> Self {
        let initial = NetworkStatus::build(true, link.as_ref().and_then(|l| l.sample()));
        let (status_tx, _) = watch::channel(initial);
        Self {
            probe,
            link,
            events,
            config,
            status_tx,
            task: Mutex::new(None),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        self.status_tx.borrow().clone()
    }

    pub fn is_online(&self) -> bool {
        self.status_tx.borrow().is_online
    }

    pub fn quality_tier(&self) -> QualityTier {
        self.status_tx.borrow().quality_tier
    }

    /// Timeout for network calls at the current tier.
    pub fn request_timeout(&self) -> Duration {
        self.quality_tier().request_timeout()
    }

    /// Watch connectivity snapshots.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status_tx.subscribe()
    }

    /// Probe now and update the status.
    pub async fn check_now(&self) -> NetworkStatus {
        let started = Instant::now();
        let result = with_timeout("connectivity_probe", self.config.probe_timeout(), self.probe.probe()).await;
        let online = result.is_ok();
        metrics::record_probe(online, started.elapsed());
        if let Err(e) = result {
            debug!(error = %e, "Connectivity probe failed");
        }
        self.apply(online)
    }

    /// Apply a runtime online/offline signal from the host.
    pub fn set_online(&self, online: bool) -> NetworkStatus {
        self.apply(online)
    }

    fn apply(&self, online: bool) -> NetworkStatus {
        let link = if online {
            self.link.as_ref().and_then(|l| l.sample())
        } else {
            None
        };
        let next = NetworkStatus::build(online, link);
        let previous = self.status_tx.send_replace(next.clone());

        let changed = previous.is_online != next.is_online || previous.quality_tier != next.quality_tier;
        if changed {
            info!(
                online = next.is_online,
                tier = %next.quality_tier,
                previous_tier = %previous.quality_tier,
                "Network status changed"
            );
            metrics::set_network_status(next.is_online, next.quality_tier.as_str());
            self.events.emit(
                SyncEventType::NetworkStatusChanged,
                json!({
                    "is_online": next.is_online,
                    "quality_tier": next.quality_tier,
                    "previous_tier": previous.quality_tier,
                }),
                "connection_monitor",
            );
        }

        if !previous.is_online && next.is_online {
            metrics::record_connection_restored();
            self.events.emit(
                SyncEventType::ConnectionRestored,
                json!({ "quality_tier": next.quality_tier }),
                "connection_monitor",
            );
        }

        next
    }

    /// Start the periodic probe loop. No-op while already running.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_some() {
            debug!("Connection monitor already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let monitor = Arc::clone(self);
        let interval = self.config.probe_interval();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        monitor.check_now().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Connection monitor stopping");
                            break;
                        }
                    }
                }
            }
        });

        info!(interval_ms = interval.as_millis() as u64, "Connection monitor started");
        *guard = Some(ProbeTask { shutdown_tx, handle });
    }

    /// Stop the probe loop.
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Connection monitor task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }
}
