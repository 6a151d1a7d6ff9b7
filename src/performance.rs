// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync performance monitor.
//!
//! Listens to sync lifecycle events only; it never calls into the orchestrator.
//! `*_STARTED` is paired with the matching `*_COMPLETED` / `*_FAILED` for the
//! same (kind, address) to produce one sample per sync. Samples live in a
//! rolling window from which average, p95, error rate and trend are derived.
//!
//! Alerts (slow sync, high error rate) are kept in a bounded list, logged,
//! counted in metrics and re-emitted as `PERFORMANCE_ALERT`. The error-rate
//! alert fires once per excursion above the threshold.

use crate::config::PerformanceConfig;
use crate::events::{EventBus, Subscription, SyncEvent, SyncEventType};
use crate::metrics;
use crate::orchestrator::SyncKind;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, warn};

const EVENT_SOURCE: &str = "performance_monitor";

/// Direction of sync latency across the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlowSync,
    HighErrorRate,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::SlowSync => "slow_sync",
            AlertKind::HighErrorRate => "high_error_rate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceAlert {
    pub kind: AlertKind,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

/// One finished sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSample {
    pub kind: &'static str,
    pub address: String,
    pub duration_ms: u64,
    pub success: bool,
    pub finished_at: DateTime<Utc>,
}

/// Snapshot of the monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub sample_count: usize,
    pub average_ms: f64,
    pub p95_ms: u64,
    pub error_rate: f64,
    pub trend: Trend,
    pub in_flight: usize,
    pub alerts: Vec<PerformanceAlert>,
}

#[derive(Default)]
struct MonitorInner {
    started: HashMap<(SyncKind, String), DateTime<Utc>>,
    samples: VecDeque<SyncSample>,
    alerts: VecDeque<PerformanceAlert>,
    error_alert_active: bool,
}

pub struct PerformanceMonitor {
    config: PerformanceConfig,
    events: EventBus,
    inner: Mutex<MonitorInner>,
    subscriptions: Mutex<Vec<Subscription>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

const LIFECYCLE_EVENTS: [SyncEventType; 9] = [
    SyncEventType::ProfileSyncStarted,
    SyncEventType::ProfileSyncCompleted,
    SyncEventType::ProfileSyncFailed,
    SyncEventType::NftSyncStarted,
    SyncEventType::NftSyncCompleted,
    SyncEventType::NftSyncFailed,
    SyncEventType::StatsSyncStarted,
    SyncEventType::StatsSyncCompleted,
    SyncEventType::StatsSyncFailed,
];

impl PerformanceMonitor {
    pub fn new(config: PerformanceConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            inner: Mutex::new(MonitorInner::default()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to lifecycle events. Calling twice is a no-op.
    pub fn attach(self: &Arc<Self>) {
        let mut subscriptions = lock(&self.subscriptions);
        if !subscriptions.is_empty() {
            return;
        }
        for event_type in LIFECYCLE_EVENTS {
            let monitor: Weak<Self> = Arc::downgrade(self);
            subscriptions.push(self.events.subscribe(event_type, move |event| {
                if let Some(monitor) = monitor.upgrade() {
                    monitor.observe(event);
                }
                Ok(())
            }));
        }
        debug!(events = LIFECYCLE_EVENTS.len(), "Performance monitor attached");
    }

    pub fn detach(&self) {
        for subscription in lock(&self.subscriptions).drain(..) {
            subscription.unsubscribe();
        }
    }

    /// Feed one event. Non-lifecycle events are ignored.
    pub fn observe(&self, event: &SyncEvent) {
        let Some(kind) = SyncKind::from_event(event.event_type) else {
            return;
        };
        let Some(address) = event.payload.get("address").and_then(|a| a.as_str()) else {
            return;
        };
        let key = (kind, address.to_string());

        if event.event_type == kind.started_event() {
            lock(&self.inner).started.insert(key, event.timestamp);
            return;
        }

        let success = event.event_type == kind.completed_event();
        let raised = {
            let mut inner = lock(&self.inner);
            let paired = inner
                .started
                .remove(&key)
                .and_then(|start| (event.timestamp - start).to_std().ok());
            let duration = paired.or_else(|| {
                event
                    .payload
                    .get("durationMs")
                    .and_then(|ms| ms.as_u64())
                    .map(Duration::from_millis)
            });
            let Some(duration) = duration else {
                debug!(kind = %kind, address, "Unpaired sync event ignored");
                return;
            };

            let sample = SyncSample {
                kind: kind.as_str(),
                address: address.to_string(),
                duration_ms: duration.as_millis() as u64,
                success,
                finished_at: event.timestamp,
            };
            self.record(&mut inner, sample)
        };

        // Emitted outside the lock; handlers may call `report()`.
        for alert in raised {
            self.events.emit(
                SyncEventType::PerformanceAlert,
                json!({
                    "kind": alert.kind.as_str(),
                    "message": alert.message,
                    "value": alert.value,
                    "threshold": alert.threshold,
                }),
                EVENT_SOURCE,
            );
        }
    }

    fn record(&self, inner: &mut MonitorInner, sample: SyncSample) -> Vec<PerformanceAlert> {
        let mut raised = Vec::new();

        if sample.duration_ms > self.config.slow_sync_threshold_ms {
            raised.push(PerformanceAlert {
                kind: AlertKind::SlowSync,
                message: format!(
                    "{} sync for {} took {}ms",
                    sample.kind, sample.address, sample.duration_ms
                ),
                value: sample.duration_ms as f64,
                threshold: self.config.slow_sync_threshold_ms as f64,
                timestamp: Utc::now(),
            });
        }

        let window = self.config.window_size.max(1);
        while inner.samples.len() >= window {
            inner.samples.pop_front();
        }
        inner.samples.push_back(sample);

        let error_rate = error_rate(&inner.samples);
        if inner.samples.len() >= self.config.min_samples {
            if error_rate > self.config.error_rate_threshold {
                if !inner.error_alert_active {
                    inner.error_alert_active = true;
                    raised.push(PerformanceAlert {
                        kind: AlertKind::HighErrorRate,
                        message: format!(
                            "sync error rate {:.0}% over last {} syncs",
                            error_rate * 100.0,
                            inner.samples.len()
                        ),
                        value: error_rate,
                        threshold: self.config.error_rate_threshold,
                        timestamp: Utc::now(),
                    });
                }
            } else {
                inner.error_alert_active = false;
            }
        }

        metrics::set_sync_health(error_rate, percentile(&inner.samples, 0.95));

        for alert in &raised {
            warn!(kind = alert.kind.as_str(), message = %alert.message, "Performance alert");
            metrics::record_performance_alert(alert.kind.as_str());
            while inner.alerts.len() >= self.config.max_alerts.max(1) {
                inner.alerts.pop_front();
            }
            inner.alerts.push_back(alert.clone());
        }
        raised
    }

    pub fn report(&self) -> PerformanceReport {
        let inner = lock(&self.inner);
        let samples = &inner.samples;
        let average_ms = average(samples.iter());
        PerformanceReport {
            sample_count: samples.len(),
            average_ms,
            p95_ms: percentile(samples, 0.95),
            error_rate: error_rate(samples),
            trend: trend(samples, self.config.min_samples),
            in_flight: inner.started.len(),
            alerts: inner.alerts.iter().cloned().collect(),
        }
    }

    pub fn alerts(&self) -> Vec<PerformanceAlert> {
        lock(&self.inner).alerts.iter().cloned().collect()
    }

    pub fn reset(&self) {
        *lock(&self.inner) = MonitorInner::default();
    }
}

fn average<'a>(samples: impl Iterator<Item = &'a SyncSample>) -> f64 {
    let (sum, count) = samples.fold((0u64, 0usize), |(sum, count), s| (sum + s.duration_ms, count + 1));
    if count == 0 {
        0.0
    } else {
        sum as f64 / count as f64
    }
}

fn error_rate(samples: &VecDeque<SyncSample>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let failed = samples.iter().filter(|s| !s.success).count();
    failed as f64 / samples.len() as f64
}

/// Nearest-rank percentile of durations.
fn percentile(samples: &VecDeque<SyncSample>, p: f64) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let mut durations: Vec<u64> = samples.iter().map(|s| s.duration_ms).collect();
    durations.sort_unstable();
    let rank = (p * durations.len() as f64).ceil() as usize;
    durations[rank.clamp(1, durations.len()) - 1]
}

/// Compare mean latency of the older and newer halves of the window.
fn trend(samples: &VecDeque<SyncSample>, min_samples: usize) -> Trend {
    if samples.len() < min_samples.max(2) {
        return Trend::Stable;
    }
    let half = samples.len() / 2;
    let older = average(samples.iter().take(half));
    let newer = average(samples.iter().skip(half));
    if older == 0.0 {
        return if newer > 0.0 { Trend::Degrading } else { Trend::Stable };
    }
    let ratio = newer / older;
    if ratio < 0.9 {
        Trend::Improving
    } else if ratio > 1.1 {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn config() -> PerformanceConfig {
        PerformanceConfig {
            window_size: 10,
            slow_sync_threshold_ms: 1000,
            error_rate_threshold: 0.5,
            min_samples: 4,
            max_alerts: 3,
        }
    }

    fn event(event_type: SyncEventType, address: &str, at: DateTime<Utc>) -> SyncEvent {
        SyncEvent {
            event_type,
            timestamp: at,
            payload: json!({ "address": address }),
            source: "test".to_string(),
        }
    }

    fn sync(monitor: &PerformanceMonitor, kind: SyncKind, ms: i64, success: bool) {
        let start = Utc::now();
        let end = start + ChronoDuration::milliseconds(ms);
        monitor.observe(&event(kind.started_event(), "0xabc", start));
        let done = if success {
            kind.completed_event()
        } else {
            kind.failed_event()
        };
        monitor.observe(&event(done, "0xabc", end));
    }

    #[test]
    fn test_pairs_start_and_finish() {
        let monitor = PerformanceMonitor::new(config(), EventBus::new(10));
        sync(&monitor, SyncKind::Profile, 120, true);
        sync(&monitor, SyncKind::Nft, 80, false);

        let report = monitor.report();
        assert_eq!(report.sample_count, 2);
        assert_eq!(report.in_flight, 0);
        assert!((report.average_ms - 100.0).abs() < f64::EPSILON);
        assert!((report.error_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(report.p95_ms, 120);
    }

    #[test]
    fn test_unpaired_finish_uses_payload_duration() {
        let monitor = PerformanceMonitor::new(config(), EventBus::new(10));
        let mut done = event(SyncEventType::StatsSyncCompleted, "0xabc", Utc::now());
        done.payload["durationMs"] = json!(42);
        monitor.observe(&done);
        monitor.observe(&event(SyncEventType::StatsSyncFailed, "0xdef", Utc::now()));

        let report = monitor.report();
        assert_eq!(report.sample_count, 1);
        assert_eq!(report.p95_ms, 42);
    }

    #[test]
    fn test_slow_sync_alert_emitted() {
        let bus = EventBus::new(20);
        let monitor = PerformanceMonitor::new(config(), bus.clone());
        sync(&monitor, SyncKind::Profile, 1500, true);

        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::SlowSync);
        let emitted = bus.get_event_history(Some(SyncEventType::PerformanceAlert));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].payload["kind"], "slow_sync");
    }

    #[test]
    fn test_error_rate_alert_fires_once_per_excursion() {
        let monitor = PerformanceMonitor::new(config(), EventBus::new(50));
        for _ in 0..6 {
            sync(&monitor, SyncKind::Nft, 10, false);
        }
        let high: Vec<_> = monitor
            .alerts()
            .into_iter()
            .filter(|a| a.kind == AlertKind::HighErrorRate)
            .collect();
        assert_eq!(high.len(), 1);
        assert!((high[0].value - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_alert_list_is_bounded() {
        let monitor = PerformanceMonitor::new(config(), EventBus::new(50));
        for _ in 0..5 {
            sync(&monitor, SyncKind::Profile, 2000, true);
        }
        assert_eq!(monitor.alerts().len(), 3);
    }

    #[test]
    fn test_trend() {
        let monitor = PerformanceMonitor::new(config(), EventBus::new(50));
        for ms in [100, 100, 100, 300, 300, 300] {
            sync(&monitor, SyncKind::Profile, ms, true);
        }
        assert_eq!(monitor.report().trend, Trend::Degrading);

        monitor.reset();
        for ms in [300, 300, 100, 100] {
            sync(&monitor, SyncKind::Profile, ms, true);
        }
        assert_eq!(monitor.report().trend, Trend::Improving);

        monitor.reset();
        sync(&monitor, SyncKind::Profile, 100, true);
        assert_eq!(monitor.report().trend, Trend::Stable);
    }

    #[test]
    fn test_window_is_rolling() {
        let monitor = PerformanceMonitor::new(config(), EventBus::new(50));
        for _ in 0..15 {
            sync(&monitor, SyncKind::Stats, 5, true);
        }
        assert_eq!(monitor.report().sample_count, 10);
    }

    #[test]
    fn test_attach_via_bus() {
        let bus = EventBus::new(50);
        let monitor = Arc::new(PerformanceMonitor::new(config(), bus.clone()));
        monitor.attach();
        monitor.attach();
        assert_eq!(bus.handler_count(SyncEventType::ProfileSyncStarted), 1);

        bus.emit(SyncEventType::ProfileSyncStarted, json!({"address": "0xabc"}), "test");
        bus.emit(SyncEventType::ProfileSyncCompleted, json!({"address": "0xabc"}), "test");
        bus.emit(SyncEventType::WalletConnected, json!({"address": "0xabc"}), "test");
        assert_eq!(monitor.report().sample_count, 1);

        monitor.detach();
        assert_eq!(bus.handler_count(SyncEventType::ProfileSyncStarted), 0);
    }
}
