// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic background sync.
//!
//! One timer per orchestrator. Foreground sessions get a full sync, background
//! sessions an NFT-only sync. A tick is skipped while any sync for the
//! connected address is still in flight.

use super::{SessionActivity, SyncOrchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// How long `stop_periodic_sync` waits for a running tick before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct PeriodicTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncOrchestrator {
    /// Start the periodic timer. Returns `false` if it was already running.
    pub async fn start_periodic_sync(self: &Arc<Self>) -> bool {
        let mut slot = self.periodic.lock().await;
        if let Some(task) = slot.as_ref() {
            if !task.handle.is_finished() {
                debug!("Periodic sync already running");
                return false;
            }
        }

        let period = self.config.periodic_interval();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let orchestrator = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(orchestrator) = orchestrator.upgrade() else {
                            break;
                        };
                        tokio::select! {
                            _ = orchestrator.periodic_tick() => {}
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Periodic sync loop exited");
        });

        info!(period_ms = period.as_millis() as u64, "Periodic sync started");
        *slot = Some(PeriodicTask { shutdown_tx, handle });
        true
    }

    /// Stop the periodic timer. Returns `false` if it was not running.
    pub async fn stop_periodic_sync(&self) -> bool {
        let Some(task) = self.periodic.lock().await.take() else {
            return false;
        };

        let _ = task.shutdown_tx.send(true);
        let abort = task.handle.abort_handle();
        if tokio::time::timeout(STOP_TIMEOUT, task.handle).await.is_err() {
            warn!("Periodic sync did not stop in time, aborting");
            abort.abort();
        }
        info!("Periodic sync stopped");
        true
    }

    pub async fn is_periodic_running(&self) -> bool {
        self.periodic
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    async fn periodic_tick(self: &Arc<Self>) {
        let Some((address, activity)) = self.session_snapshot() else {
            return;
        };

        if self.is_syncing(&address) {
            debug!(address = %address, "Sync in flight, skipping periodic tick");
            return;
        }

        let result = match activity {
            SessionActivity::Foreground => self.sync_wallet_to_profile(&address, true).await.map(|_| ()),
            SessionActivity::Background => self.sync_nft_collection(&address, true).await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!(address = %address, error = %e, "Periodic sync failed");
        }
    }
}
