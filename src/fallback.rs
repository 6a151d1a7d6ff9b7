// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Last-known-good snapshots for degraded operation.
//!
//! Each entry is stored individually under `fallback:<key>` as
//! `{"data": ..., "timestamp": ...}`. This path is best-effort: storage and
//! serialization failures are logged and swallowed, so `set` never fails and
//! `get` degrades to `None`.

use crate::metrics;
use crate::storage::KeyValueStore;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "fallback:";

/// A snapshot together with the time it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEntry<T> {
    pub data: T,
    pub timestamp: DateTime<Utc>,
}

pub struct FallbackStore {
    storage: Arc<dyn KeyValueStore>,
}

impl FallbackStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        Self { storage }
    }

    fn storage_key(key: &str) -> String {
        format!("{}{}", KEY_PREFIX, key)
    }

    /// Store a snapshot. Returns whether it was written.
    pub async fn set<T: Serialize>(&self, key: &str, data: &T) -> bool {
        let entry = FallbackEntry {
            data,
            timestamp: Utc::now(),
        };
        let json = match serde_json::to_string(&entry) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize fallback entry");
                return false;
            }
        };

        match self.storage.set_item(&Self::storage_key(key), json).await {
            Ok(()) => {
                debug!(key, "Fallback entry stored");
                true
            }
            Err(e) => {
                metrics::record_storage_error("fallback_set");
                warn!(key, error = %e, "Failed to store fallback entry");
                false
            }
        }
    }

    /// Read a snapshot; `None` when absent, unreadable or of another shape.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<FallbackEntry<T>> {
        let raw = match self.storage.get_item(&Self::storage_key(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                metrics::record_fallback_read(false);
                return None;
            }
            Err(e) => {
                metrics::record_storage_error("fallback_get");
                warn!(key, error = %e, "Failed to read fallback entry");
                return None;
            }
        };

        match serde_json::from_str::<FallbackEntry<T>>(&raw) {
            Ok(entry) => {
                metrics::record_fallback_read(true);
                Some(entry)
            }
            Err(e) => {
                warn!(key, error = %e, "Discarding unreadable fallback entry");
                metrics::record_fallback_read(false);
                None
            }
        }
    }

    pub async fn remove(&self, key: &str) {
        if let Err(e) = self.storage.remove_item(&Self::storage_key(key)).await {
            metrics::record_storage_error("fallback_remove");
            warn!(key, error = %e, "Failed to remove fallback entry");
        }
    }
}
