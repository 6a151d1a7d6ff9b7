// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Orchestrator state and data types.
//!
//! # State Transitions
//!
//! ```text
//!                 on_wallet_connect()
//! Disconnected ─────────────────────→ Connecting
//!      ↑                                  │
//!      │                                  │ (full sync starts)
//!      │                                  ↓
//!      │  on_wallet_disconnect()      Syncing ←─────────────┐
//!      ├──────────────────────────────────┤                 │
//!      │                                  │ (last sync      │ (periodic,
//!      │                                  │  settles)       │  manual)
//!      │                                  ↓                 │
//!      └─────────────────────────────── Idle ───────────────┘
//! ```

use super::source::Moment;
use crate::events::SyncEventType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State of the wallet sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No wallet connected.
    #[default]
    Disconnected,

    /// A wallet was connected and its first sync has not started yet.
    Connecting,

    /// At least one sync is in flight.
    Syncing,

    /// Connected with nothing in flight.
    Idle,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Disconnected => "Disconnected",
            SyncState::Connecting => "Connecting",
            SyncState::Syncing => "Syncing",
            SyncState::Idle => "Idle",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three sync scopes, each with its own dedup key space and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncKind {
    /// Ownership, eligible moments and stats.
    Profile,
    /// Ownership only.
    Nft,
    /// Derived stats only.
    Stats,
}

impl SyncKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncKind::Profile => "profile",
            SyncKind::Nft => "nft",
            SyncKind::Stats => "stats",
        }
    }

    pub fn started_event(self) -> SyncEventType {
        match self {
            SyncKind::Profile => SyncEventType::ProfileSyncStarted,
            SyncKind::Nft => SyncEventType::NftSyncStarted,
            SyncKind::Stats => SyncEventType::StatsSyncStarted,
        }
    }

    pub fn completed_event(self) -> SyncEventType {
        match self {
            SyncKind::Profile => SyncEventType::ProfileSyncCompleted,
            SyncKind::Nft => SyncEventType::NftSyncCompleted,
            SyncKind::Stats => SyncEventType::StatsSyncCompleted,
        }
    }

    pub fn failed_event(self) -> SyncEventType {
        match self {
            SyncKind::Profile => SyncEventType::ProfileSyncFailed,
            SyncKind::Nft => SyncEventType::NftSyncFailed,
            SyncKind::Stats => SyncEventType::StatsSyncFailed,
        }
    }

    /// Map a lifecycle event back to its kind.
    pub fn from_event(event_type: SyncEventType) -> Option<Self> {
        match event_type {
            SyncEventType::ProfileSyncStarted
            | SyncEventType::ProfileSyncCompleted
            | SyncEventType::ProfileSyncFailed => Some(SyncKind::Profile),
            SyncEventType::NftSyncStarted
            | SyncEventType::NftSyncCompleted
            | SyncEventType::NftSyncFailed => Some(SyncKind::Nft),
            SyncEventType::StatsSyncStarted
            | SyncEventType::StatsSyncCompleted
            | SyncEventType::StatsSyncFailed => Some(SyncKind::Stats),
            _ => None,
        }
    }

    /// Cache key for this kind's data.
    pub fn cache_key(self, address: &str) -> String {
        format!("{}:{}", self.as_str(), address)
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable sync status for the presentation layer.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_active: bool,
    pub current_operation: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub failure_count: u32,
}

/// How current a returned value is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Freshness {
    /// Fetched by this call.
    #[default]
    Live,
    /// Served from cache within its TTL.
    Cached,
    /// Served after a failed fetch; data as of `as_of`.
    Stale { as_of: DateTime<Utc> },
}

impl Freshness {
    pub fn is_stale(&self) -> bool {
        matches!(self, Freshness::Stale { .. })
    }
}

/// Moments held in one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSummary {
    pub name: String,
    pub moment_count: usize,
}

/// Group moments by collection, keeping collections the source listed
/// even when they hold no moments.
pub fn summarize_collections(moments: &[Moment], listed: &[String]) -> Vec<CollectionSummary> {
    let mut counts: BTreeMap<&str, usize> = listed.iter().map(|name| (name.as_str(), 0)).collect();
    for moment in moments {
        *counts.entry(moment.collection.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(name, moment_count)| CollectionSummary {
            name: name.to_string(),
            moment_count,
        })
        .collect()
}

/// Stats derived from holdings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileStats {
    pub total_nfts: usize,
    pub eligible_moments: usize,
    pub collection_count: usize,
    pub is_eligible: bool,
    #[serde(default)]
    pub freshness: Freshness,
}

/// A wallet's NFT holdings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NftCollection {
    pub address: String,
    pub moments: Vec<Moment>,
    pub collections: Vec<CollectionSummary>,
    pub total_count: usize,
    pub is_eligible: bool,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub freshness: Freshness,
}

/// Materialized profile view of a wallet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileData {
    pub address: String,
    pub wallet_type: Option<String>,
    pub collections: Vec<CollectionSummary>,
    pub moments: Vec<Moment>,
    pub stats: ProfileStats,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub freshness: Freshness,
}

impl ProfileData {
    /// Replace holdings and stats, keeping the session fields.
    ///
    /// The profile is only as fresh as the least fresh of its parts.
    pub(crate) fn apply_collection(&mut self, nft: &NftCollection, stats: ProfileStats) {
        self.moments = nft.moments.clone();
        self.collections = nft.collections.clone();
        self.freshness = match (nft.freshness, stats.freshness) {
            (stale @ Freshness::Stale { .. }, _) | (_, stale @ Freshness::Stale { .. }) => stale,
            _ => Freshness::Live,
        };
        self.stats = stats;
        self.last_updated = Utc::now();
    }
}

/// Whether the session is in front of the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionActivity {
    #[default]
    Foreground,
    Background,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SyncState::default(), SyncState::Disconnected);
        assert_eq!(SyncState::Syncing.to_string(), "Syncing");
    }

    #[test]
    fn test_kind_events_roundtrip() {
        for kind in [SyncKind::Profile, SyncKind::Nft, SyncKind::Stats] {
            assert_eq!(SyncKind::from_event(kind.started_event()), Some(kind));
            assert_eq!(SyncKind::from_event(kind.completed_event()), Some(kind));
            assert_eq!(SyncKind::from_event(kind.failed_event()), Some(kind));
            assert!(kind.failed_event().is_failure());
        }
        assert_eq!(SyncKind::from_event(SyncEventType::WalletConnected), None);
        assert_eq!(SyncKind::Nft.cache_key("0xabc"), "nft:0xabc");
    }

    #[test]
    fn test_summarize_collections() {
        let moments = vec![
            Moment::new("1", "Genesis"),
            Moment::new("2", "Genesis"),
            Moment::new("3", "Rookies"),
        ];
        let listed = vec!["Genesis".to_string(), "Legends".to_string()];

        let summary = summarize_collections(&moments, &listed);
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0].name, "Genesis");
        assert_eq!(summary[0].moment_count, 2);
        assert_eq!(summary[1].name, "Legends");
        assert_eq!(summary[1].moment_count, 0);
        assert_eq!(summary[2].moment_count, 1);
    }

    #[test]
    fn test_freshness_serialization() {
        let json = serde_json::to_value(Freshness::Cached).unwrap();
        assert_eq!(json["kind"], "cached");
        assert!(!Freshness::Live.is_stale());
        assert!(Freshness::Stale { as_of: Utc::now() }.is_stale());
    }
}
