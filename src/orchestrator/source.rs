// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! NFT ownership source abstraction.
//!
//! The orchestrator never talks to a chain or an indexer directly. Hosts
//! provide an [`NftOwnershipSource`]; every call through it is wrapped in the
//! endpoint's circuit breaker, the retry executor and a tier-derived timeout.
//!
//! # Implementing
//!
//! Returned futures may only borrow `self`. Copy any argument the future needs:
//!
//! ```rust,ignore
//! fn get_ownership(&self, address: &str, force_refresh: bool) -> BoxFuture<'_, Ownership> {
//!     let address = address.to_string();
//!     Box::pin(async move { self.client.fetch(&address, force_refresh).await })
//! }
//! ```

use crate::error::BoxFuture;
use serde::{Deserialize, Serialize};

/// A single ownable collectible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Moment {
    pub id: String,
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<u64>,
}

impl Moment {
    pub fn new(id: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            name: None,
            serial_number: None,
        }
    }
}

/// Holdings of one wallet as reported by the ownership source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ownership {
    pub moments: Vec<Moment>,
    pub collections: Vec<String>,
    pub total_count: usize,
    pub is_eligible: bool,
}

/// Where wallet holdings come from.
///
/// Errors should be classified at the throw site; anything unclassified is
/// best reported as [`crate::SyncError::Server`] so it is retried.
pub trait NftOwnershipSource: Send + Sync + 'static {
    /// Endpoint name used to key the circuit breaker.
    fn endpoint(&self) -> &str {
        "nft_ownership"
    }

    fn get_ownership(&self, address: &str, force_refresh: bool) -> BoxFuture<'_, Ownership>;

    fn get_eligible_moments(&self, address: &str) -> BoxFuture<'_, Vec<Moment>>;
}
