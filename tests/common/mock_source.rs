//! Mock NftOwnershipSource for testing.
//!
//! Records every call (with its `force_refresh` flag) for assertions.
//! Holdings are set per address and can change between calls; failures and
//! latency can be injected.

use profile_sync_engine::{BoxFuture, ConnectivityProbe, Moment, NftOwnershipSource, Ownership, SyncError};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;

/// Scriptable ownership source.
///
/// # Example
/// ```rust,ignore
/// let source = MockOwnershipSource::new();
/// source.set_moments("0xABC", 2).await;
///
/// // Use in tests...
///
/// assert_eq!(source.ownership_calls(), 1);
/// ```
pub struct MockOwnershipSource {
    /// Holdings by address
    holdings: RwLock<HashMap<String, Vec<Moment>>>,
    /// `force_refresh` flag of each get_ownership() call
    force_flags: RwLock<Vec<bool>>,
    /// Counter for get_ownership() calls
    ownership_calls: AtomicUsize,
    /// Counter for get_eligible_moments() calls
    eligible_calls: AtomicUsize,
    /// Fail every call with a network error
    offline: AtomicBool,
    /// Fail this many upcoming calls with a server error
    fail_next: AtomicUsize,
    /// Fail this many upcoming get_eligible_moments() calls only
    fail_eligible_next: AtomicUsize,
    /// Simulated latency per call
    delay: Mutex<Duration>,
}

impl MockOwnershipSource {
    pub fn new() -> Self {
        Self {
            holdings: RwLock::new(HashMap::new()),
            force_flags: RwLock::new(Vec::new()),
            ownership_calls: AtomicUsize::new(0),
            eligible_calls: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            fail_eligible_next: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Give `address` exactly `count` moments.
    pub async fn set_moments(&self, address: &str, count: usize) {
        let moments = (0..count).map(|i| moment(address, i)).collect();
        self.holdings.write().await.insert(address.to_string(), moments);
    }

    /// A new moment appears in the wallet.
    pub async fn add_moment(&self, address: &str) {
        let mut holdings = self.holdings.write().await;
        let moments = holdings.entry(address.to_string()).or_default();
        let next = moments.len();
        moments.push(moment(address, next));
    }

    // =========================================================================
    // Failure Injection
    // =========================================================================

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn fail_eligible_next(&self, count: usize) {
        self.fail_eligible_next.store(count, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    // =========================================================================
    // Assertions
    // =========================================================================

    pub fn ownership_calls(&self) -> usize {
        self.ownership_calls.load(Ordering::SeqCst)
    }

    pub fn eligible_calls(&self) -> usize {
        self.eligible_calls.load(Ordering::SeqCst)
    }

    pub async fn force_flags(&self) -> Vec<bool> {
        self.force_flags.read().await.clone()
    }

    async fn simulate(&self, operation: &str) -> Result<(), SyncError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::network(operation, "connection refused"));
        }
        if take_one(&self.fail_next) {
            return Err(SyncError::server(operation, "503 service unavailable"));
        }
        Ok(())
    }

    async fn moments_of(&self, address: &str) -> Vec<Moment> {
        self.holdings.read().await.get(address).cloned().unwrap_or_default()
    }
}

impl Default for MockOwnershipSource {
    fn default() -> Self {
        Self::new()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn moment(address: &str, index: usize) -> Moment {
    let collection = if index % 2 == 0 { "Genesis" } else { "Rookies" };
    let mut moment = Moment::new(format!("{}-{}", address, index), collection);
    moment.serial_number = Some(index as u64 + 1);
    moment
}

impl NftOwnershipSource for MockOwnershipSource {
    fn get_ownership(&self, address: &str, force_refresh: bool) -> BoxFuture<'_, Ownership> {
        let address = address.to_string();
        Box::pin(async move {
            self.ownership_calls.fetch_add(1, Ordering::SeqCst);
            self.force_flags.write().await.push(force_refresh);
            self.simulate("get_ownership").await?;

            let moments = self.moments_of(&address).await;
            let collections: BTreeSet<String> = moments.iter().map(|m| m.collection.clone()).collect();
            Ok(Ownership {
                total_count: moments.len(),
                collections: collections.into_iter().collect(),
                is_eligible: !moments.is_empty(),
                moments,
            })
        })
    }

    fn get_eligible_moments(&self, address: &str) -> BoxFuture<'_, Vec<Moment>> {
        let address = address.to_string();
        Box::pin(async move {
            self.eligible_calls.fetch_add(1, Ordering::SeqCst);
            self.simulate("get_eligible_moments").await?;
            if take_one(&self.fail_eligible_next) {
                return Err(SyncError::server("get_eligible_moments", "502 bad gateway"));
            }

            // Serial numbers up to 10 count toward eligibility.
            Ok(self
                .moments_of(&address)
                .await
                .into_iter()
                .filter(|m| m.serial_number.is_some_and(|s| s <= 10))
                .collect())
        })
    }
}

/// Probe whose answer tests flip.
pub struct ToggleProbe {
    online: AtomicBool,
}

impl ToggleProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl ConnectivityProbe for ToggleProbe {
    fn probe(&self) -> BoxFuture<'_, ()> {
        let online = self.online.load(Ordering::SeqCst);
        Box::pin(async move {
            if online {
                Ok(())
            } else {
                Err(SyncError::network("probe", "unreachable"))
            }
        })
    }
}
