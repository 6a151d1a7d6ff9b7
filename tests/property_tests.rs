//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

use profile_sync_engine::cache::maybe_decompress;
use profile_sync_engine::config::{CacheConfig, ConnectionConfig, OfflineQueueConfig};
use profile_sync_engine::connection::AlwaysOnline;
use profile_sync_engine::{
    execute_with_retry, handler_fn, CacheOptions, CircuitBreaker, CircuitConfig, ConnectionMonitor,
    EventBus, IntelligentCache, MemoryStore, OfflineQueue, OperationRegistry, Priority,
    RetryPolicy, SyncError, SyncEventType,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn instant_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter: 0.0,
        ..RetryPolicy::default()
    }
}

// =============================================================================
// Compression Properties
// =============================================================================

proptest! {
    /// Data without the zstd magic passes through untouched
    #[test]
    fn decompress_passthrough_non_zstd(data in prop::collection::vec(any::<u8>(), 0..1000)) {
        prop_assume!(data.len() < 4 || data[..4] != [0x28, 0xB5, 0x2F, 0xFD]);
        prop_assert_eq!(maybe_decompress(&data).unwrap(), data);
    }

    /// Compressed data decompresses to the original
    #[test]
    fn decompress_zstd_roundtrip(data in prop::collection::vec(any::<u8>(), 1..10000)) {
        let compressed = zstd::encode_all(&data[..], 3).unwrap();
        prop_assert_eq!(maybe_decompress(&compressed).unwrap(), data);
    }

    /// Garbage after the magic bytes is an error, never a panic
    #[test]
    fn decompress_corrupted_zstd_no_panic(garbage in prop::collection::vec(any::<u8>(), 0..500)) {
        let mut data = vec![0x28, 0xB5, 0x2F, 0xFD];
        data.extend(garbage);
        let _ = maybe_decompress(&data);
    }
}

// =============================================================================
// Cache Properties
// =============================================================================

#[derive(Debug, Clone)]
enum CacheOp {
    Set(u8),
    Get(u8),
    Invalidate(u8),
}

fn cache_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (0u8..40).prop_map(CacheOp::Set),
        (0u8..40).prop_map(CacheOp::Get),
        (0u8..40).prop_map(CacheOp::Invalidate),
    ]
}

proptest! {
    /// No sequence of operations pushes the cache past its entry bound
    #[test]
    fn cache_never_exceeds_max_entries(
        max_entries in 1usize..16,
        ops in prop::collection::vec(cache_op(), 0..200),
    ) {
        let cache = IntelligentCache::new(CacheConfig {
            max_entries,
            ..CacheConfig::default()
        });
        for op in ops {
            match op {
                CacheOp::Set(k) => cache.set(&format!("k{}", k), &k, CacheOptions::new()).unwrap(),
                CacheOp::Get(k) => {
                    let _ = cache.get::<u8>(&format!("k{}", k));
                }
                CacheOp::Invalidate(k) => {
                    cache.invalidate(&format!("k{}", k));
                }
            }
            prop_assert!(cache.len() <= max_entries);
        }
    }

    /// The most recently written key always survives eviction
    #[test]
    fn cache_keeps_latest_write(max_entries in 1usize..8, keys in prop::collection::vec(0u8..50, 1..100)) {
        let cache = IntelligentCache::new(CacheConfig {
            max_entries,
            ..CacheConfig::default()
        });
        for k in &keys {
            cache.set(&format!("k{}", k), k, CacheOptions::new()).unwrap();
        }
        let last = *keys.last().unwrap();
        prop_assert_eq!(cache.get::<u8>(&format!("k{}", last)), Some(last));
    }

    /// Tag invalidation removes exactly the tagged entries
    #[test]
    fn cache_tag_invalidation_is_exact(tagged in prop::collection::vec(any::<bool>(), 1..30)) {
        let cache = IntelligentCache::new(CacheConfig::default());
        for (i, is_profile) in tagged.iter().enumerate() {
            let tag = if *is_profile { "profile" } else { "nft" };
            cache.set(&format!("k{}", i), &i, CacheOptions::new().tags([tag])).unwrap();
        }

        let removed = cache.invalidate_by_tags(&["profile"]);
        prop_assert_eq!(removed, tagged.iter().filter(|t| **t).count());
        for (i, is_profile) in tagged.iter().enumerate() {
            prop_assert_eq!(cache.contains(&format!("k{}", i)), !*is_profile);
        }
    }
}

// =============================================================================
// Retry and Circuit Properties
// =============================================================================

proptest! {
    /// Backoff never shrinks between attempts and never exceeds the ceiling
    #[test]
    fn backoff_monotonic_and_bounded(
        base_ms in 1u64..1000,
        max_ms in 1u64..60_000,
        multiplier in 1.0f64..4.0,
        attempts in 1u32..200,
    ) {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_multiplier: multiplier,
            ..RetryPolicy::default()
        };
        let mut previous = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = policy.delay_for_attempt(attempt);
            prop_assert!(delay <= policy.max_delay);
            prop_assert!(delay >= previous);
            previous = delay;
        }
    }

    /// An always-failing operation runs exactly max_attempts times
    #[test]
    fn retry_invocations_equal_max_attempts(max_attempts in 1u32..8) {
        let calls = AtomicU32::new(0);
        let result: Result<(), SyncError> = runtime().block_on(execute_with_retry(
            &instant_policy(max_attempts),
            "prop",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::server("prop", "down")) }
            },
        ));
        prop_assert!(result.is_err());
        prop_assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
    }

    /// The circuit opens after exactly `threshold` consecutive failures
    #[test]
    fn circuit_opens_at_threshold(threshold in 1u32..12) {
        let breaker = CircuitBreaker::new("prop", CircuitConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(60),
        });
        let invoked = AtomicU32::new(0);

        runtime().block_on(async {
            for _ in 0..threshold {
                prop_assert!(!breaker.is_open());
                let _: Result<(), _> = breaker
                    .call(|| async {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        Err(SyncError::network("prop", "refused"))
                    })
                    .await;
            }
            prop_assert!(breaker.is_open());

            let rejected: Result<(), _> = breaker
                .call(|| async {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            prop_assert!(rejected.unwrap_err().is_circuit_open());
            prop_assert_eq!(invoked.load(Ordering::SeqCst), threshold);
            Ok(())
        })?;
    }
}

// =============================================================================
// Offline Queue Ordering
// =============================================================================

fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
        Just(Priority::Critical),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Replay order is priority descending, then enqueue order
    #[test]
    fn queue_replays_by_priority_then_age(priorities in prop::collection::vec(priority(), 1..20)) {
        let executed = Arc::new(Mutex::new(Vec::new()));
        let order = runtime().block_on(async {
            let events = EventBus::new(100);
            let connection = Arc::new(ConnectionMonitor::new(
                Arc::new(AlwaysOnline),
                None,
                events.clone(),
                ConnectionConfig::default(),
            ));
            let registry = Arc::new(OperationRegistry::new());
            let sink = Arc::clone(&executed);
            registry.register("op", handler_fn(move |payload| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(payload["index"].as_u64().unwrap() as usize);
                    Ok(())
                }
            }));
            let queue = OfflineQueue::new(
                OfflineQueueConfig::default(),
                instant_policy(1),
                Arc::new(MemoryStore::new()),
                registry,
                connection,
                events,
            );

            for (index, priority) in priorities.iter().enumerate() {
                queue.enqueue("op", json!({ "index": index }), *priority).await.unwrap();
                // Distinct enqueue timestamps.
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            queue.process_queue().await;
            executed.lock().unwrap().clone()
        });

        let mut expected: Vec<usize> = (0..priorities.len()).collect();
        expected.sort_by(|a, b| priorities[*b].cmp(&priorities[*a]).then(a.cmp(b)));
        prop_assert_eq!(order, expected);
    }
}

// =============================================================================
// Event Bus
// =============================================================================

proptest! {
    /// History never exceeds its bound and keeps the newest events
    #[test]
    fn event_history_bounded(history_size in 1usize..50, emits in 0usize..200) {
        let bus = EventBus::new(history_size);
        for i in 0..emits {
            bus.emit(SyncEventType::NftSyncStarted, json!({ "i": i }), "prop");
        }
        let history = bus.get_event_history(None);
        prop_assert_eq!(history.len(), emits.min(history_size));
        if let Some(last) = history.last() {
            prop_assert_eq!(last.payload["i"].as_u64(), Some(emits as u64 - 1));
        }
    }
}
