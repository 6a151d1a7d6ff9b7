//! Fuzz target for reading restored cache entries.
//!
//! Arbitrary bytes stored raw must read back as a miss or a value, never a
//! panic, and an unreadable entry must be gone afterwards.

#![no_main]

use libfuzzer_sys::fuzz_target;
use profile_sync_engine::config::CacheConfig;
use profile_sync_engine::{CacheOptions, IntelligentCache};

fuzz_target!(|input: (bool, &[u8])| {
    let (compressed, data) = input;
    let cache = IntelligentCache::new(CacheConfig::default());
    if cache
        .set_raw("fuzz", data.to_vec(), compressed, CacheOptions::new())
        .is_err()
    {
        return;
    }

    if cache.get::<serde_json::Value>("fuzz").is_none() {
        assert!(!cache.contains("fuzz"));
    }
    let _ = cache.get_stale::<serde_json::Value>("fuzz");
});
