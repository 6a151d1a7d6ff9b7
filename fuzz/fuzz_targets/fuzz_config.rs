//! Fuzz target for config parsing.
//!
//! Any JSON document must parse or fail cleanly, and a parsed config must
//! yield usable durations.

#![no_main]

use libfuzzer_sys::fuzz_target;
use profile_sync_engine::SyncConfig;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(config) = SyncConfig::from_json(text) {
        let _ = config.cache.default_ttl();
        let _ = config.retry.policy();
        let _ = config.circuit.circuit_config();
    }
});
