//! Fuzz target for cache payload decompression.
//!
//! This tests that `maybe_decompress` never panics on arbitrary input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use profile_sync_engine::cache::maybe_decompress;

fuzz_target!(|data: &[u8]| {
    let _ = maybe_decompress(data);
});
