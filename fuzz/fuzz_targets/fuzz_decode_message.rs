//! Fuzz target for message decoding.
//!
//! This tests that `decode` and `decode_verified` never panic on arbitrary
//! stream payloads, compressed or not.

#![no_main]

use libfuzzer_sys::fuzz_target;
use replication_task_processor::codec::{compute_content_hash, decode, decode_verified};

fuzz_target!(|data: &[u8]| {
    let _ = decode(data);

    // Hash of the raw bytes only matches for uncompressed payloads
    let hash = compute_content_hash(data);
    let _ = decode_verified(data, &hash);
});
