//! Fuzz target for pack file parsing.
//!
//! Tests that the pack reader handles arbitrary input without panicking.

#![no_main]

use gitwire_protocol::PackReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(reader) = PackReader::new(data) {
        // Bounded so a huge declared object count cannot stall the run.
        for entry in reader.take(1000) {
            if entry.is_err() {
                break;
            }
        }
    }
});
