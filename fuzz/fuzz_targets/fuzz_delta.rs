//! Fuzz target for delta decoding and encoding.

#![no_main]

use gitwire_protocol::pack::{apply_delta, create_delta};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }
    // First byte picks the split between base and delta.
    let split = usize::from(data[0]) * data.len() / 256;
    let (base, delta) = data[1..].split_at(split.min(data.len() - 1));

    let _ = apply_delta(base, delta);

    // Anything we encode must decode back to the target.
    let encoded = create_delta(base, delta);
    let decoded = apply_delta(base, &encoded).expect("own delta must apply");
    assert_eq!(decoded, delta);
});
