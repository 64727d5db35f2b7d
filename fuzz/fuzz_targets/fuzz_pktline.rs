//! Fuzz target for pkt-line framing and side-band demultiplexing.
//!
//! Tests that the readers handle arbitrary input without panicking.

#![no_main]

use gitwire_protocol::sideband::SideBandReader;
use gitwire_protocol::PktLineReader;
use libfuzzer_sys::fuzz_target;
use std::io::Read;

fuzz_target!(|data: &[u8]| {
    let mut reader = PktLineReader::new(data);

    // Bounded so crafted input cannot loop forever.
    for _ in 0..1000 {
        match reader.read() {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }

    let mut sideband = SideBandReader::new(PktLineReader::new(data), None);
    let mut sink = Vec::new();
    let _ = sideband.read_to_end(&mut sink);
});
