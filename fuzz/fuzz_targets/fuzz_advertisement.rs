//! Fuzz target for server responses: ref advertisements, v2 ref lines and
//! push status reports.

#![no_main]

use gitwire_protocol::{Advertisement, PktLineReader, Ref, StatusReport};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = Advertisement::read(&mut PktLineReader::new(data));
    let _ = StatusReport::read(&mut PktLineReader::new(data));

    if let Ok(s) = std::str::from_utf8(data) {
        for line in s.lines() {
            let _ = Ref::parse_v2(line);
        }
    }
});
