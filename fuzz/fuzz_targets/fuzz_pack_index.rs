//! Fuzz target for pack index parsing.

#![no_main]

use gitwire_protocol::PackIndex;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(index) = PackIndex::parse(data) {
        let mut out = Vec::new();
        index.write(&mut out, index.version()).expect("parsed index must write");
        let reparsed = PackIndex::parse(&out).expect("written index must parse");
        assert_eq!(reparsed.entries(), index.entries());
        for entry in index.entries() {
            assert_eq!(index.lookup(&entry.id), Some(entry.offset));
        }
    }
});
