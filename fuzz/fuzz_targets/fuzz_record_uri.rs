//! Fuzz target for record URI parsing.

#![no_main]

use firehose_mirror::envelope::RecordRef;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|uri: &str| {
    // Should never panic
    if let Some(parsed) = RecordRef::parse(uri) {
        // Anything that parses re-renders to the same string
        assert_eq!(parsed.uri(), uri);
    }
});
