//! Fuzz target for feed frame decoding.
//!
//! Frames come straight off the network, so decoding must never panic and
//! anything it accepts must be usable by the handlers.

#![no_main]

use firehose_mirror::envelope::{parse_frame, RecordRef};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Should never panic
    if let Ok(Some(envelope)) = parse_frame(text) {
        assert!(envelope.time_us >= 0);
        assert!(!envelope.actor_id.is_empty());
        assert!(!envelope.record_key.is_empty());

        // Accepted envelopes always yield a URI that parses back
        let uri = envelope.record_uri();
        let parsed = RecordRef::parse(&uri).expect("accepted envelope produced unparseable uri");
        assert_eq!(parsed.record_key, envelope.record_key);
    }
});
