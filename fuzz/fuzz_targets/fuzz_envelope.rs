#![no_main]

use e32_link::codec::BroadcastEnvelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = BroadcastEnvelope::parse(data) {
        assert_eq!(envelope.serialize(), data);
    }
});
