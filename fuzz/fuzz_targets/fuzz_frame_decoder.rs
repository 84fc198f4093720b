#![no_main]

use e32_link::link::{FrameDecoder, LinkEvent};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    // First byte picks the chunk size; the rest is the line.
    let chunk = (data[0] as usize % 32) + 1;
    let line = &data[1..];

    let mut whole = FrameDecoder::new();
    let expected = whole.feed(line);

    let mut split = FrameDecoder::new();
    let mut events = Vec::new();
    for piece in line.chunks(chunk) {
        events.extend(split.feed(piece));
    }
    assert_eq!(events, expected);

    for event in &events {
        if let LinkEvent::Message(payload) = event {
            assert!(!payload.is_empty() && payload.len() <= 255);
        }
    }
});
