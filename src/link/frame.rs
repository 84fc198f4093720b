//! # Frame Codec
//!
//! Every application message crosses the air as one frame:
//!
//! ```text
//! +------+-----+-------------------+----------+
//! | 0x7E | LEN | payload (LEN)     | CRC16 BE |
//! +------+-----+-------------------+----------+
//! ```
//!
//! `LEN` is 1..=255. The CRC is CRC-16/IBM-3740 (poly 0x1021, init 0xFFFF)
//! over `LEN` and the payload.
//!
//! [`FrameDecoder`] is a byte-at-a-time state machine, so the frames it yields
//! do not depend on how the input was chunked. It has no clock; the caller
//! decides when a partial frame has waited too long and calls
//! [`FrameDecoder::abandon`].

use crate::constants::{FRAME_CRC_LEN, FRAME_HEADER_LEN, FRAME_START, MAX_FRAME_PAYLOAD};
use crate::error::{E32Error, LinkError};
use bytes::Bytes;
use crc::{Crc, CRC_16_IBM_3740};
use std::collections::VecDeque;

static FRAME_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Why a partially received frame was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The transport ended mid-frame.
    EndOfStream,
    /// No byte arrived within the inter-byte timeout.
    InterByteTimeout,
    /// The link fell behind the transport and bytes were lost.
    Overrun,
    /// Register traffic interrupted the frame.
    Suspended,
}

/// A frame that was begun but never completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropInfo {
    pub reason: DropReason,
    /// Bytes received after the start marker.
    pub partial: Bytes,
    /// Payload length announced by the frame, if it got that far.
    pub expected: Option<usize>,
}

/// Events published by the data link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A complete frame passed its checksum.
    Message(Bytes),
    /// A structural fault; the offending bytes were discarded.
    Error(LinkError),
    Dropped(DropInfo),
    /// The link stopped; nothing follows.
    Closed,
}

/// CRC over the length byte and the payload.
pub fn frame_checksum(len: u8, payload: &[u8]) -> u16 {
    let mut digest = FRAME_CRC.digest();
    digest.update(&[len]);
    digest.update(payload);
    digest.finalize()
}

/// Wraps `payload` in a frame. Fails unless it is 1..=255 bytes long.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, E32Error> {
    let len = match u8::try_from(payload.len()) {
        Ok(len) if len > 0 => len,
        _ => return Err(E32Error::InvalidFrameLength(payload.len())),
    };

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len() + FRAME_CRC_LEN);
    frame.push(FRAME_START);
    frame.push(len);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&frame_checksum(len, payload).to_be_bytes());
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Hunting for a start marker.
    Idle,
    /// Start seen, waiting for the length byte.
    Length,
    /// Collecting payload and CRC.
    Body { len: usize },
}

/// Reassembles frames from an arbitrarily chunked byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
    /// Length byte, payload and CRC of the frame in progress.
    buf: Vec<u8>,
    /// Bytes of a rejected frame, re-examined for a start marker.
    replay: VecDeque<u8>,
    noise: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            state: State::Idle,
            buf: Vec::with_capacity(1 + MAX_FRAME_PAYLOAD + FRAME_CRC_LEN),
            replay: VecDeque::new(),
            noise: 0,
        }
    }

    /// True while a frame has been started but not finished.
    pub fn is_accumulating(&self) -> bool {
        self.state != State::Idle
    }

    /// Bytes discarded outside any frame since the last call.
    pub fn take_noise(&mut self) -> usize {
        std::mem::take(&mut self.noise)
    }

    /// Consumes `data` and returns the events it completes, in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        for &byte in data {
            self.step(byte, &mut events);
            while let Some(replayed) = self.replay.pop_front() {
                self.step(replayed, &mut events);
            }
        }
        events
    }

    /// Discards the frame in progress, if any.
    pub fn abandon(&mut self, reason: DropReason) -> Option<DropInfo> {
        let expected = match self.state {
            State::Idle => return None,
            State::Length => None,
            State::Body { len } => Some(len),
        };

        self.state = State::Idle;
        let partial = Bytes::from(std::mem::take(&mut self.buf));
        Some(DropInfo {
            reason,
            partial,
            expected,
        })
    }

    fn step(&mut self, byte: u8, events: &mut Vec<LinkEvent>) {
        match self.state {
            State::Idle => {
                if byte == FRAME_START {
                    self.buf.clear();
                    self.state = State::Length;
                } else {
                    self.noise += 1;
                }
            }
            State::Length => {
                if byte == 0 {
                    self.state = State::Idle;
                    events.push(LinkEvent::Error(LinkError::InvalidLength(0)));
                } else {
                    self.buf.push(byte);
                    self.state = State::Body {
                        len: byte as usize,
                    };
                }
            }
            State::Body { len } => {
                self.buf.push(byte);
                if self.buf.len() == 1 + len + FRAME_CRC_LEN {
                    self.complete(len, events);
                }
            }
        }
    }

    fn complete(&mut self, len: usize, events: &mut Vec<LinkEvent>) {
        self.state = State::Idle;
        let frame = std::mem::take(&mut self.buf);

        let payload = &frame[1..1 + len];
        let expected = u16::from_be_bytes([frame[1 + len], frame[2 + len]]);
        let calculated = frame_checksum(frame[0], payload);

        if expected == calculated {
            events.push(LinkEvent::Message(Bytes::copy_from_slice(payload)));
            return;
        }

        events.push(LinkEvent::Error(LinkError::Checksum {
            expected,
            calculated,
        }));
        // The start marker may have been noise; a real frame can hide in what followed.
        for &byte in frame.iter().rev() {
            self.replay.push_front(byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn messages(events: &[LinkEvent]) -> Vec<Bytes> {
        events
            .iter()
            .filter_map(|e| match e {
                LinkEvent::Message(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_encode_layout() {
        let frame = encode_frame(b"hi").unwrap();
        assert_eq!(&frame[..4], &[0x7E, 0x02, b'h', b'i']);
        let crc = frame_checksum(2, b"hi");
        assert_eq!(&frame[4..], &crc.to_be_bytes());
    }

    #[test]
    fn test_checksum_reference_value() {
        let mut digest = FRAME_CRC.digest();
        digest.update(b"123456789");
        assert_eq!(digest.finalize(), 0x29B1);
    }

    #[test]
    fn test_encode_rejects_bad_lengths() {
        assert_eq!(encode_frame(&[]), Err(E32Error::InvalidFrameLength(0)));
        assert_eq!(
            encode_frame(&[0u8; 256]),
            Err(E32Error::InvalidFrameLength(256))
        );
        assert!(encode_frame(&[0u8; 255]).is_ok());
    }

    #[test]
    fn test_two_frames_in_one_chunk() {
        let mut stream = encode_frame(b"first").unwrap();
        stream.extend(encode_frame(b"second").unwrap());

        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(&stream);
        assert_eq!(
            events,
            vec![
                LinkEvent::Message(Bytes::from_static(b"first")),
                LinkEvent::Message(Bytes::from_static(b"second")),
            ]
        );
        assert!(!decoder.is_accumulating());
    }

    #[test]
    fn test_noise_is_counted_and_skipped() {
        let mut stream = vec![0x00, 0x11, 0x22];
        stream.extend(encode_frame(b"ok").unwrap());

        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(&stream);
        assert_eq!(messages(&events), vec![Bytes::from_static(b"ok")]);
        assert_eq!(decoder.take_noise(), 3);
        assert_eq!(decoder.take_noise(), 0);
    }

    #[test]
    fn test_corrupt_frame_reports_checksum() {
        let mut frame = encode_frame(b"payload").unwrap();
        frame[4] ^= 0x01;

        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(&frame);
        assert!(matches!(
            events.first(),
            Some(LinkEvent::Error(LinkError::Checksum { .. }))
        ));
        assert!(messages(&events).is_empty());
    }

    #[test]
    fn test_false_start_resynchronizes() {
        // A stray start marker claims a 3-byte payload, swallowing the head of a real frame.
        let mut stream = vec![0x7E, 0x03];
        stream.extend(encode_frame(b"real frame").unwrap());

        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(&stream);
        assert!(matches!(
            events.first(),
            Some(LinkEvent::Error(LinkError::Checksum { .. }))
        ));
        assert_eq!(messages(&events), vec![Bytes::from_static(b"real frame")]);
    }

    #[test]
    fn test_zero_length_is_rejected() {
        let mut stream = vec![0x7E, 0x00];
        stream.extend(encode_frame(b"x").unwrap());

        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(&stream);
        assert_eq!(events[0], LinkEvent::Error(LinkError::InvalidLength(0)));
        assert_eq!(messages(&events), vec![Bytes::from_static(b"x")]);
    }

    #[test]
    fn test_abandon_reports_partial_once() {
        let frame = encode_frame(b"interrupted").unwrap();
        let mut decoder = FrameDecoder::new();

        assert!(decoder.feed(&frame[..6]).is_empty());
        let info = decoder.abandon(DropReason::EndOfStream).unwrap();
        assert_eq!(info.reason, DropReason::EndOfStream);
        assert_eq!(info.expected, Some(11));
        assert_eq!(&info.partial[..], &frame[1..6]);

        assert!(decoder.abandon(DropReason::EndOfStream).is_none());
    }

    #[test]
    fn test_abandon_after_start_only() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[0x7E]);
        let info = decoder.abandon(DropReason::InterByteTimeout).unwrap();
        assert_eq!(info.expected, None);
        assert!(info.partial.is_empty());
    }

    proptest! {
        #[test]
        fn prop_chunking_does_not_change_messages(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..8),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..16),
        ) {
            let stream: Vec<u8> = payloads
                .iter()
                .flat_map(|p| encode_frame(p).unwrap())
                .collect();

            let mut whole = FrameDecoder::new();
            let expected = whole.feed(&stream);

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(stream.len())).collect();
            points.sort_unstable();
            points.dedup();

            let mut chunked = FrameDecoder::new();
            let mut events = Vec::new();
            let mut start = 0;
            for point in points.into_iter().chain(std::iter::once(stream.len())) {
                events.extend(chunked.feed(&stream[start..point]));
                start = point;
            }

            prop_assert_eq!(&events, &expected);
            let want: Vec<Bytes> = payloads.into_iter().map(Bytes::from).collect();
            prop_assert_eq!(messages(&events), want);
        }

        #[test]
        fn prop_truncated_frame_drops_exactly_once(
            payload in prop::collection::vec(any::<u8>(), 1..128),
            cut in any::<prop::sample::Index>(),
        ) {
            let frame = encode_frame(&payload).unwrap();
            let keep = 1 + cut.index(frame.len() - 1);

            let mut decoder = FrameDecoder::new();
            let events = decoder.feed(&frame[..keep]);
            prop_assert!(messages(&events).is_empty());

            let dropped = decoder.abandon(DropReason::EndOfStream);
            prop_assert!(dropped.is_some());
            prop_assert!(decoder.abandon(DropReason::EndOfStream).is_none());
        }

        #[test]
        fn prop_arbitrary_input_never_panics(data in prop::collection::vec(any::<u8>(), 0..600)) {
            let mut decoder = FrameDecoder::new();
            let _ = decoder.feed(&data);
            let _ = decoder.abandon(DropReason::EndOfStream);
        }
    }
}
