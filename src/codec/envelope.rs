//! # Broadcast Envelope Codec
//!
//! Wraps a payload with addressing metadata for one-way delivery. The
//! envelope travels inside a single data-link frame, so integrity is already
//! covered by the frame check sequence; parsing here only checks structure.
//!
//! ```text
//! 0xB5 | 0x01 | source (BE u16) | destination (BE u16) | sequence | length | payload
//! ```

use crate::codec::config::Address;
use crate::constants::{
    ENVELOPE_HEADER_LEN, ENVELOPE_MAGIC, ENVELOPE_VERSION, MAX_ENVELOPE_PAYLOAD,
};
use crate::error::{E32Error, ParseError};
use bytes::Bytes;
use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u8};
use nom::sequence::tuple;
use nom::IResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastEnvelope {
    source: Address,
    destination: Address,
    sequence: u8,
    payload: Bytes,
}

impl BroadcastEnvelope {
    /// Builds an envelope; fails if the payload would not fit a single frame.
    pub fn new(
        source: Address,
        destination: Address,
        sequence: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Self, E32Error> {
        let payload = payload.into();
        if payload.len() > MAX_ENVELOPE_PAYLOAD {
            return Err(E32Error::InvalidFrameLength(
                payload.len() + ENVELOPE_HEADER_LEN,
            ));
        }
        Ok(Self {
            source,
            destination,
            sequence,
            payload,
        })
    }

    pub fn source(&self) -> Address {
        self.source
    }

    pub fn destination(&self) -> Address {
        self.destination
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination == Address::BROADCAST
    }

    /// True if a station at `address` should accept this envelope.
    pub fn is_for(&self, address: Address) -> bool {
        self.is_broadcast() || self.destination == address
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.payload.len());
        out.push(ENVELOPE_MAGIC);
        out.push(ENVELOPE_VERSION);
        out.extend_from_slice(&self.source.0.to_be_bytes());
        out.extend_from_slice(&self.destination.0.to_be_bytes());
        out.push(self.sequence);
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return Err(ParseError::Malformed(format!(
                "truncated header: {} of {} bytes",
                bytes.len(),
                ENVELOPE_HEADER_LEN
            )));
        }

        let (rest, (magic, version, source, destination, sequence, length)) =
            parse_header(bytes).map_err(|e| ParseError::Malformed(format!("{e:?}")))?;

        if magic != ENVELOPE_MAGIC {
            return Err(ParseError::Malformed(format!("bad magic 0x{magic:02X}")));
        }
        if version != ENVELOPE_VERSION {
            return Err(ParseError::Malformed(format!(
                "unsupported version {version}"
            )));
        }

        let (rest, payload) = parse_payload(rest, length as usize).map_err(|_| {
            ParseError::Malformed(format!(
                "truncated payload: {} of {} bytes",
                bytes.len() - ENVELOPE_HEADER_LEN,
                length
            ))
        })?;
        if !rest.is_empty() {
            return Err(ParseError::Malformed(format!(
                "{} trailing bytes",
                rest.len()
            )));
        }

        Ok(Self {
            source: Address(source),
            destination: Address(destination),
            sequence,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

type Header = (u8, u8, u16, u16, u8, u8);

fn parse_header(input: &[u8]) -> IResult<&[u8], Header> {
    tuple((be_u8, be_u8, be_u16, be_u16, be_u8, be_u8))(input)
}

fn parse_payload(input: &[u8], length: usize) -> IResult<&[u8], &[u8]> {
    take(length)(input)
}
