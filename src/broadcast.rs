//! # Broadcast Layer
//!
//! One-way delivery of addressed payloads. Outbound payloads are wrapped in a
//! [`BroadcastEnvelope`] carrying this station's address and a per-sender
//! sequence number, then framed by the [`DataLink`]. A drain task parses every
//! inbound frame; a frame that is not a valid envelope is reported as an
//! `Error` event and the drain keeps going.

use crate::codec::{Address, BroadcastEnvelope};
use crate::constants::EVENT_CAPACITY;
use crate::error::{E32Error, ParseError};
use crate::link::{DataLink, LinkEvent};
use bytes::Bytes;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastEvent {
    /// An envelope was handed to the link.
    Sent(BroadcastEnvelope),
    /// A well-formed envelope arrived.
    Message(BroadcastEnvelope),
    /// An inbound frame was not a valid envelope.
    Error(ParseError),
}

struct Inner {
    link: DataLink,
    source: watch::Receiver<Address>,
    destination: Address,
    sequence: AtomicU8,
    events: broadcast::Sender<BroadcastEvent>,
    drain: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

#[derive(Clone)]
pub struct BroadcastLayer {
    inner: Arc<Inner>,
}

impl BroadcastLayer {
    /// Sends to every station, tagging envelopes with `source`.
    pub fn new(link: DataLink, source: Address) -> Self {
        Self::with_destination(link, source, Address::BROADCAST)
    }

    pub fn with_destination(link: DataLink, source: Address, destination: Address) -> Self {
        let (_, source) = watch::channel(source);
        Self::spawn(link, source, destination)
    }

    /// Sends to every station, tagging each envelope with the address
    /// `source` holds at the time of sending.
    pub fn following(link: DataLink, source: watch::Receiver<Address>) -> Self {
        Self::spawn(link, source, Address::BROADCAST)
    }

    fn spawn(link: DataLink, source: watch::Receiver<Address>, destination: Address) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let drain = tokio::spawn(drain(link.subscribe(), events.clone()));

        BroadcastLayer {
            inner: Arc::new(Inner {
                link,
                source,
                destination,
                sequence: AtomicU8::new(0),
                events,
                drain,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.inner.events.subscribe()
    }

    /// Address the next envelope will carry.
    pub fn source(&self) -> Address {
        *self.inner.source.borrow()
    }

    /// Wraps `payload` and sends it. Returns the envelope that went out.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<BroadcastEnvelope, E32Error> {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let envelope = BroadcastEnvelope::new(
            self.source(),
            self.inner.destination,
            sequence,
            payload,
        )?;

        self.inner.link.try_send(&envelope.serialize()).await?;
        log::debug!(
            "Broadcast #{} from {} to {} ({} bytes)",
            sequence,
            envelope.source(),
            envelope.destination(),
            envelope.payload().len()
        );
        let _ = self.inner.events.send(BroadcastEvent::Sent(envelope.clone()));
        Ok(envelope)
    }

    /// Stops the drain. Idempotent.
    pub fn close(&self) {
        self.inner.drain.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.drain.is_finished()
    }
}

async fn drain(mut rx: broadcast::Receiver<LinkEvent>, events: broadcast::Sender<BroadcastEvent>) {
    loop {
        match rx.recv().await {
            Ok(LinkEvent::Message(frame)) => {
                let event = match BroadcastEnvelope::parse(&frame) {
                    Ok(envelope) => {
                        log::debug!(
                            "Envelope #{} from {} ({} bytes)",
                            envelope.sequence(),
                            envelope.source(),
                            envelope.payload().len()
                        );
                        BroadcastEvent::Message(envelope)
                    }
                    Err(err) => {
                        log::warn!("Discarding frame that is not an envelope: {err}");
                        BroadcastEvent::Error(err)
                    }
                };
                let _ = events.send(event);
            }
            Ok(LinkEvent::Closed) | Err(RecvError::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => log::warn!("Broadcast drain lagged, {n} frames lost"),
        }
    }
    log::debug!("Broadcast drain stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::MockPins;
    use crate::transport::{SimulatedModule, Transport};
    use std::time::Duration;

    async fn next(rx: &mut broadcast::Receiver<BroadcastEvent>) -> BroadcastEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no broadcast event")
            .expect("broadcast stream closed")
    }

    #[tokio::test]
    async fn test_send_numbers_envelopes() {
        let (sim, host) = SimulatedModule::spawn(MockPins::new());
        sim.set_echo(false);
        let layer = BroadcastLayer::new(DataLink::new(Transport::new(host)), Address(0x0102));
        let mut events = layer.subscribe();

        let first = layer.send(&b"one"[..]).await.unwrap();
        let second = layer.send(&b"two"[..]).await.unwrap();

        assert_eq!(first.sequence(), 0);
        assert_eq!(second.sequence(), 1);
        assert!(first.is_broadcast());
        assert_eq!(next(&mut events).await, BroadcastEvent::Sent(first));
    }

    #[tokio::test]
    async fn test_drain_survives_garbage() {
        let (sim, host) = SimulatedModule::spawn(MockPins::new());
        let layer = BroadcastLayer::new(DataLink::new(Transport::new(host)), Address(0x0001));
        let mut events = layer.subscribe();

        sim.inject_frame(b"not an envelope").await.unwrap();
        assert!(matches!(next(&mut events).await, BroadcastEvent::Error(_)));

        let envelope =
            BroadcastEnvelope::new(Address(0x0203), Address::BROADCAST, 9, &b"hello"[..]).unwrap();
        sim.inject_frame(&envelope.serialize()).await.unwrap();
        assert_eq!(next(&mut events).await, BroadcastEvent::Message(envelope));
    }

    #[tokio::test]
    async fn test_following_layer_reads_address_at_send_time() {
        let (sim, host) = SimulatedModule::spawn(MockPins::new());
        sim.set_echo(false);
        let (address_tx, address_rx) = watch::channel(Address(0x0001));
        let layer = BroadcastLayer::following(DataLink::new(Transport::new(host)), address_rx);

        let before = layer.send(&b"a"[..]).await.unwrap();
        address_tx.send_replace(Address(0x0BEE));
        let after = layer.send(&b"b"[..]).await.unwrap();

        assert_eq!(before.source(), Address(0x0001));
        assert_eq!(after.source(), Address(0x0BEE));
        assert_eq!(layer.source(), Address(0x0BEE));
    }

    #[tokio::test]
    async fn test_link_close_stops_drain() {
        let (_sim, host) = SimulatedModule::spawn(MockPins::new());
        let link = DataLink::new(Transport::new(host));
        let layer = BroadcastLayer::new(link.clone(), Address(0x0001));

        link.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(layer.is_closed());
    }
}
