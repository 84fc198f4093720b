//! Broadcast envelopes end to end.

use e32_link::{
    Address, BroadcastEnvelope, BroadcastEvent, BroadcastLayer, DataLink, MockPins, ParseError,
    SimulatedModule, Transport,
};
use std::time::Duration;
use tokio::sync::broadcast;

async fn next(rx: &mut broadcast::Receiver<BroadcastEvent>) -> BroadcastEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no broadcast event")
        .expect("broadcast stream closed")
}

fn rig(source: Address) -> (SimulatedModule, BroadcastLayer) {
    let (sim, stream) = SimulatedModule::spawn(MockPins::new());
    let layer = BroadcastLayer::new(DataLink::new(Transport::new(stream)), source);
    (sim, layer)
}

#[tokio::test]
async fn test_echoed_envelope_is_parsed() {
    let (_sim, layer) = rig(Address(0x0A0B));
    let mut events = layer.subscribe();

    let sent = layer.send(&b"temperature=21.5"[..]).await.unwrap();

    assert_eq!(next(&mut events).await, BroadcastEvent::Sent(sent.clone()));
    match next(&mut events).await {
        BroadcastEvent::Message(received) => {
            assert_eq!(received, sent);
            assert_eq!(received.source(), Address(0x0A0B));
            assert!(received.is_for(Address(0x0001)));
        }
        other => panic!("expected the echoed envelope, got {other:?}"),
    }
}

#[tokio::test]
async fn test_truncated_envelope_does_not_stop_drain() {
    let (sim, layer) = rig(Address(0x0001));
    sim.set_echo(false);
    let mut events = layer.subscribe();

    let good = BroadcastEnvelope::new(Address(0x0002), Address::BROADCAST, 1, &b"ok"[..]).unwrap();
    let mut truncated = good.serialize();
    truncated.truncate(truncated.len() - 1);

    sim.inject_frame(&truncated).await.unwrap();
    sim.inject_frame(&good.serialize()).await.unwrap();

    match next(&mut events).await {
        BroadcastEvent::Error(ParseError::Malformed(msg)) => assert!(msg.contains("truncated")),
        other => panic!("expected a parse error, got {other:?}"),
    }
    assert_eq!(next(&mut events).await, BroadcastEvent::Message(good));
}

#[tokio::test]
async fn test_corrupted_envelope_does_not_stop_drain() {
    let (sim, layer) = rig(Address(0x0001));
    sim.set_echo(false);
    let mut events = layer.subscribe();

    let good =
        BroadcastEnvelope::new(Address(0x0003), Address(0x0001), 200, &b"direct"[..]).unwrap();
    let mut corrupted = good.serialize();
    corrupted[0] = 0x00;

    sim.inject_frame(&corrupted).await.unwrap();
    sim.inject_frame(&good.serialize()).await.unwrap();

    assert!(matches!(next(&mut events).await, BroadcastEvent::Error(_)));
    match next(&mut events).await {
        BroadcastEvent::Message(envelope) => {
            assert_eq!(envelope.sequence(), 200);
            assert!(!envelope.is_broadcast());
            assert!(envelope.is_for(Address(0x0001)));
            assert!(!envelope.is_for(Address(0x0002)));
        }
        other => panic!("expected the envelope, got {other:?}"),
    }
}

#[tokio::test]
async fn test_oversized_payload_is_refused() {
    let (sim, layer) = rig(Address(0x0001));

    assert!(layer.send(vec![0u8; 250]).await.is_err());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sim.received().is_empty());
}

#[tokio::test]
async fn test_directed_layer_sets_destination() {
    let (sim, stream) = SimulatedModule::spawn(MockPins::new());
    sim.set_echo(false);
    let layer = BroadcastLayer::with_destination(
        DataLink::new(Transport::new(stream)),
        Address(0x0001),
        Address(0x0042),
    );

    let envelope = layer.send(&b"hi"[..]).await.unwrap();
    assert_eq!(envelope.destination(), Address(0x0042));
    assert!(!envelope.is_broadcast());
}
