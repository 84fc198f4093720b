//! # Data Link
//!
//! [`DataLink`] turns the transport's byte chunks into complete frames and
//! publishes them as [`LinkEvent`]s. A background task owns the
//! [`FrameDecoder`]: it feeds every chunk through it, abandons a partial frame
//! when the line goes quiet for [`LinkConfig::inter_byte_timeout`], and ignores
//! [`TransportEvent::Register`] chunks: while the module is in Sleep the serial
//! line carries register replies instead of air traffic.
//!
//! Sends are fire-and-forget: a failed write is reported on the event stream.
//! Reliability is left to the round-trip layer.

use crate::constants::{EVENT_CAPACITY, INTER_BYTE_TIMEOUT};
use crate::device::OperatingMode;
use crate::error::{E32Error, LinkError};
use crate::transport::{Transport, TransportEvent};
use crate::util::{log_frame_hex, LogThrottle};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

pub mod frame;

pub use frame::{encode_frame, frame_checksum, DropInfo, DropReason, FrameDecoder, LinkEvent};

/// Data link tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Silence after which a partial frame is dropped.
    #[serde(with = "crate::config::duration_ms")]
    pub inter_byte_timeout: Duration,
    /// Backlog of the event stream per subscriber.
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            inter_byte_timeout: INTER_BYTE_TIMEOUT,
            event_capacity: EVENT_CAPACITY,
        }
    }
}

/// Counters kept by the link since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub checksum_errors: u64,
    pub invalid_lengths: u64,
    pub dropped: u64,
    pub noise_bytes: u64,
    pub transport_errors: u64,
}

impl LinkStats {
    fn record(&mut self, event: &LinkEvent) {
        match event {
            LinkEvent::Message(_) => self.frames_received += 1,
            LinkEvent::Error(LinkError::Checksum { .. }) => self.checksum_errors += 1,
            LinkEvent::Error(LinkError::InvalidLength(_)) => self.invalid_lengths += 1,
            LinkEvent::Error(LinkError::Transport(_)) => self.transport_errors += 1,
            LinkEvent::Dropped(_) => self.dropped += 1,
            LinkEvent::Closed => {}
        }
    }
}

struct Shared {
    events: broadcast::Sender<LinkEvent>,
    stats: Mutex<LinkStats>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Shared {
    fn stats(&self) -> std::sync::MutexGuard<'_, LinkStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: LinkEvent) {
        self.stats().record(&event);
        match &event {
            LinkEvent::Message(frame) => log_frame_hex("Frame received", frame),
            LinkEvent::Error(err) => log::warn!("Frame discarded: {err}"),
            LinkEvent::Dropped(info) => log::warn!(
                "Partial frame dropped ({:?}) after {} bytes",
                info.reason,
                info.partial.len()
            ),
            LinkEvent::Closed => log::debug!("Data link closed"),
        }
        let _ = self.events.send(event);
    }
}

struct Inner {
    transport: Transport,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Framed messaging over a [`Transport`].
#[derive(Clone)]
pub struct DataLink {
    inner: Arc<Inner>,
}

impl DataLink {
    pub fn new(transport: Transport) -> Self {
        Self::with_config(transport, LinkConfig::default())
    }

    pub fn with_config(transport: Transport, config: LinkConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let shared = Arc::new(Shared {
            events,
            stats: Mutex::new(LinkStats::default()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        let task = tokio::spawn(reassemble(
            transport.subscribe(),
            shared.clone(),
            config.inter_byte_timeout,
        ));

        DataLink {
            inner: Arc::new(Inner {
                transport,
                shared,
                task,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.shared.events.subscribe()
    }

    pub fn stats(&self) -> LinkStats {
        *self.inner.shared.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.closed.load(Ordering::Acquire)
    }

    /// Frames and writes `payload`; failures are published as events.
    pub async fn send(&self, payload: &[u8]) {
        if let Err(e) = self.try_send(payload).await {
            let err = match e {
                E32Error::Link(err) => err,
                E32Error::InvalidFrameLength(len) => LinkError::InvalidLength(len),
                other => LinkError::Transport(other.to_string()),
            };
            self.inner.shared.publish(LinkEvent::Error(err));
        }
    }

    /// Frames and writes `payload`, returning any failure to the caller.
    ///
    /// Refused while the transport is reserved for register access.
    pub async fn try_send(&self, payload: &[u8]) -> Result<(), E32Error> {
        if self.is_closed() {
            return Err(E32Error::Closed);
        }
        if self.inner.transport.is_register_access() {
            return Err(E32Error::TrafficSuspended(OperatingMode::Sleep));
        }

        let frame = encode_frame(payload)?;
        self.inner.transport.write(&frame).await?;
        self.inner.shared.stats().frames_sent += 1;
        log_frame_hex("Frame sent", payload);
        Ok(())
    }

    /// Writes `bytes` without framing.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), E32Error> {
        if self.is_closed() {
            return Err(E32Error::Closed);
        }
        self.inner.transport.write(bytes).await
    }

    /// Stops reassembly. A partial frame is reported as dropped, then
    /// `Closed` is published. Idempotent.
    pub fn close(&self) {
        if self.inner.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shared.shutdown.notify_one();
    }
}

async fn reassemble(
    mut rx: broadcast::Receiver<TransportEvent>,
    shared: Arc<Shared>,
    inter_byte_timeout: Duration,
) {
    let mut decoder = FrameDecoder::new();
    let mut throttle = LogThrottle::new(1000, 5);
    let mut last_byte = Instant::now();

    let abandon = |decoder: &mut FrameDecoder, reason: DropReason| {
        if let Some(info) = decoder.abandon(reason) {
            shared.publish(LinkEvent::Dropped(info));
        }
    };

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(TransportEvent::Register(chunk)) => {
                    abandon(&mut decoder, DropReason::Suspended);
                    log::trace!("Ignoring {} bytes of register traffic", chunk.len());
                }
                Ok(TransportEvent::Data(chunk)) => {
                    last_byte = Instant::now();
                    for event in decoder.feed(&chunk) {
                        shared.publish(event);
                    }
                    let noise = decoder.take_noise();
                    if noise > 0 {
                        shared.stats().noise_bytes += noise as u64;
                        if throttle.allow() {
                            log::debug!("Discarded {noise} bytes outside any frame");
                        }
                    }
                }
                Ok(TransportEvent::Error(e)) => {
                    shared.publish(LinkEvent::Error(LinkError::Transport(e)));
                }
                Ok(TransportEvent::Closed) | Err(RecvError::Closed) => {
                    abandon(&mut decoder, DropReason::EndOfStream);
                    shared.closed.store(true, Ordering::Release);
                    shared.publish(LinkEvent::Closed);
                    break;
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Data link fell behind, {n} chunks lost");
                    abandon(&mut decoder, DropReason::Overrun);
                }
            },
            _ = sleep_until(last_byte + inter_byte_timeout), if decoder.is_accumulating() => {
                abandon(&mut decoder, DropReason::InterByteTimeout);
            }
            _ = shared.shutdown.notified() => {
                abandon(&mut decoder, DropReason::EndOfStream);
                shared.publish(LinkEvent::Closed);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    async fn next(rx: &mut broadcast::Receiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no link event")
            .expect("link stream closed")
    }

    #[tokio::test]
    async fn test_frames_split_across_writes() {
        let (host, mut far) = duplex(256);
        let link = DataLink::new(Transport::new(host));
        let mut rx = link.subscribe();

        let frame = encode_frame(b"split me").unwrap();
        far.write_all(&frame[..3]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        far.write_all(&frame[3..]).await.unwrap();

        assert_eq!(
            next(&mut rx).await,
            LinkEvent::Message(Bytes::from_static(b"split me"))
        );
        assert_eq!(link.stats().frames_received, 1);
    }

    #[tokio::test]
    async fn test_send_writes_a_frame() {
        let (host, mut far) = duplex(256);
        let link = DataLink::new(Transport::new(host));

        link.send(b"abc").await;

        let mut buf = vec![0u8; 7];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, encode_frame(b"abc").unwrap());
        assert_eq!(link.stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_send_reports_bad_length_on_stream() {
        let (host, _far) = duplex(256);
        let link = DataLink::new(Transport::new(host));
        let mut rx = link.subscribe();

        link.send(&[]).await;

        assert_eq!(
            next(&mut rx).await,
            LinkEvent::Error(LinkError::InvalidLength(0))
        );
        assert_eq!(link.stats().frames_sent, 0);
    }

    #[tokio::test]
    async fn test_quiet_line_drops_partial_frame() {
        let (host, mut far) = duplex(256);
        let config = LinkConfig {
            inter_byte_timeout: Duration::from_millis(30),
            ..LinkConfig::default()
        };
        let link = DataLink::with_config(Transport::new(host), config);
        let mut rx = link.subscribe();

        let frame = encode_frame(b"never finished").unwrap();
        far.write_all(&frame[..5]).await.unwrap();

        match next(&mut rx).await {
            LinkEvent::Dropped(info) => {
                assert_eq!(info.reason, DropReason::InterByteTimeout);
                assert_eq!(info.expected, Some(14));
            }
            other => panic!("expected a drop, got {other:?}"),
        }

        far.write_all(&encode_frame(b"next").unwrap()).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            LinkEvent::Message(Bytes::from_static(b"next"))
        );
    }

    #[tokio::test]
    async fn test_end_of_stream_drops_once_then_closes() {
        let (host, mut far) = duplex(256);
        let link = DataLink::new(Transport::new(host));
        let mut rx = link.subscribe();

        let frame = encode_frame(b"cut short").unwrap();
        far.write_all(&frame[..4]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(far);

        assert!(matches!(
            next(&mut rx).await,
            LinkEvent::Dropped(DropInfo {
                reason: DropReason::EndOfStream,
                ..
            })
        ));
        assert_eq!(next(&mut rx).await, LinkEvent::Closed);
        assert_eq!(link.stats().dropped, 1);
        assert_eq!(link.stats().frames_received, 0);
        assert!(link.is_closed());
    }

    #[tokio::test]
    async fn test_register_traffic_suspends_link() {
        let (host, mut far) = duplex(256);
        let transport = Transport::new(host);
        let link = DataLink::new(transport.clone());
        let mut rx = link.subscribe();

        let frame = encode_frame(b"half").unwrap();
        far.write_all(&frame[..3]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.set_register_access(true);
        far.write_all(&[0xC0, 0x00, 0x00, 0x1A, 0x17, 0x44]).await.unwrap();

        assert!(matches!(
            next(&mut rx).await,
            LinkEvent::Dropped(DropInfo {
                reason: DropReason::Suspended,
                ..
            })
        ));
        assert_eq!(
            link.try_send(b"x").await,
            Err(E32Error::TrafficSuspended(OperatingMode::Sleep))
        );

        // Register replies in Sleep are not frames.
        far.write_all(&frame).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        transport.set_register_access(false);
        far.write_all(&frame).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            LinkEvent::Message(Bytes::from_static(b"half"))
        );
    }

    #[tokio::test]
    async fn test_close_drops_partial_frame_first() {
        let (host, mut far) = duplex(256);
        let link = DataLink::new(Transport::new(host));
        let mut rx = link.subscribe();

        let frame = encode_frame(b"interrupted").unwrap();
        far.write_all(&frame[..6]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        link.close();

        match next(&mut rx).await {
            LinkEvent::Dropped(info) => {
                assert_eq!(info.reason, DropReason::EndOfStream);
                assert_eq!(&info.partial[..], &frame[1..6]);
            }
            other => panic!("expected a drop, got {other:?}"),
        }
        assert_eq!(next(&mut rx).await, LinkEvent::Closed);
        assert_eq!(link.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (host, _far) = duplex(256);
        let link = DataLink::new(Transport::new(host));
        let mut rx = link.subscribe();

        link.close();
        link.close();

        assert_eq!(next(&mut rx).await, LinkEvent::Closed);
        assert!(rx.try_recv().is_err());
        assert_eq!(link.try_send(b"late").await, Err(E32Error::Closed));
    }
}
