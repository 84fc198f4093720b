//! # Byte Transport
//!
//! This module owns the serial stream shared by the device controller and the
//! data link. One reader task publishes every inbound chunk as a
//! [`TransportEvent`] on a broadcast channel, so each consumer attaches its own
//! listener and detaches it by dropping the receiver. Writes are serialized
//! through an async mutex.
//!
//! Chunk boundaries carry no meaning: a reply may arrive split over several
//! events, or share an event with unrelated bytes.
//!
//! While the line is reserved for register access (the module is in Sleep),
//! chunks are published as [`TransportEvent::Register`] instead of
//! [`TransportEvent::Data`]. The tag is taken by the reader at the moment the
//! chunk is published, so it stays ordered with the data.

use crate::constants::EVENT_CAPACITY;
use crate::error::E32Error;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

pub mod mock;
pub mod serial;

pub use mock::SimulatedModule;
pub use serial::{Parity, SerialConfig};

const READ_CHUNK: usize = 256;

/// Notifications published by the transport reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Bytes arrived.
    Data(Bytes),
    /// Bytes arrived while the line was reserved for register access.
    Register(Bytes),
    /// The stream failed; no more data will follow.
    Error(String),
    /// The stream ended or the transport was closed.
    Closed,
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Inner {
    writer: Mutex<Writer>,
    events: broadcast::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    register_access: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Cloneable handle to a byte stream.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Wraps any full-duplex stream. Must be called inside a tokio runtime.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_capacity(stream, EVENT_CAPACITY)
    }

    /// Like [`Transport::new`] with a custom event backlog per listener.
    pub fn with_capacity<S>(stream: S, capacity: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (events, _) = broadcast::channel(capacity.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let register_access = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(
            read_half,
            events.clone(),
            closed.clone(),
            register_access.clone(),
        ));

        Transport {
            inner: Arc::new(Inner {
                writer: Mutex::new(Box::new(write_half)),
                events,
                closed,
                register_access,
                reader,
            }),
        }
    }

    /// Attach a listener. It sees every chunk published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Reserve the line for register access, or release it.
    pub fn set_register_access(&self, on: bool) {
        self.inner.register_access.store(on, Ordering::Release);
    }

    pub fn is_register_access(&self) -> bool {
        self.inner.register_access.load(Ordering::Acquire)
    }

    /// Write all bytes and flush.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), E32Error> {
        if self.is_closed() {
            return Err(E32Error::Closed);
        }

        let mut writer = self.inner.writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| E32Error::Transport(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| E32Error::Transport(e.to_string()))?;
        log::trace!("Transport wrote {} bytes", bytes.len());
        Ok(())
    }

    /// Write `command`, then collect at least `reply_len` bytes.
    ///
    /// The listener is attached before the write so a fast reply cannot be
    /// missed, and detached when this returns.
    pub async fn request(
        &self,
        command: &[u8],
        reply_len: usize,
        deadline: Duration,
    ) -> Result<Vec<u8>, E32Error> {
        let mut rx = self.subscribe();
        self.write(command).await?;
        receive(&mut rx, reply_len, deadline).await
    }

    /// Stop the reader and notify listeners. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.reader.abort();
        let _ = self.inner.events.send(TransportEvent::Closed);
        log::debug!("Transport closed");
    }
}

/// Swallows whatever arrives on `rx` until the line has been quiet for
/// `quiet`, or `bound` has passed. Returns the number of bytes discarded.
///
/// Used after a failed register exchange, so that a reply arriving late is
/// not taken as the answer to the next command.
pub async fn discard_until_quiet(
    rx: &mut broadcast::Receiver<TransportEvent>,
    quiet: Duration,
    bound: Duration,
) -> Result<usize, E32Error> {
    let give_up = Instant::now() + bound;
    let mut discarded = 0;

    loop {
        let until = (Instant::now() + quiet).min(give_up);
        match timeout_at(until, rx.recv()).await {
            Err(_) => return Ok(discarded),
            Ok(Ok(TransportEvent::Data(chunk))) | Ok(Ok(TransportEvent::Register(chunk))) => {
                discarded += chunk.len();
            }
            Ok(Ok(TransportEvent::Error(_))) | Ok(Err(RecvError::Lagged(_))) => {}
            Ok(Ok(TransportEvent::Closed)) | Ok(Err(RecvError::Closed)) => {
                return Err(E32Error::Closed)
            }
        }
    }
}

/// Accumulates chunks from `rx` until at least `len` bytes have arrived.
///
/// Completes with everything received so far, which may exceed `len` when the
/// final chunk carries extra bytes. Fails with `Timeout` if `deadline` passes
/// first, reporting how many bytes did arrive.
pub async fn receive(
    rx: &mut broadcast::Receiver<TransportEvent>,
    len: usize,
    deadline: Duration,
) -> Result<Vec<u8>, E32Error> {
    let mut buf = Vec::with_capacity(len);

    let outcome = timeout(deadline, async {
        while buf.len() < len {
            match rx.recv().await {
                Ok(TransportEvent::Data(chunk)) | Ok(TransportEvent::Register(chunk)) => {
                    buf.extend_from_slice(&chunk)
                }
                Ok(TransportEvent::Error(e)) => return Err(E32Error::Transport(e)),
                Ok(TransportEvent::Closed) | Err(RecvError::Closed) => {
                    return Err(E32Error::Closed)
                }
                Err(RecvError::Lagged(n)) => {
                    return Err(E32Error::Transport(format!(
                        "listener lagged, {n} chunks lost"
                    )))
                }
            }
        }
        Ok(())
    })
    .await;

    match outcome {
        Ok(Ok(())) => {
            crate::util::log_frame_hex("Register reply", &buf);
            Ok(buf)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            log::warn!(
                "Timed out waiting for {len} bytes, received {}",
                buf.len()
            );
            Err(E32Error::Timeout {
                expected: len,
                received: buf.len(),
            })
        }
    }
}

async fn read_loop<R>(
    mut reader: R,
    events: broadcast::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    register_access: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::debug!("Transport reached end of stream");
                break;
            }
            Ok(n) => {
                log::trace!("Transport read {n} bytes");
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                let event = if register_access.load(Ordering::Acquire) {
                    TransportEvent::Register(chunk)
                } else {
                    TransportEvent::Data(chunk)
                };
                let _ = events.send(event);
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                log::error!("Transport read failed: {e}");
                let _ = events.send(TransportEvent::Error(e.to_string()));
                break;
            }
        }
    }

    closed.store(true, Ordering::Release);
    let _ = events.send(TransportEvent::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_chunks_reach_every_listener() {
        let (host, mut far) = duplex(64);
        let transport = Transport::new(host);
        let mut a = transport.subscribe();
        let mut b = transport.subscribe();

        far.write_all(&[1, 2, 3]).await.unwrap();

        let from_a = receive(&mut a, 3, Duration::from_secs(1)).await.unwrap();
        let from_b = receive(&mut b, 3, Duration::from_secs(1)).await.unwrap();
        assert_eq!(from_a, vec![1, 2, 3]);
        assert_eq!(from_b, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_receive_accumulates_split_reply() {
        let (host, mut far) = duplex(64);
        let transport = Transport::new(host);
        let mut rx = transport.subscribe();

        tokio::spawn(async move {
            far.write_all(&[0xC0, 0x00]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            far.write_all(&[0x00, 0x1A]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            far.write_all(&[0x17, 0x44]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let reply = receive(&mut rx, 6, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, vec![0xC0, 0x00, 0x00, 0x1A, 0x17, 0x44]);
    }

    #[tokio::test]
    async fn test_receive_times_out_with_partial_count() {
        let (host, mut far) = duplex(64);
        let transport = Transport::new(host);
        let mut rx = transport.subscribe();

        far.write_all(&[0xC0, 0x00]).await.unwrap();

        let result = receive(&mut rx, 6, Duration::from_millis(50)).await;
        assert_eq!(
            result,
            Err(E32Error::Timeout {
                expected: 6,
                received: 2
            })
        );
    }

    #[tokio::test]
    async fn test_end_of_stream_closes_transport() {
        let (host, far) = duplex(64);
        let transport = Transport::new(host);
        let mut rx = transport.subscribe();

        drop(far);

        assert_eq!(rx.recv().await.unwrap(), TransportEvent::Closed);
        assert!(transport.is_closed());
        assert_eq!(transport.write(&[0x00]).await, Err(E32Error::Closed));
    }

    #[tokio::test]
    async fn test_request_writes_then_collects() {
        let (host, mut far) = duplex(64);
        let transport = Transport::new(host);

        tokio::spawn(async move {
            let mut cmd = [0u8; 3];
            far.read_exact(&mut cmd).await.unwrap();
            assert_eq!(cmd, [0xC3, 0xC3, 0xC3]);
            far.write_all(&[0xC3, 0x32, 0x27, 0x14]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let reply = transport
            .request(&[0xC3, 0xC3, 0xC3], 4, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, vec![0xC3, 0x32, 0x27, 0x14]);
    }

    #[tokio::test]
    async fn test_register_access_tags_chunks() {
        let (host, mut far) = duplex(64);
        let transport = Transport::new(host);
        let mut rx = transport.subscribe();

        transport.set_register_access(true);
        far.write_all(&[0xC0]).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            TransportEvent::Register(Bytes::from_static(&[0xC0]))
        );

        transport.set_register_access(false);
        far.write_all(&[0x7E]).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            TransportEvent::Data(Bytes::from_static(&[0x7E]))
        );
    }

    #[tokio::test]
    async fn test_discard_until_quiet_swallows_late_bytes() {
        let (host, mut far) = duplex(64);
        let transport = Transport::new(host);
        let mut rx = transport.subscribe();

        let writer = tokio::spawn(async move {
            far.write_all(&[0xC0, 0x00, 0x00]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            far.write_all(&[0x1A, 0x17, 0x44]).await.unwrap();
            far
        });

        let discarded = discard_until_quiet(
            &mut rx,
            Duration::from_millis(30),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let _far = writer.await.unwrap();

        assert_eq!(discarded, 6);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (host, _far) = duplex(64);
        let transport = Transport::new(host);
        let mut rx = transport.subscribe();

        transport.close();
        transport.close();

        assert_eq!(rx.recv().await.unwrap(), TransportEvent::Closed);
        assert!(rx.try_recv().is_err());
    }
}
