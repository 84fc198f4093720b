//! # Round Trips
//!
//! [`RoundTripper`] sends a random payload through the [`DataLink`] and takes
//! the next frame the link delivers as the reply. There are no sequence
//! numbers: a stray frame arriving while a request is outstanding (from a
//! broadcast, say) is taken as the reply. Callers that need correlation must
//! keep a single conversation on the channel.
//!
//! Only one round trip may be in flight per instance (clones share the slot);
//! a second call fails with `Busy`. After each round trip the caller's
//! [`WaitTimeProvider`] decides how long to pause, and the slot stays taken
//! for that pause.

use crate::constants::{EVENT_CAPACITY, ROUND_TRIP_TIMEOUT};
use crate::error::E32Error;
use crate::link::{DataLink, LinkEvent};
use bytes::Bytes;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep, timeout_at, Instant};

/// Supplies the pause applied after each round trip.
pub trait WaitTimeProvider {
    fn next_wait(&mut self) -> Duration;
}

impl<F> WaitTimeProvider for F
where
    F: FnMut() -> Duration,
{
    fn next_wait(&mut self) -> Duration {
        self()
    }
}

/// Always the same pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWait(pub Duration);

impl WaitTimeProvider for FixedWait {
    fn next_wait(&mut self) -> Duration {
        self.0
    }
}

/// Uniformly random pause in `min..=max`, millisecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomWait {
    pub min: Duration,
    pub max: Duration,
}

impl RandomWait {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }
}

impl WaitTimeProvider for RandomWait {
    fn next_wait(&mut self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundTripConfig {
    /// Time allowed for the reply frame.
    #[serde(with = "crate::config::duration_ms")]
    pub timeout: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub min_wait: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub max_wait: Duration,
}

impl Default for RoundTripConfig {
    fn default() -> Self {
        Self {
            timeout: ROUND_TRIP_TIMEOUT,
            min_wait: Duration::from_millis(500),
            max_wait: Duration::from_millis(2000),
        }
    }
}

impl RoundTripConfig {
    pub fn wait_provider(&self) -> RandomWait {
        RandomWait::new(self.min_wait, self.max_wait)
    }
}

/// The request currently in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub payload: Bytes,
    pub sent_at: Instant,
    pub deadline: Instant,
}

/// Notifications published by the round-trip layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundTripEvent {
    /// A request went out.
    Sent(Bytes),
    /// The reply to the outstanding request.
    Message { reply: Bytes, latency: Duration },
    /// No reply arrived before the deadline.
    Dropped { payload: Bytes, waited: Duration },
    /// A fault from below; the round trip keeps waiting unless it is fatal.
    Error(E32Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundTripOutcome {
    Reply { reply: Bytes, latency: Duration },
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTripResult {
    pub payload: Bytes,
    pub outcome: RoundTripOutcome,
    /// Pause applied after the round trip completed.
    pub wait: Duration,
}

impl RoundTripResult {
    pub fn latency(&self) -> Option<Duration> {
        match self.outcome {
            RoundTripOutcome::Reply { latency, .. } => Some(latency),
            RoundTripOutcome::Dropped => None,
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.outcome == RoundTripOutcome::Dropped
    }
}

type Slot = Mutex<Option<PendingRequest>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<PendingRequest>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Frees the in-flight slot however the round trip ends.
struct PendingGuard<'a> {
    slot: &'a Slot,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.slot).take();
    }
}

/// Request–response exchanges over a [`DataLink`].
#[derive(Clone)]
pub struct RoundTripper {
    link: DataLink,
    config: RoundTripConfig,
    pending: Arc<Slot>,
    events: broadcast::Sender<RoundTripEvent>,
}

impl RoundTripper {
    pub fn new(link: DataLink) -> Self {
        Self::with_config(link, RoundTripConfig::default())
    }

    pub fn with_config(link: DataLink, config: RoundTripConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        RoundTripper {
            link,
            config,
            pending: Arc::new(Mutex::new(None)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundTripEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &RoundTripConfig {
        &self.config
    }

    /// The request in flight, if any.
    pub fn pending(&self) -> Option<PendingRequest> {
        lock(&self.pending).clone()
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.pending).is_some()
    }

    fn emit(&self, event: RoundTripEvent) {
        let _ = self.events.send(event);
    }

    /// Sends `payload_size` random bytes and waits for the reply.
    pub async fn do_round_trip(
        &self,
        payload_size: usize,
        wait: &mut impl WaitTimeProvider,
    ) -> Result<RoundTripResult, E32Error> {
        self.exchange(random_payload(payload_size), wait).await
    }

    /// Sends `payload` and waits for the reply.
    ///
    /// A missing reply is not an error: the result carries
    /// [`RoundTripOutcome::Dropped`] and a `Dropped` event is published.
    pub async fn exchange(
        &self,
        payload: Bytes,
        wait: &mut impl WaitTimeProvider,
    ) -> Result<RoundTripResult, E32Error> {
        let _guard = self.claim(&payload)?;

        let mut rx = self.link.subscribe();
        if let Err(e) = self.link.try_send(&payload).await {
            log::warn!("Round trip send failed: {e}");
            self.emit(RoundTripEvent::Error(e.clone()));
            return Err(e);
        }

        let sent_at = Instant::now();
        let deadline = sent_at + self.config.timeout;
        if let Some(pending) = lock(&self.pending).as_mut() {
            pending.sent_at = sent_at;
            pending.deadline = deadline;
        }
        self.emit(RoundTripEvent::Sent(payload.clone()));

        let outcome = loop {
            match timeout_at(deadline, rx.recv()).await {
                Err(_) => {
                    log::warn!(
                        "No reply to {}-byte request within {:?}",
                        payload.len(),
                        self.config.timeout
                    );
                    self.emit(RoundTripEvent::Dropped {
                        payload: payload.clone(),
                        waited: self.config.timeout,
                    });
                    break RoundTripOutcome::Dropped;
                }
                Ok(Ok(LinkEvent::Message(reply))) => {
                    let latency = sent_at.elapsed();
                    log::debug!("Reply of {} bytes after {latency:?}", reply.len());
                    self.emit(RoundTripEvent::Message {
                        reply: reply.clone(),
                        latency,
                    });
                    break RoundTripOutcome::Reply { reply, latency };
                }
                Ok(Ok(LinkEvent::Error(err))) => {
                    self.emit(RoundTripEvent::Error(err.into()));
                }
                Ok(Ok(LinkEvent::Dropped(info))) => {
                    log::debug!("Partial frame dropped while waiting: {:?}", info.reason);
                }
                Ok(Ok(LinkEvent::Closed)) | Ok(Err(RecvError::Closed)) => {
                    self.emit(RoundTripEvent::Error(E32Error::Closed));
                    return Err(E32Error::Closed);
                }
                Ok(Err(RecvError::Lagged(n))) => {
                    log::warn!("Round trip listener lagged, {n} link events lost");
                }
            }
        };

        let wait_time = wait.next_wait();
        sleep(wait_time).await;

        Ok(RoundTripResult {
            payload,
            outcome,
            wait: wait_time,
        })
    }

    fn claim(&self, payload: &Bytes) -> Result<PendingGuard<'_>, E32Error> {
        let mut slot = lock(&self.pending);
        if slot.is_some() {
            return Err(E32Error::Busy);
        }
        let now = Instant::now();
        *slot = Some(PendingRequest {
            payload: payload.clone(),
            sent_at: now,
            deadline: now + self.config.timeout,
        });
        Ok(PendingGuard {
            slot: &self.pending,
        })
    }
}

fn random_payload(size: usize) -> Bytes {
    let mut payload = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut payload);
    Bytes::from(payload)
}
