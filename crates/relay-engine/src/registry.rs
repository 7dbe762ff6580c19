//! Session id → delivery channel registry.
//!
//! Each entry owns one bounded mpsc channel. Entries are stored in a sharded
//! `DashMap`, so operations on unrelated sessions never contend on a global
//! lock while operations on the same id are linearized by its shard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use relay_core::{DeliveryPayload, RelayError, SessionId};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Result of a push attempt. Failure is an expected outcome, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Queue stayed full for the whole push timeout.
    Full,
    /// Channel was deregistered or replaced.
    Closed,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Full => "full",
            Self::Closed => "closed",
        }
    }

    pub fn into_result(self, session_id: &SessionId) -> Result<(), RelayError> {
        match self {
            Self::Delivered => Ok(()),
            other => Err(RelayError::ChannelUnavailable {
                session_id: session_id.to_string(),
                reason: other.as_str().to_string(),
            }),
        }
    }
}

/// Receiver held for a channel nobody is streaming from yet.
struct Parked {
    _rx: mpsc::Receiver<DeliveryPayload>,
    since: Instant,
}

struct ChannelEntry {
    generation: u64,
    tx: mpsc::Sender<DeliveryPayload>,
    closed: CancellationToken,
    parked: Mutex<Option<Parked>>,
}

impl ChannelEntry {
    fn is_parked(&self) -> bool {
        self.parked.lock().is_some()
    }

    fn parked_longer_than(&self, max_age: Duration, now: Instant) -> bool {
        self.parked
            .lock()
            .as_ref()
            .is_some_and(|p| now.saturating_duration_since(p.since) >= max_age)
    }
}

impl Drop for ChannelEntry {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Push side of a registered channel.
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    session_id: SessionId,
    generation: u64,
    tx: mpsc::Sender<DeliveryPayload>,
    closed: CancellationToken,
}

impl ChannelHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Enqueue, waiting up to `timeout` for room.
    pub async fn push(&self, payload: DeliveryPayload, timeout: Duration) -> DeliveryOutcome {
        if self.closed.is_cancelled() {
            return DeliveryOutcome::Closed;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => DeliveryOutcome::Closed,
            sent = self.tx.send_timeout(payload, timeout) => match sent {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => DeliveryOutcome::Full,
                Err(mpsc::error::SendTimeoutError::Closed(_)) => DeliveryOutcome::Closed,
            },
        }
    }

    /// Enqueue without waiting.
    pub fn try_push(&self, payload: DeliveryPayload) -> DeliveryOutcome {
        if self.closed.is_cancelled() {
            return DeliveryOutcome::Closed;
        }
        match self.tx.try_send(payload) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => DeliveryOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => DeliveryOutcome::Closed,
        }
    }
}

/// Receive side of a registered channel, owned by one stream.
pub struct Subscription {
    session_id: SessionId,
    generation: u64,
    pub(crate) rx: mpsc::Receiver<DeliveryPayload>,
    pub(crate) closed: CancellationToken,
    handle: ChannelHandle,
}

impl Subscription {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Push handle for the same channel.
    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    /// Whether the registry has dropped this channel.
    pub fn is_detached(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Pop an already-queued item without waiting.
    pub fn try_recv(&mut self) -> Option<DeliveryPayload> {
        self.rx.try_recv().ok()
    }
}

/// Registry of delivery channels, at most one per session.
pub struct SessionRegistry {
    channels: DashMap<SessionId, ChannelEntry>,
    capacity: usize,
    next_generation: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
            next_generation: AtomicU64::new(1),
        }
    }

    fn create(
        &self,
        session_id: &SessionId,
    ) -> (ChannelEntry, ChannelHandle, mpsc::Receiver<DeliveryPayload>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        let closed = CancellationToken::new();
        let handle = ChannelHandle {
            session_id: session_id.clone(),
            generation,
            tx: tx.clone(),
            closed: closed.clone(),
        };
        let entry = ChannelEntry {
            generation,
            tx,
            closed,
            parked: Mutex::new(None),
        };
        (entry, handle, rx)
    }

    fn install(&self, session_id: &SessionId, entry: ChannelEntry) {
        let generation = entry.generation;
        if let Some(previous) = self.channels.insert(session_id.clone(), entry) {
            debug!(
                session_id = %session_id,
                replaced = previous.generation,
                generation,
                "replaced delivery channel"
            );
        }
    }

    /// Create the channel for `session_id`, replacing any existing one.
    /// The replaced channel is closed and its unread items are dropped.
    pub fn register(&self, session_id: &SessionId) -> Subscription {
        let (entry, handle, rx) = self.create(session_id);
        let subscription = Subscription {
            session_id: session_id.clone(),
            generation: entry.generation,
            rx,
            closed: entry.closed.clone(),
            handle,
        };
        self.install(session_id, entry);
        subscription
    }

    /// Register a channel whose receiver stays inside the registry until a
    /// stream replaces it or it expires.
    pub fn register_parked(&self, session_id: &SessionId) -> ChannelHandle {
        let (entry, handle, rx) = self.create(session_id);
        *entry.parked.lock() = Some(Parked {
            _rx: rx,
            since: Instant::now(),
        });
        self.install(session_id, entry);
        handle
    }

    pub fn lookup(&self, session_id: &SessionId) -> Option<ChannelHandle> {
        self.channels.get(session_id).map(|entry| ChannelHandle {
            session_id: session_id.clone(),
            generation: entry.generation,
            tx: entry.tx.clone(),
            closed: entry.closed.clone(),
        })
    }

    /// Remove and close the channel. Idempotent.
    pub fn deregister(&self, session_id: &SessionId) -> bool {
        self.channels.remove(session_id).is_some()
    }

    /// Remove the channel only if it is still the given registration.
    pub fn deregister_generation(&self, session_id: &SessionId, generation: u64) -> bool {
        self.channels
            .remove_if(session_id, |_, entry| entry.generation == generation)
            .is_some()
    }

    pub fn is_registered(&self, session_id: &SessionId) -> bool {
        self.channels.contains_key(session_id)
    }

    /// Registered and claimed by a stream.
    pub fn is_streaming(&self, session_id: &SessionId) -> bool {
        self.channels
            .get(session_id)
            .is_some_and(|entry| !entry.is_parked())
    }

    /// Ids with a stream attached, in no particular order.
    pub fn active_sessions(&self) -> Vec<SessionId> {
        self.channels
            .iter()
            .filter(|entry| !entry.is_parked())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop parked channels that no stream claimed within `max_age`.
    /// Returns the ids removed.
    pub fn expire_parked(&self, max_age: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.channels.retain(|session_id, entry| {
            let stale = entry.parked_longer_than(max_age, now);
            if stale {
                expired.push(session_id.clone());
            }
            !stale
        });
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired parked channels");
        }
        expired
    }

    /// All registered channels, parked ones included.
    pub fn count(&self) -> usize {
        self.channels.len()
    }

    /// Channels with a stream attached.
    pub fn streaming_count(&self) -> usize {
        self.channels.iter().filter(|entry| !entry.is_parked()).count()
    }

    pub fn parked_count(&self) -> usize {
        self.channels.iter().filter(|entry| entry.is_parked()).count()
    }
}
