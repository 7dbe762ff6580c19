//! Per-connection event loop.
//!
//! `Attaching → Streaming → Closed`. Attaching registers a fresh channel and
//! yields the connected notice; streaming yields queued messages or a
//! heartbeat after `idle_timeout` of silence; closing deregisters the
//! stream's own registration and never a successor's.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tracing::{debug, info};

use relay_core::{SessionId, StreamEvent};

use crate::registry::{SessionRegistry, Subscription};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Attaching,
    Streaming,
    Closed,
}

/// Runs once when the stream closes, if no newer stream took over the session.
pub type CloseHook = Box<dyn FnOnce(&SessionId) + Send>;

enum Received {
    Item(relay_core::DeliveryPayload),
    Idle,
    Detached,
}

pub struct EventStream {
    session_id: SessionId,
    registry: Arc<SessionRegistry>,
    subscription: Option<Subscription>,
    generation: u64,
    idle_timeout: Duration,
    state: StreamState,
    on_close: Option<CloseHook>,
}

impl EventStream {
    /// Register a channel for `session_id`, replacing any previous one.
    pub fn attach(
        registry: Arc<SessionRegistry>,
        session_id: SessionId,
        idle_timeout: Duration,
    ) -> Self {
        let subscription = registry.register(&session_id);
        let generation = subscription.generation();
        debug!(session_id = %session_id, generation, "stream attaching");
        Self {
            session_id,
            registry,
            subscription: Some(subscription),
            generation,
            idle_timeout,
            state: StreamState::Attaching,
            on_close: None,
        }
    }

    pub fn with_close_hook(mut self, hook: CloseHook) -> Self {
        self.on_close = Some(hook);
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Next event for the client, or `None` once closed.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        match self.state {
            StreamState::Closed => return None,
            StreamState::Attaching => {
                self.state = StreamState::Streaming;
                info!(session_id = %self.session_id, "stream connected");
                return Some(StreamEvent::connected(self.session_id.clone()));
            }
            StreamState::Streaming => {}
        }

        let subscription = self.subscription.as_mut()?;
        let received = tokio::select! {
            biased;
            _ = subscription.closed.cancelled() => Received::Detached,
            item = tokio::time::timeout(self.idle_timeout, subscription.rx.recv()) => match item {
                Ok(Some(payload)) => Received::Item(payload),
                Ok(None) => Received::Detached,
                Err(_) => Received::Idle,
            },
        };

        match received {
            Received::Item(payload) => Some(StreamEvent::Message(payload)),
            Received::Idle => Some(StreamEvent::heartbeat()),
            Received::Detached => {
                self.close();
                None
            }
        }
    }

    /// Transition to `Closed`. Idempotent.
    pub fn close(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        self.state = StreamState::Closed;
        // Unread items go with the receiver.
        self.subscription = None;
        let removed = self
            .registry
            .deregister_generation(&self.session_id, self.generation);
        let superseded = !removed && self.registry.is_registered(&self.session_id);
        info!(session_id = %self.session_id, superseded, "stream closed");

        if !superseded {
            if let Some(hook) = self.on_close.take() {
                hook(&self.session_id);
            }
        }
    }

    /// Adapt into a `Stream` that ends when the session is detached.
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next_event().await.map(|event| (event, stream))
        })
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.close();
    }
}
