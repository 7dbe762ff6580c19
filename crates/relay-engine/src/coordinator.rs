//! Session lifecycle: open/restore, user messages, process status, streams
//! and deletion. Owns the in-memory `SessionState` table.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use relay_core::{Message, ProcessStatus, RelayError, SessionId, SessionState, DEFAULT_USER_ID};
use relay_store::HistoryStore;

use crate::config::EngineConfig;
use crate::producer::{JobReport, JobSizer, Producer, ProducerJob, RandomJobSizer};
use crate::registry::SessionRegistry;
use crate::stream::EventStream;

#[derive(Clone, Debug)]
pub struct OpenedSession {
    pub session_id: SessionId,
    /// False when an existing or restored session was reused.
    pub created: bool,
    pub state: SessionState,
}

/// Result of accepting a user message.
#[derive(Debug)]
pub struct SubmitReceipt {
    pub session_id: SessionId,
    pub created: bool,
    pub user_message: Message,
    pub message_count: u64,
    pub total_responses: u32,
    pub process_status: ProcessStatus,
    /// Background job producing the responses. Safe to drop.
    pub job: JoinHandle<JobReport>,
}

#[derive(Clone, Debug)]
pub struct SessionOverview {
    /// In-memory sessions, oldest first.
    pub sessions: Vec<SessionState>,
    pub active_connections: Vec<SessionId>,
    /// Sessions with persisted history.
    pub persisted: Vec<SessionId>,
    pub total: usize,
}

pub struct SessionCoordinator {
    config: EngineConfig,
    sessions: Arc<DashMap<SessionId, SessionState>>,
    registry: Arc<SessionRegistry>,
    history: Arc<dyn HistoryStore>,
    producer: Producer,
    sizer: Arc<dyn JobSizer>,
}

impl SessionCoordinator {
    pub fn new(config: EngineConfig, history: Arc<dyn HistoryStore>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.channel_capacity));
        let producer = Producer::new(
            Arc::clone(&history),
            Arc::clone(&registry),
            config.pacing_interval,
            config.push_timeout,
        );
        let sizer = Arc::new(RandomJobSizer::new(config.min_responses, config.max_responses));
        Self {
            config,
            sessions: Arc::new(DashMap::new()),
            registry,
            history,
            producer,
            sizer,
        }
    }

    pub fn with_job_sizer(mut self, sizer: Arc<dyn JobSizer>) -> Self {
        self.sizer = sizer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    /// Number of sessions held in memory.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, session_id: &SessionId) -> Option<SessionState> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Reuse a live or persisted session, or allocate a new one.
    ///
    /// A newly created session gets a parked channel so responses produced
    /// before any stream attaches have somewhere to go.
    #[instrument(skip(self))]
    pub fn open_session(
        &self,
        existing: Option<&SessionId>,
        user_id: &str,
    ) -> Result<OpenedSession, RelayError> {
        if let Some(session_id) = existing {
            if let Some(state) = self.session(session_id) {
                return Ok(OpenedSession {
                    session_id: session_id.clone(),
                    created: false,
                    state,
                });
            }
            if let Some(state) = self.restore_from_history(session_id)? {
                return Ok(OpenedSession {
                    session_id: session_id.clone(),
                    created: false,
                    state,
                });
            }
        }

        let session_id = SessionId::new();
        let state = SessionState::created(session_id.clone(), user_id);
        self.sessions.insert(session_id.clone(), state.clone());
        self.registry.register_parked(&session_id);
        info!(session_id = %session_id, user_id, "session created");
        Ok(OpenedSession {
            session_id,
            created: true,
            state,
        })
    }

    /// Rebuild `SessionState` from history if it is not already in memory.
    /// Returns `None` when there is no history.
    pub fn restore_from_history(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionState>, RelayError> {
        if let Some(state) = self.session(session_id) {
            return Ok(Some(state));
        }
        let messages = self.history.read_all(session_id)?;
        Ok(self.restore_from_messages(session_id, &messages))
    }

    fn restore_from_messages(
        &self,
        session_id: &SessionId,
        messages: &[Message],
    ) -> Option<SessionState> {
        let first = messages.first()?;
        let user_messages = messages.iter().filter(|m| m.is_user()).count() as u64;
        let restored = SessionState::restored(session_id.clone(), first.timestamp(), user_messages);
        let state = self
            .sessions
            .entry(session_id.clone())
            .or_insert(restored)
            .clone();
        info!(
            session_id = %session_id,
            messages = messages.len(),
            user_messages = state.message_count,
            "session restored from history"
        );
        Some(state)
    }

    /// Persist a user message and bump the session's count. The count only
    /// moves after the append succeeds.
    ///
    /// The state entry stays locked across the append, so a concurrent
    /// release cannot leave a persisted message without its count.
    pub fn record_user_message(
        &self,
        session_id: &SessionId,
        content: &str,
    ) -> Result<(Message, SessionState), RelayError> {
        let mut state = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::NotFound(session_id.to_string()))?;
        let message = Message::user(session_id.clone(), content);
        self.history.append(session_id, &message)?;
        state.message_count += 1;
        Ok((message, state.clone()))
    }

    /// Accept a chat message: open or reuse the session, persist the message
    /// and start a response job.
    pub fn submit_user_message(
        &self,
        session_id: Option<&SessionId>,
        user_id: Option<&str>,
        content: &str,
    ) -> Result<SubmitReceipt, RelayError> {
        if content.trim().is_empty() {
            return Err(RelayError::MalformedRequest("message is required".into()));
        }
        let opened = self.open_session(session_id, user_id.unwrap_or(DEFAULT_USER_ID))?;
        let (user_message, state) = match self.record_user_message(&opened.session_id, content) {
            Ok(recorded) => recorded,
            Err(e) => {
                if opened.created {
                    self.discard_created(&opened.session_id);
                }
                return Err(e);
            }
        };

        let total = self.sizer.size(&opened.session_id, content);
        let job = self.producer.submit(
            opened.session_id.clone(),
            ProducerJob {
                total,
                original_message: content.to_string(),
                process_status: state.process_status,
            },
        );
        info!(session_id = %opened.session_id, total, "chat message accepted");

        Ok(SubmitReceipt {
            session_id: opened.session_id,
            created: opened.created,
            user_message,
            message_count: state.message_count,
            total_responses: total,
            process_status: state.process_status,
            job,
        })
    }

    /// A session that was never persisted has nothing to restore from.
    fn discard_created(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
        self.registry.deregister(session_id);
        debug!(session_id = %session_id, "discarded unpersisted session");
    }

    /// Move the session one stage forward; `Deploy` is terminal.
    pub fn advance_process_status(
        &self,
        session_id: &SessionId,
    ) -> Result<ProcessStatus, RelayError> {
        let mut state = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::NotFound(session_id.to_string()))?;
        let previous = state.process_status;
        if previous.is_last() {
            debug!(session_id = %session_id, "process status already final");
            return Ok(previous);
        }
        state.process_status = previous.next();
        info!(
            session_id = %session_id,
            from = %previous,
            to = %state.process_status,
            "process status advanced"
        );
        Ok(state.process_status)
    }

    pub fn list_sessions(&self) -> Result<SessionOverview, RelayError> {
        let mut sessions: Vec<SessionState> =
            self.sessions.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by_key(|s| s.created_at);
        let mut active_connections = self.registry.active_sessions();
        active_connections.sort();
        let persisted = self.history.list_sessions()?;
        Ok(SessionOverview {
            total: sessions.len(),
            sessions,
            active_connections,
            persisted,
        })
    }

    /// Full history for a session. Restores in-memory state as a side effect
    /// when history exists but the state does not.
    pub fn get_history(&self, session_id: &SessionId) -> Result<Vec<Message>, RelayError> {
        let messages = self.history.read_all(session_id)?;
        if !messages.is_empty() && !self.sessions.contains_key(session_id) {
            self.restore_from_messages(session_id, &messages);
        }
        Ok(messages)
    }

    /// Open an event stream for the session, replacing any existing one.
    pub fn attach_stream(&self, session_id: &SessionId) -> EventStream {
        let stream = EventStream::attach(
            Arc::clone(&self.registry),
            session_id.clone(),
            self.config.idle_timeout,
        );
        if !self.config.release_state_on_detach {
            return stream;
        }
        let sessions = Arc::clone(&self.sessions);
        stream.with_close_hook(Box::new(move |session_id: &SessionId| {
            if sessions.remove(session_id).is_some() {
                info!(session_id = %session_id, "session state released");
            }
        }))
    }

    /// Close the session's stream, if any.
    pub fn detach_stream(&self, session_id: &SessionId) -> bool {
        self.registry.deregister(session_id)
    }

    /// Drop parked channels no stream claimed within `parked_ttl`. Their
    /// in-memory state goes too when state is released on detach.
    pub fn expire_parked(&self) -> usize {
        let expired = self.registry.expire_parked(self.config.parked_ttl);
        if self.config.release_state_on_detach {
            for session_id in &expired {
                self.sessions.remove(session_id);
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired unclaimed sessions");
        }
        expired.len()
    }

    /// Drop everything known about a session: running jobs, its channel,
    /// in-memory state and persisted history. Returns whether anything existed.
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<bool, RelayError> {
        let cancelled = self.producer.cancel_session(session_id).await;
        let had_channel = self.registry.deregister(session_id);
        let had_state = self.sessions.remove(session_id).is_some();
        let had_history = self.history.delete(session_id).map_err(|e| {
            warn!(session_id = %session_id, error = %e, "failed to purge history");
            RelayError::from(e)
        })?;
        info!(
            session_id = %session_id,
            cancelled,
            had_channel,
            had_state,
            had_history,
            "session deleted"
        );
        Ok(had_channel || had_state || had_history)
    }
}

/// Periodically expire parked channels until `shutdown` fires.
pub fn start_parked_sweeper(
    coordinator: Arc<SessionCoordinator>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = (coordinator.config.parked_ttl / 2).max(std::time::Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    coordinator.expire_parked();
                }
            }
        }
        debug!("parked channel sweeper stopped");
    })
}
