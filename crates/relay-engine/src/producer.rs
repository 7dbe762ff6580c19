//! Background response jobs.
//!
//! A job produces `total` paced server messages for one user message. Every
//! response is persisted before delivery is attempted. Delivery failures stop
//! delivery for the rest of the job but persistence still runs to `total`;
//! only cancellation (session deletion) stops persistence early.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use relay_core::{DeliveryPayload, Message, ProcessStatus, SessionId};
use relay_store::HistoryStore;

use crate::registry::{DeliveryOutcome, SessionRegistry};

/// Decides how many responses a user message gets.
pub trait JobSizer: Send + Sync {
    fn size(&self, session_id: &SessionId, message: &str) -> u32;
}

/// Uniform pick from an inclusive range.
#[derive(Clone, Copy, Debug)]
pub struct RandomJobSizer {
    min: u32,
    max: u32,
}

impl RandomJobSizer {
    pub fn new(min: u32, max: u32) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }
}

impl Default for RandomJobSizer {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

impl JobSizer for RandomJobSizer {
    fn size(&self, _session_id: &SessionId, _message: &str) -> u32 {
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FixedJobSizer(pub u32);

impl JobSizer for FixedJobSizer {
    fn size(&self, _session_id: &SessionId, _message: &str) -> u32 {
        self.0
    }
}

#[derive(Clone, Debug)]
pub struct ProducerJob {
    pub total: u32,
    pub original_message: String,
    pub process_status: ProcessStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Delivery stopped at `sequence`; later responses were persisted only.
    DeliveryAborted { sequence: u32, reason: DeliveryOutcome },
    /// Session was deleted before `sequence` was persisted.
    Cancelled { sequence: u32 },
    PersistenceFailed { sequence: u32, error: String },
}

#[derive(Clone, Debug)]
pub struct JobReport {
    pub session_id: SessionId,
    pub total: u32,
    pub persisted: u32,
    pub delivered: u32,
    pub outcome: JobOutcome,
}

pub(crate) fn response_content(session_id: &SessionId, sequence: u32, total: u32) -> String {
    format!("Response for {session_id} ({sequence}/{total})")
}

struct SessionJobs {
    epoch: u64,
    cancel: CancellationToken,
    /// Held shared around each append; taken exclusively on cancel so no
    /// append can land after `cancel_session` returns.
    gate: Arc<RwLock<()>>,
    running: usize,
}

pub struct Producer {
    history: Arc<dyn HistoryStore>,
    registry: Arc<SessionRegistry>,
    pacing: Duration,
    push_timeout: Duration,
    jobs: Arc<DashMap<SessionId, SessionJobs>>,
    next_epoch: AtomicU64,
}

impl Producer {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        registry: Arc<SessionRegistry>,
        pacing: Duration,
        push_timeout: Duration,
    ) -> Self {
        Self {
            history,
            registry,
            pacing,
            push_timeout,
            jobs: Arc::new(DashMap::new()),
            next_epoch: AtomicU64::new(1),
        }
    }

    /// Start a job in the background. The caller may drop the handle.
    pub fn submit(&self, session_id: SessionId, job: ProducerJob) -> JoinHandle<JobReport> {
        let (epoch, cancel, gate) = {
            let mut entry = self.jobs.entry(session_id.clone()).or_insert_with(|| SessionJobs {
                epoch: self.next_epoch.fetch_add(1, Ordering::Relaxed),
                cancel: CancellationToken::new(),
                gate: Arc::new(RwLock::new(())),
                running: 0,
            });
            entry.running += 1;
            (entry.epoch, entry.cancel.child_token(), Arc::clone(&entry.gate))
        };

        let span = info_span!("producer_job", session_id = %session_id, total = job.total);
        let run = JobRun {
            session_id,
            job,
            history: Arc::clone(&self.history),
            registry: Arc::clone(&self.registry),
            pacing: self.pacing,
            push_timeout: self.push_timeout,
            cancel,
            gate,
        };
        let jobs = Arc::clone(&self.jobs);

        tokio::spawn(
            async move {
                let session_id = run.session_id.clone();
                let report = run.execute().await;
                finish(&jobs, &session_id, epoch);
                report
            }
            .instrument(span),
        )
    }

    /// Cancel every running job for a session and wait until none of them
    /// can persist again. Returns the number of jobs that were running.
    pub async fn cancel_session(&self, session_id: &SessionId) -> usize {
        let Some((_, jobs)) = self.jobs.remove(session_id) else {
            return 0;
        };
        jobs.cancel.cancel();
        let _drained = jobs.gate.write().await;
        info!(session_id = %session_id, running = jobs.running, "cancelled producer jobs");
        jobs.running
    }

    pub fn in_flight(&self, session_id: &SessionId) -> usize {
        self.jobs.get(session_id).map(|j| j.running).unwrap_or(0)
    }
}

fn finish(jobs: &DashMap<SessionId, SessionJobs>, session_id: &SessionId, epoch: u64) {
    if let Some(mut entry) = jobs.get_mut(session_id) {
        if entry.epoch == epoch {
            entry.running = entry.running.saturating_sub(1);
        }
    }
    jobs.remove_if(session_id, |_, entry| entry.epoch == epoch && entry.running == 0);
}

struct JobRun {
    session_id: SessionId,
    job: ProducerJob,
    history: Arc<dyn HistoryStore>,
    registry: Arc<SessionRegistry>,
    pacing: Duration,
    push_timeout: Duration,
    cancel: CancellationToken,
    gate: Arc<RwLock<()>>,
}

impl JobRun {
    async fn execute(self) -> JobReport {
        let total = self.job.total;
        let mut report = JobReport {
            session_id: self.session_id.clone(),
            total,
            persisted: 0,
            delivered: 0,
            outcome: JobOutcome::Completed,
        };
        let mut delivering = true;

        for sequence in 1..=total {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    report.outcome = JobOutcome::Cancelled { sequence };
                    break;
                }
                _ = tokio::time::sleep(self.pacing) => {}
            }

            let message = Message::server(
                self.session_id.clone(),
                response_content(&self.session_id, sequence, total),
            );
            {
                let _step = self.gate.read().await;
                if self.cancel.is_cancelled() {
                    report.outcome = JobOutcome::Cancelled { sequence };
                    break;
                }
                if let Err(e) = self.history.append(&self.session_id, &message) {
                    error!(sequence, error = %e, "failed to persist response");
                    report.outcome = JobOutcome::PersistenceFailed {
                        sequence,
                        error: e.to_string(),
                    };
                    break;
                }
            }
            report.persisted += 1;

            if !delivering {
                continue;
            }
            let payload = DeliveryPayload {
                message,
                sequence,
                total,
                original_message: self.job.original_message.clone(),
                process_status: self.job.process_status,
            };
            let outcome = match self.registry.lookup(&self.session_id) {
                Some(channel) => channel.push(payload, self.push_timeout).await,
                None => DeliveryOutcome::Closed,
            };
            match outcome.into_result(&self.session_id) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(sequence, error = %e, "delivery aborted");
                    delivering = false;
                    report.outcome = JobOutcome::DeliveryAborted {
                        sequence,
                        reason: outcome,
                    };
                }
            }
        }

        debug!(
            persisted = report.persisted,
            delivered = report.delivered,
            outcome = ?report.outcome,
            "producer job finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::{Database, SqliteHistoryStore, StoreError};

    fn setup(
        capacity: usize,
        pacing_ms: u64,
    ) -> (Producer, Arc<SqliteHistoryStore>, Arc<SessionRegistry>) {
        let history = Arc::new(SqliteHistoryStore::new(Database::in_memory().unwrap()));
        let registry = Arc::new(SessionRegistry::new(capacity));
        let producer = Producer::new(
            history.clone(),
            Arc::clone(&registry),
            Duration::from_millis(pacing_ms),
            Duration::from_millis(5),
        );
        (producer, history, registry)
    }

    fn job(total: u32) -> ProducerJob {
        ProducerJob {
            total,
            original_message: "hello".into(),
            process_status: ProcessStatus::Data,
        }
    }

    #[tokio::test]
    async fn delivers_in_sequence_order() {
        let (producer, history, registry) = setup(16, 1);
        let sid = SessionId::new();
        let mut sub = registry.register(&sid);

        let report = producer.submit(sid.clone(), job(3)).await.unwrap();
        assert_eq!(report.outcome, JobOutcome::Completed);
        assert_eq!((report.persisted, report.delivered), (3, 3));

        for expected in 1..=3 {
            let p = sub.try_recv().unwrap();
            assert_eq!(p.sequence, expected);
            assert_eq!(p.total, 3);
            assert_eq!(p.original_message, "hello");
            assert_eq!(p.process_status, ProcessStatus::Data);
            assert_eq!(p.message.content(), response_content(&sid, expected, 3));
        }
        assert!(sub.try_recv().is_none());
        assert_eq!(history.count(&sid).unwrap(), 3);
    }

    #[tokio::test]
    async fn persists_everything_without_a_channel() {
        let (producer, history, _registry) = setup(16, 1);
        let sid = SessionId::new();

        let report = producer.submit(sid.clone(), job(4)).await.unwrap();
        assert_eq!(report.persisted, 4);
        assert_eq!(report.delivered, 0);
        assert_eq!(
            report.outcome,
            JobOutcome::DeliveryAborted {
                sequence: 1,
                reason: DeliveryOutcome::Closed
            }
        );
        assert_eq!(history.count(&sid).unwrap(), 4);
    }

    #[tokio::test]
    async fn full_channel_aborts_delivery_but_not_persistence() {
        let (producer, history, registry) = setup(1, 1);
        let sid = SessionId::new();
        registry.register_parked(&sid);

        let report = producer.submit(sid.clone(), job(4)).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(
            report.outcome,
            JobOutcome::DeliveryAborted {
                sequence: 2,
                reason: DeliveryOutcome::Full
            }
        );
        assert_eq!(history.count(&sid).unwrap(), 4);
    }

    #[tokio::test]
    async fn zero_total_completes_immediately() {
        let (producer, history, _registry) = setup(4, 1);
        let sid = SessionId::new();
        let report = producer.submit(sid.clone(), job(0)).await.unwrap();
        assert_eq!(report.outcome, JobOutcome::Completed);
        assert_eq!(report.persisted, 0);
        assert_eq!(history.count(&sid).unwrap(), 0);
    }

    #[tokio::test]
    async fn cancel_stops_persistence() {
        let (producer, history, _registry) = setup(4, 10);
        let sid = SessionId::new();
        let handle = producer.submit(sid.clone(), job(50));
        assert_eq!(producer.in_flight(&sid), 1);

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(producer.cancel_session(&sid).await, 1);
        let persisted_at_cancel = history.count(&sid).unwrap();

        let report = handle.await.unwrap();
        assert!(matches!(report.outcome, JobOutcome::Cancelled { .. }));
        assert!(report.persisted < 50);
        assert_eq!(report.persisted as usize, persisted_at_cancel);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(history.count(&sid).unwrap(), persisted_at_cancel);
        assert_eq!(producer.in_flight(&sid), 0);
    }

    #[tokio::test]
    async fn cancel_without_jobs_is_noop() {
        let (producer, _history, _registry) = setup(4, 1);
        assert_eq!(producer.cancel_session(&SessionId::new()).await, 0);
    }

    #[tokio::test]
    async fn finished_jobs_are_forgotten() {
        let (producer, _history, _registry) = setup(4, 1);
        let sid = SessionId::new();
        let a = producer.submit(sid.clone(), job(2));
        let b = producer.submit(sid.clone(), job(2));
        assert_eq!(producer.in_flight(&sid), 2);
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(producer.in_flight(&sid), 0);
    }

    struct FailingStore;

    impl HistoryStore for FailingStore {
        fn append(&self, _: &SessionId, _: &Message) -> Result<(), StoreError> {
            Err(StoreError::Io("disk full".into()))
        }
        fn read_all(&self, _: &SessionId) -> Result<Vec<Message>, StoreError> {
            Ok(Vec::new())
        }
        fn delete(&self, _: &SessionId) -> Result<bool, StoreError> {
            Ok(false)
        }
        fn list_sessions(&self) -> Result<Vec<SessionId>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn persistence_failure_stops_job_before_delivery() {
        let registry = Arc::new(SessionRegistry::new(4));
        let producer = Producer::new(
            Arc::new(FailingStore),
            Arc::clone(&registry),
            Duration::from_millis(1),
            Duration::from_millis(5),
        );
        let sid = SessionId::new();
        let mut sub = registry.register(&sid);

        let report = producer.submit(sid, job(3)).await.unwrap();
        assert!(matches!(report.outcome, JobOutcome::PersistenceFailed { sequence: 1, .. }));
        assert_eq!(report.persisted, 0);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn random_sizer_stays_in_bounds() {
        let sid = SessionId::new();
        let sizer = RandomJobSizer::new(2, 4);
        for _ in 0..200 {
            let n = sizer.size(&sid, "x");
            assert!((2..=4).contains(&n), "{n}");
        }
        let swapped = RandomJobSizer::new(5, 3);
        assert!((3..=5).contains(&swapped.size(&sid, "x")));
        assert_eq!(FixedJobSizer(7).size(&sid, "x"), 7);
    }
}
