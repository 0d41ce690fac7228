//! Subtitle Coordinator (spec.md §4.7): per-job asynchronous subtitle
//! acquisition with a readiness gate consulted by matchers.
//!
//! Grounded on the timeout-bounded waiter style of
//! `ferrex-core/src/scan/orchestration/lease.rs` (a gate with a bounded
//! wait rather than a blocking join) and the persist-then-publish pattern
//! already used throughout this crate for state transitions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info};

use crate::events::{DomainEvent, EventPublisher};
use crate::ids::JobId;
use crate::model::SubtitleStatus;
use crate::persistence::Store;
use crate::{IngestError, Result};

/// The external subtitle-scraping collaborator (spec.md §6: HTTP scrapers
/// returning `.srt` bodies, content-validated — rejecting HTML, missing
/// timestamp markers, or bodies under 50 bytes — by the adapter, not
/// here).
#[async_trait]
pub trait SubtitleAcquirer: Send + Sync {
    async fn acquire(&self, job_id: JobId, show_name: &str, season: Option<i32>) -> anyhow::Result<SubtitleOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleOutcome {
    Completed,
    Partial,
    Failed,
}

impl SubtitleOutcome {
    fn into_status(self) -> SubtitleStatus {
        match self {
            SubtitleOutcome::Completed => SubtitleStatus::Completed,
            SubtitleOutcome::Partial => SubtitleStatus::Partial,
            SubtitleOutcome::Failed => SubtitleStatus::Failed,
        }
    }
}

/// Lets an `Arc<dyn SubtitleAcquirer>` stand in for a concrete acquirer, so
/// the Job Orchestrator can hold one `SubtitleCoordinator<S, Arc<dyn
/// SubtitleAcquirer>>` without naming a concrete scraper type.
#[async_trait]
impl SubtitleAcquirer for Arc<dyn SubtitleAcquirer> {
    async fn acquire(&self, job_id: JobId, show_name: &str, season: Option<i32>) -> anyhow::Result<SubtitleOutcome> {
        (**self).acquire(job_id, show_name, season).await
    }
}

struct JobGate {
    notify: Notify,
    ready: AtomicBool,
}

impl JobGate {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            ready: AtomicBool::new(false),
        }
    }
}

/// Owns, per job, the "has subtitle acquisition reached a terminal state
/// yet" gate. A job is triggered at most once (spec.md §4.7: "at most one
/// in-flight subtitle acquisition").
pub struct SubtitleCoordinator<S: Store, A: SubtitleAcquirer> {
    store: Arc<S>,
    acquirer: Arc<A>,
    events: Arc<dyn EventPublisher>,
    gates: Mutex<HashMap<JobId, Arc<JobGate>>>,
}

impl<S: Store, A: SubtitleAcquirer + 'static> SubtitleCoordinator<S, A> {
    pub fn new(store: Arc<S>, acquirer: Arc<A>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            acquirer,
            events,
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Triggers acquisition for a job, shortly after identification
    /// reveals the show/season (spec.md §4.7). Idempotent: calling this a
    /// second time for a job that already has a gate is a no-op, since the
    /// first call already owns the in-flight acquisition.
    pub async fn start(self: &Arc<Self>, job_id: JobId, show_name: String, season: Option<i32>) {
        let mut gates = self.gates.lock().await;
        if gates.contains_key(&job_id) {
            return;
        }
        gates.insert(job_id, Arc::new(JobGate::new()));
        drop(gates);

        if let Err(err) = self.set_status(job_id, SubtitleStatus::Downloading).await {
            error!(job_id = job_id.0, error = %err, "failed to persist downloading status");
        }

        let this = self.clone();
        tokio::spawn(async move {
            let outcome = match this.acquirer.acquire(job_id, &show_name, season).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(job_id = job_id.0, error = %err, "subtitle acquisition failed");
                    SubtitleOutcome::Failed
                }
            };

            if let Err(err) = this.set_status(job_id, outcome.into_status()).await {
                error!(job_id = job_id.0, error = %err, "failed to persist terminal subtitle status");
            }

            let gates = this.gates.lock().await;
            if let Some(gate) = gates.get(&job_id) {
                gate.ready.store(true, Ordering::SeqCst);
                gate.notify.notify_waiters();
            }
            info!(job_id = job_id.0, outcome = ?outcome, "subtitle acquisition settled");
        });
    }

    async fn set_status(&self, job_id: JobId, status: SubtitleStatus) -> Result<()> {
        let Some(mut job) = self.store.get_job(job_id).await? else {
            return Err(IngestError::NotFound(format!("job {job_id}")));
        };
        job.subtitle_status = status;
        job.updated_at = chrono::Utc::now();
        self.store.update_job(job).await?;
        self.events
            .publish(DomainEvent::subtitle_event(job_id, status))
            .await
    }

    /// Waits for the job's readiness signal (spec.md §4.7/§4.6 step 1),
    /// bounded by `timeout`. Returns the observed terminal status, or
    /// `None` if the timeout elapsed first — callers proceed with
    /// whatever references already exist (spec.md §5 timeouts: "after
    /// which matching proceeds with whatever references exist").
    pub async fn wait_ready(&self, job_id: JobId, timeout: Duration) -> Result<Option<SubtitleStatus>> {
        let gate = {
            let mut gates = self.gates.lock().await;
            gates.entry(job_id).or_insert_with(|| Arc::new(JobGate::new())).clone()
        };

        if !gate.ready.load(Ordering::SeqCst) {
            let _ = tokio::time::timeout(timeout, gate.notify.notified()).await;
        }

        if !gate.ready.load(Ordering::SeqCst) {
            return Ok(None);
        }

        let status = self
            .store
            .get_job(job_id)
            .await?
            .map(|job| job.subtitle_status);
        Ok(status)
    }
}

/// Narrow view of [`SubtitleCoordinator`] that the Match Worker Pool
/// depends on, so it can hold `Arc<dyn SubtitleGate>` instead of being
/// generic over `S`/`A` itself.
#[async_trait]
pub trait SubtitleGate: Send + Sync {
    async fn wait_ready(&self, job_id: JobId, timeout: Duration) -> Result<Option<SubtitleStatus>>;
}

#[async_trait]
impl<S: Store + 'static, A: SubtitleAcquirer + 'static> SubtitleGate for SubtitleCoordinator<S, A> {
    async fn wait_ready(&self, job_id: JobId, timeout: Duration) -> Result<Option<SubtitleStatus>> {
        SubtitleCoordinator::wait_ready(self, job_id, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::InProcEventBus;
    use crate::model::Job;
    use crate::persistence::memory::MemoryStore;
    use std::path::PathBuf;

    struct StaticAcquirer(SubtitleOutcome);

    #[async_trait]
    impl SubtitleAcquirer for StaticAcquirer {
        async fn acquire(&self, _job_id: JobId, _show_name: &str, _season: Option<i32>) -> anyhow::Result<SubtitleOutcome> {
            Ok(self.0)
        }
    }

    async fn seeded_job(store: &MemoryStore) -> JobId {
        let job_id = store.next_job_id();
        store
            .insert_job(Job::new(job_id, "/dev/sr0", "THE_SHOW", PathBuf::from("/tmp/staging")))
            .await
            .unwrap();
        job_id
    }

    #[tokio::test]
    async fn wait_ready_returns_terminal_status_once_settled() {
        let store = Arc::new(MemoryStore::new());
        let job_id = seeded_job(&store).await;
        let bus = Arc::new(InProcEventBus::new(8));
        let coordinator = Arc::new(SubtitleCoordinator::new(
            store.clone(),
            Arc::new(StaticAcquirer(SubtitleOutcome::Completed)),
            bus,
        ));

        coordinator.start(job_id, "The Show".into(), Some(1)).await;
        let status = coordinator
            .wait_ready(job_id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(status, Some(SubtitleStatus::Completed));
    }

    #[tokio::test]
    async fn wait_ready_times_out_when_never_started() {
        let store = Arc::new(MemoryStore::new());
        let job_id = seeded_job(&store).await;
        let bus = Arc::new(InProcEventBus::new(8));
        let coordinator = Arc::new(SubtitleCoordinator::new(
            store.clone(),
            Arc::new(StaticAcquirer(SubtitleOutcome::Completed)),
            bus,
        ));

        let status = coordinator
            .wait_ready(job_id, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(status, None);
    }

    #[tokio::test]
    async fn failed_acquisition_is_a_terminal_status() {
        let store = Arc::new(MemoryStore::new());
        let job_id = seeded_job(&store).await;
        let bus = Arc::new(InProcEventBus::new(8));
        let coordinator = Arc::new(SubtitleCoordinator::new(
            store.clone(),
            Arc::new(StaticAcquirer(SubtitleOutcome::Failed)),
            bus,
        ));

        coordinator.start(job_id, "The Show".into(), None).await;
        let status = coordinator
            .wait_ready(job_id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(status, Some(SubtitleStatus::Failed));
    }
}
