//! Match Worker Pool (spec.md §4.6): bounded-concurrency execution of
//! episode matching, decoupled from rip order.
//!
//! The concurrency bound is a `tokio::sync::Semaphore`, which is FIFO by
//! construction (acquire order matches the order permits become
//! available) — no separate priority queue is needed since spec.md §4.6
//! doesn't ask for one. Grounded on the bounded-worker pattern in
//! `ferrex-server/src/transcoding/queue.rs`'s `JobQueue`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::conflict_resolver::Organizer;
use crate::events::{DomainEvent, EventPublisher};
use crate::ids::{JobId, TitleId};
use crate::file_ready_gate::FileReadyGate;
use crate::model::{MatchDetails, RunnerUp, SubtitleStatus, Title, TitleState};
use crate::persistence::Store;
use crate::subtitle_coordinator::SubtitleGate;
use crate::{IngestError, Result};

/// Confidence at or above which a match is trusted without review
/// (spec.md §4.6 step 8 / GLOSSARY: "Confidence … ≥0.7 is a strong
/// match").
pub const CONFIDENCE_THRESHOLD: f64 = 0.7;

/// ±5 minutes, spec.md §4.6 step 4.
const DURATION_FILTER_TOLERANCE_SECS: f64 = 300.0;

const SUBTITLE_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// The external episode matcher (spec.md §1: "invoked as a single
/// `IdentifyEpisode(file, season) → MatchResult` call").
#[async_trait]
pub trait EpisodeMatcher: Send + Sync {
    async fn identify_episode(&self, file_path: &Path, series_name: &str, season: Option<i32>) -> anyhow::Result<MatchOutcome>;
}

#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// `None` if the matcher found no confident candidate at all (spec.md
    /// §4.6 step 8: "`review` if the matcher returned no match").
    pub episode_code: Option<String>,
    pub confidence: f64,
    pub vote_count: u32,
    pub file_coverage: f64,
    pub score_gap: f64,
    pub runner_ups: Vec<RunnerUp>,
}

/// The external metadata source's per-episode runtime lookup (spec.md
/// §6: "fetch season → episode count and per-episode runtime minutes").
#[async_trait]
pub trait DurationFilter: Send + Sync {
    async fn expected_runtimes_secs(&self, series_name: &str, season: Option<i32>) -> anyhow::Result<Vec<f64>>;
}

/// Everything a single match task needs to resolve `job_id`/`title_id`
/// into a series name and season for the external collaborators.
pub struct MatchTask {
    pub job_id: JobId,
    pub title_id: TitleId,
    pub file_path: PathBuf,
    pub series_name: String,
    pub season: Option<i32>,
    pub expected_size_bytes: u64,
}

/// Bounded-concurrency scheduler for match tasks (spec.md §4.6).
pub struct MatchWorkerPool {
    store: Arc<dyn Store>,
    events: Arc<dyn EventPublisher>,
    subtitle_gate: Arc<dyn SubtitleGate>,
    file_ready_gate: Arc<FileReadyGate>,
    matcher: Arc<dyn EpisodeMatcher>,
    duration_filter: Arc<dyn DurationFilter>,
    organizer: Arc<dyn Organizer>,
    semaphore: Arc<Semaphore>,
}

impl MatchWorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<dyn EventPublisher>,
        subtitle_gate: Arc<dyn SubtitleGate>,
        file_ready_gate: Arc<FileReadyGate>,
        matcher: Arc<dyn EpisodeMatcher>,
        duration_filter: Arc<dyn DurationFilter>,
        organizer: Arc<dyn Organizer>,
        max_concurrent_matches: usize,
    ) -> Self {
        Self {
            store,
            events,
            subtitle_gate,
            file_ready_gate,
            matcher,
            duration_filter,
            organizer,
            semaphore: Arc::new(Semaphore::new(max_concurrent_matches.max(1))),
        }
    }

    /// Spawns the match task as an independent tokio task, returning
    /// immediately — the Match Worker Pool's concurrency bound governs
    /// how many run their matcher call at once, not how many tasks are
    /// in flight overall (steps 1–4 of spec.md §4.6 run before the
    /// semaphore is even acquired).
    pub fn spawn(self: &Arc<Self>, task: MatchTask) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.run_task(task).await {
                warn!(error = %err, "match task failed outside its own error handling");
            }
        });
    }

    async fn run_task(&self, task: MatchTask) -> Result<()> {
        // Step 1: subtitle readiness, bounded wait.
        let subtitle_status = self
            .subtitle_gate
            .wait_ready(task.job_id, SUBTITLE_WAIT_TIMEOUT)
            .await?;

        // Step 2: a failed subtitle pass sends the title straight to
        // review without touching the matcher.
        if subtitle_status == Some(SubtitleStatus::Failed) {
            self.to_review(task.title_id, "subtitle_download_failed").await?;
            return self.check_job_completion(task.job_id).await;
        }

        // Step 3: file-ready gate.
        if !self.file_ready_gate.wait_ready(&task.file_path, task.expected_size_bytes).await {
            self.to_failed(task.title_id, "file_not_ready").await?;
            return self.check_job_completion(task.job_id).await;
        }

        // Step 4: duration filter — extras bypass matching entirely.
        match self.apply_duration_filter(&task).await {
            Ok(true) => return self.check_job_completion(task.job_id).await,
            Ok(false) => {}
            Err(err) => {
                warn!(title_id = task.title_id.0, error = %err, "duration filter lookup failed, proceeding to match");
            }
        }

        // Step 5–6: acquire a slot, then mark matching.
        let _permit = self.semaphore.acquire().await.map_err(|_| {
            IngestError::ValidationError("match worker pool semaphore closed".into())
        })?;
        self.transition_title(task.title_id, TitleState::Matching).await?;

        // Step 7–8: run the matcher and persist the result.
        let result = self
            .matcher
            .identify_episode(&task.file_path, &task.series_name, task.season)
            .await;

        match result {
            Ok(outcome) => self.persist_match_result(task.title_id, outcome).await?,
            Err(err) => {
                warn!(title_id = task.title_id.0, error = %err, "matcher invocation failed");
                self.mark_matching_task_failed(task.title_id, &err.to_string()).await?;
            }
        }

        // Step 9 happens implicitly: `_permit` drops at the end of scope.
        // Step 10: always check completion, even on failure.
        self.check_job_completion(task.job_id).await
    }

    async fn apply_duration_filter(&self, task: &MatchTask) -> anyhow::Result<bool> {
        let Some(mut title) = self.store.get_title(task.title_id).await? else {
            return Ok(false);
        };

        let runtimes = self
            .duration_filter
            .expected_runtimes_secs(&task.series_name, task.season)
            .await?;

        let matches_any = runtimes
            .iter()
            .any(|&expected| (title.duration_secs - expected).abs() <= DURATION_FILTER_TOLERANCE_SECS);

        if matches_any || runtimes.is_empty() {
            return Ok(false);
        }

        let destination = self.organizer.organize_extra(&title).await?;
        title.is_extra = true;
        title.organized_to = Some(destination);
        title.state = TitleState::Completed;
        title.updated_at = Utc::now();
        self.store.update_title(title.clone()).await?;
        self.events
            .publish(DomainEvent::title_update(
                task.job_id,
                task.title_id,
                TitleState::Completed,
                vec!["is_extra".into(), "organized_to".into()],
            ))
            .await?;
        info!(title_id = task.title_id.0, "title routed to extras by duration filter");
        Ok(true)
    }

    async fn persist_match_result(&self, title_id: TitleId, outcome: MatchOutcome) -> Result<()> {
        let Some(mut title) = self.store.get_title(title_id).await? else {
            return Ok(());
        };

        let details = MatchDetails {
            score: outcome.confidence,
            vote_count: outcome.vote_count,
            file_coverage: outcome.file_coverage,
            score_gap: outcome.score_gap,
            runner_ups: outcome.runner_ups,
            error: None,
            conflict_reason: None,
        };
        title.match_details = serde_json::to_value(&details).ok();
        title.confidence = Some(outcome.confidence);
        title.updated_at = Utc::now();

        title.state = match &outcome.episode_code {
            None => TitleState::Review,
            Some(code) => {
                title.matched_episode = Some(code.clone());
                if outcome.confidence >= CONFIDENCE_THRESHOLD {
                    TitleState::Matched
                } else {
                    TitleState::Review
                }
            }
        };

        let job_id = title.job_id;
        self.store.update_title(title.clone()).await?;
        self.events
            .publish(DomainEvent::title_update(
                job_id,
                title_id,
                title.state,
                vec!["matched_episode".into(), "confidence".into(), "match_details".into()],
            ))
            .await
    }

    async fn mark_matching_task_failed(&self, title_id: TitleId, message: &str) -> Result<()> {
        let Some(mut title) = self.store.get_title(title_id).await? else {
            return Ok(());
        };
        title.state = TitleState::Review;
        title.updated_at = Utc::now();
        title.match_details = serde_json::to_value(serde_json::json!({
            "error": "matching_task_failed",
            "message": message,
        }))
        .ok();
        let job_id = title.job_id;
        self.store.update_title(title.clone()).await?;
        self.events
            .publish(DomainEvent::title_update(job_id, title_id, TitleState::Review, vec!["match_details".into()]))
            .await
    }

    async fn to_review(&self, title_id: TitleId, reason: &str) -> Result<()> {
        let Some(mut title) = self.store.get_title(title_id).await? else {
            return Ok(());
        };
        title.state = TitleState::Review;
        title.updated_at = Utc::now();
        let mut details = title
            .match_details
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(|| MatchDetails::synthetic_error(reason));
        details.error = Some(reason.to_string());
        title.match_details = serde_json::to_value(details).ok();
        let job_id = title.job_id;
        self.store.update_title(title.clone()).await?;
        self.events
            .publish(DomainEvent::title_update(job_id, title_id, TitleState::Review, vec!["match_details".into()]))
            .await
    }

    async fn to_failed(&self, title_id: TitleId, reason: &str) -> Result<()> {
        let Some(mut title) = self.store.get_title(title_id).await? else {
            return Ok(());
        };
        title.state = TitleState::Failed;
        title.updated_at = Utc::now();
        title.match_details = serde_json::to_value(MatchDetails::synthetic_error(reason)).ok();
        let job_id = title.job_id;
        self.store.update_title(title.clone()).await?;
        self.events
            .publish(DomainEvent::title_update(job_id, title_id, TitleState::Failed, vec!["match_details".into()]))
            .await
    }

    async fn transition_title(&self, title_id: TitleId, state: TitleState) -> Result<()> {
        let Some(mut title) = self.store.get_title(title_id).await? else {
            return Ok(());
        };
        title.state = state;
        title.updated_at = Utc::now();
        let job_id = title.job_id;
        self.store.update_title(title.clone()).await?;
        self.events
            .publish(DomainEvent::title_update(job_id, title_id, state, vec!["state".into()]))
            .await
    }

    /// Checks whether every title of `job_id` has reached a terminal
    /// match state, and if so publishes `titles_discovered`-adjacent
    /// completion bookkeeping for the Job Orchestrator to pick up (spec.md
    /// §4.9 step 7). The actual finalization dispatch (Conflict Resolver
    /// vs. Organizer) lives in the orchestrator, which subscribes to the
    /// same event bus this publishes `title_update`s on.
    async fn check_job_completion(&self, job_id: JobId) -> Result<()> {
        let titles = self.store.list_titles_for_job(job_id).await?;
        if titles.iter().all(|t| t.state.is_settled()) {
            info!(job_id = job_id.0, "all titles settled, job ready for finalization");
        }
        Ok(())
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::InProcEventBus;
    use crate::model::Job;
    use crate::persistence::memory::MemoryStore;
    use crate::subtitle_coordinator::{SubtitleCoordinator, SubtitleOutcome};

    struct StaticMatcher(MatchOutcome);
    #[async_trait]
    impl EpisodeMatcher for StaticMatcher {
        async fn identify_episode(&self, _file_path: &Path, _series_name: &str, _season: Option<i32>) -> anyhow::Result<MatchOutcome> {
            Ok(self.0.clone())
        }
    }

    struct StaticDurationFilter(Vec<f64>);
    #[async_trait]
    impl DurationFilter for StaticDurationFilter {
        async fn expected_runtimes_secs(&self, _series_name: &str, _season: Option<i32>) -> anyhow::Result<Vec<f64>> {
            Ok(self.0.clone())
        }
    }

    struct NoopOrganizer;
    #[async_trait]
    impl Organizer for NoopOrganizer {
        async fn organize(&self, _title: &Title) -> anyhow::Result<PathBuf> {
            Ok(PathBuf::from("/library/x.mkv"))
        }
        async fn organize_extra(&self, _title: &Title) -> anyhow::Result<PathBuf> {
            Ok(PathBuf::from("/library/Extras/x.mkv"))
        }
    }

    struct AlwaysCompleteSubtitles;
    #[async_trait]
    impl SubtitleGate for AlwaysCompleteSubtitles {
        async fn wait_ready(&self, _job_id: JobId, _timeout: Duration) -> Result<Option<SubtitleStatus>> {
            Ok(Some(SubtitleStatus::Completed))
        }
    }

    async fn seed(store: &MemoryStore, duration_secs: f64) -> (JobId, TitleId) {
        let job_id = store.next_job_id();
        store
            .insert_job(Job::new(job_id, "/dev/sr0", "THE_SHOW", PathBuf::from("/tmp/staging")))
            .await
            .unwrap();
        let title_id = store.next_title_id();
        let mut title = Title::new(title_id, job_id, 0, duration_secs);
        title.state = TitleState::Ripping;
        title.expected_size_bytes = 1000;
        store.insert_title(title).await.unwrap();
        (job_id, title_id)
    }

    fn pool(
        store: Arc<MemoryStore>,
        events: Arc<InProcEventBus>,
        matcher: MatchOutcome,
        runtimes: Vec<f64>,
    ) -> Arc<MatchWorkerPool> {
        Arc::new(MatchWorkerPool::new(
            store,
            events,
            Arc::new(AlwaysCompleteSubtitles),
            Arc::new(FileReadyGate::new(Duration::from_millis(1), 1, Duration::from_millis(50))),
            Arc::new(StaticMatcher(matcher)),
            Arc::new(StaticDurationFilter(runtimes)),
            Arc::new(NoopOrganizer),
            2,
        ))
    }

    #[tokio::test]
    async fn duration_filter_routes_short_title_to_extras() {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(InProcEventBus::new(16));
        let (job_id, title_id) = seed(&store, 600.0).await;

        let matcher_outcome = MatchOutcome {
            episode_code: Some("S01E01".into()),
            confidence: 0.9,
            vote_count: 10,
            file_coverage: 0.9,
            score_gap: 0.1,
            runner_ups: vec![],
        };
        let pool = pool(store.clone(), events.clone(), matcher_outcome, vec![1400.0, 1500.0, 1600.0]);

        pool.run_task(MatchTask {
            job_id,
            title_id,
            file_path: PathBuf::from("/tmp/staging/t00.mkv"),
            series_name: "The Show".into(),
            season: Some(1),
            expected_size_bytes: 1000,
        })
        .await
        .unwrap();

        let title = store.get_title(title_id).await.unwrap().unwrap();
        assert!(title.is_extra);
        assert_eq!(title.state, TitleState::Completed);
    }

    #[tokio::test]
    async fn matching_title_within_tolerance_is_matched() {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(InProcEventBus::new(16));
        let (job_id, title_id) = seed(&store, 1420.0).await;

        let matcher_outcome = MatchOutcome {
            episode_code: Some("S01E01".into()),
            confidence: 0.9,
            vote_count: 10,
            file_coverage: 0.9,
            score_gap: 0.1,
            runner_ups: vec![],
        };
        let pool = pool(store.clone(), events.clone(), matcher_outcome, vec![1400.0, 1500.0, 1600.0]);

        pool.run_task(MatchTask {
            job_id,
            title_id,
            file_path: PathBuf::from("/tmp/staging/t00.mkv"),
            series_name: "The Show".into(),
            season: Some(1),
            expected_size_bytes: 1000,
        })
        .await
        .unwrap();

        let title = store.get_title(title_id).await.unwrap().unwrap();
        assert!(!title.is_extra);
        assert_eq!(title.state, TitleState::Matched);
        assert_eq!(title.matched_episode.as_deref(), Some("S01E01"));
    }

    #[tokio::test]
    async fn subtitle_failure_short_circuits_before_matcher() {
        struct FailingSubtitles;
        #[async_trait]
        impl SubtitleGate for FailingSubtitles {
            async fn wait_ready(&self, _job_id: JobId, _timeout: Duration) -> Result<Option<SubtitleStatus>> {
                Ok(Some(SubtitleStatus::Failed))
            }
        }

        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(InProcEventBus::new(16));
        let (job_id, title_id) = seed(&store, 1420.0).await;

        let matcher_outcome = MatchOutcome {
            episode_code: Some("S01E01".into()),
            confidence: 0.9,
            vote_count: 10,
            file_coverage: 0.9,
            score_gap: 0.1,
            runner_ups: vec![],
        };

        let pool = Arc::new(MatchWorkerPool::new(
            store.clone(),
            events.clone(),
            Arc::new(FailingSubtitles),
            Arc::new(FileReadyGate::new(Duration::from_millis(1), 1, Duration::from_millis(50))),
            Arc::new(StaticMatcher(matcher_outcome)),
            Arc::new(StaticDurationFilter(vec![1400.0])),
            Arc::new(NoopOrganizer),
            2,
        ));

        pool.run_task(MatchTask {
            job_id,
            title_id,
            file_path: PathBuf::from("/tmp/staging/t00.mkv"),
            series_name: "The Show".into(),
            season: Some(1),
            expected_size_bytes: 1000,
        })
        .await
        .unwrap();

        let title = store.get_title(title_id).await.unwrap().unwrap();
        assert_eq!(title.state, TitleState::Review);
    }

    #[tokio::test]
    async fn unconfident_or_missing_match_goes_to_review_state_is_still_settled() {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(InProcEventBus::new(16));
        let (job_id, title_id) = seed(&store, 1420.0).await;

        let matcher_outcome = MatchOutcome {
            episode_code: None,
            confidence: 0.0,
            vote_count: 0,
            file_coverage: 0.0,
            score_gap: 0.0,
            runner_ups: vec![],
        };
        let pool = pool(store.clone(), events.clone(), matcher_outcome, vec![1400.0]);

        pool.run_task(MatchTask {
            job_id,
            title_id,
            file_path: PathBuf::from("/tmp/staging/t00.mkv"),
            series_name: "The Show".into(),
            season: Some(1),
            expected_size_bytes: 1000,
        })
        .await
        .unwrap();

        let title = store.get_title(title_id).await.unwrap().unwrap();
        assert_eq!(title.state, TitleState::Review);
        assert!(title.state.is_settled());
    }

    #[tokio::test]
    async fn subtitle_coordinator_implements_the_gate_trait_object_safely() {
        let store = Arc::new(MemoryStore::new());
        let events: Arc<InProcEventBus> = Arc::new(InProcEventBus::new(8));

        struct Completes;
        #[async_trait]
        impl crate::subtitle_coordinator::SubtitleAcquirer for Completes {
            async fn acquire(&self, _job_id: JobId, _show_name: &str, _season: Option<i32>) -> anyhow::Result<SubtitleOutcome> {
                Ok(SubtitleOutcome::Completed)
            }
        }

        let coordinator: Arc<dyn SubtitleGate> = Arc::new(SubtitleCoordinator::new(store, Arc::new(Completes), events));
        let (job_id, _) = (JobId(1), ());
        // Never started: should time out quickly rather than panic.
        let status = coordinator.wait_ready(job_id, Duration::from_millis(10)).await.unwrap();
        assert_eq!(status, None);
    }
}
