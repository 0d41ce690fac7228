//! Job Orchestrator (spec.md §4.9): top-level per-job coordination,
//! composing every other component into the full identify → rip → match →
//! resolve → organize pipeline, plus the review and cancellation branches.
//!
//! Grounded on `ferrex-server/src/infra/scan/scan_manager.rs`'s
//! `ScanControlPlane`: a command/read-model split over a guarded active-jobs
//! registry (`Arc<RwLock<HashMap<_, _>>>`), with one independent task per
//! running job rather than a single serialized event loop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::conflict_resolver::{ConflictResolverService, Organizer};
use crate::events::{DomainEvent, EventPublisher};
use crate::ids::{DriveId, JobId, TitleId};
use crate::match_pool::{MatchTask, MatchWorkerPool};
use crate::model::{ContentType, Job, JobState, Title, TitleState};
use crate::persistence::Store;
use crate::rip_driver::{RipDriver, RipEvent};
use crate::subtitle_coordinator::{SubtitleAcquirer, SubtitleCoordinator};
use crate::{IngestError, Result};

/// A title the external disc scanner reported (spec.md §1: disc
/// classification and title parsing are external pure functions; the
/// Orchestrator only consumes their output).
#[derive(Debug, Clone)]
pub struct DetectedTitle {
    pub title_index: i32,
    pub duration_secs: f64,
    pub expected_size_bytes: u64,
    pub chapter_count: i32,
    pub resolution_label: Option<String>,
    /// "Play All" concatenation of the disc's real episodes/feature — never
    /// selected for ripping (spec.md §4.9 step 2).
    pub is_play_all: bool,
    /// Feature-length candidate under movie classification; more than one
    /// of these triggers the movie-ambiguous branch (spec.md §4.9 step 8).
    pub is_feature_length: bool,
}

/// Result of identifying an inserted disc (spec.md §4.9 step 2).
#[derive(Debug, Clone)]
pub struct DiscIdentification {
    pub content_type: ContentType,
    pub detected_title: Option<String>,
    pub detected_season: Option<i32>,
    pub titles: Vec<DetectedTitle>,
    /// `true` when the disc-classification heuristics couldn't decide
    /// confidently and a human should choose before ripping proceeds.
    pub needs_review: bool,
}

/// The external disc scanner's identification call (spec.md §6: `<bin> -r
/// info dev:<drive>`).
#[async_trait]
pub trait DiscScanner: Send + Sync {
    async fn identify(&self, drive_spec: &str) -> anyhow::Result<DiscIdentification>;
}

/// Requests disc ejection after ripping completes (spec.md §4.9 step 6).
#[async_trait]
pub trait Ejector: Send + Sync {
    async fn eject(&self, drive_spec: &str) -> anyhow::Result<()>;
}

struct ActiveJob {
    drive_spec: String,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Top-level per-job coordinator. One instance serves every job; each
/// running job gets its own spawned task, tracked in `active` so
/// [`Self::cancel_job`] can reach it.
pub struct JobOrchestrator<S: Store + 'static> {
    store: Arc<S>,
    events: Arc<dyn EventPublisher>,
    subtitles: Arc<SubtitleCoordinator<S, Arc<dyn SubtitleAcquirer>>>,
    match_pool: Arc<MatchWorkerPool>,
    conflict_resolver: ConflictResolverService<S, Arc<dyn Organizer>>,
    organizer: Arc<dyn Organizer>,
    disc_scanner: Arc<dyn DiscScanner>,
    ejector: Arc<dyn Ejector>,
    rip_binary_path: String,
    staging_root: PathBuf,
    active: RwLock<HashMap<JobId, ActiveJob>>,
}

impl<S: Store + 'static> JobOrchestrator<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        events: Arc<dyn EventPublisher>,
        subtitles: Arc<SubtitleCoordinator<S, Arc<dyn SubtitleAcquirer>>>,
        match_pool: Arc<MatchWorkerPool>,
        organizer: Arc<dyn Organizer>,
        disc_scanner: Arc<dyn DiscScanner>,
        ejector: Arc<dyn Ejector>,
        rip_binary_path: impl Into<String>,
        staging_root: PathBuf,
    ) -> Self {
        let conflict_resolver =
            ConflictResolverService::new(store.clone(), organizer.clone(), events.clone());
        Self {
            store,
            events,
            subtitles,
            match_pool,
            conflict_resolver,
            organizer,
            disc_scanner,
            ejector,
            rip_binary_path: rip_binary_path.into(),
            staging_root,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Spec.md §4.9 step 1: creates a Job for a newly-inserted drive unless
    /// one is already active for it. Does not start identification — that
    /// happens on an explicit `start_job` call (spec.md §6 `POST
    /// /jobs/{id}/start`).
    pub async fn on_drive_inserted(&self, drive_id: DriveId, volume_label: Option<String>) -> Result<Option<Job>> {
        if self.store.find_active_job_for_drive(&drive_id).await?.is_some() {
            return Ok(None);
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let staging_dir = self.staging_root.join(format!("job_{timestamp}"));
        let job_id = self.store.allocate_job_id().await?;
        let job = Job::new(
            job_id,
            drive_id,
            volume_label.unwrap_or_else(|| "UNKNOWN".to_string()),
            staging_dir,
        );
        let job = self.store.insert_job(job).await?;
        self.events
            .publish(DomainEvent::job_update(job.id, job.state, vec!["state".into()]))
            .await?;
        Ok(Some(job))
    }

    /// Spec.md §6 `POST /jobs/{id}/start`: begins ripping from `idle` (runs
    /// identification first) or resumes straight into ripping from
    /// `review_needed` (titles already exist — movie-ambiguous resubmission
    /// or a resolved classification review).
    pub async fn start_job(self: &Arc<Self>, job_id: JobId) -> Result<()> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Err(IngestError::NotFound(format!("job {job_id}")));
        };

        match job.state {
            JobState::Idle => self.identify_then_rip(job).await,
            JobState::ReviewNeeded => self.begin_rip(job).await,
            other => Err(IngestError::ValidationError(format!(
                "cannot start job {job_id} from state {other:?}"
            ))),
        }
    }

    async fn identify_then_rip(self: &Arc<Self>, mut job: Job) -> Result<()> {
        let job_id = job.id;
        self.transition_job(&mut job, JobState::Identifying, None).await?;

        let identification = match self.disc_scanner.identify(&job.drive_id).await {
            Ok(id) => id,
            Err(err) => {
                self.transition_job(&mut job, JobState::Failed, Some(&err.to_string())).await?;
                return Ok(());
            }
        };

        job.content_type = identification.content_type;
        job.detected_title = identification.detected_title.clone();
        job.detected_season = identification.detected_season;
        job.total_titles = Some(identification.titles.len() as i32);
        job.updated_at = Utc::now();
        self.store.update_job(job.clone()).await?;

        let feature_candidates = identification
            .titles
            .iter()
            .filter(|t| t.is_feature_length && !t.is_play_all)
            .count();
        let movie_ambiguous = identification.content_type == ContentType::Movie && feature_candidates > 1;

        let mut title_ids = Vec::new();
        for detected in &identification.titles {
            let title_id = self.store.allocate_title_id().await?;
            let mut title = Title::new(title_id, job_id, detected.title_index, detected.duration_secs);
            title.expected_size_bytes = detected.expected_size_bytes;
            title.chapter_count = detected.chapter_count;
            title.resolution_label = detected.resolution_label.clone();
            title.is_selected = !detected.is_play_all;
            let title = self.store.insert_title(title).await?;
            title_ids.push(title.id);
        }
        self.events
            .publish(DomainEvent::titles_discovered(job_id, title_ids))
            .await?;

        if identification.content_type == ContentType::Tv {
            if let Some(show) = &job.detected_title {
                self.subtitles
                    .start(job_id, show.clone(), job.detected_season)
                    .await;
            }
        }

        if identification.needs_review || movie_ambiguous {
            self.transition_job(&mut job, JobState::ReviewNeeded, None).await?;
            return Ok(());
        }

        self.begin_rip(job).await
    }

    async fn begin_rip(self: &Arc<Self>, mut job: Job) -> Result<()> {
        let job_id = job.id;
        self.transition_job(&mut job, JobState::Ripping, None).await?;

        let titles = self.store.list_titles_for_job(job_id).await?;
        let selected: Vec<Title> = titles.into_iter().filter(|t| t.is_selected).collect();
        let indices: Vec<i32> = selected.iter().map(|t| t.title_index).collect();

        let this = self.clone();
        let drive_spec = job.drive_id.clone();
        let staging_dir = job.staging_dir.clone();
        let rip_binary = self.rip_binary_path.clone();
        let driver = RipDriver::new(rip_binary);
        // Shared with the active-jobs registry entry: `cancel_job` flips
        // this same flag, which the driver checks at the top of every
        // read/poll cycle (spec.md §5: "within one output-polling interval").
        let cancel_flag = driver.cancel_flag();

        let task = tokio::spawn(async move {
            let (tx, rx) = mpsc::channel(64);
            let drive_for_rip = drive_spec.clone();
            let output_dir = staging_dir.clone();
            let indices_opt = if indices.is_empty() { None } else { Some(indices.as_slice()) };

            let progress_task = {
                let this = this.clone();
                tokio::spawn(async move { this.pump_rip_events(job_id, rx, selected).await })
            };

            let outcome = driver.rip(&drive_for_rip, &output_dir, indices_opt, tx).await;
            let _ = progress_task.await;

            if let Err(err) = this.run_backfill(job_id, &output_dir).await {
                warn!(job_id = job_id.0, error = %err, "backfill pass failed");
            }

            if outcome.success {
                if let Err(err) = this.ejector.eject(&drive_for_rip).await {
                    warn!(job_id = job_id.0, error = %err, "eject failed");
                }
            } else if let Some(message) = outcome.error_message {
                if let Err(err) = this.fail_job(job_id, &message).await {
                    error!(job_id = job_id.0, error = %err, "failed to mark job failed after rip error");
                }
                this.active.write().await.remove(&job_id);
                return;
            }

            if let Err(err) = this.check_job_completion(job_id).await {
                error!(job_id = job_id.0, error = %err, "completion check failed after rip");
            }
            this.active.write().await.remove(&job_id);
        });

        self.active.write().await.insert(
            job_id,
            ActiveJob {
                drive_spec: job.drive_id.clone(),
                cancel: cancel_flag,
                task,
            },
        );

        Ok(())
    }

    async fn pump_rip_events(self: &Arc<Self>, job_id: JobId, mut rx: mpsc::Receiver<RipEvent>, sorted_titles: Vec<Title>) {
        let mut bytes_done: u64 = 0;
        let start = tokio::time::Instant::now();

        while let Some(event) = rx.recv().await {
            match event {
                RipEvent::Progress {
                    percent,
                    current_title_index,
                    total_titles,
                } => {
                    if let Err(err) = self
                        .update_rip_progress(job_id, percent, current_title_index, total_titles, &start, &mut bytes_done)
                        .await
                    {
                        warn!(job_id = job_id.0, error = %err, "failed to persist rip progress");
                    }
                }
                RipEvent::TitleComplete { path, title_index } => {
                    if let Err(err) = self.report_title_ripped(job_id, title_index, path, &sorted_titles).await {
                        warn!(job_id = job_id.0, error = %err, "failed to process title completion");
                    }
                }
            }
        }
    }

    async fn update_rip_progress(
        &self,
        job_id: JobId,
        percent: f64,
        current_title_index: Option<i32>,
        total_titles: Option<i32>,
        start: &tokio::time::Instant,
        bytes_done: &mut u64,
    ) -> Result<()> {
        let Some(mut job) = self.store.get_job(job_id).await? else {
            return Ok(());
        };
        job.percent = percent;
        job.current_title_index = current_title_index;
        job.total_titles = total_titles;
        *bytes_done += 1;
        let elapsed = start.elapsed().as_secs_f64().max(0.001);
        job.transfer_speed = Some(format!("{:.1} titles/s", *bytes_done as f64 / elapsed));
        job.eta_seconds = if percent > 0.0 {
            Some(((100.0 - percent) / percent.max(0.01) * elapsed) as i64)
        } else {
            None
        };
        job.updated_at = Utc::now();
        self.store.update_job(job.clone()).await?;
        self.events
            .publish(DomainEvent::job_update(
                job_id,
                job.state,
                vec!["percent".into(), "transfer_speed".into(), "eta_seconds".into()],
            ))
            .await
    }

    /// Spec.md §4.9 step 4: maps a ripped file to a Title by parsed rip
    /// index, falling back to the next not-yet-ripped selected title in
    /// disc order. Idempotent: a title whose `output_filename` is already
    /// set is left untouched, satisfying the "set exactly once" invariant
    /// and allowing both the rip callback and the backfill pass (step 5)
    /// to call this safely for the same file.
    pub async fn report_title_ripped(
        &self,
        job_id: JobId,
        rip_index: Option<i32>,
        path: PathBuf,
        sorted_titles: &[Title],
    ) -> Result<()> {
        let target = match rip_index {
            Some(idx) => sorted_titles.iter().find(|t| t.title_index == idx),
            None => None,
        };
        let target = match target {
            Some(t) => Some(t.clone()),
            None => {
                let titles = self.store.list_titles_for_job(job_id).await?;
                titles
                    .into_iter()
                    .filter(|t| t.is_selected && t.output_filename.is_none())
                    .min_by_key(|t| t.title_index)
            }
        };

        let Some(mut title) = target else {
            warn!(job_id = job_id.0, path = %path.display(), "ripped file did not map to any title");
            return Ok(());
        };

        if title.output_filename.is_some() {
            return Ok(());
        }

        title.output_filename = Some(path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default());
        title.updated_at = Utc::now();
        title.state = TitleState::Ripping;
        self.store.update_title(title.clone()).await?;
        self.events
            .publish(DomainEvent::title_update(
                job_id,
                title.id,
                title.state,
                vec!["output_filename".into()],
            ))
            .await?;

        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(());
        };

        if job.content_type == ContentType::Tv {
            let series_name = job.detected_title.clone().unwrap_or_else(|| job.volume_label.clone());
            self.match_pool.spawn(MatchTask {
                job_id,
                title_id: title.id,
                file_path: path,
                series_name,
                season: job.detected_season,
                expected_size_bytes: title.expected_size_bytes,
            });
        } else {
            title.state = TitleState::Matched;
            title.organized_to = None;
            title.updated_at = Utc::now();
            self.store.update_title(title.clone()).await?;
            self.events
                .publish(DomainEvent::title_update(job_id, title.id, title.state, vec!["state".into()]))
                .await?;
            self.check_job_completion(job_id).await?;
        }

        Ok(())
    }

    /// Spec.md §4.9 step 5: scans the staging directory after the Rip
    /// Driver exits for any `.mkv` file whose title never got an
    /// `output_filename`, and synthesizes a late completion for it.
    async fn run_backfill(&self, job_id: JobId, staging_dir: &Path) -> Result<()> {
        let titles = self.store.list_titles_for_job(job_id).await?;
        let mut entries = match tokio::fs::read_dir(staging_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %staging_dir.display(), error = %err, "backfill pass could not read staging dir");
                return Ok(());
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("mkv") {
                continue;
            }
            let filename = path.file_name().map(|n| n.to_string_lossy().to_string());
            let already_reported = titles
                .iter()
                .any(|t| t.output_filename.as_deref() == filename.as_deref());
            if already_reported {
                continue;
            }
            info!(job_id = job_id.0, path = %path.display(), "backfill reporting unclaimed rip output");
            self.report_title_ripped(job_id, None, path, &titles).await?;
        }

        Ok(())
    }

    /// Spec.md §4.9 step 7: a job is ready for finalization once every
    /// title has reached a terminal match state.
    pub async fn check_job_completion(&self, job_id: JobId) -> Result<()> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(());
        };
        if job.state.is_terminal() {
            return Ok(());
        }

        let titles = self.store.list_titles_for_job(job_id).await?;
        if titles.is_empty() || !titles.iter().all(|t| t.state.is_settled()) {
            return Ok(());
        }

        match job.content_type {
            ContentType::Tv => {
                let final_state = self.conflict_resolver.resolve_job(job_id).await?;
                self.set_job_state(job_id, final_state, None).await?;
            }
            ContentType::Movie | ContentType::Unknown => {
                self.finalize_movie(job_id, &titles).await?;
            }
        }

        Ok(())
    }

    async fn finalize_movie(&self, job_id: JobId, titles: &[Title]) -> Result<()> {
        let candidates: Vec<&Title> = titles.iter().filter(|t| t.state == TitleState::Matched).collect();

        if candidates.len() > 1 {
            // Movie-ambiguous branch (spec.md §4.9 step 8): more than one
            // feature-length rip survived, the user must pick.
            self.set_job_state(job_id, JobState::ReviewNeeded, None).await?;
            return Ok(());
        }

        let Some(title) = candidates.into_iter().next() else {
            let any_review = titles.iter().any(|t| t.state == TitleState::Review);
            let final_state = if any_review { JobState::ReviewNeeded } else { JobState::Failed };
            self.set_job_state(job_id, final_state, None).await?;
            return Ok(());
        };

        let mut title = title.clone();
        match self.organizer.organize(&title).await {
            Ok(path) => {
                title.state = TitleState::Completed;
                title.organized_to = Some(path.clone());
                title.updated_at = Utc::now();
                self.store.update_title(title.clone()).await?;
                self.events
                    .publish(DomainEvent::title_update(
                        job_id,
                        title.id,
                        title.state,
                        vec!["state".into(), "organized_to".into()],
                    ))
                    .await?;

                let Some(mut job) = self.store.get_job(job_id).await? else {
                    return Ok(());
                };
                job.final_path = Some(path);
                job.updated_at = Utc::now();
                self.store.update_job(job.clone()).await?;
                self.set_job_state(job_id, JobState::Completed, None).await?;
            }
            Err(err) => {
                warn!(title_id = title.id.0, error = %err, "movie organize failed, sending to review");
                title.state = TitleState::Review;
                title.updated_at = Utc::now();
                self.store.update_title(title.clone()).await?;
                self.events
                    .publish(DomainEvent::title_update(job_id, title.id, title.state, vec!["state".into()]))
                    .await?;
                self.set_job_state(job_id, JobState::ReviewNeeded, None).await?;
            }
        }

        Ok(())
    }

    /// Spec.md §4.9 step 9: records the user's review choice, deletes
    /// competing rips for the movie-ambiguous branch, and advances the job
    /// to finalization.
    pub async fn apply_review(
        &self,
        job_id: JobId,
        title_id: TitleId,
        episode_code: Option<String>,
        edition: Option<String>,
    ) -> Result<()> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Err(IngestError::NotFound(format!("job {job_id}")));
        };
        let titles = self.store.list_titles_for_job(job_id).await?;

        let Some(mut chosen) = titles.iter().find(|t| t.id == title_id).cloned() else {
            return Err(IngestError::NotFound(format!("title {title_id}")));
        };

        if let Some(code) = episode_code {
            chosen.matched_episode = Some(code);
        }
        chosen.edition = edition;
        chosen.state = TitleState::Matched;
        chosen.updated_at = Utc::now();
        self.store.update_title(chosen.clone()).await?;

        if job.content_type == ContentType::Movie {
            for other in titles.iter().filter(|t| t.id != title_id && t.state == TitleState::Matched) {
                if let Some(path) = &other.organized_to {
                    let _ = tokio::fs::remove_file(path).await;
                }
                let mut discarded = other.clone();
                discarded.state = TitleState::Failed;
                discarded.updated_at = Utc::now();
                self.store.update_title(discarded).await?;
            }
        }

        self.events
            .publish(DomainEvent::title_update(
                job_id,
                title_id,
                chosen.state,
                vec!["matched_episode".into(), "edition".into()],
            ))
            .await?;

        self.check_job_completion(job_id).await
    }

    /// Spec.md §6 `POST /jobs/{id}/process-matched`: organizes titles
    /// already resolved to `matched` without waiting for the rest of the
    /// disc to settle, so an operator stuck on a handful of `review` titles
    /// can claim the rest of the output now. Titles still in
    /// `review`/`pending`/`ripping` are left exactly as they are.
    pub async fn process_matched_titles(&self, job_id: JobId) -> Result<()> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Err(IngestError::NotFound(format!("job {job_id}")));
        };

        let titles = self.store.list_titles_for_job(job_id).await?;
        let mut any_organized = false;

        for title in titles.iter().filter(|t| t.state == TitleState::Matched) {
            let mut title = title.clone();
            match self.organizer.organize(&title).await {
                Ok(path) => {
                    title.state = TitleState::Completed;
                    title.organized_to = Some(path);
                    title.updated_at = Utc::now();
                    any_organized = true;
                }
                Err(err) => {
                    warn!(title_id = title.id.0, error = %err, "organize failed during partial processing, sending to review");
                    title.state = TitleState::Review;
                    title.updated_at = Utc::now();
                }
            }
            self.store.update_title(title.clone()).await?;
            self.events
                .publish(DomainEvent::title_update(
                    job_id,
                    title.id,
                    title.state,
                    vec!["state".into(), "organized_to".into()],
                ))
                .await?;
        }

        if !any_organized {
            return Ok(());
        }

        let remaining = self.store.list_titles_for_job(job_id).await?;
        if remaining.iter().all(|t| t.state.is_settled()) {
            return self.check_job_completion(job_id).await;
        }

        if job.state != JobState::ReviewNeeded {
            self.set_job_state(job_id, JobState::ReviewNeeded, None).await?;
        }

        Ok(())
    }

    /// Spec.md §4.9 step 10: cancels the Rip Driver and any in-flight
    /// matching tasks for the job, then transitions it to `failed`.
    /// Cooperative and idempotent (spec.md §5): calling this twice, or
    /// after the job already finished, is a harmless no-op.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<()> {
        let active = self.active.read().await;
        if let Some(handle) = active.get(&job_id) {
            handle.cancel.store(true, Ordering::SeqCst);
            info!(job_id = job_id.0, drive = %handle.drive_spec, "cancel requested");
        }
        drop(active);

        self.fail_job(job_id, "cancelled").await
    }

    async fn fail_job(&self, job_id: JobId, message: &str) -> Result<()> {
        self.set_job_state(job_id, JobState::Failed, Some(message)).await
    }

    async fn set_job_state(&self, job_id: JobId, target: JobState, context: Option<&str>) -> Result<()> {
        let Some(mut job) = self.store.get_job(job_id).await? else {
            return Ok(());
        };
        if job.state == target {
            return Ok(());
        }
        job.state = target;
        job.updated_at = Utc::now();
        if target == JobState::Failed {
            job.error_message = context.map(str::to_string);
        }
        self.store.update_job(job.clone()).await?;
        self.events
            .publish(DomainEvent::job_update(job_id, target, vec!["state".into()]))
            .await
    }

    async fn transition_job(&self, job: &mut Job, target: JobState, context: Option<&str>) -> Result<()> {
        job.state = target;
        job.updated_at = Utc::now();
        if target == JobState::Failed {
            job.error_message = context.map(str::to_string);
        }
        *job = self.store.update_job(job.clone()).await?;
        self.events
            .publish(DomainEvent::job_update(job.id, target, vec!["state".into()]))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::InProcEventBus;
    use crate::file_ready_gate::FileReadyGate;
    use crate::match_pool::{DurationFilter, EpisodeMatcher, MatchOutcome};
    use crate::persistence::memory::MemoryStore;
    use crate::subtitle_coordinator::SubtitleOutcome;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicI64;

    struct SequentialStore {
        inner: MemoryStore,
        job_seq: AtomicI64,
        title_seq: AtomicI64,
    }

    impl SequentialStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                job_seq: AtomicI64::new(0),
                title_seq: AtomicI64::new(0),
            }
        }
    }

    #[async_trait]
    impl Store for SequentialStore {
        async fn allocate_job_id(&self) -> Result<JobId> {
            Ok(JobId(self.job_seq.fetch_add(1, Ordering::SeqCst) + 1))
        }

        async fn allocate_title_id(&self) -> Result<TitleId> {
            Ok(TitleId(self.title_seq.fetch_add(1, Ordering::SeqCst) + 1))
        }

        async fn insert_job(&self, mut job: Job) -> Result<Job> {
            if job.id.0 == 0 {
                job.id = JobId(self.job_seq.fetch_add(1, Ordering::SeqCst) + 1);
            }
            self.inner.insert_job(job).await
        }
        async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
            self.inner.get_job(id).await
        }
        async fn update_job(&self, job: Job) -> Result<Job> {
            self.inner.update_job(job).await
        }
        async fn delete_job(&self, id: JobId) -> Result<()> {
            self.inner.delete_job(id).await
        }
        async fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>> {
            self.inner.list_recent_jobs(limit).await
        }
        async fn find_active_job_for_drive(&self, drive_id: &str) -> Result<Option<Job>> {
            self.inner.find_active_job_for_drive(drive_id).await
        }
        async fn insert_title(&self, mut title: Title) -> Result<Title> {
            if title.id.0 == 0 {
                title.id = TitleId(self.title_seq.fetch_add(1, Ordering::SeqCst) + 1);
            }
            self.inner.insert_title(title).await
        }
        async fn get_title(&self, id: TitleId) -> Result<Option<Title>> {
            self.inner.get_title(id).await
        }
        async fn update_title(&self, title: Title) -> Result<Title> {
            self.inner.update_title(title).await
        }
        async fn list_titles_for_job(&self, job_id: JobId) -> Result<Vec<Title>> {
            self.inner.list_titles_for_job(job_id).await
        }
    }

    struct NoopOrganizer;
    #[async_trait]
    impl Organizer for NoopOrganizer {
        async fn organize(&self, title: &Title) -> anyhow::Result<PathBuf> {
            Ok(PathBuf::from(format!("/library/{}.mkv", title.id)))
        }
        async fn organize_extra(&self, title: &Title) -> anyhow::Result<PathBuf> {
            Ok(PathBuf::from(format!("/library/Extras/{}.mkv", title.id)))
        }
    }

    struct StaticMatcher(MatchOutcome);
    #[async_trait]
    impl EpisodeMatcher for StaticMatcher {
        async fn identify_episode(&self, _file_path: &Path, _series_name: &str, _season: Option<i32>) -> anyhow::Result<MatchOutcome> {
            Ok(self.0.clone())
        }
    }

    struct EmptyDurationFilter;
    #[async_trait]
    impl DurationFilter for EmptyDurationFilter {
        async fn expected_runtimes_secs(&self, _series_name: &str, _season: Option<i32>) -> anyhow::Result<Vec<f64>> {
            Ok(vec![])
        }
    }

    struct CompletingSubtitles;
    #[async_trait]
    impl SubtitleAcquirer for CompletingSubtitles {
        async fn acquire(&self, _job_id: JobId, _show_name: &str, _season: Option<i32>) -> anyhow::Result<SubtitleOutcome> {
            Ok(SubtitleOutcome::Completed)
        }
    }

    struct NeverScans;
    #[async_trait]
    impl DiscScanner for NeverScans {
        async fn identify(&self, _drive_spec: &str) -> anyhow::Result<DiscIdentification> {
            anyhow::bail!("not used in this test")
        }
    }

    struct NoopEjector;
    #[async_trait]
    impl Ejector for NoopEjector {
        async fn eject(&self, _drive_spec: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn build_orchestrator(matcher_outcome: MatchOutcome) -> Arc<JobOrchestrator<SequentialStore>> {
        let store = Arc::new(SequentialStore::new());
        let events: Arc<InProcEventBus> = Arc::new(InProcEventBus::new(32));
        let organizer: Arc<dyn Organizer> = Arc::new(NoopOrganizer);
        let subtitle_acquirer: Arc<dyn SubtitleAcquirer> = Arc::new(CompletingSubtitles);
        let subtitles = Arc::new(SubtitleCoordinator::new(
            store.clone(),
            Arc::new(subtitle_acquirer),
            events.clone(),
        ));

        let match_pool = Arc::new(MatchWorkerPool::new(
            store.clone(),
            events.clone(),
            subtitles.clone(),
            Arc::new(FileReadyGate::new(Duration::from_millis(1), 1, Duration::from_millis(50))),
            Arc::new(StaticMatcher(matcher_outcome)),
            Arc::new(EmptyDurationFilter),
            organizer.clone(),
            2,
        ));

        Arc::new(JobOrchestrator::new(
            store,
            events,
            subtitles,
            match_pool,
            organizer,
            Arc::new(NeverScans),
            Arc::new(NoopEjector),
            "makemkvcon",
            PathBuf::from("/tmp/staging"),
        ))
    }

    async fn seed_tv_job(orch: &Arc<JobOrchestrator<SequentialStore>>) -> (JobId, Vec<Title>) {
        let job = orch
            .store
            .insert_job(Job::new(JobId(0), "/dev/sr0", "THE_SHOW", PathBuf::from("/tmp/staging")))
            .await
            .unwrap();
        let mut job = job;
        job.content_type = ContentType::Tv;
        job.detected_title = Some("The Show".into());
        job.detected_season = Some(1);
        let job = orch.store.update_job(job).await.unwrap();

        let mut titles = Vec::new();
        for idx in 0..2 {
            let title = orch
                .store
                .insert_title(Title::new(TitleId(0), job.id, idx, 1400.0))
                .await
                .unwrap();
            titles.push(title);
        }
        (job.id, titles)
    }

    #[tokio::test]
    async fn report_title_ripped_is_idempotent_across_callback_and_backfill() {
        let outcome = MatchOutcome {
            episode_code: Some("S01E01".into()),
            confidence: 0.9,
            vote_count: 5,
            file_coverage: 0.9,
            score_gap: 0.2,
            runner_ups: vec![],
        };
        let orch = build_orchestrator(outcome);
        let (job_id, titles) = seed_tv_job(&orch).await;

        let path = PathBuf::from("THE_SHOW_t00.mkv");
        orch.report_title_ripped(job_id, Some(0), path.clone(), &titles).await.unwrap();
        let after_first = orch.store.list_titles_for_job(job_id).await.unwrap();
        let matched_title = after_first.iter().find(|t| t.title_index == 0).unwrap().clone();
        assert!(matched_title.output_filename.is_some());

        // A second, duplicate report for the same file (simulating the
        // backfill pass re-observing the callback's file) must not double
        // dispatch a match task or clobber the filename.
        orch.report_title_ripped(job_id, Some(0), path, &titles).await.unwrap();
        let after_second = orch.store.list_titles_for_job(job_id).await.unwrap();
        let still = after_second.iter().find(|t| t.title_index == 0).unwrap();
        assert_eq!(still.output_filename, matched_title.output_filename);
    }

    #[tokio::test]
    async fn movie_title_skips_matching_and_goes_straight_to_matched() {
        let outcome = MatchOutcome {
            episode_code: None,
            confidence: 0.0,
            vote_count: 0,
            file_coverage: 0.0,
            score_gap: 0.0,
            runner_ups: vec![],
        };
        let orch = build_orchestrator(outcome);

        let job = orch
            .store
            .insert_job(Job::new(JobId(0), "/dev/sr0", "A_MOVIE", PathBuf::from("/tmp/staging")))
            .await
            .unwrap();
        let mut job = job;
        job.content_type = ContentType::Movie;
        let job = orch.store.update_job(job).await.unwrap();
        let title = orch
            .store
            .insert_title(Title::new(TitleId(0), job.id, 0, 6000.0))
            .await
            .unwrap();

        orch.report_title_ripped(job.id, Some(0), PathBuf::from("A_MOVIE_t00.mkv"), &[title.clone()])
            .await
            .unwrap();

        let updated = orch.store.get_title(title.id).await.unwrap().unwrap();
        assert_eq!(updated.state, TitleState::Matched);
    }

    #[tokio::test]
    async fn cancel_job_transitions_to_failed_and_is_idempotent() {
        let orch = build_orchestrator(MatchOutcome {
            episode_code: None,
            confidence: 0.0,
            vote_count: 0,
            file_coverage: 0.0,
            score_gap: 0.0,
            runner_ups: vec![],
        });
        let (job_id, _titles) = seed_tv_job(&orch).await;

        orch.cancel_job(job_id).await.unwrap();
        let job = orch.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error_message.as_deref(), Some("cancelled"));

        // Calling cancel again on an already-failed job must not error.
        orch.cancel_job(job_id).await.unwrap();
    }

    #[tokio::test]
    async fn process_matched_titles_organizes_matched_and_leaves_review_alone() {
        let orch = build_orchestrator(MatchOutcome {
            episode_code: Some("S01E01".into()),
            confidence: 0.9,
            vote_count: 5,
            file_coverage: 0.9,
            score_gap: 0.2,
            runner_ups: vec![],
        });
        let (job_id, titles) = seed_tv_job(&orch).await;

        let mut matched = titles[0].clone();
        matched.state = TitleState::Matched;
        matched.matched_episode = Some("S01E01".into());
        orch.store.update_title(matched.clone()).await.unwrap();

        let mut stuck = titles[1].clone();
        stuck.state = TitleState::Review;
        orch.store.update_title(stuck.clone()).await.unwrap();

        orch.process_matched_titles(job_id).await.unwrap();

        let after = orch.store.list_titles_for_job(job_id).await.unwrap();
        let organized = after.iter().find(|t| t.id == matched.id).unwrap();
        assert_eq!(organized.state, TitleState::Completed);
        assert!(organized.organized_to.is_some());

        let untouched = after.iter().find(|t| t.id == stuck.id).unwrap();
        assert_eq!(untouched.state, TitleState::Review);

        let job = orch.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::ReviewNeeded);
    }

    #[tokio::test]
    async fn check_job_completion_is_a_noop_until_every_title_is_settled() {
        let orch = build_orchestrator(MatchOutcome {
            episode_code: Some("S01E01".into()),
            confidence: 0.9,
            vote_count: 5,
            file_coverage: 0.9,
            score_gap: 0.2,
            runner_ups: vec![],
        });
        let (job_id, _titles) = seed_tv_job(&orch).await;

        // Titles are still `pending`: completion check must not finalize.
        orch.check_job_completion(job_id).await.unwrap();
        let job = orch.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Idle);
    }
}
