//! Persistence Interface (spec.md §4.10): an opaque, transactional store
//! for jobs, titles, and config.
//!
//! Grounded on the trait-plus-adapter split in
//! `ferrex-core/src/database/traits.rs` (an async trait describing the
//! operations, with concrete adapters behind it) and the
//! `#[sqlx::test(migrator = ...)]` pattern used to exercise the Postgres
//! adapter in `dispatcher.rs`'s test suite.

use async_trait::async_trait;

use crate::ids::{JobId, TitleId};
use crate::model::{Job, Title};
use crate::Result;

/// Every mutation is wrapped in a transaction by the implementation
/// (spec.md §5: "every mutation is wrapped in a transaction"). Callers
/// never hold a `Job`/`Title` across an `.await` boundary and mutate it in
/// place; they re-read by id, compute the new value, and call the matching
/// `update_*` method (spec.md §9's "do not cache entities across
/// suspension points; re-read before write").
#[async_trait]
pub trait Store: Send + Sync {
    /// Allocates a fresh id for a not-yet-persisted job (spec.md §4.9 step
    /// 1: the Orchestrator assigns an id before the first `insert_job`).
    async fn allocate_job_id(&self) -> Result<JobId>;
    /// Allocates a fresh id for a not-yet-persisted title (spec.md §4.9
    /// step 2, one per detected track).
    async fn allocate_title_id(&self) -> Result<TitleId>;

    async fn insert_job(&self, job: Job) -> Result<Job>;
    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;
    async fn update_job(&self, job: Job) -> Result<Job>;
    async fn delete_job(&self, id: JobId) -> Result<()>;
    async fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>>;
    /// Jobs not yet in a terminal state, used to find an existing job for
    /// a drive on insertion (spec.md §4.9 step 1).
    async fn find_active_job_for_drive(&self, drive_id: &str) -> Result<Option<Job>>;

    async fn insert_title(&self, title: Title) -> Result<Title>;
    async fn get_title(&self, id: TitleId) -> Result<Option<Title>>;
    async fn update_title(&self, title: Title) -> Result<Title>;
    /// Ordered by `title_index` (spec.md §6: `GET /jobs/{id}/titles`).
    async fn list_titles_for_job(&self, job_id: JobId) -> Result<Vec<Title>>;
}

/// In-memory [`Store`] used by tests and by the in-process integration
/// suite. Not a production adapter.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryStore {
        jobs: Mutex<HashMap<JobId, Job>>,
        titles: Mutex<HashMap<TitleId, Title>>,
        next_job_id: AtomicI64,
        next_title_id: AtomicI64,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn next_job_id(&self) -> JobId {
            JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst) + 1)
        }

        pub fn next_title_id(&self) -> TitleId {
            TitleId(self.next_title_id.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn allocate_job_id(&self) -> Result<JobId> {
            Ok(self.next_job_id())
        }

        async fn allocate_title_id(&self) -> Result<TitleId> {
            Ok(self.next_title_id())
        }

        async fn insert_job(&self, job: Job) -> Result<Job> {
            self.jobs.lock().unwrap().insert(job.id, job.clone());
            Ok(job)
        }

        async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
            Ok(self.jobs.lock().unwrap().get(&id).cloned())
        }

        async fn update_job(&self, job: Job) -> Result<Job> {
            let mut jobs = self.jobs.lock().unwrap();
            if !jobs.contains_key(&job.id) {
                return Err(crate::IngestError::NotFound(format!("job {}", job.id)));
            }
            jobs.insert(job.id, job.clone());
            Ok(job)
        }

        async fn delete_job(&self, id: JobId) -> Result<()> {
            self.jobs.lock().unwrap().remove(&id);
            self.titles.lock().unwrap().retain(|_, t| t.job_id != id);
            Ok(())
        }

        async fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>> {
            let jobs = self.jobs.lock().unwrap();
            let mut all: Vec<Job> = jobs.values().cloned().collect();
            all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            all.truncate(limit);
            Ok(all)
        }

        async fn find_active_job_for_drive(&self, drive_id: &str) -> Result<Option<Job>> {
            let jobs = self.jobs.lock().unwrap();
            Ok(jobs
                .values()
                .find(|j| j.drive_id == drive_id && !j.state.is_terminal())
                .cloned())
        }

        async fn insert_title(&self, title: Title) -> Result<Title> {
            self.titles.lock().unwrap().insert(title.id, title.clone());
            Ok(title)
        }

        async fn get_title(&self, id: TitleId) -> Result<Option<Title>> {
            Ok(self.titles.lock().unwrap().get(&id).cloned())
        }

        async fn update_title(&self, title: Title) -> Result<Title> {
            let mut titles = self.titles.lock().unwrap();
            if !titles.contains_key(&title.id) {
                return Err(crate::IngestError::NotFound(format!("title {}", title.id)));
            }
            titles.insert(title.id, title.clone());
            Ok(title)
        }

        async fn list_titles_for_job(&self, job_id: JobId) -> Result<Vec<Title>> {
            let titles = self.titles.lock().unwrap();
            let mut list: Vec<Title> = titles.values().filter(|t| t.job_id == job_id).cloned().collect();
            list.sort_by_key(|t| t.title_index);
            Ok(list)
        }
    }
}

#[cfg(feature = "postgres")]
pub mod postgres {
    use super::*;
    use crate::model::{ContentType, JobState, SubtitleStatus, TitleState};
    use sqlx::{PgPool, Row};
    use std::path::PathBuf;

    /// `sqlx`/Postgres-backed [`Store`]. Three tables per spec.md §6:
    /// `app_config` (owned by `spindle-config`, not this crate),
    /// `disc_jobs`, `disc_titles`. Migration policy (§6): on startup,
    /// detect column mismatches against the model and rebuild the
    /// transient job/title tables on mismatch while preserving
    /// `app_config` rows — left to the embedding binary's startup
    /// sequence (`spindle-server`), which owns the `sqlx::migrate!` call.
    pub struct PostgresStore {
        pool: PgPool,
    }

    impl PostgresStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        /// Spec.md §6 migration policy: run the baseline migration, then
        /// compare `disc_jobs`/`disc_titles`'s live columns against the
        /// model's. A mismatch (a prior deploy's schema drifted from this
        /// binary's expectations) drops and recreates those two tables only
        /// — `app_config` rows are never touched here.
        pub async fn initialize_schema(&self) -> Result<()> {
            sqlx::migrate!("./migrations")
                .run(&self.pool)
                .await
                .map_err(|err| crate::IngestError::Database(sqlx::Error::Configuration(err.into())))?;

            if !self.schema_matches_model("disc_jobs", EXPECTED_JOB_COLUMNS).await?
                || !self.schema_matches_model("disc_titles", EXPECTED_TITLE_COLUMNS).await?
            {
                tracing::warn!("disc_jobs/disc_titles schema drift detected, rebuilding transient tables");
                sqlx::query("drop table if exists disc_titles, disc_jobs cascade")
                    .execute(&self.pool)
                    .await?;
                sqlx::migrate!("./migrations")
                    .run(&self.pool)
                    .await
                    .map_err(|err| crate::IngestError::Database(sqlx::Error::Configuration(err.into())))?;
            }

            Ok(())
        }

        async fn schema_matches_model(&self, table: &str, expected: &[&str]) -> Result<bool> {
            let rows = sqlx::query("select column_name from information_schema.columns where table_name = $1")
                .bind(table)
                .fetch_all(&self.pool)
                .await?;
            let mut present = std::collections::HashSet::with_capacity(rows.len());
            for row in &rows {
                present.insert(row.try_get::<String, _>("column_name")?);
            }
            Ok(expected.iter().all(|col| present.contains(*col)))
        }
    }

    const EXPECTED_JOB_COLUMNS: &[&str] = &[
        "id",
        "created_at",
        "updated_at",
        "drive_id",
        "volume_label",
        "content_type",
        "detected_title",
        "detected_season",
        "disc_number",
        "staging_dir",
        "state",
        "percent",
        "current_title_index",
        "total_titles",
        "transfer_speed",
        "eta_seconds",
        "final_path",
        "error_message",
        "subtitle_status",
    ];

    const EXPECTED_TITLE_COLUMNS: &[&str] = &[
        "id",
        "job_id",
        "title_index",
        "updated_at",
        "duration_secs",
        "expected_size_bytes",
        "chapter_count",
        "resolution_label",
        "is_selected",
        "is_extra",
        "state",
        "matched_episode",
        "confidence",
        "match_details",
        "edition",
        "output_filename",
        "organized_to",
    ];

    #[async_trait]
    impl Store for PostgresStore {
        async fn allocate_job_id(&self) -> Result<JobId> {
            let (id,): (i64,) = sqlx::query_as("select nextval(pg_get_serial_sequence('disc_jobs', 'id'))")
                .fetch_one(&self.pool)
                .await?;
            Ok(JobId(id))
        }

        async fn allocate_title_id(&self) -> Result<TitleId> {
            let (id,): (i64,) = sqlx::query_as("select nextval(pg_get_serial_sequence('disc_titles', 'id'))")
                .fetch_one(&self.pool)
                .await?;
            Ok(TitleId(id))
        }

        async fn insert_job(&self, job: Job) -> Result<Job> {
            sqlx::query(
                r#"
                insert into disc_jobs
                    (id, created_at, updated_at, drive_id, volume_label, content_type,
                     detected_title, detected_season, disc_number, staging_dir, state,
                     percent, current_title_index, total_titles, transfer_speed,
                     eta_seconds, final_path, error_message, subtitle_status)
                values
                    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                "#,
            )
            .bind(job.id.0)
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(&job.drive_id)
            .bind(&job.volume_label)
            .bind(content_type_str(job.content_type))
            .bind(&job.detected_title)
            .bind(job.detected_season)
            .bind(job.disc_number)
            .bind(job.staging_dir.to_string_lossy().to_string())
            .bind(job_state_str(job.state))
            .bind(job.percent)
            .bind(job.current_title_index)
            .bind(job.total_titles)
            .bind(&job.transfer_speed)
            .bind(job.eta_seconds)
            .bind(job.final_path.as_ref().map(|p| p.to_string_lossy().to_string()))
            .bind(&job.error_message)
            .bind(subtitle_status_str(job.subtitle_status))
            .execute(&self.pool)
            .await?;
            Ok(job)
        }

        async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
            let row = sqlx::query("select * from disc_jobs where id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
            row.map(job_from_row).transpose()
        }

        async fn update_job(&self, job: Job) -> Result<Job> {
            sqlx::query(
                r#"
                update disc_jobs set
                    updated_at = $2, state = $3, percent = $4, current_title_index = $5,
                    total_titles = $6, transfer_speed = $7, eta_seconds = $8,
                    final_path = $9, error_message = $10, subtitle_status = $11,
                    content_type = $12, detected_title = $13, detected_season = $14
                where id = $1
                "#,
            )
            .bind(job.id.0)
            .bind(job.updated_at)
            .bind(job_state_str(job.state))
            .bind(job.percent)
            .bind(job.current_title_index)
            .bind(job.total_titles)
            .bind(&job.transfer_speed)
            .bind(job.eta_seconds)
            .bind(job.final_path.as_ref().map(|p| p.to_string_lossy().to_string()))
            .bind(&job.error_message)
            .bind(subtitle_status_str(job.subtitle_status))
            .bind(content_type_str(job.content_type))
            .bind(&job.detected_title)
            .bind(job.detected_season)
            .execute(&self.pool)
            .await?;
            Ok(job)
        }

        async fn delete_job(&self, id: JobId) -> Result<()> {
            sqlx::query("delete from disc_titles where job_id = $1")
                .bind(id.0)
                .execute(&self.pool)
                .await?;
            sqlx::query("delete from disc_jobs where id = $1")
                .bind(id.0)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn list_recent_jobs(&self, limit: usize) -> Result<Vec<Job>> {
            let rows = sqlx::query("select * from disc_jobs order by created_at desc limit $1")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
            rows.into_iter().map(job_from_row).collect()
        }

        async fn find_active_job_for_drive(&self, drive_id: &str) -> Result<Option<Job>> {
            let row = sqlx::query(
                "select * from disc_jobs where drive_id = $1 and state not in ('completed', 'failed') \
                 order by created_at desc limit 1",
            )
            .bind(drive_id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(job_from_row).transpose()
        }

        async fn insert_title(&self, title: Title) -> Result<Title> {
            sqlx::query(
                r#"
                insert into disc_titles
                    (id, job_id, title_index, updated_at, duration_secs, expected_size_bytes,
                     chapter_count, resolution_label, is_selected, is_extra, state,
                     matched_episode, confidence, match_details, edition, output_filename,
                     organized_to)
                values
                    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                "#,
            )
            .bind(title.id.0)
            .bind(title.job_id.0)
            .bind(title.title_index)
            .bind(title.updated_at)
            .bind(title.duration_secs)
            .bind(title.expected_size_bytes as i64)
            .bind(title.chapter_count)
            .bind(&title.resolution_label)
            .bind(title.is_selected)
            .bind(title.is_extra)
            .bind(title_state_str(title.state))
            .bind(&title.matched_episode)
            .bind(title.confidence)
            .bind(&title.match_details)
            .bind(&title.edition)
            .bind(&title.output_filename)
            .bind(title.organized_to.as_ref().map(|p| p.to_string_lossy().to_string()))
            .execute(&self.pool)
            .await?;
            Ok(title)
        }

        async fn get_title(&self, id: TitleId) -> Result<Option<Title>> {
            let row = sqlx::query("select * from disc_titles where id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
            row.map(title_from_row).transpose()
        }

        async fn update_title(&self, title: Title) -> Result<Title> {
            sqlx::query(
                r#"
                update disc_titles set
                    updated_at = $2, state = $3, matched_episode = $4, confidence = $5,
                    match_details = $6, edition = $7, output_filename = $8, organized_to = $9,
                    is_extra = $10
                where id = $1
                "#,
            )
            .bind(title.id.0)
            .bind(title.updated_at)
            .bind(title_state_str(title.state))
            .bind(&title.matched_episode)
            .bind(title.confidence)
            .bind(&title.match_details)
            .bind(&title.edition)
            .bind(&title.output_filename)
            .bind(title.organized_to.as_ref().map(|p| p.to_string_lossy().to_string()))
            .bind(title.is_extra)
            .execute(&self.pool)
            .await?;
            Ok(title)
        }

        async fn list_titles_for_job(&self, job_id: JobId) -> Result<Vec<Title>> {
            let rows = sqlx::query("select * from disc_titles where job_id = $1 order by title_index")
                .bind(job_id.0)
                .fetch_all(&self.pool)
                .await?;
            rows.into_iter().map(title_from_row).collect()
        }
    }

    fn job_from_row(row: sqlx::postgres::PgRow) -> Result<Job> {
        let staging_dir: String = row.try_get("staging_dir")?;
        let final_path: Option<String> = row.try_get("final_path")?;
        Ok(Job {
            id: JobId(row.try_get("id")?),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            drive_id: row.try_get("drive_id")?,
            volume_label: row.try_get("volume_label")?,
            content_type: content_type_from_str(row.try_get("content_type")?),
            detected_title: row.try_get("detected_title")?,
            detected_season: row.try_get("detected_season")?,
            disc_number: row.try_get("disc_number")?,
            staging_dir: PathBuf::from(staging_dir),
            state: job_state_from_str(row.try_get("state")?),
            percent: row.try_get("percent")?,
            current_title_index: row.try_get("current_title_index")?,
            total_titles: row.try_get("total_titles")?,
            transfer_speed: row.try_get("transfer_speed")?,
            eta_seconds: row.try_get("eta_seconds")?,
            final_path: final_path.map(PathBuf::from),
            error_message: row.try_get("error_message")?,
            subtitle_status: subtitle_status_from_str(row.try_get("subtitle_status")?),
        })
    }

    fn title_from_row(row: sqlx::postgres::PgRow) -> Result<Title> {
        let expected_size_bytes: i64 = row.try_get("expected_size_bytes")?;
        let organized_to: Option<String> = row.try_get("organized_to")?;
        Ok(Title {
            id: TitleId(row.try_get("id")?),
            job_id: JobId(row.try_get("job_id")?),
            title_index: row.try_get("title_index")?,
            updated_at: row.try_get("updated_at")?,
            duration_secs: row.try_get("duration_secs")?,
            expected_size_bytes: expected_size_bytes as u64,
            chapter_count: row.try_get("chapter_count")?,
            resolution_label: row.try_get("resolution_label")?,
            is_selected: row.try_get("is_selected")?,
            is_extra: row.try_get("is_extra")?,
            state: title_state_from_str(row.try_get("state")?),
            matched_episode: row.try_get("matched_episode")?,
            confidence: row.try_get("confidence")?,
            match_details: row.try_get("match_details")?,
            edition: row.try_get("edition")?,
            output_filename: row.try_get("output_filename")?,
            organized_to: organized_to.map(PathBuf::from),
        })
    }

    fn job_state_from_str(s: &str) -> JobState {
        match s {
            "idle" => JobState::Idle,
            "identifying" => JobState::Identifying,
            "ripping" => JobState::Ripping,
            "matching" => JobState::Matching,
            "organizing" => JobState::Organizing,
            "review_needed" => JobState::ReviewNeeded,
            "completed" => JobState::Completed,
            _ => JobState::Failed,
        }
    }

    fn title_state_from_str(s: &str) -> TitleState {
        match s {
            "pending" => TitleState::Pending,
            "ripping" => TitleState::Ripping,
            "matching" => TitleState::Matching,
            "matched" => TitleState::Matched,
            "review" => TitleState::Review,
            "completed" => TitleState::Completed,
            _ => TitleState::Failed,
        }
    }

    fn content_type_from_str(s: &str) -> ContentType {
        match s {
            "tv" => ContentType::Tv,
            "movie" => ContentType::Movie,
            _ => ContentType::Unknown,
        }
    }

    fn subtitle_status_from_str(s: &str) -> SubtitleStatus {
        match s {
            "downloading" => SubtitleStatus::Downloading,
            "completed" => SubtitleStatus::Completed,
            "partial" => SubtitleStatus::Partial,
            "failed" => SubtitleStatus::Failed,
            _ => SubtitleStatus::None,
        }
    }

    fn job_state_str(state: JobState) -> &'static str {
        match state {
            JobState::Idle => "idle",
            JobState::Identifying => "identifying",
            JobState::Ripping => "ripping",
            JobState::Matching => "matching",
            JobState::Organizing => "organizing",
            JobState::ReviewNeeded => "review_needed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    fn title_state_str(state: TitleState) -> &'static str {
        match state {
            TitleState::Pending => "pending",
            TitleState::Ripping => "ripping",
            TitleState::Matching => "matching",
            TitleState::Matched => "matched",
            TitleState::Review => "review",
            TitleState::Completed => "completed",
            TitleState::Failed => "failed",
        }
    }

    fn content_type_str(content_type: ContentType) -> &'static str {
        match content_type {
            ContentType::Tv => "tv",
            ContentType::Movie => "movie",
            ContentType::Unknown => "unknown",
        }
    }

    fn subtitle_status_str(status: SubtitleStatus) -> &'static str {
        match status {
            SubtitleStatus::None => "none",
            SubtitleStatus::Downloading => "downloading",
            SubtitleStatus::Completed => "completed",
            SubtitleStatus::Partial => "partial",
            SubtitleStatus::Failed => "failed",
        }
    }
}
