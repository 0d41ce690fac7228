//! Job/Title data model (spec.md §3).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{JobId, TitleId};

/// Disc content-type classification. Produced externally (§1 out-of-scope:
/// "the disc-classification heuristics"); the core only stores the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Tv,
    Movie,
    Unknown,
}

/// Job lifecycle state (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Identifying,
    Ripping,
    Matching,
    Organizing,
    ReviewNeeded,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Title lifecycle state (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleState {
    Pending,
    Ripping,
    Matching,
    Matched,
    Review,
    Completed,
    Failed,
}

impl TitleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TitleState::Completed | TitleState::Failed)
    }

    /// States §4.9 step 7 treats as "this title has nothing left to do
    /// without outside input" — used by job-completion detection.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            TitleState::Completed | TitleState::Failed | TitleState::Matched | TitleState::Review
        )
    }
}

/// Subtitle-acquisition status for a job (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleStatus {
    None,
    Downloading,
    Completed,
    Partial,
    Failed,
}

impl SubtitleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubtitleStatus::Completed | SubtitleStatus::Partial | SubtitleStatus::Failed
        )
    }
}

/// Processing of one disc (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub drive_id: String,
    pub volume_label: String,
    pub content_type: ContentType,
    pub detected_title: Option<String>,
    pub detected_season: Option<i32>,
    pub disc_number: i32,
    pub staging_dir: PathBuf,

    pub state: JobState,
    pub percent: f64,
    pub current_title_index: Option<i32>,
    pub total_titles: Option<i32>,
    pub transfer_speed: Option<String>,
    pub eta_seconds: Option<i64>,

    pub final_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub subtitle_status: SubtitleStatus,
}

impl Job {
    pub fn new(
        id: JobId,
        drive_id: impl Into<String>,
        volume_label: impl Into<String>,
        staging_dir: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            updated_at: now,
            drive_id: drive_id.into(),
            volume_label: volume_label.into(),
            content_type: ContentType::Unknown,
            detected_title: None,
            detected_season: None,
            disc_number: 1,
            staging_dir,
            state: JobState::Idle,
            percent: 0.0,
            current_title_index: None,
            total_titles: None,
            transfer_speed: None,
            eta_seconds: None,
            final_path: None,
            error_message: None,
            subtitle_status: SubtitleStatus::None,
        }
    }
}

/// One video track on a disc (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Title {
    pub id: TitleId,
    pub job_id: JobId,
    pub title_index: i32,
    pub updated_at: DateTime<Utc>,

    pub duration_secs: f64,
    pub expected_size_bytes: u64,
    pub chapter_count: i32,
    pub resolution_label: Option<String>,

    pub is_selected: bool,
    pub is_extra: bool,

    pub state: TitleState,

    pub matched_episode: Option<String>,
    pub confidence: Option<f64>,
    pub match_details: Option<serde_json::Value>,
    pub edition: Option<String>,

    pub output_filename: Option<String>,
    pub organized_to: Option<PathBuf>,
}

impl Title {
    pub fn new(id: TitleId, job_id: JobId, title_index: i32, duration_secs: f64) -> Self {
        Self {
            id,
            job_id,
            title_index,
            updated_at: Utc::now(),
            duration_secs,
            expected_size_bytes: 0,
            chapter_count: 0,
            resolution_label: None,
            is_selected: true,
            is_extra: false,
            state: TitleState::Pending,
            matched_episode: None,
            confidence: None,
            match_details: None,
            edition: None,
            output_filename: None,
            organized_to: None,
        }
    }
}

/// `match_details` shape persisted on a successful match (spec.md §4.6
/// step 8). Also doubles as the cascading-reassignment input for the
/// Conflict Resolver (§4.8), which is why `runner_ups` is a typed field
/// rather than living only inside the opaque JSON blob (§9 "Runner-up
/// carry-through").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchDetails {
    pub score: f64,
    pub vote_count: u32,
    pub file_coverage: f64,
    pub score_gap: f64,
    pub runner_ups: Vec<RunnerUp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict_reason: Option<String>,
}

/// A candidate episode ranked below the winner (spec.md GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerUp {
    pub episode_code: String,
    pub score: f64,
}

impl MatchDetails {
    pub fn synthetic_error(message: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            vote_count: 0,
            file_coverage: 0.0,
            score_gap: 0.0,
            runner_ups: Vec::new(),
            error: Some(message.into()),
            conflict_reason: None,
        }
    }
}
