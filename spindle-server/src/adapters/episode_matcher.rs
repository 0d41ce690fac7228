//! `EpisodeMatcher` implementation: shells out to the configured episode
//! matcher binary, which performs the audio-fingerprinting comparison
//! against reference episodes internally (spec.md §1: "matches ripped
//! video files to reference episodes via audio fingerprinting" is named
//! as a pipeline stage but its algorithm is explicitly out of core's
//! scope, same as disc classification).
//!
//! Wire format: unlike the disc scanner, spec.md names no fixed binary or
//! line protocol for this collaborator, so the invocation contract here
//! is this crate's own design, chosen to match the shape of the other
//! external-tool adapters (one-shot subprocess, JSON on stdout) rather
//! than a line-buffered robot-mode protocol: `<bin> --file <path> --series
//! <name> [--season <n>]`, with a single JSON object on stdout matching
//! `MatchOutcome`'s fields.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use spindle_core::match_pool::{EpisodeMatcher, MatchOutcome};
use spindle_core::model::RunnerUp;
use tokio::process::Command;
use tokio::time::timeout;

const MATCH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct RawMatchOutcome {
    episode_code: Option<String>,
    confidence: f64,
    vote_count: u32,
    file_coverage: f64,
    score_gap: f64,
    #[serde(default)]
    runner_ups: Vec<RawRunnerUp>,
}

#[derive(Debug, Deserialize)]
struct RawRunnerUp {
    episode_code: String,
    score: f64,
}

pub struct CliEpisodeMatcher {
    binary_path: String,
}

impl CliEpisodeMatcher {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self { binary_path: binary_path.into() }
    }
}

#[async_trait]
impl EpisodeMatcher for CliEpisodeMatcher {
    async fn identify_episode(
        &self,
        file_path: &Path,
        series_name: &str,
        season: Option<i32>,
    ) -> anyhow::Result<MatchOutcome> {
        let mut command = Command::new(&self.binary_path);
        command
            .arg("--file")
            .arg(file_path)
            .arg("--series")
            .arg(series_name)
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        if let Some(season) = season {
            command.arg("--season").arg(season.to_string());
        }

        let output = timeout(MATCH_TIMEOUT, command.output())
            .await
            .map_err(|_| anyhow::anyhow!("episode matcher timed out after {MATCH_TIMEOUT:?}"))??;

        if !output.status.success() {
            anyhow::bail!("episode matcher exited with status {}", output.status);
        }

        let raw: RawMatchOutcome = serde_json::from_slice(&output.stdout)?;
        Ok(MatchOutcome {
            episode_code: raw.episode_code,
            confidence: raw.confidence,
            vote_count: raw.vote_count,
            file_coverage: raw.file_coverage,
            score_gap: raw.score_gap,
            runner_ups: raw
                .runner_ups
                .into_iter()
                .map(|r| RunnerUp { episode_code: r.episode_code, score: r.score })
                .collect(),
        })
    }
}
