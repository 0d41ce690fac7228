//! `DiscScanner`, `Ejector`, and `DriveProbe` implementations backed by the
//! `makemkvcon` binary's robot-mode output (spec.md §6: "`<bin> -r info
//! dev:<drive>`").
//!
//! Grounded on `extractor.py::scan_disc`/`_parse_disc_info`: run the
//! binary with a timeout via a blocking-safe spawn, then parse
//! `TINFO:(\d+),(\d+),\d+,"(.*)"` / `CINFO:(\d+),\d+,"(.*)"` lines. Field
//! ids: 2 = name, 8 = chapter count, 9 = duration `H:MM:SS`, 10 = size
//! (e.g. `"12.5 GB"`), 19 = resolution (e.g. `"1920x1080"`).

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use spindle_core::drive_sentinel::{DriveProbe, DriveStatus};
use spindle_core::orchestrator::{DetectedTitle, DiscIdentification, DiscScanner, Ejector};
use tokio::process::Command;
use tokio::time::timeout;

use crate::adapters::content_analyst;

static TINFO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"TINFO:(\d+),(\d+),\d+,"(.*)""#).unwrap());
static CINFO_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"CINFO:(\d+),\d+,"(.*)""#).unwrap());
static SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)([\d.]+)\s*(GB|MB|KB|B)").unwrap());
static RESOLUTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)x(\d+)").unwrap());

const SCAN_TIMEOUT: Duration = Duration::from_secs(120);

const ATTR_NAME: u32 = 2;
const ATTR_CHAPTER_COUNT: u32 = 8;
const ATTR_DURATION: u32 = 9;
const ATTR_SIZE: u32 = 10;
const ATTR_RESOLUTION: u32 = 19;

fn parse_duration_secs(value: &str) -> f64 {
    let parts: Vec<&str> = value.split(':').collect();
    let nums: Vec<f64> = parts.iter().filter_map(|p| p.parse().ok()).collect();
    if nums.len() != parts.len() {
        return 0.0;
    }
    match nums.len() {
        3 => nums[0] * 3600.0 + nums[1] * 60.0 + nums[2],
        2 => nums[0] * 60.0 + nums[1],
        1 => nums[0],
        _ => 0.0,
    }
}

fn parse_size_bytes(value: &str) -> u64 {
    let Some(caps) = SIZE_RE.captures(value) else {
        return 0;
    };
    let amount: f64 = caps[1].parse().unwrap_or(0.0);
    let multiplier: f64 = match caps[2].to_uppercase().as_str() {
        "GB" => 1024.0 * 1024.0 * 1024.0,
        "MB" => 1024.0 * 1024.0,
        "KB" => 1024.0,
        _ => 1.0,
    };
    (amount * multiplier) as u64
}

/// Buckets raw `WxH` into the library's resolution labels (grounded on
/// `extractor.py::_parse_resolution`).
fn parse_resolution(value: &str) -> String {
    let Some(caps) = RESOLUTION_RE.captures(value) else {
        return "Unknown".to_string();
    };
    let width: u32 = caps[1].parse().unwrap_or(0);
    let height: u32 = caps[2].parse().unwrap_or(0);

    if width >= 3800 || height >= 2100 {
        "4K".to_string()
    } else if width >= 1900 || height >= 1000 {
        "1080p".to_string()
    } else if width >= 1200 || height >= 700 {
        "720p".to_string()
    } else if height >= 570 || height == 480 {
        "480p".to_string()
    } else if height == 576 {
        "576p".to_string()
    } else {
        "Unknown".to_string()
    }
}

struct RawTitle {
    index: i32,
    duration_secs: f64,
    size_bytes: u64,
    chapter_count: i32,
    resolution: Option<String>,
}

fn parse_disc_info(output: &str) -> (Option<String>, Vec<RawTitle>) {
    let mut volume_label = None;
    let mut durations: HashMap<i32, f64> = HashMap::new();
    let mut sizes: HashMap<i32, u64> = HashMap::new();
    let mut chapters: HashMap<i32, i32> = HashMap::new();
    let mut resolutions: HashMap<i32, String> = HashMap::new();
    let mut indices: Vec<i32> = Vec::new();

    for line in output.lines() {
        if let Some(caps) = CINFO_RE.captures(line) {
            let attr: u32 = caps[1].parse().unwrap_or(0);
            if attr == ATTR_NAME {
                volume_label = Some(caps[2].to_string());
            }
            continue;
        }

        let Some(caps) = TINFO_RE.captures(line) else { continue };
        let title_index: i32 = caps[1].parse().unwrap_or(0);
        let attr: u32 = caps[2].parse().unwrap_or(0);
        let value = &caps[3];

        if !indices.contains(&title_index) {
            indices.push(title_index);
        }

        match attr {
            ATTR_DURATION => {
                durations.insert(title_index, parse_duration_secs(value));
            }
            ATTR_SIZE => {
                sizes.insert(title_index, parse_size_bytes(value));
            }
            ATTR_CHAPTER_COUNT => {
                chapters.insert(title_index, value.parse().unwrap_or(0));
            }
            ATTR_RESOLUTION => {
                resolutions.insert(title_index, parse_resolution(value));
            }
            _ => {}
        }
    }

    indices.sort_unstable();
    let titles = indices
        .into_iter()
        .map(|index| RawTitle {
            index,
            duration_secs: durations.get(&index).copied().unwrap_or(0.0),
            size_bytes: sizes.get(&index).copied().unwrap_or(0),
            chapter_count: chapters.get(&index).copied().unwrap_or(0),
            resolution: resolutions.get(&index).cloned(),
        })
        .collect();

    (volume_label, titles)
}

pub struct MakemkvDiscScanner {
    binary_path: String,
    thresholds: spindle_config::AnalystThresholds,
}

impl MakemkvDiscScanner {
    pub fn new(binary_path: impl Into<String>, thresholds: spindle_config::AnalystThresholds) -> Self {
        Self { binary_path: binary_path.into(), thresholds }
    }

    async fn run_info(&self, drive_spec: &str) -> anyhow::Result<String> {
        let output = timeout(
            SCAN_TIMEOUT,
            Command::new(&self.binary_path)
                .args(["-r", "info", &format!("dev:{drive_spec}")])
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("disc scan timed out after {SCAN_TIMEOUT:?}"))??;

        if !output.status.success() {
            anyhow::bail!("disc scanner exited with status {}", output.status);
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl DiscScanner for MakemkvDiscScanner {
    async fn identify(&self, drive_spec: &str) -> anyhow::Result<DiscIdentification> {
        let raw_output = self.run_info(drive_spec).await?;
        let (volume_label, raw_titles) = parse_disc_info(&raw_output);
        let volume_label = volume_label.unwrap_or_else(|| "UNKNOWN".to_string());

        let mut titles: Vec<DetectedTitle> = raw_titles
            .into_iter()
            .map(|raw| DetectedTitle {
                title_index: raw.index,
                duration_secs: raw.duration_secs,
                expected_size_bytes: raw.size_bytes,
                chapter_count: raw.chapter_count,
                resolution_label: raw.resolution,
                is_play_all: false,
                is_feature_length: raw.duration_secs >= self.thresholds.movie_min_duration_secs,
            })
            .collect();

        let classification = content_analyst::classify(&volume_label, &titles, &self.thresholds);
        content_analyst::mark_play_all(&mut titles, &self.thresholds);

        Ok(DiscIdentification {
            content_type: classification.content_type,
            detected_title: classification.detected_title,
            detected_season: classification.detected_season,
            titles,
            needs_review: classification.needs_review,
        })
    }
}

pub struct MakemkvEjector {
    binary_path: String,
}

impl MakemkvEjector {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self { binary_path: binary_path.into() }
    }
}

#[async_trait]
impl Ejector for MakemkvEjector {
    async fn eject(&self, drive_spec: &str) -> anyhow::Result<()> {
        let status = Command::new(&self.binary_path)
            .args(["-r", "eject", &format!("dev:{drive_spec}")])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;

        if !status.success() {
            anyhow::bail!("eject command exited with status {status}");
        }
        Ok(())
    }
}

/// Polls the configured drives by re-running disc-scanner `info` against
/// each; a nonzero exit / empty output means no disc present. Grounded on
/// `extractor.py`'s same scan invocation, reused here for presence
/// detection since MakeMKV's robot mode has no separate "is a disc
/// inserted" query.
pub struct MakemkvDriveProbe {
    binary_path: String,
    drives: Vec<String>,
}

impl MakemkvDriveProbe {
    pub fn new(binary_path: impl Into<String>, drives: Vec<String>) -> Self {
        Self { binary_path: binary_path.into(), drives }
    }
}

#[async_trait]
impl DriveProbe for MakemkvDriveProbe {
    async fn poll(&self) -> anyhow::Result<Vec<DriveStatus>> {
        let mut statuses = Vec::with_capacity(self.drives.len());

        for drive_spec in &self.drives {
            let result = timeout(
                SCAN_TIMEOUT,
                Command::new(&self.binary_path)
                    .args(["-r", "info", &format!("dev:{drive_spec}")])
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .output(),
            )
            .await;

            let (present, volume_label) = match result {
                Ok(Ok(output)) if output.status.success() => {
                    let text = String::from_utf8_lossy(&output.stdout);
                    let (label, titles) = parse_disc_info(&text);
                    (!titles.is_empty(), label)
                }
                _ => (false, None),
            };

            statuses.push(DriveStatus {
                drive_id: drive_spec.clone(),
                present,
                volume_label,
            });
        }

        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_size_and_resolution() {
        assert_eq!(parse_duration_secs("1:30:15"), 5415.0);
        assert_eq!(parse_duration_secs("45:00"), 2700.0);
        assert_eq!(parse_size_bytes("12.5 GB"), (12.5 * 1024.0 * 1024.0 * 1024.0) as u64);
        assert_eq!(parse_resolution("1920x1080"), "1080p");
        assert_eq!(parse_resolution("3840x2160"), "4K");
        assert_eq!(parse_resolution("bogus"), "Unknown");
    }

    #[test]
    fn parse_disc_info_extracts_volume_label_and_titles() {
        let output = concat!(
            "CINFO:2,0,\"MY_MOVIE\"\n",
            "TINFO:0,9,0,\"1:52:30\"\n",
            "TINFO:0,10,0,\"8.2 GB\"\n",
            "TINFO:0,8,0,\"20\"\n",
            "TINFO:0,19,0,\"1920x1080\"\n",
            "TINFO:1,9,0,\"0:02:15\"\n",
        );
        let (label, titles) = parse_disc_info(output);
        assert_eq!(label, Some("MY_MOVIE".to_string()));
        assert_eq!(titles.len(), 2);
        assert_eq!(titles[0].duration_secs, 6750.0);
        assert_eq!(titles[0].chapter_count, 20);
        assert_eq!(titles[0].resolution.as_deref(), Some("1080p"));
    }
}
