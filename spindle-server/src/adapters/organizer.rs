//! Filesystem Organizer (spec.md §6 filesystem layout): moves a resolved
//! title from staging into its final library path, applying the
//! configured conflict-resolution policy on a destination collision.
//!
//! Grounded on `organizer.py`'s `organize_movie`/`organize_tv_episode`:
//! sanitize the name, build `<library>/<Show>/Season NN/<Show> - SNNENN.mkv`
//! (TV) or `<library>/<Name> (YYYY)/<Name> (YYYY).mkv` (movie), then resolve
//! a destination collision by `overwrite` (unlink first), `rename` (append
//! ` (vN)` until free), `skip` (leave the file in staging), or `ask`
//! (fail with a conflict so the title goes to `review`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use spindle_config::ConflictResolution;
use spindle_core::conflict_resolver::Organizer;
use spindle_core::persistence::postgres::PostgresStore;
use spindle_core::persistence::Store;
use spindle_core::model::Title;
use tokio::sync::RwLock;

static EPISODE_CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^S(\d+)E\d+").unwrap());
static YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(?((?:19|20)\d{2})\)?").unwrap());
static INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| !INVALID_CHARS.contains(c)).collect();
    cleaned.trim_matches(|c: char| c == '.' || c == ' ').to_string()
}

/// `THE_OFFICE` -> `The Office` (spec.md §6; grounded on
/// `organizer.py::clean_movie_name`'s underscore/dash replace + title-case,
/// minus the disc-marker stripping already done by `content_analyst`).
fn title_case(raw: &str) -> String {
    let words: Vec<String> = raw
        .replace(['_', '-'], " ")
        .split_whitespace()
        .enumerate()
        .map(|(i, word)| {
            let lower = word.to_lowercase();
            const SMALL_WORDS: &[&str] = &[
                "a", "an", "the", "and", "but", "or", "for", "nor", "on", "at", "to", "by", "of", "in",
            ];
            if i > 0 && SMALL_WORDS.contains(&lower.as_str()) {
                lower
            } else {
                let mut chars = lower.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => lower,
                }
            }
        })
        .collect();
    words.join(" ")
}

fn extract_year(text: &str) -> Option<String> {
    YEAR_RE.captures(text).map(|c| c[1].to_string())
}

/// `Movie Name (YYYY)` + `Some("Extended")` -> `Movie Name (YYYY) Extended`
/// (spec.md §4.9 step 8 / §8 scenario 4). A blank or absent edition leaves
/// the folder name untouched.
fn movie_file_stem(folder_name: &str, edition: Option<&str>) -> String {
    match edition.map(str::trim) {
        Some(edition) if !edition.is_empty() => format!("{folder_name} {}", sanitize_filename(edition)),
        _ => folder_name.to_string(),
    }
}

/// Resolves a destination path against an existing file per the configured
/// policy. `None` means "skip" (caller should return the staging path
/// untouched); `Err` means "ask" (caller surfaces this as a review).
fn resolve_conflict(dest: PathBuf, policy: ConflictResolution) -> anyhow::Result<Option<PathBuf>> {
    if !dest.exists() {
        return Ok(Some(dest));
    }

    match policy {
        ConflictResolution::Overwrite => {
            std::fs::remove_file(&dest)?;
            Ok(Some(dest))
        }
        ConflictResolution::Rename => {
            let stem = dest.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
            let ext = dest.extension().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
            let mut counter = 2;
            loop {
                let candidate = dest.with_file_name(format!("{stem} (v{counter}).{ext}"));
                if !candidate.exists() {
                    return Ok(Some(candidate));
                }
                counter += 1;
            }
        }
        ConflictResolution::Skip => Ok(None),
        ConflictResolution::Ask => Err(anyhow::anyhow!("destination already exists: {}", dest.display())),
    }
}

pub struct FilesystemOrganizer {
    store: Arc<PostgresStore>,
    library_movies_path: RwLock<PathBuf>,
    library_tv_path: RwLock<PathBuf>,
    conflict_resolution: RwLock<ConflictResolution>,
}

impl FilesystemOrganizer {
    pub fn new(
        store: Arc<PostgresStore>,
        library_movies_path: PathBuf,
        library_tv_path: PathBuf,
        conflict_resolution: ConflictResolution,
    ) -> Self {
        Self {
            store,
            library_movies_path: RwLock::new(library_movies_path),
            library_tv_path: RwLock::new(library_tv_path),
            conflict_resolution: RwLock::new(conflict_resolution),
        }
    }

    /// Called by the `PUT /config` handler when the library paths or
    /// conflict policy change, so in-flight organizing picks up the new
    /// values without a restart.
    pub async fn update_settings(
        &self,
        library_movies_path: PathBuf,
        library_tv_path: PathBuf,
        conflict_resolution: ConflictResolution,
    ) {
        *self.library_movies_path.write().await = library_movies_path;
        *self.library_tv_path.write().await = library_tv_path;
        *self.conflict_resolution.write().await = conflict_resolution;
    }

    async fn staging_source(&self, title: &Title) -> anyhow::Result<PathBuf> {
        let job = self
            .store
            .get_job(title.job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {} not found for title {}", title.job_id, title.id))?;
        let filename = title
            .output_filename
            .clone()
            .ok_or_else(|| anyhow::anyhow!("title {} has no ripped output file", title.id))?;
        Ok(job.staging_dir.join(filename))
    }

    async fn organize_movie(&self, title: &Title, subdir: &str) -> anyhow::Result<PathBuf> {
        let job = self
            .store
            .get_job(title.job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {} not found", title.job_id))?;
        let source = self.staging_source(title).await?;

        let raw_name = job.detected_title.clone().unwrap_or_else(|| job.volume_label.clone());
        let year = extract_year(&raw_name).or_else(|| extract_year(&job.volume_label));
        let clean_name = title_case(&raw_name.replace(&year.clone().unwrap_or_default(), ""));
        let folder_name = match &year {
            Some(year) => format!("{clean_name} ({year})"),
            None => clean_name,
        };
        let folder_name = sanitize_filename(&folder_name);

        let library_root = self.library_movies_path.read().await.clone();
        let dest_dir = library_root.join(&folder_name).join(subdir);
        tokio::fs::create_dir_all(&dest_dir).await?;

        let file_stem = movie_file_stem(&folder_name, title.edition.as_deref());
        let dest = dest_dir.join(format!("{file_stem}.mkv"));

        self.move_with_conflict_policy(&source, dest).await
    }

    async fn organize_tv(&self, title: &Title, subdir: Option<&str>) -> anyhow::Result<PathBuf> {
        let job = self
            .store
            .get_job(title.job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {} not found", title.job_id))?;
        let source = self.staging_source(title).await?;

        let show_name = sanitize_filename(&title_case(
            &job.detected_title.clone().unwrap_or_else(|| job.volume_label.clone()),
        ));
        let library_root = self.library_tv_path.read().await.clone();
        let show_dir = library_root.join(&show_name);

        let dest = match subdir {
            None => {
                let episode_code = title
                    .matched_episode
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("title {} has no matched episode code", title.id))?;
                let season = EPISODE_CODE_RE
                    .captures(&episode_code)
                    .and_then(|c| c[1].parse::<u32>().ok())
                    .ok_or_else(|| anyhow::anyhow!("invalid episode code: {episode_code}"))?;
                let season_dir = show_dir.join(format!("Season {season:02}"));
                tokio::fs::create_dir_all(&season_dir).await?;
                season_dir.join(format!("{show_name} - {}.mkv", episode_code.to_uppercase()))
            }
            Some(extras_subdir) => {
                let extras_dir = show_dir.join(extras_subdir);
                tokio::fs::create_dir_all(&extras_dir).await?;
                extras_dir.join(format!("{show_name} Disc {} Extras {}.mkv", job.disc_number, title.title_index))
            }
        };

        self.move_with_conflict_policy(&source, dest).await
    }

    async fn move_with_conflict_policy(&self, source: &Path, dest: PathBuf) -> anyhow::Result<PathBuf> {
        let policy = *self.conflict_resolution.read().await;
        let resolved = resolve_conflict(dest.clone(), policy)?;
        let Some(resolved) = resolved else {
            // "skip": the policy says leave it alone; report the staging
            // path back since nothing moved.
            return Ok(source.to_path_buf());
        };
        tokio::fs::rename(source, &resolved).await?;
        Ok(resolved)
    }
}

#[async_trait]
impl Organizer for FilesystemOrganizer {
    async fn organize(&self, title: &Title) -> anyhow::Result<PathBuf> {
        let job = self
            .store
            .get_job(title.job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {} not found", title.job_id))?;
        match job.content_type {
            spindle_core::ContentType::Movie => self.organize_movie(title, ".").await,
            _ => self.organize_tv(title, None).await,
        }
    }

    async fn organize_extra(&self, title: &Title) -> anyhow::Result<PathBuf> {
        let job = self
            .store
            .get_job(title.job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("job {} not found", title.job_id))?;
        match job.content_type {
            spindle_core::ContentType::Movie => self.organize_movie(title, "Extras").await,
            _ => self.organize_tv(title, Some("Extras")).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_case_keeps_small_words_lowercase_mid_title() {
        assert_eq!(title_case("THE_LORD_OF_THE_RINGS"), "The Lord of the Rings");
    }

    #[test]
    fn sanitize_filename_strips_invalid_characters() {
        assert_eq!(sanitize_filename("Show: The Beginning?"), "Show The Beginning");
    }

    #[test]
    fn extract_year_finds_parenthesized_year() {
        assert_eq!(extract_year("Inception (2010)"), Some("2010".to_string()));
        assert_eq!(extract_year("NO_YEAR_HERE"), None);
    }

    #[test]
    fn resolve_conflict_rename_finds_next_free_version() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Movie.mkv");
        std::fs::write(&dest, b"x").unwrap();
        std::fs::write(dir.path().join("Movie (v2).mkv"), b"x").unwrap();

        let resolved = resolve_conflict(dest, ConflictResolution::Rename).unwrap().unwrap();
        assert_eq!(resolved.file_name().unwrap().to_str().unwrap(), "Movie (v3).mkv");
    }

    #[test]
    fn resolve_conflict_skip_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Movie.mkv");
        std::fs::write(&dest, b"x").unwrap();
        assert!(resolve_conflict(dest, ConflictResolution::Skip).unwrap().is_none());
    }

    #[test]
    fn resolve_conflict_ask_errors_on_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("Movie.mkv");
        std::fs::write(&dest, b"x").unwrap();
        assert!(resolve_conflict(dest, ConflictResolution::Ask).is_err());
    }

    #[test]
    fn movie_file_stem_appends_edition_when_present() {
        assert_eq!(
            movie_file_stem("Inception (2010)", Some("Extended")),
            "Inception (2010) Extended"
        );
    }

    #[test]
    fn movie_file_stem_leaves_name_untouched_without_edition() {
        assert_eq!(movie_file_stem("Inception (2010)", None), "Inception (2010)");
        assert_eq!(movie_file_stem("Inception (2010)", Some("   ")), "Inception (2010)");
    }

    #[test]
    fn movie_file_stem_sanitizes_the_edition_tag() {
        assert_eq!(
            movie_file_stem("Blade Runner (1982)", Some("Director's: Cut")),
            "Blade Runner (1982) Director's Cut"
        );
    }
}
