use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigLoadError;
use crate::model::AppConfig;

/// Loads [`AppConfig`]. Evaluation order, mirroring the env-then-file
/// layering this codebase family uses elsewhere:
///
/// 1. Defaults.
/// 2. Individual `SPINDLE_*` environment variables, if set.
/// 3. `$SPINDLE_CONFIG_PATH` (TOML or JSON), or the first of
///    `spindle.toml`/`spindle.json`/`config/spindle.toml`/`config/spindle.json`
///    that exists, merged on top as a patch (so a partial override file
///    doesn't clobber fields it doesn't mention).
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load() -> Result<AppConfig, ConfigLoadError> {
        dotenvy::dotenv().ok();

        let mut config = Self::from_env()?;

        if let Some(path) = Self::config_file_path() {
            let patch = Self::read_patch(&path)?;
            config
                .merge_patch(patch)
                .map_err(|source| ConfigLoadError::Parse {
                    origin: path.display().to_string(),
                    source,
                })?;
        }

        Ok(config)
    }

    fn from_env() -> Result<AppConfig, ConfigLoadError> {
        let mut config = AppConfig::default();

        if let Ok(v) = env::var("SPINDLE_SERVER_HOST") {
            config.server.host = v;
        }
        if let Ok(v) = env::var("SPINDLE_SERVER_PORT") {
            config.server.port = parse_env("SPINDLE_SERVER_PORT", &v)?;
        }
        config.database_url = env::var("DATABASE_URL").ok();

        if let Ok(v) = env::var("SPINDLE_STAGING_PATH") {
            config.paths.staging_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SPINDLE_LIBRARY_MOVIES_PATH") {
            config.paths.library_movies_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SPINDLE_LIBRARY_TV_PATH") {
            config.paths.library_tv_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SPINDLE_MAKEMKV_PATH") {
            config.paths.makemkv_path = v;
        }
        if let Ok(v) = env::var("SPINDLE_FFMPEG_PATH") {
            config.paths.ffmpeg_path = v;
        }
        if let Ok(v) = env::var("SPINDLE_EPISODE_MATCHER_PATH") {
            config.paths.episode_matcher_path = v;
        }
        if let Ok(v) = env::var("SPINDLE_DRIVE_SPECS") {
            config.paths.drive_specs = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("SPINDLE_METADATA_SERVICE_URL") {
            config.metadata_service.base_url = v;
        }
        if let Ok(v) = env::var("SPINDLE_METADATA_SERVICE_MAX_RPS") {
            config.metadata_service.max_requests_per_second =
                parse_env("SPINDLE_METADATA_SERVICE_MAX_RPS", &v)?;
        }

        config.secrets.tmdb_api_key = env::var("SPINDLE_TMDB_API_KEY").ok();
        config.secrets.makemkv_key = env::var("SPINDLE_MAKEMKV_KEY").ok();

        if let Ok(v) = env::var("SPINDLE_MAX_CONCURRENT_MATCHES") {
            config.max_concurrent_matches = parse_env("SPINDLE_MAX_CONCURRENT_MATCHES", &v)?;
        }
        if let Ok(v) = env::var("SPINDLE_RIPPING_FILE_POLL_INTERVAL") {
            config.ripping.file_poll_interval_secs =
                parse_env("SPINDLE_RIPPING_FILE_POLL_INTERVAL", &v)?;
        }
        if let Ok(v) = env::var("SPINDLE_RIPPING_STABILITY_CHECKS") {
            config.ripping.stability_checks = parse_env("SPINDLE_RIPPING_STABILITY_CHECKS", &v)?;
        }
        if let Ok(v) = env::var("SPINDLE_RIPPING_FILE_READY_TIMEOUT") {
            config.ripping.file_ready_timeout_secs =
                parse_env("SPINDLE_RIPPING_FILE_READY_TIMEOUT", &v)?;
        }
        if let Ok(v) = env::var("SPINDLE_SENTINEL_POLL_INTERVAL") {
            config.sentinel_poll_interval_secs = parse_env("SPINDLE_SENTINEL_POLL_INTERVAL", &v)?;
        }
        if let Ok(v) = env::var("SPINDLE_CONFLICT_RESOLUTION_DEFAULT") {
            config.conflict_resolution_default =
                crate::model::ConflictResolution::from_str(&v).map_err(|err| {
                    ConfigLoadError::InvalidValue {
                        field: "conflict_resolution_default",
                        message: err.to_string(),
                    }
                })?;
        }
        if let Ok(v) = env::var("SPINDLE_TRANSCODING_ENABLED") {
            config.transcoding_enabled = parse_env("SPINDLE_TRANSCODING_ENABLED", &v)?;
        }
        if let Ok(v) = env::var("SPINDLE_SETUP_COMPLETE") {
            config.setup_complete = parse_env("SPINDLE_SETUP_COMPLETE", &v)?;
        }

        Ok(config)
    }

    fn config_file_path() -> Option<PathBuf> {
        if let Ok(path) = env::var("SPINDLE_CONFIG_PATH") {
            return Some(PathBuf::from(path));
        }

        const CANDIDATES: &[&str] = &[
            "spindle.toml",
            "spindle.json",
            "config/spindle.toml",
            "config/spindle.json",
        ];

        CANDIDATES
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(Path::to_path_buf)
    }

    fn read_patch(path: &Path) -> Result<serde_json::Value, ConfigLoadError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
                origin: path.display().to_string(),
                source: anyhow::anyhow!(err),
            }),
            _ => toml::from_str::<serde_json::Value>(&contents).map_err(|err| {
                ConfigLoadError::Parse {
                    origin: path.display().to_string(),
                    source: anyhow::anyhow!(err),
                }
            }),
        }
    }
}

fn parse_env<T>(field: &'static str, value: &str) -> Result<T, ConfigLoadError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|err: T::Err| ConfigLoadError::InvalidValue {
        field,
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_spec() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = AppConfig::default();
        assert_eq!(config.max_concurrent_matches, 2);
        assert_eq!(config.ripping.file_poll_interval_secs, 5.0);
        assert_eq!(config.ripping.stability_checks, 2);
        assert_eq!(config.ripping.file_ready_timeout_secs, 600);
        assert_eq!(config.sentinel_poll_interval_secs, 2.0);
        assert_eq!(config.analyst.movie_min_duration_secs, 4800.0);
        assert_eq!(config.analyst.tv_min_duration_secs, 1080.0);
        assert_eq!(config.analyst.tv_max_duration_secs, 4200.0);
        assert_eq!(config.analyst.tv_duration_variance_secs, 120.0);
        assert_eq!(config.analyst.tv_min_cluster_size, 3);
        assert_eq!(config.analyst.movie_dominance_threshold, 0.6);
        assert_eq!(
            config.conflict_resolution_default,
            crate::model::ConflictResolution::Rename
        );
        assert!(!config.transcoding_enabled);
        assert!(!config.setup_complete);
    }

    #[test]
    fn env_override_takes_precedence() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            env::set_var("SPINDLE_MAX_CONCURRENT_MATCHES", "4");
        }
        let config = ConfigLoader::from_env().unwrap();
        assert_eq!(config.max_concurrent_matches, 4);
        unsafe {
            env::remove_var("SPINDLE_MAX_CONCURRENT_MATCHES");
        }
    }

    #[test]
    fn toml_patch_overrides_only_mentioned_fields() {
        let mut config = AppConfig::default();
        let patch: serde_json::Value =
            toml::from_str("max_concurrent_matches = 7").unwrap();
        config.merge_patch(patch).unwrap();
        assert_eq!(config.max_concurrent_matches, 7);
        assert_eq!(config.ripping.file_poll_interval_secs, 5.0);
    }
}
