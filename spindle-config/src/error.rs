use std::path::PathBuf;

/// Errors raised while loading or parsing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config at {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}
