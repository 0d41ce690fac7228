//! Configuration loading, defaults, and redaction for the disc ingestion
//! orchestrator.
//!
//! [`AppConfig`] centralizes every tunable spec.md §6 names: staging and
//! library paths, external binary locations, ripping/matching concurrency
//! and polling knobs, and the content-analyst thresholds consumed by the
//! (external) disc classifier. [`loader::ConfigLoader`] is the only place
//! that reads environment variables or config files; callers elsewhere
//! just hold an [`AppConfig`].

pub mod error;
pub mod loader;
pub mod model;
pub mod redact;

pub use error::ConfigLoadError;
pub use loader::ConfigLoader;
pub use model::{
    AnalystThresholds, AppConfig, ConflictResolution, MetadataServiceConfig, PathsConfig,
    RippingConfig, Secrets, ServerConfig,
};
pub use redact::redacted_json;
