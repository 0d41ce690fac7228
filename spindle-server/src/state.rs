//! Aggregated application state handed to every axum handler.
//!
//! Grounded on `ferrex-server/src/infra/app_state.rs`: a `#[derive(Clone)]`
//! struct of `Arc<Service>` fields with a manual `Debug` impl (the services
//! themselves don't implement it, and axum requires `State` to be
//! `Clone` but says nothing about `Debug`).

use std::fmt;
use std::sync::Arc;

use spindle_config::AppConfig;
use spindle_core::orchestrator::JobOrchestrator;
use spindle_core::persistence::postgres::PostgresStore;
use spindle_core::InProcEventBus;
use tokio::sync::RwLock;

use crate::adapters::organizer::FilesystemOrganizer;

/// `spindle-server` always runs against Postgres; `spindle-core`'s
/// in-memory `Store` is test-only (see `spindle-core/src/persistence.rs`).
pub type Orchestrator = JobOrchestrator<PostgresStore>;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<PostgresStore>,
    /// Held concretely, not as `Arc<dyn EventPublisher>`, because the
    /// websocket handler needs `subscribe()` which only exists on the
    /// concrete bus type.
    pub events: Arc<InProcEventBus>,
    /// `PUT /config` mutates this in place; every handler reads through
    /// the lock rather than holding a stale clone.
    pub config: Arc<RwLock<AppConfig>>,
    /// Held concretely (not `Arc<dyn Organizer>`) so `PUT /config` can
    /// call `update_settings` directly when library paths or the
    /// conflict-resolution policy change.
    pub organizer: Arc<FilesystemOrganizer>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
