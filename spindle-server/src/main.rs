//! Disc ingestion orchestrator server: wires the `spindle-core` components
//! together with their external-collaborator adapters, then serves the
//! HTTP/WebSocket API (spec.md §6).
//!
//! Grounded on the teacher's `main.rs`: env-driven config load, directory
//! setup, Postgres connect + schema init, component construction, then
//! `Router` + `CorsLayer`/`TraceLayer` + `axum::serve`. Unlike the teacher,
//! there's no `clap` CLI layer here — `spindle-config::ConfigLoader`
//! already does env-then-file layering and spec.md names no CLI-override
//! surface for this service.

mod adapters;
mod error;
mod handlers;
mod routes;
mod state;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use spindle_config::ConfigLoader;
use spindle_core::conflict_resolver::Organizer;
use spindle_core::drive_sentinel::DriveSentinel;
use spindle_core::file_ready_gate::FileReadyGate;
use spindle_core::match_pool::{DurationFilter, EpisodeMatcher, MatchWorkerPool};
use spindle_core::orchestrator::JobOrchestrator;
use spindle_core::persistence::postgres::PostgresStore;
use spindle_core::persistence::Store;
use spindle_core::subtitle_coordinator::{SubtitleAcquirer, SubtitleCoordinator};
use spindle_core::{DomainEvent, DriveEventKind, EventPublisher, InProcEventBus};
use tokio::sync::RwLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use adapters::episode_matcher::CliEpisodeMatcher;
use adapters::makemkv::{MakemkvDriveProbe, MakemkvEjector, MakemkvDiscScanner};
use adapters::metadata::MetadataServiceClient;
use adapters::organizer::FilesystemOrganizer;
use adapters::subtitles::ChainedSubtitleAcquirer;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spindle_server=debug,spindle_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ConfigLoader::load()?;
    config.ensure_directories()?;
    tracing::info!("configuration loaded");

    let database_url = config
        .database_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL not set"))?;
    let pool = PgPoolOptions::new().max_connections(10).connect(&database_url).await?;
    let store = Arc::new(PostgresStore::new(pool));
    store.initialize_schema().await?;
    tracing::info!("database schema initialized");

    let events = Arc::new(InProcEventBus::new(1024));

    let organizer = Arc::new(FilesystemOrganizer::new(
        store.clone(),
        config.paths.library_movies_path.clone(),
        config.paths.library_tv_path.clone(),
        config.conflict_resolution_default,
    ));
    let organizer_trait_object: Arc<dyn Organizer> = organizer.clone();

    let acquirer: Arc<dyn SubtitleAcquirer> = Arc::new(ChainedSubtitleAcquirer::new(
        "https://www.addic7ed.com",
        "https://www.opensubtitles.org",
        config.paths.staging_path.clone(),
    ));
    let subtitles = Arc::new(SubtitleCoordinator::new(
        store.clone(),
        Arc::new(acquirer),
        events.clone() as Arc<dyn EventPublisher>,
    ));

    let file_ready_gate = Arc::new(FileReadyGate::new(
        Duration::from_secs_f64(config.ripping.file_poll_interval_secs),
        config.ripping.stability_checks,
        Duration::from_secs(config.ripping.file_ready_timeout_secs),
    ));

    let metadata_client = Arc::new(MetadataServiceClient::new(
        config.metadata_service.clone(),
        config.secrets.tmdb_api_key.clone(),
    ));
    let duration_filter: Arc<dyn DurationFilter> = metadata_client;
    let episode_matcher: Arc<dyn EpisodeMatcher> =
        Arc::new(CliEpisodeMatcher::new(config.paths.episode_matcher_path.clone()));

    let match_pool = Arc::new(MatchWorkerPool::new(
        store.clone() as Arc<dyn Store>,
        events.clone() as Arc<dyn EventPublisher>,
        subtitles.clone(),
        file_ready_gate,
        episode_matcher,
        duration_filter,
        organizer_trait_object.clone(),
        config.max_concurrent_matches,
    ));

    let disc_scanner = Arc::new(MakemkvDiscScanner::new(
        config.paths.makemkv_path.clone(),
        config.analyst.clone(),
    ));
    let ejector = Arc::new(MakemkvEjector::new(config.paths.makemkv_path.clone()));

    let orchestrator = Arc::new(JobOrchestrator::new(
        store.clone(),
        events.clone() as Arc<dyn EventPublisher>,
        subtitles,
        match_pool,
        organizer_trait_object,
        disc_scanner,
        ejector,
        config.paths.makemkv_path.clone(),
        config.paths.staging_path.clone(),
    ));

    let drive_probe = MakemkvDriveProbe::new(config.paths.makemkv_path.clone(), config.paths.drive_specs.clone());
    let sentinel = Arc::new(DriveSentinel::new(
        drive_probe,
        events.clone() as Arc<dyn EventPublisher>,
        Duration::from_secs_f64(config.sentinel_poll_interval_secs),
    ));
    tokio::spawn({
        let sentinel = sentinel.clone();
        async move { sentinel.run().await }
    });

    tokio::spawn({
        let orchestrator = orchestrator.clone();
        let mut drive_events = events.subscribe();
        async move {
            loop {
                match drive_events.recv().await {
                    Ok(DomainEvent::DriveEvent { drive_id, kind: DriveEventKind::Inserted, volume_label, .. }) => {
                        if let Err(err) = orchestrator.on_drive_inserted(drive_id, volume_label).await {
                            tracing::error!(error = %err, "failed to create job for inserted drive");
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });

    let server_config = config.server.clone();
    let state = AppState {
        orchestrator,
        store,
        events,
        config: Arc::new(RwLock::new(config)),
        organizer,
    };

    let app = routes::build_router(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("{}:{}", server_config.host, server_config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
