//! Core pipeline engine for the disc ingestion orchestrator: the state
//! machine, event bus, persistence interface, and the five worker
//! components that carry a disc from insertion to a library path
//! (spec.md §4).
//!
//! This crate is storage- and transport-agnostic: nothing here knows
//! about HTTP or Postgres connection strings, only the [`Store`] and
//! [`EventPublisher`] traits. `spindle-server` wires concrete adapters in.

pub mod conflict_resolver;
pub mod drive_sentinel;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod file_ready_gate;
pub mod ids;
pub mod match_pool;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod rip_driver;
pub mod state_machine;
pub mod subtitle_coordinator;

pub use error::{IngestError, Result};
pub use event_bus::InProcEventBus;
pub use events::{DomainEvent, DriveEventKind, EventPublisher};
pub use ids::{DriveId, JobId, TitleId};
pub use model::{ContentType, Job, JobState, MatchDetails, SubtitleStatus, Title, TitleState};
pub use persistence::Store;
pub use state_machine::{StateMachine, TransitionOutcome};
