//! Event Bus contract and event shapes (spec.md §4.1).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{JobId, TitleId};
use crate::model::{JobState, SubtitleStatus, TitleState};
use crate::Result;

/// Per-event metadata shared by every variant: when it was published, and
/// which position in this particular subscriber's delivery order it
/// occupies. `seq` is `0` at publish time and stamped by
/// [`crate::event_bus::EventReceiver`] on each `recv`/`try_recv` — the same
/// event instance gets a different `seq` for each subscriber, which is why
/// it can't be assigned once at publish (spec.md §4.1: "a monotonically
/// increasing sequence number per subscriber").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub published_at: DateTime<Utc>,
    pub seq: u64,
}

impl Default for EventMeta {
    fn default() -> Self {
        Self {
            published_at: Utc::now(),
            seq: 0,
        }
    }
}

/// The discriminated union of state-change events (spec.md §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    JobUpdate {
        meta: EventMeta,
        job_id: JobId,
        state: JobState,
        changed_fields: Vec<String>,
    },
    TitleUpdate {
        meta: EventMeta,
        job_id: JobId,
        title_id: TitleId,
        state: TitleState,
        changed_fields: Vec<String>,
    },
    DriveEvent {
        meta: EventMeta,
        drive_id: String,
        kind: DriveEventKind,
        volume_label: Option<String>,
    },
    TitlesDiscovered {
        meta: EventMeta,
        job_id: JobId,
        title_ids: Vec<TitleId>,
    },
    SubtitleEvent {
        meta: EventMeta,
        job_id: JobId,
        status: SubtitleStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveEventKind {
    Inserted,
    Removed,
}

impl DomainEvent {
    /// Shared metadata, regardless of variant.
    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::JobUpdate { meta, .. }
            | Self::TitleUpdate { meta, .. }
            | Self::DriveEvent { meta, .. }
            | Self::TitlesDiscovered { meta, .. }
            | Self::SubtitleEvent { meta, .. } => meta,
        }
    }

    /// Stamps this event's per-subscriber sequence number. Called only by
    /// [`crate::event_bus::EventReceiver`] at delivery time, never by a
    /// publisher.
    pub(crate) fn set_seq(&mut self, seq: u64) {
        let meta = match self {
            Self::JobUpdate { meta, .. }
            | Self::TitleUpdate { meta, .. }
            | Self::DriveEvent { meta, .. }
            | Self::TitlesDiscovered { meta, .. }
            | Self::SubtitleEvent { meta, .. } => meta,
        };
        meta.seq = seq;
    }

    pub fn job_update(job_id: JobId, state: JobState, changed_fields: Vec<String>) -> Self {
        Self::JobUpdate {
            meta: EventMeta::default(),
            job_id,
            state,
            changed_fields,
        }
    }

    pub fn title_update(
        job_id: JobId,
        title_id: TitleId,
        state: TitleState,
        changed_fields: Vec<String>,
    ) -> Self {
        Self::TitleUpdate {
            meta: EventMeta::default(),
            job_id,
            title_id,
            state,
            changed_fields,
        }
    }

    pub fn drive_event(drive_id: String, kind: DriveEventKind, volume_label: Option<String>) -> Self {
        Self::DriveEvent {
            meta: EventMeta::default(),
            drive_id,
            kind,
            volume_label,
        }
    }

    pub fn titles_discovered(job_id: JobId, title_ids: Vec<TitleId>) -> Self {
        Self::TitlesDiscovered {
            meta: EventMeta::default(),
            job_id,
            title_ids,
        }
    }

    pub fn subtitle_event(job_id: JobId, status: SubtitleStatus) -> Self {
        Self::SubtitleEvent {
            meta: EventMeta::default(),
            job_id,
            status,
        }
    }
}

/// Publish side of the Event Bus contract (spec.md §4.1: `Publish(event)`).
/// Publication must be non-blocking for the publisher and never fail the
/// caller on a slow subscriber — only [`crate::event_bus::InProcEventBus`]
/// implements this, but the trait lets the Orchestrator and friends depend
/// on "something I can publish to" without the concrete broadcast type.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> Result<()>;
}
