//! Drive Sentinel (spec.md §4.3): polls attached optical drives and emits
//! insertion/removal events.
//!
//! Grounded on `ferrex-core/src/scanner/folder_monitor.rs`'s
//! `FolderMonitor`: a `tokio::time::interval` loop with
//! `MissedTickBehavior::Skip`, gated on an `Arc<RwLock<bool>>` shutdown
//! flag checked at the top of every tick, and per-item errors logged
//! without aborting the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::events::{DomainEvent, DriveEventKind, EventPublisher};
use crate::ids::DriveId;

/// One attached drive's observed status. Produced by a [`DriveProbe`]
/// (the real optical-drive scan is an external collaborator, spec.md §1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveStatus {
    pub drive_id: DriveId,
    pub present: bool,
    pub volume_label: Option<String>,
}

/// Abstraction over "ask the OS/disc scanner what's in the drives right
/// now", so the sentinel is testable without real hardware.
#[async_trait]
pub trait DriveProbe: Send + Sync {
    async fn poll(&self) -> anyhow::Result<Vec<DriveStatus>>;
}

#[derive(Debug, Clone, Default)]
struct TrackedState {
    present: bool,
    volume_label: Option<String>,
}

/// Polls at a configurable interval (default 2.0s, spec.md §4.3/§6) and
/// emits at most one event per state transition per drive, coalescing
/// rapid flapping within one poll cycle (a drive that went away and came
/// back between two polls just looks unchanged).
pub struct DriveSentinel<P: DriveProbe> {
    probe: P,
    events: Arc<dyn EventPublisher>,
    poll_interval: Duration,
    known: RwLock<HashMap<DriveId, TrackedState>>,
    shutdown: Arc<RwLock<bool>>,
}

impl<P: DriveProbe> DriveSentinel<P> {
    pub fn new(probe: P, events: Arc<dyn EventPublisher>, poll_interval: Duration) -> Self {
        Self {
            probe,
            events,
            poll_interval,
            known: RwLock::new(HashMap::new()),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<RwLock<bool>> {
        self.shutdown.clone()
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
    }

    /// Runs the polling loop until [`Self::stop`] is called. Never blocks
    /// on event delivery: publishing goes through the (non-blocking)
    /// [`EventPublisher`], so a stalled subscriber can't stall the drive
    /// poll.
    pub async fn run(&self) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }

            if let Err(err) = self.poll_once().await {
                error!(error = %err, "drive sentinel poll failed");
            }
        }

        info!("drive sentinel stopped");
    }

    async fn poll_once(&self) -> anyhow::Result<()> {
        let observed = self.probe.poll().await?;
        let mut known = self.known.write().await;

        for status in observed {
            let previous = known.entry(status.drive_id.clone()).or_default();

            if previous.present == status.present && previous.volume_label == status.volume_label {
                continue;
            }

            let kind = if status.present {
                DriveEventKind::Inserted
            } else {
                DriveEventKind::Removed
            };

            let event = DomainEvent::drive_event(
                status.drive_id.clone(),
                kind,
                status.volume_label.clone(),
            );

            *previous = TrackedState {
                present: status.present,
                volume_label: status.volume_label,
            };

            if let Err(err) = self.events.publish(event).await {
                error!(drive_id = %status.drive_id, error = %err, "failed to publish drive event");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::InProcEventBus;
    use std::sync::Mutex as StdMutex;

    struct ScriptedProbe {
        polls: StdMutex<std::vec::IntoIter<Vec<DriveStatus>>>,
    }

    impl ScriptedProbe {
        fn new(polls: Vec<Vec<DriveStatus>>) -> Self {
            Self {
                polls: StdMutex::new(polls.into_iter()),
            }
        }
    }

    #[async_trait]
    impl DriveProbe for ScriptedProbe {
        async fn poll(&self) -> anyhow::Result<Vec<DriveStatus>> {
            Ok(self.polls.lock().unwrap().next().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn emits_one_event_per_transition() {
        let bus = Arc::new(InProcEventBus::new(16));
        let mut rx = bus.subscribe();

        let probe = ScriptedProbe::new(vec![vec![DriveStatus {
            drive_id: "/dev/sr0".into(),
            present: true,
            volume_label: Some("DISC_ONE".into()),
        }]]);
        let sentinel = DriveSentinel::new(probe, bus, Duration::from_millis(1));
        sentinel.poll_once().await.unwrap();

        let DomainEvent::DriveEvent { kind, volume_label, .. } = rx.try_recv().unwrap() else {
            panic!("expected drive event");
        };
        assert_eq!(kind, DriveEventKind::Inserted);
        assert_eq!(volume_label.as_deref(), Some("DISC_ONE"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unchanged_status_emits_nothing() {
        let bus = Arc::new(InProcEventBus::new(16));
        let mut rx = bus.subscribe();

        let status = DriveStatus {
            drive_id: "/dev/sr0".into(),
            present: true,
            volume_label: Some("DISC_ONE".into()),
        };
        let probe = ScriptedProbe::new(vec![vec![status.clone()], vec![status]]);
        let sentinel = DriveSentinel::new(probe, bus, Duration::from_millis(1));

        sentinel.poll_once().await.unwrap();
        rx.try_recv().unwrap();
        sentinel.poll_once().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removal_after_insertion_emits_removed() {
        let bus = Arc::new(InProcEventBus::new(16));
        let mut rx = bus.subscribe();

        let probe = ScriptedProbe::new(vec![
            vec![DriveStatus {
                drive_id: "/dev/sr0".into(),
                present: true,
                volume_label: Some("DISC_ONE".into()),
            }],
            vec![DriveStatus {
                drive_id: "/dev/sr0".into(),
                present: false,
                volume_label: None,
            }],
        ]);
        let sentinel = DriveSentinel::new(probe, bus, Duration::from_millis(1));

        sentinel.poll_once().await.unwrap();
        rx.try_recv().unwrap();
        sentinel.poll_once().await.unwrap();
        let DomainEvent::DriveEvent { kind, .. } = rx.try_recv().unwrap() else {
            panic!("expected drive event");
        };
        assert_eq!(kind, DriveEventKind::Removed);
    }
}
