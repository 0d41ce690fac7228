//! In-process Event Bus (spec.md §4.1), backed by `tokio::sync::broadcast`.
//!
//! Grounded on `ferrex-core/src/scan/orchestration/runtime/event_bus.rs`'s
//! `InProcJobEventBus`: a broadcast channel gives non-blocking publish and
//! silently drops events for subscribers that are lagging or gone, which is
//! exactly spec.md §4.1's delivery contract ("A subscriber whose delivery
//! buffer overflows is dropped silently").

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::events::{DomainEvent, EventPublisher};
use crate::Result;

/// Subscriber handle. Each subscriber sees events in publication order
/// (broadcast preserves send order per receiver); if it falls far enough
/// behind that the channel's ring buffer wraps, `recv()` returns
/// `Err(Lagged(n))` and the subscriber has effectively been dropped for
/// those `n` events — connection cleanup from there is the subscriber's
/// job, per spec.md §4.1.
///
/// Wraps the raw broadcast receiver to stamp each delivered event with this
/// subscriber's own monotonically increasing sequence number (spec.md §4.1)
/// before handing it back — two subscribers see the same event with two
/// different `seq` values, so the number can't live on the event itself
/// until delivery.
pub struct EventReceiver {
    inner: broadcast::Receiver<DomainEvent>,
    next_seq: u64,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> std::result::Result<DomainEvent, broadcast::error::RecvError> {
        match self.inner.recv().await {
            Ok(mut event) => {
                event.set_seq(self.next_seq);
                self.next_seq += 1;
                Ok(event)
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                self.next_seq += n;
                Err(broadcast::error::RecvError::Lagged(n))
            }
            Err(err) => Err(err),
        }
    }

    pub fn try_recv(&mut self) -> std::result::Result<DomainEvent, broadcast::error::TryRecvError> {
        match self.inner.try_recv() {
            Ok(mut event) => {
                event.set_seq(self.next_seq);
                self.next_seq += 1;
                Ok(event)
            }
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                self.next_seq += n;
                Err(broadcast::error::TryRecvError::Lagged(n))
            }
            Err(err) => Err(err),
        }
    }
}

/// In-process, broadcast-backed Event Bus.
#[derive(Clone)]
pub struct InProcEventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            inner: self.sender.subscribe(),
            next_seq: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventPublisher for InProcEventBus {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        // `send` returning Err just means there are currently no
        // subscribers; that's not a publisher-visible failure.
        let _ = self.sender.send(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::JobId;
    use crate::model::JobState;

    #[tokio::test]
    async fn publish_is_non_blocking_with_no_subscribers() {
        let bus = InProcEventBus::new(16);
        bus.publish(DomainEvent::job_update(JobId(1), JobState::Idle, vec![]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn subscriber_receives_in_publication_order() {
        let bus = InProcEventBus::new(16);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(DomainEvent::job_update(
                JobId(i),
                JobState::Ripping,
                vec![],
            ))
            .await
            .unwrap();
        }

        for i in 0..5 {
            let DomainEvent::JobUpdate { job_id, .. } = rx.recv().await.unwrap() else {
                panic!("expected job update");
            };
            assert_eq!(job_id, JobId(i));
        }
    }

    #[tokio::test]
    async fn seq_is_assigned_independently_per_subscriber() {
        let bus = InProcEventBus::new(16);
        let mut early = bus.subscribe();

        bus.publish(DomainEvent::job_update(JobId(1), JobState::Ripping, vec![]))
            .await
            .unwrap();

        // Subscribes after the first publish, so its own sequence starts
        // fresh at 0 for whatever it receives from here on.
        let mut late = bus.subscribe();

        bus.publish(DomainEvent::job_update(JobId(2), JobState::Ripping, vec![]))
            .await
            .unwrap();

        assert_eq!(early.recv().await.unwrap().meta().seq, 0);
        assert_eq!(early.recv().await.unwrap().meta().seq, 1);
        assert_eq!(late.recv().await.unwrap().meta().seq, 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_does_not_block_publisher_or_other_subscribers() {
        let bus = InProcEventBus::new(2);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for i in 0..10 {
            bus.publish(DomainEvent::job_update(JobId(i), JobState::Ripping, vec![]))
                .await
                .unwrap();
        }

        // The slow subscriber never read; it should observe a Lagged error
        // rather than the publisher having blocked on it.
        assert!(matches!(slow.recv().await, Err(broadcast::error::RecvError::Lagged(_))));
        // The fast subscriber (also never read, but we only assert the bus
        // itself didn't deadlock getting here) can still drain.
        assert!(fast.recv().await.is_ok());
    }
}
