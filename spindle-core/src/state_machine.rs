//! State Machine (spec.md §4.2): validates and applies job/title state
//! transitions, persists them, and emits events.
//!
//! Grounded on the plain-enum `JobState` in
//! `ferrex-core/src/scan/orchestration/job.rs` and the match-based error
//! classification style of `dispatcher.rs::handle_media_error` — a runtime
//! transition table over a persisted, re-read-each-time entity, not the
//! teacher's compile-time phantom-typed `auth::state_machine` (see
//! DESIGN.md for why that pattern doesn't fit here).

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::events::{DomainEvent, EventPublisher};
use crate::ids::{JobId, TitleId};
use crate::model::{Job, JobState, Title, TitleState};
use crate::persistence::Store;
use crate::Result;

/// Whether a transition request was applied, was a no-op, or was rejected.
/// Rejections are not errors: spec.md §4.2 says "Rejections are logged but
/// do not error the caller."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    NoOp,
    Rejected,
}

/// `true` if `from -> to` is a legal job transition per spec.md §4.2's
/// table (same-state is handled separately as a no-op, not here).
fn job_transition_allowed(from: JobState, to: JobState) -> bool {
    use JobState::*;
    if to == Failed {
        // "any -> failed (cancellation path)" — allowed from any
        // non-terminal state.
        return !from.is_terminal();
    }
    matches!(
        (from, to),
        (Idle, Identifying)
            | (Identifying, Ripping)
            | (Identifying, ReviewNeeded)
            | (Ripping, Matching)
            | (Ripping, ReviewNeeded)
            | (Ripping, Organizing)
            | (Matching, Organizing)
            | (Matching, ReviewNeeded)
            | (Organizing, Completed)
            | (Organizing, ReviewNeeded)
            | (ReviewNeeded, Ripping)
            | (ReviewNeeded, Matching)
            | (ReviewNeeded, Organizing)
            | (ReviewNeeded, Completed)
    )
}

/// `true` if `from -> to` is a legal title transition per spec.md §4.2's
/// table. Movies skip `matching` (`Ripping -> Matched` directly); TV goes
/// `Ripping -> Matching`. Both edges are legal here — which one a given
/// title takes is the caller's (Match Worker Pool's) decision, not this
/// function's.
fn title_transition_allowed(from: TitleState, to: TitleState) -> bool {
    use TitleState::*;
    if to == Failed {
        return !from.is_terminal();
    }
    matches!(
        (from, to),
        (Pending, Ripping)
            | (Ripping, Matching)
            | (Ripping, Matched)
            | (Matching, Matched)
            | (Matching, Review)
            | (Matched, Completed)
            | (Matched, Review)
            | (Review, Matched)
            | (Review, Completed)
    )
}

/// Coordinates job/title transitions: validates, persists, emits.
pub struct StateMachine<S: Store> {
    store: Arc<S>,
    events: Arc<dyn EventPublisher>,
}

impl<S: Store> StateMachine<S> {
    pub fn new(store: Arc<S>, events: Arc<dyn EventPublisher>) -> Self {
        Self { store, events }
    }

    /// `Transition(entity, target_state, context)` for a job (spec.md
    /// §4.2). `context` is free text folded into `error_message` only when
    /// `target == Failed`; other transitions ignore it.
    pub async fn transition_job(
        &self,
        job_id: JobId,
        target: JobState,
        context: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let Some(mut job) = self.store.get_job(job_id).await? else {
            return Ok(TransitionOutcome::Rejected);
        };

        if job.state == target {
            return Ok(TransitionOutcome::NoOp);
        }

        if !job_transition_allowed(job.state, target) {
            warn!(
                job_id = job_id.0,
                from = ?job.state,
                to = ?target,
                "rejected invalid job state transition"
            );
            return Ok(TransitionOutcome::Rejected);
        }

        job.state = target;
        job.updated_at = Utc::now();
        if target == JobState::Failed {
            job.error_message = context.map(str::to_string);
        }
        self.store.update_job(job).await?;

        self.events
            .publish(DomainEvent::job_update(job_id, target, vec!["state".into()]))
            .await?;

        Ok(TransitionOutcome::Applied)
    }

    /// `Transition(entity, target_state, context)` for a title.
    pub async fn transition_title(
        &self,
        title_id: TitleId,
        target: TitleState,
        context: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let Some(mut title) = self.store.get_title(title_id).await? else {
            return Ok(TransitionOutcome::Rejected);
        };

        if title.state == target {
            return Ok(TransitionOutcome::NoOp);
        }

        if !title_transition_allowed(title.state, target) {
            warn!(
                title_id = title_id.0,
                from = ?title.state,
                to = ?target,
                "rejected invalid title state transition"
            );
            return Ok(TransitionOutcome::Rejected);
        }

        title.state = target;
        title.updated_at = Utc::now();
        if target == TitleState::Failed && context.is_some() {
            let mut details = title
                .match_details
                .clone()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_else(|| crate::model::MatchDetails::synthetic_error(""));
            details.error = context.map(str::to_string);
            title.match_details = serde_json::to_value(details).ok();
        }
        let job_id = title.job_id;
        self.store.update_title(title).await?;

        self.events
            .publish(DomainEvent::title_update(
                job_id,
                title_id,
                target,
                vec!["state".into()],
            ))
            .await?;

        Ok(TransitionOutcome::Applied)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

/// Helper for tests/callers that want to assert a recorded sequence of
/// transitions follows §4.2's edges without going through a `Store`
/// (spec.md §8: "a test harness can record transitions and validate").
pub fn validate_title_sequence(states: &[TitleState]) -> bool {
    states
        .windows(2)
        .all(|pair| pair[0] == pair[1] || title_transition_allowed(pair[0], pair[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movies_skip_matching() {
        assert!(title_transition_allowed(TitleState::Ripping, TitleState::Matched));
    }

    #[test]
    fn tv_goes_through_matching() {
        assert!(title_transition_allowed(TitleState::Ripping, TitleState::Matching));
        assert!(title_transition_allowed(TitleState::Matching, TitleState::Matched));
    }

    #[test]
    fn terminal_title_states_reject_any_further_transition() {
        assert!(!title_transition_allowed(TitleState::Completed, TitleState::Review));
        assert!(!title_transition_allowed(TitleState::Failed, TitleState::Matched));
    }

    #[test]
    fn any_nonterminal_job_state_can_fail() {
        for state in [
            JobState::Idle,
            JobState::Identifying,
            JobState::Ripping,
            JobState::Matching,
            JobState::Organizing,
            JobState::ReviewNeeded,
        ] {
            assert!(job_transition_allowed(state, JobState::Failed));
        }
    }

    #[test]
    fn terminal_job_states_cannot_fail_again() {
        assert!(!job_transition_allowed(JobState::Completed, JobState::Failed));
        assert!(!job_transition_allowed(JobState::Failed, JobState::Failed));
    }

    #[test]
    fn review_needed_can_resume_into_several_stages() {
        assert!(job_transition_allowed(JobState::ReviewNeeded, JobState::Ripping));
        assert!(job_transition_allowed(JobState::ReviewNeeded, JobState::Matching));
        assert!(job_transition_allowed(JobState::ReviewNeeded, JobState::Organizing));
        assert!(job_transition_allowed(JobState::ReviewNeeded, JobState::Completed));
    }

    #[test]
    fn validate_sequence_accepts_noop_repeats() {
        let seq = [
            TitleState::Pending,
            TitleState::Pending,
            TitleState::Ripping,
            TitleState::Matching,
            TitleState::Matched,
            TitleState::Completed,
        ];
        assert!(validate_title_sequence(&seq));
    }

    #[test]
    fn validate_sequence_rejects_illegal_jump() {
        let seq = [TitleState::Pending, TitleState::Matched];
        assert!(!validate_title_sequence(&seq));
    }

    #[tokio::test]
    async fn transition_to_same_state_is_noop_and_emits_nothing() {
        use crate::event_bus::InProcEventBus;
        use crate::persistence::memory::MemoryStore;
        use std::path::PathBuf;

        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InProcEventBus::new(8));
        let mut rx = bus.subscribe();
        let sm = StateMachine::new(store.clone(), bus.clone());

        let job_id = store.next_job_id();
        store
            .insert_job(Job::new(job_id, "/dev/sr0", "DISC", PathBuf::from("/tmp/x")))
            .await
            .unwrap();

        let outcome = sm.transition_job(job_id, JobState::Idle, None).await.unwrap();
        assert_eq!(outcome, TransitionOutcome::NoOp);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected_not_errored() {
        use crate::event_bus::InProcEventBus;
        use crate::persistence::memory::MemoryStore;
        use std::path::PathBuf;

        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InProcEventBus::new(8));
        let sm = StateMachine::new(store.clone(), bus);

        let job_id = store.next_job_id();
        store
            .insert_job(Job::new(job_id, "/dev/sr0", "DISC", PathBuf::from("/tmp/x")))
            .await
            .unwrap();

        // idle -> organizing is not a legal edge.
        let outcome = sm
            .transition_job(job_id, JobState::Organizing, None)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Rejected);
    }
}
