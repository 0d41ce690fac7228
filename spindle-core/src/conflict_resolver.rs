//! Conflict Resolver (spec.md §4.8): reassigns episode matches when more
//! than one title claims the same episode code, then hands survivors to
//! the Organizer and settles the job's final state.
//!
//! The reassignment algorithm is a pure function over `&mut [Title]` —
//! grounded on the pure, densely-tested classification style of
//! `ferrex-core/src/orchestration/classification.rs` — kept separate from
//! the async finalization step, which needs the `Store`/`EventPublisher`/
//! `Organizer` collaborators.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

#[cfg(test)]
use crate::event_bus::EventReceiver;
use crate::events::{DomainEvent, EventPublisher};
use crate::ids::JobId;
use crate::model::{JobState, MatchDetails, Title, TitleState};
use crate::persistence::Store;
use crate::{IngestError, Result};

const MAX_ROUNDS: usize = 3;

/// Where the Conflict Resolver places a surviving `matched` title (spec.md
/// §4.8 step 3 / §6 filesystem layout). Implemented outside this crate —
/// the move/rename itself touches the real filesystem and the destination
/// naming rules (`library_tv_path`/`library_movies_path`, conflict
/// resolution policy) that belong to `spindle-server`.
#[async_trait]
pub trait Organizer: Send + Sync {
    /// Places a resolved `matched` title at its final library path
    /// (spec.md §6 filesystem layout).
    async fn organize(&self, title: &Title) -> anyhow::Result<std::path::PathBuf>;

    /// Places a title classified as an extra (spec.md §4.6 step 4) under
    /// the library's `Extras` sub-directory instead of matching it to an
    /// episode.
    async fn organize_extra(&self, title: &Title) -> anyhow::Result<std::path::PathBuf>;
}

/// Lets an `Arc<dyn Organizer>` stand in anywhere a concrete `Organizer` is
/// expected, so the Job Orchestrator can share one trait object between the
/// Match Worker Pool's extras routing and this service's survivor
/// organization instead of threading a second generic parameter through.
#[async_trait]
impl Organizer for Arc<dyn Organizer> {
    async fn organize(&self, title: &Title) -> anyhow::Result<std::path::PathBuf> {
        (**self).organize(title).await
    }

    async fn organize_extra(&self, title: &Title) -> anyhow::Result<std::path::PathBuf> {
        (**self).organize_extra(title).await
    }
}

fn match_details_of(title: &Title) -> Option<MatchDetails> {
    title
        .match_details
        .clone()
        .and_then(|v| serde_json::from_value(v).ok())
}

fn rank_key(details: &MatchDetails) -> (u32, f64, f64) {
    (details.vote_count, details.score, details.file_coverage)
}

/// `(vote_count desc, score desc, file_coverage desc)` — spec.md §4.8 step
/// 2a. Plain `f64::partial_cmp` treating incomparable (NaN) as equal is
/// fine here: match scores come from the external matcher as ordinary
/// finite floats.
fn cmp_rank(a: &(u32, f64, f64), b: &(u32, f64, f64)) -> std::cmp::Ordering {
    a.0.cmp(&b.0)
        .then_with(|| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .then_with(|| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
}

/// Runs the cascading-reassignment algorithm (spec.md §4.8 steps 1–2) over
/// titles that are currently in `matched` state. Mutates in place; returns
/// `true` if any title changed (episode reassignment or demotion to
/// `review`) so the caller knows whether another round is worth running.
fn run_round(titles: &mut [Title]) -> bool {
    let mut details: Vec<Option<MatchDetails>> = titles.iter().map(match_details_of).collect();

    // A `BTreeMap` keyed by episode code, not a `HashMap`, so the order in
    // which conflict groups are resolved below (and therefore the order
    // `losers` is built in) is a deterministic function of the codes
    // themselves rather than this process's random hash seed — spec.md
    // §8/§9's "deterministic given identical inputs" property otherwise
    // breaks whenever two losers from different groups race for the same
    // unclaimed runner-up code.
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, title) in titles.iter().enumerate() {
        if title.state == TitleState::Matched {
            if let Some(code) = &title.matched_episode {
                groups.entry(code.clone()).or_default().push(i);
            }
        }
    }

    // `assigned` tracks which title currently holds each episode code,
    // seeded with every non-conflicted holder so a newly-reassigned loser
    // can't steal a code that a singleton already legitimately owns.
    let mut assigned: HashMap<String, usize> = HashMap::new();
    let mut losers: Vec<usize> = Vec::new();

    for (code, mut members) in groups {
        if members.len() == 1 {
            assigned.insert(code, members[0]);
            continue;
        }

        members.sort_by(|&a, &b| {
            let ka = details[a].as_ref().map(rank_key).unwrap_or_default();
            let kb = details[b].as_ref().map(rank_key).unwrap_or_default();
            cmp_rank(&kb, &ka)
        });

        let winner = members[0];
        assigned.insert(code, winner);
        losers.extend(members.into_iter().skip(1));
    }

    let mut changed = false;

    for loser in losers {
        let Some(loser_details) = details[loser].clone() else {
            mark_review(&mut titles[loser], "no_match_details");
            changed = true;
            continue;
        };

        let mut runner_ups = loser_details.runner_ups.clone();
        runner_ups.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut reassigned = false;
        for candidate in &runner_ups {
            match assigned.get(&candidate.episode_code).copied() {
                None => {
                    assigned.insert(candidate.episode_code.clone(), loser);
                    apply_reassignment(&mut titles[loser], &mut details[loser], candidate.episode_code.clone(), candidate.score);
                    reassigned = true;
                    changed = true;
                    break;
                }
                Some(holder) if holder != loser => {
                    let holder_score = details[holder].as_ref().map(|d| d.score).unwrap_or(0.0);
                    if candidate.score > holder_score {
                        assigned.insert(candidate.episode_code.clone(), loser);
                        apply_reassignment(&mut titles[loser], &mut details[loser], candidate.episode_code.clone(), candidate.score);
                        reassigned = true;
                        changed = true;
                        break;
                    }
                }
                _ => {}
            }
        }

        if !reassigned {
            mark_review(&mut titles[loser], "no_viable_runner_up");
            changed = true;
        }
    }

    changed
}

fn apply_reassignment(title: &mut Title, details: &mut Option<MatchDetails>, episode_code: String, score: f64) {
    title.matched_episode = Some(episode_code);
    title.confidence = Some(score);
    if let Some(d) = details {
        d.score = score;
        title.match_details = serde_json::to_value(&*d).ok();
    }
    title.updated_at = Utc::now();
}

fn mark_review(title: &mut Title, reason: &str) {
    title.state = TitleState::Review;
    title.updated_at = Utc::now();
    let mut details = match_details_of(title).unwrap_or_else(|| MatchDetails::synthetic_error(""));
    details.conflict_reason = Some(reason.to_string());
    title.match_details = serde_json::to_value(details).ok();
}

/// Runs up to [`MAX_ROUNDS`] rounds, stopping early once a round makes no
/// change (spec.md §4.8: "terminates when no reassignment happens in a
/// round"). Returns the number of rounds actually run.
pub fn resolve(titles: &mut [Title]) -> usize {
    let mut rounds_run = 0;
    for _ in 0..MAX_ROUNDS {
        rounds_run += 1;
        if !run_round(titles) {
            break;
        }
    }
    rounds_run
}

/// The async half of §4.8: runs [`resolve`] against a job's persisted
/// titles, organizes survivors, and settles the job's final state (step
/// 3–4). Invoked by the Job Orchestrator once every title has reached a
/// terminal match state and at least one is `matched` (spec.md §4.8
/// preamble).
pub struct ConflictResolverService<S: Store, O: Organizer> {
    store: Arc<S>,
    organizer: O,
    events: Arc<dyn EventPublisher>,
}

impl<S: Store, O: Organizer> ConflictResolverService<S, O> {
    pub fn new(store: Arc<S>, organizer: O, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            organizer,
            events,
        }
    }

    pub async fn resolve_job(&self, job_id: JobId) -> Result<JobState> {
        let mut titles = self.store.list_titles_for_job(job_id).await?;

        let rounds = resolve(&mut titles);
        info!(job_id = job_id.0, rounds, "conflict resolution complete");

        for title in &titles {
            self.store.update_title(title.clone()).await?;
            self.events
                .publish(DomainEvent::title_update(
                    job_id,
                    title.id,
                    title.state,
                    vec!["match_details".into(), "matched_episode".into()],
                ))
                .await?;
        }

        let mut any_review = false;
        let mut any_completed = false;
        let mut final_path = None;

        for title in &mut titles {
            if title.state != TitleState::Matched {
                if title.state == TitleState::Review {
                    any_review = true;
                }
                continue;
            }

            match self.organizer.organize(title).await {
                Ok(path) => {
                    title.state = TitleState::Completed;
                    title.organized_to = Some(path.clone());
                    title.updated_at = Utc::now();
                    final_path = Some(path);
                    any_completed = true;
                }
                Err(err) => {
                    warn!(title_id = title.id.0, error = %err, "organize failed, sending to review");
                    mark_review(title, "organize_failed");
                    any_review = true;
                }
            }

            self.store.update_title(title.clone()).await?;
            self.events
                .publish(DomainEvent::title_update(
                    job_id,
                    title.id,
                    title.state,
                    vec!["state".into(), "organized_to".into()],
                ))
                .await?;
        }

        let Some(mut job) = self.store.get_job(job_id).await? else {
            return Err(IngestError::NotFound(format!("job {job_id}")));
        };

        let final_state = if any_review {
            JobState::ReviewNeeded
        } else if any_completed {
            JobState::Completed
        } else {
            JobState::Failed
        };

        job.state = final_state;
        job.updated_at = Utc::now();
        if final_state == JobState::Completed {
            job.final_path = final_path;
        }
        self.store.update_job(job).await?;
        self.events
            .publish(DomainEvent::job_update(job_id, final_state, vec!["state".into()]))
            .await?;

        Ok(final_state)
    }
}

/// Subscribes to the bus and waits for the job's terminal update — test
/// helper only, not used in production code paths.
#[cfg(test)]
async fn await_job_terminal(mut rx: EventReceiver, job_id: JobId) -> JobState {
    loop {
        if let DomainEvent::JobUpdate { job_id: id, state, .. } = rx.recv().await.unwrap() {
            if id == job_id && (state == JobState::Completed || state == JobState::Failed || state == JobState::ReviewNeeded) {
                return state;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunnerUp;

    fn matched_title(id: i64, episode: &str, vote_count: u32, score: f64, file_coverage: f64, runner_ups: Vec<RunnerUp>) -> Title {
        let mut title = Title::new(crate::ids::TitleId(id), crate::ids::JobId(1), id as i32, 1440.0);
        title.state = TitleState::Matched;
        title.matched_episode = Some(episode.to_string());
        title.confidence = Some(score);
        title.match_details = serde_json::to_value(MatchDetails {
            score,
            vote_count,
            file_coverage,
            score_gap: 0.1,
            runner_ups,
            error: None,
            conflict_reason: None,
        })
        .ok();
        title
    }

    #[test]
    fn no_conflict_is_untouched() {
        let mut titles = vec![
            matched_title(1, "S01E01", 10, 0.9, 0.9, vec![]),
            matched_title(2, "S01E02", 10, 0.9, 0.9, vec![]),
        ];
        let rounds = resolve(&mut titles);
        assert_eq!(rounds, 1);
        assert_eq!(titles[0].matched_episode.as_deref(), Some("S01E01"));
        assert_eq!(titles[1].matched_episode.as_deref(), Some("S01E02"));
    }

    #[test]
    fn winner_keeps_code_losers_take_runner_ups() {
        let mut titles = vec![
            matched_title(
                1,
                "S01E02",
                20,
                0.9,
                0.9,
                vec![RunnerUp { episode_code: "S01E01".into(), score: 0.6 }],
            ),
            matched_title(
                2,
                "S01E02",
                10,
                0.8,
                0.8,
                vec![RunnerUp { episode_code: "S01E01".into(), score: 0.7 }],
            ),
            matched_title(
                3,
                "S01E02",
                5,
                0.7,
                0.7,
                vec![RunnerUp { episode_code: "S01E03".into(), score: 0.65 }],
            ),
        ];

        resolve(&mut titles);

        assert_eq!(titles[0].matched_episode.as_deref(), Some("S01E02"));
        assert_eq!(titles[1].matched_episode.as_deref(), Some("S01E01"));
        assert_eq!(titles[2].matched_episode.as_deref(), Some("S01E03"));

        let mut seen = std::collections::HashSet::new();
        for title in &titles {
            if let Some(code) = &title.matched_episode {
                assert!(seen.insert(code.clone()), "duplicate assignment of {code}");
            }
        }
    }

    #[test]
    fn loser_with_no_viable_runner_up_goes_to_review() {
        let mut titles = vec![
            matched_title(1, "S01E01", 20, 0.9, 0.9, vec![]),
            matched_title(2, "S01E01", 10, 0.8, 0.8, vec![]),
        ];
        resolve(&mut titles);
        assert_eq!(titles[0].state, TitleState::Matched);
        assert_eq!(titles[1].state, TitleState::Review);
    }

    #[test]
    fn confidence_never_exceeds_runner_up_recorded_score() {
        let mut titles = vec![
            matched_title(1, "S01E01", 20, 0.95, 0.9, vec![]),
            matched_title(
                2,
                "S01E01",
                10,
                0.8,
                0.8,
                vec![RunnerUp { episode_code: "S01E02".into(), score: 0.55 }],
            ),
        ];
        resolve(&mut titles);
        assert_eq!(titles[1].confidence, Some(0.55));
    }

    #[test]
    fn terminates_within_three_rounds_on_a_long_cascade() {
        // Four titles all initially claim the same code; each has a chain
        // of runner-ups leading to a distinct free slot.
        let mut titles = vec![
            matched_title(1, "S01E01", 40, 0.95, 0.95, vec![]),
            matched_title(
                2,
                "S01E01",
                30,
                0.9,
                0.9,
                vec![RunnerUp { episode_code: "S01E02".into(), score: 0.85 }],
            ),
            matched_title(
                3,
                "S01E01",
                20,
                0.8,
                0.8,
                vec![RunnerUp { episode_code: "S01E02".into(), score: 0.7 }],
            ),
            matched_title(
                4,
                "S01E01",
                10,
                0.7,
                0.7,
                vec![RunnerUp { episode_code: "S01E03".into(), score: 0.6 }],
            ),
        ];

        let rounds = resolve(&mut titles);
        assert!(rounds <= MAX_ROUNDS);

        let mut seen = std::collections::HashSet::new();
        for title in &titles {
            if title.state == TitleState::Matched {
                let code = title.matched_episode.clone().unwrap();
                assert!(seen.insert(code), "duplicate matched_episode after resolution");
            }
        }
    }

    #[test]
    fn losers_from_different_groups_racing_for_same_code_resolve_by_code_order() {
        // Two independent conflict groups ("S01E01" and "S01E02"), each
        // with a loser whose sole runner-up is the same free code
        // ("S01E99") at equal score. Which loser claims it must depend only
        // on the codes themselves, never on hash-map iteration order.
        let mut titles = vec![
            matched_title(1, "S01E01", 20, 0.9, 0.9, vec![]),
            matched_title(
                2,
                "S01E01",
                10,
                0.8,
                0.8,
                vec![RunnerUp { episode_code: "S01E99".into(), score: 0.5 }],
            ),
            matched_title(3, "S01E02", 20, 0.9, 0.9, vec![]),
            matched_title(
                4,
                "S01E02",
                10,
                0.8,
                0.8,
                vec![RunnerUp { episode_code: "S01E99".into(), score: 0.5 }],
            ),
        ];

        resolve(&mut titles);

        // The "S01E01" group is processed first (lexicographically), so its
        // loser (title 2) claims "S01E99" before the "S01E02" group's loser
        // (title 4) gets a chance at it.
        assert_eq!(titles[1].matched_episode.as_deref(), Some("S01E99"));
        assert_eq!(titles[3].state, TitleState::Review);
    }

    #[tokio::test]
    async fn resolve_job_finalizes_to_completed_when_all_matched() {
        use crate::event_bus::InProcEventBus;
        use crate::persistence::memory::MemoryStore;
        use std::path::PathBuf;

        struct AlwaysOrganizes;
        #[async_trait]
        impl Organizer for AlwaysOrganizes {
            async fn organize(&self, title: &Title) -> anyhow::Result<PathBuf> {
                Ok(PathBuf::from(format!("/library/{}", title.matched_episode.clone().unwrap())))
            }

            async fn organize_extra(&self, title: &Title) -> anyhow::Result<PathBuf> {
                Ok(PathBuf::from(format!("/library/Extras/{}", title.id)))
            }
        }

        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InProcEventBus::new(16));
        let rx = bus.subscribe();

        let job_id = store.next_job_id();
        let mut job = new_job(job_id);
        job.state = JobState::Matching;
        store.insert_job(job).await.unwrap();

        let title = matched_title(store.next_title_id().0, "S01E01", 10, 0.9, 0.9, vec![]);
        store.insert_title(title).await.unwrap();

        let service = ConflictResolverService::new(store.clone(), AlwaysOrganizes, bus.clone());
        let outcome = service.resolve_job(job_id).await.unwrap();
        assert_eq!(outcome, JobState::Completed);

        let final_state = await_job_terminal(rx, job_id).await;
        assert_eq!(final_state, JobState::Completed);
    }

    fn new_job(id: crate::ids::JobId) -> crate::model::Job {
        crate::model::Job::new(id, "/dev/sr0", "DISC", std::path::PathBuf::from("/tmp/staging"))
    }
}
