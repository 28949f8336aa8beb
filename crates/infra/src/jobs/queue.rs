//! Bounded in-memory job collection.
//!
//! The queue is plain data: it never blocks or spawns. The scheduler owns one
//! behind a mutex and is the only writer.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::types::{Job, JobId, JobOptions, JobPayload, JobState, JobSummary, RetryDecision};

/// Queue error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job queue full ({queued}/{capacity})")]
    Full { queued: usize, capacity: usize },
}

#[derive(Debug)]
struct Slot {
    job: Job,
    executing: bool,
}

/// Outcome of finishing a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Job stays queued and becomes ready again at `at`.
    Rescheduled { attempts: u32, delay: Duration, at: Instant },
    /// Job was removed after its final attempt.
    Exhausted { attempts: u32 },
}

/// Capacity-bounded collection of live jobs.
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<JobId, Slot>,
    capacity: usize,
    next_sequence: u64,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            capacity,
            next_sequence: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id).map(|slot| &slot.job)
    }

    /// Build and insert a new job; fails closed when at capacity.
    pub fn admit(
        &mut self,
        payload: JobPayload,
        options: JobOptions,
        default_max_attempts: u32,
        now: Instant,
    ) -> Result<JobId, QueueError> {
        if self.jobs.len() >= self.capacity {
            return Err(QueueError::Full {
                queued: self.jobs.len(),
                capacity: self.capacity,
            });
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let job = Job::new(payload, options, default_max_attempts, sequence, now);
        let id = job.id;
        self.jobs.insert(
            id,
            Slot {
                job,
                executing: false,
            },
        );
        Ok(id)
    }

    /// Highest-priority ready job; ties go to the earliest admitted.
    pub fn next_ready(&self, now: Instant) -> Option<JobId> {
        self.jobs
            .values()
            .filter(|slot| !slot.executing && slot.job.is_ready_at(now))
            .max_by(|a, b| {
                a.job
                    .priority
                    .cmp(&b.job.priority)
                    .then_with(|| b.job.sequence.cmp(&a.job.sequence))
            })
            .map(|slot| slot.job.id)
    }

    /// Earliest instant at which a currently scheduled job becomes ready.
    pub fn next_wake(&self, now: Instant) -> Option<Instant> {
        self.jobs
            .values()
            .filter(|slot| !slot.executing)
            .filter_map(|slot| slot.job.scheduled_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Mark a job as executing and count the attempt.
    ///
    /// Returns a copy for the executor; `None` if the job is gone or already
    /// executing.
    pub fn checkout(&mut self, id: JobId) -> Option<Job> {
        let slot = self.jobs.get_mut(&id)?;
        if slot.executing {
            return None;
        }
        slot.executing = true;
        slot.job.begin_attempt();
        Some(slot.job.clone())
    }

    /// Remove a job that finished successfully.
    pub fn complete(&mut self, id: JobId) -> Option<Job> {
        self.remove(id)
    }

    /// Apply the retry policy to a failed attempt.
    ///
    /// `None` if the job is no longer live (e.g. swept while executing).
    pub fn fail(&mut self, id: JobId, now: Instant, backoff_base: Duration) -> Option<FailureOutcome> {
        let slot = self.jobs.get_mut(&id)?;
        let attempts = slot.job.attempts;

        match slot.job.retry_decision(backoff_base) {
            RetryDecision::Retry { delay } => {
                let at = now.checked_add(delay).unwrap_or(now);
                slot.job.scheduled_at = Some(at);
                slot.executing = false;
                Some(FailureOutcome::Rescheduled {
                    attempts,
                    delay,
                    at,
                })
            }
            RetryDecision::Exhausted => {
                self.jobs.remove(&id);
                Some(FailureOutcome::Exhausted { attempts })
            }
        }
    }

    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        self.jobs.remove(&id).map(|slot| slot.job)
    }

    /// Drop every live job; returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.jobs.len();
        self.jobs.clear();
        removed
    }

    /// Remove every job older than `retention`, whatever its state.
    pub fn sweep(&mut self, now: Instant, retention: Duration) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, slot| slot.job.age_at(now) <= retention);
        before - self.jobs.len()
    }

    /// Live jobs in selection order (executing, then ready, then scheduled).
    pub fn snapshot(&self, now: Instant) -> Vec<JobSummary> {
        let mut slots: Vec<_> = self.jobs.values().collect();
        slots.sort_by(|a, b| {
            let rank = |s: &Slot| {
                if s.executing {
                    0
                } else if s.job.is_ready_at(now) {
                    1
                } else {
                    2
                }
            };
            rank(a)
                .cmp(&rank(b))
                .then_with(|| b.job.priority.cmp(&a.job.priority))
                .then_with(|| a.job.sequence.cmp(&b.job.sequence))
        });

        slots
            .into_iter()
            .map(|slot| {
                let state = if slot.executing {
                    JobState::Executing
                } else {
                    match slot.job.scheduled_at {
                        Some(at) if at > now => JobState::Scheduled {
                            ready_in_ms: u64::try_from((at - now).as_millis())
                                .unwrap_or(u64::MAX),
                        },
                        _ => JobState::Ready,
                    }
                };
                JobSummary {
                    id: slot.job.id,
                    job_type: slot.job.job_type(),
                    priority: slot.job.priority,
                    attempts: slot.job.attempts,
                    max_attempts: slot.job.max_attempts,
                    created_at: slot.job.created_at,
                    state,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobType;
    use proptest::prelude::*;

    fn payload(tag: &str) -> JobPayload {
        JobPayload::cleanup_cache(Some(tag.to_string()))
    }

    fn admit(queue: &mut JobQueue, tag: &str, options: JobOptions, now: Instant) -> JobId {
        queue.admit(payload(tag), options, 3, now).unwrap()
    }

    #[test]
    fn rejects_when_full_without_evicting() {
        let mut queue = JobQueue::new(50);
        let now = Instant::now();

        for i in 0..50 {
            admit(&mut queue, &format!("job-{i}"), JobOptions::default(), now);
        }

        let err = queue
            .admit(payload("overflow"), JobOptions::default(), 3, now)
            .unwrap_err();
        assert_eq!(
            err,
            QueueError::Full {
                queued: 50,
                capacity: 50
            }
        );
        assert_eq!(queue.len(), 50);
    }

    #[test]
    fn selects_highest_priority_ready_job() {
        let mut queue = JobQueue::new(10);
        let now = Instant::now();

        let a = admit(&mut queue, "a", JobOptions::default().with_priority(5), now);
        let _b = admit(&mut queue, "b", JobOptions::default().with_priority(1), now);

        assert_eq!(queue.next_ready(now), Some(a));
    }

    #[test]
    fn equal_priorities_run_in_admission_order() {
        let mut queue = JobQueue::new(10);
        let now = Instant::now();

        let first = admit(&mut queue, "first", JobOptions::default(), now);
        let second = admit(&mut queue, "second", JobOptions::default(), now);

        assert_eq!(queue.next_ready(now), Some(first));
        queue.checkout(first);
        queue.complete(first);
        assert_eq!(queue.next_ready(now), Some(second));
    }

    #[test]
    fn scheduled_jobs_are_skipped_until_ready() {
        let mut queue = JobQueue::new(10);
        let now = Instant::now();

        let later = admit(
            &mut queue,
            "later",
            JobOptions::default()
                .with_priority(10)
                .delayed(Duration::from_secs(10)),
            now,
        );
        let soon = admit(&mut queue, "soon", JobOptions::default(), now);

        assert_eq!(queue.next_ready(now), Some(soon));
        assert_eq!(queue.next_wake(now), Some(now + Duration::from_secs(10)));

        queue.checkout(soon);
        queue.complete(soon);
        assert_eq!(queue.next_ready(now + Duration::from_secs(1)), None);
        assert_eq!(queue.next_ready(now + Duration::from_secs(11)), Some(later));
    }

    #[test]
    fn executing_job_is_not_selected_twice() {
        let mut queue = JobQueue::new(10);
        let now = Instant::now();
        let id = admit(&mut queue, "only", JobOptions::default(), now);

        let job = queue.checkout(id).unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(queue.next_ready(now), None);
        assert!(queue.checkout(id).is_none());
    }

    #[test]
    fn failure_reschedules_with_backoff_then_exhausts() {
        let mut queue = JobQueue::new(10);
        let now = Instant::now();
        let base = Duration::from_secs(1);
        let id = admit(&mut queue, "flaky", JobOptions::default(), now);

        queue.checkout(id);
        assert_eq!(
            queue.fail(id, now, base),
            Some(FailureOutcome::Rescheduled {
                attempts: 1,
                delay: Duration::from_secs(2),
                at: now + Duration::from_secs(2),
            })
        );
        assert_eq!(queue.next_ready(now), None);

        let later = now + Duration::from_secs(2);
        queue.checkout(id);
        assert!(matches!(
            queue.fail(id, later, base),
            Some(FailureOutcome::Rescheduled { attempts: 2, .. })
        ));

        queue.checkout(id);
        assert_eq!(
            queue.fail(id, later, base),
            Some(FailureOutcome::Exhausted { attempts: 3 })
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn fail_on_missing_job_is_none() {
        let mut queue = JobQueue::new(10);
        assert_eq!(queue.fail(JobId::new(), Instant::now(), Duration::from_secs(1)), None);
    }

    #[test]
    fn sweep_removes_old_jobs_regardless_of_state() {
        let mut queue = JobQueue::new(10);
        let start = Instant::now();
        let retention = Duration::from_secs(3600);

        admit(&mut queue, "ready", JobOptions::default(), start);
        admit(
            &mut queue,
            "scheduled",
            JobOptions::default().delayed(Duration::from_secs(7200)),
            start,
        );
        let running = admit(&mut queue, "running", JobOptions::default(), start);
        queue.checkout(running);

        let fresh_at = start + Duration::from_secs(1800);
        let fresh = admit(&mut queue, "fresh", JobOptions::default(), fresh_at);

        let removed = queue.sweep(start + Duration::from_secs(3601), retention);

        assert_eq!(removed, 3);
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(fresh));
    }

    #[test]
    fn snapshot_reports_states_in_selection_order() {
        let mut queue = JobQueue::new(10);
        let now = Instant::now();

        admit(
            &mut queue,
            "scheduled",
            JobOptions::default().delayed(Duration::from_secs(5)),
            now,
        );
        let low = admit(&mut queue, "low", JobOptions::default(), now);
        let high = admit(&mut queue, "high", JobOptions::default().with_priority(3), now);
        let running = admit(&mut queue, "running", JobOptions::default(), now);
        queue.checkout(running);

        let snapshot = queue.snapshot(now);
        let ids: Vec<_> = snapshot.iter().map(|s| s.id).collect();

        assert_eq!(&ids[..3], &[running, high, low]);
        assert_eq!(snapshot[0].state, JobState::Executing);
        assert_eq!(snapshot[3].state, JobState::Scheduled { ready_in_ms: 5000 });
        assert!(snapshot.iter().all(|s| s.job_type == JobType::CleanupCache));
    }

    #[test]
    fn clear_drops_every_job() {
        let mut queue = JobQueue::new(10);
        let now = Instant::now();
        admit(&mut queue, "ready", JobOptions::default(), now);
        let running = admit(&mut queue, "running", JobOptions::default(), now);
        queue.checkout(running);

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.next_wake(now), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: selection picks the highest priority among ready jobs,
        /// then the earliest admitted.
        #[test]
        fn next_ready_picks_max_priority_then_earliest(
            jobs in prop::collection::vec((-5i32..5, any::<bool>()), 1..40)
        ) {
            let mut queue = JobQueue::new(64);
            let now = Instant::now();

            let ids: Vec<_> = jobs
                .iter()
                .enumerate()
                .map(|(i, (priority, delayed))| {
                    let mut options = JobOptions::default().with_priority(*priority);
                    if *delayed {
                        options = options.delayed(Duration::from_secs(60));
                    }
                    admit(&mut queue, &format!("job-{i}"), options, now)
                })
                .collect();

            let expected = jobs
                .iter()
                .enumerate()
                .filter(|(_, (_, delayed))| !*delayed)
                .max_by(|(ia, (pa, _)), (ib, (pb, _))| pa.cmp(pb).then_with(|| ib.cmp(ia)))
                .map(|(i, _)| ids[i]);

            prop_assert_eq!(queue.next_ready(now), expected);
        }
    }
}
