//! Scheduler core: admission control, priority selection, execution and retry.
//!
//! A single worker task drives execution; no two jobs run at once. The task
//! exists only while there is work: `add` starts it when idle and it exits
//! once the collection is empty. The collection itself sits behind a mutex
//! shared by `add`, the worker and the retention sweep, and the lock is never
//! held across an await.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;

use super::queue::{FailureOutcome, JobQueue, QueueError};
use super::registry::{HandlerError, HandlerRegistry, JobContext};
use super::types::{Admission, Job, JobOptions, JobPayload, JobSummary, RejectReason};

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub accepted: u64,
    pub rejected: u64,
    /// Executions finished (any outcome).
    pub processed: u64,
    pub succeeded: u64,
    /// Executions that returned an error or timed out.
    pub failed: u64,
    pub retried: u64,
    pub exhausted: u64,
    pub dropped_unknown: u64,
    pub dropped_permanent: u64,
    pub swept: u64,
    /// Live jobs dropped by `shutdown`, including one still executing.
    pub discarded: u64,
    /// Live jobs at the time of the snapshot.
    pub queued: usize,
}

/// In-process background job scheduler.
///
/// Cheap to clone; clones share the same queue and worker.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    registry: HandlerRegistry,
    queue: Mutex<JobQueue>,
    stats: Mutex<SchedulerStats>,
    processing: AtomicBool,
    wake: Notify,
    idle: Notify,
    shutdown: CancellationToken,
}

enum Step {
    Run(Job),
    Wait(Option<Instant>),
    Idle,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, registry: HandlerRegistry) -> Self {
        let queue = JobQueue::new(config.max_jobs);
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                queue: Mutex::new(queue),
                stats: Mutex::new(SchedulerStats::default()),
                processing: AtomicBool::new(false),
                wake: Notify::new(),
                idle: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    /// Admit a job.
    ///
    /// Never blocks and never evicts: at capacity (or after shutdown) the
    /// job is rejected and the caller gets `Admission::Rejected`.
    pub fn add(&self, payload: JobPayload, options: JobOptions) -> Admission {
        let job_type = payload.job_type();

        let priority = options.priority;
        let admitted = {
            let mut queue = self.lock_queue();
            // Checked under the lock so `shutdown` cannot clear the queue in between.
            if self.inner.shutdown.is_cancelled() {
                None
            } else {
                Some(queue.admit(
                    payload,
                    options,
                    self.inner.config.default_max_attempts,
                    Instant::now(),
                ))
            }
        };

        match admitted {
            None => {
                self.update_stats(|s| s.rejected += 1);
                warn!(job_type = %job_type, "scheduler shut down; rejecting job");
                Admission::Rejected(RejectReason::ShuttingDown)
            }
            Some(Ok(job_id)) => {
                self.update_stats(|s| s.accepted += 1);
                info!(job_id = %job_id, job_type = %job_type, priority, "job queued");
                self.start();
                Admission::Accepted(job_id)
            }
            Some(Err(QueueError::Full { queued, capacity })) => {
                self.update_stats(|s| s.rejected += 1);
                warn!(
                    job_type = %job_type,
                    queued,
                    capacity,
                    "job queue full; rejecting job"
                );
                Admission::Rejected(RejectReason::QueueFull { queued, capacity })
            }
        }
    }

    /// Start the worker if it is not already running.
    ///
    /// Idempotent: a second call while the worker is active only wakes it.
    /// Outside a tokio runtime the jobs stay queued until the next call made
    /// from within one.
    pub fn start(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        if !self.claim_worker() {
            self.inner.wake.notify_one();
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.clone().run_loop());
            }
            Err(_) => {
                self.inner.processing.store(false, Ordering::Release);
                warn!("no async runtime available; job loop not started");
            }
        }
    }

    /// Stop accepting jobs and cancel the in-flight execution, if any.
    ///
    /// Queued jobs are discarded; nothing is persisted. The in-flight job's
    /// outcome is dropped once its handler returns.
    pub fn shutdown(&self) {
        let discarded = {
            let mut queue = self.lock_queue();
            if self.inner.shutdown.is_cancelled() {
                return;
            }
            self.inner.shutdown.cancel();
            queue.clear()
        };

        self.update_stats(|s| s.discarded += discarded as u64);
        info!(discarded, "scheduler shutting down");
        self.inner.wake.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Whether the worker task is currently active.
    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::Acquire)
    }

    /// Resolve once the worker has gone idle (queue drained or shut down).
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_processing() {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_queue().is_empty()
    }

    pub fn snapshot(&self) -> Vec<JobSummary> {
        self.lock_queue().snapshot(Instant::now())
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self
            .inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.queued = self.len();
        stats
    }

    /// Remove jobs older than the configured retention window.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_older_than(self.inner.config.retention)
    }

    /// Remove jobs admitted more than `retention` ago, whatever their state.
    pub fn sweep_older_than(&self, retention: Duration) -> usize {
        let (removed, remaining) = {
            let mut queue = self.lock_queue();
            let removed = queue.sweep(Instant::now(), retention);
            (removed, queue.len())
        };

        if removed > 0 {
            self.update_stats(|s| s.swept += removed as u64);
            info!(removed, remaining, "swept expired jobs");
        }
        removed
    }

    fn lock_queue(&self) -> MutexGuard<'_, JobQueue> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn update_stats(&self, f: impl FnOnce(&mut SchedulerStats)) {
        let mut stats = self
            .inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut stats);
    }

    fn claim_worker(&self) -> bool {
        self.inner
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn run_loop(self) {
        debug!("job loop started");

        loop {
            self.drain().await;
            self.inner.processing.store(false, Ordering::Release);

            // `add` may have queued a job after `drain` saw an empty queue but
            // before the flag was cleared; it would not have started a worker.
            if self.inner.shutdown.is_cancelled() || self.is_empty() {
                break;
            }
            if !self.claim_worker() {
                break;
            }
        }

        debug!("job loop idle");
        self.inner.idle.notify_waiters();
    }

    async fn drain(&self) {
        while !self.inner.shutdown.is_cancelled() {
            let now = Instant::now();
            let step = {
                let mut queue = self.lock_queue();
                if queue.is_empty() {
                    Step::Idle
                } else {
                    match queue.next_ready(now).and_then(|id| queue.checkout(id)) {
                        Some(job) => Step::Run(job),
                        None => Step::Wait(queue.next_wake(now)),
                    }
                }
            };

            match step {
                Step::Idle => return,
                Step::Run(job) => self.execute(job).await,
                Step::Wait(next_wake) => {
                    let poll = self.inner.config.poll_interval;
                    let pause = next_wake
                        .map_or(poll, |at| at.saturating_duration_since(now).min(poll));
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = self.inner.wake.notified() => {}
                        _ = self.inner.shutdown.cancelled() => {}
                    }
                }
            }
        }
    }

    async fn execute(&self, job: Job) {
        let job_type = job.job_type();

        let Some(handler) = self.inner.registry.get(job_type) else {
            self.lock_queue().remove(job.id);
            self.update_stats(|s| {
                s.processed += 1;
                s.dropped_unknown += 1;
            });
            warn!(job_id = %job.id, job_type = %job_type, "no handler for job type; dropping job");
            return;
        };

        let timeout = job.timeout.unwrap_or(self.inner.config.default_job_timeout);
        let cancellation = self.inner.shutdown.child_token();
        let ctx = JobContext {
            job_id: job.id,
            attempt: job.attempts,
            cancellation: cancellation.clone(),
        };

        info!(
            job_id = %job.id,
            job_type = %job_type,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "processing job"
        );

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(HandlerError::Cancelled),
            outcome = tokio::time::timeout(timeout, handler.run(&job.payload, &ctx)) => {
                outcome.unwrap_or(Err(HandlerError::TimedOut(timeout)))
            }
        };
        // Stops any work the handler left running on its token (e.g. after a timeout).
        cancellation.cancel();
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(()) => self.finish_success(&job, elapsed_ms),
            Err(err) => self.finish_failure(&job, err, elapsed_ms),
        }
    }

    fn finish_success(&self, job: &Job, elapsed_ms: u64) {
        let removed = self.lock_queue().complete(job.id).is_some();
        self.update_stats(|s| {
            s.processed += 1;
            s.succeeded += 1;
        });

        if removed {
            info!(job_id = %job.id, job_type = %job.job_type(), elapsed_ms, "job completed");
        } else {
            debug!(job_id = %job.id, "job completed after being removed");
        }
    }

    fn finish_failure(&self, job: &Job, err: HandlerError, elapsed_ms: u64) {
        let job_type = job.job_type();
        self.update_stats(|s| {
            s.processed += 1;
            s.failed += 1;
        });
        error!(
            job_id = %job.id,
            job_type = %job_type,
            attempt = job.attempts,
            elapsed_ms,
            error = %err,
            "job failed"
        );

        if !err.is_retryable() {
            self.lock_queue().remove(job.id);
            self.update_stats(|s| s.dropped_permanent += 1);
            error!(job_id = %job.id, job_type = %job_type, error = %err, "job not retryable; dropping job");
            return;
        }

        let outcome = self
            .lock_queue()
            .fail(job.id, Instant::now(), self.inner.config.backoff_base);

        match outcome {
            Some(FailureOutcome::Rescheduled { attempts, delay, .. }) => {
                self.update_stats(|s| s.retried += 1);
                info!(
                    job_id = %job.id,
                    job_type = %job_type,
                    attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "job retry scheduled"
                );
            }
            Some(FailureOutcome::Exhausted { attempts }) => {
                self.update_stats(|s| s.exhausted += 1);
                error!(job_id = %job.id, job_type = %job_type, attempts, "job exhausted retries");
            }
            None => debug!(job_id = %job.id, "failed job was removed while executing"),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .field("processing", &self.is_processing())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use crate::jobs::registry::FnHandler;
    use crate::jobs::types::{JobState, JobType};

    fn tag(payload: &JobPayload) -> String {
        match payload {
            JobPayload::CleanupCache { pattern } => pattern.clone().unwrap_or_default(),
            other => format!("{:?}", other.job_type()),
        }
    }

    fn cleanup(label: &str) -> JobPayload {
        JobPayload::cleanup_cache(Some(label.to_string()))
    }

    fn recording_scheduler(config: SchedulerConfig) -> (Scheduler, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();
        let mut registry = HandlerRegistry::new();
        registry.register(FnHandler::new(
            JobType::CleanupCache,
            move |payload: JobPayload, _ctx: JobContext| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(tag(&payload));
                    Ok(())
                }
            },
        ));
        (Scheduler::new(config, registry), log)
    }

    fn failing_scheduler(
        config: SchedulerConfig,
        error: HandlerError,
    ) -> (Scheduler, Arc<Mutex<Vec<Instant>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry.register(FnHandler::new(
            JobType::CleanupCache,
            move |_payload: JobPayload, _ctx: JobContext| {
                let seen = seen.clone();
                let error = error.clone();
                async move {
                    seen.lock().unwrap().push(Instant::now());
                    Err(error)
                }
            },
        ));
        (Scheduler::new(config, registry), calls)
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_runs_first() {
        let (scheduler, log) = recording_scheduler(SchedulerConfig::default());

        assert!(!scheduler.add(cleanup("a"), JobOptions::default().with_priority(5)).is_rejected());
        assert!(!scheduler.add(cleanup("b"), JobOptions::default().with_priority(1)).is_rejected());
        scheduler.wait_idle().await;

        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.stats().succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_priority_runs_in_admission_order() {
        let (scheduler, log) = recording_scheduler(SchedulerConfig::default());

        for label in ["first", "second", "third"] {
            let _ = scheduler.add(cleanup(label), JobOptions::default());
        }
        scheduler.wait_idle().await;

        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_job_runs_exactly_max_attempts() {
        let (scheduler, calls) = failing_scheduler(
            SchedulerConfig::default(),
            HandlerError::transient("boom"),
        );

        let _ = scheduler.add(cleanup("flaky"), JobOptions::default().with_max_attempts(3));
        scheduler.wait_idle().await;

        assert_eq!(calls.lock().unwrap().len(), 3);
        assert!(scheduler.is_empty());

        let stats = scheduler.stats();
        assert_eq!(stats.failed, 3);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_wait_for_exponential_backoff() {
        let (scheduler, calls) = failing_scheduler(
            SchedulerConfig::default(),
            HandlerError::transient("boom"),
        );

        let _ = scheduler.add(cleanup("flaky"), JobOptions::default().with_max_attempts(3));
        scheduler.wait_idle().await;

        let calls = calls.lock().unwrap();
        assert!(calls[1] - calls[0] >= Duration::from_secs(2));
        assert!(calls[2] - calls[1] >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_is_dropped_after_one_attempt() {
        let (scheduler, calls) = failing_scheduler(
            SchedulerConfig::default(),
            HandlerError::invalid_payload("bad"),
        );

        let _ = scheduler.add(cleanup("bad"), JobOptions::default());
        scheduler.wait_idle().await;

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(scheduler.stats().dropped_permanent, 1);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects_and_keeps_size() {
        let (scheduler, _log) = recording_scheduler(SchedulerConfig::default().with_max_jobs(50));

        // `add` is synchronous, so the worker cannot drain anything in between.
        for i in 0..50 {
            assert!(!scheduler.add(cleanup(&format!("job-{i}")), JobOptions::default()).is_rejected());
        }
        let rejected = scheduler.add(cleanup("overflow"), JobOptions::default());

        assert_eq!(
            rejected,
            Admission::Rejected(RejectReason::QueueFull {
                queued: 50,
                capacity: 50
            })
        );
        assert_eq!(scheduler.len(), 50);
        assert_eq!(scheduler.stats().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_is_not_run_early() {
        let (scheduler, log) = recording_scheduler(SchedulerConfig::default());
        let admitted_at = Instant::now();

        let _ = scheduler.add(cleanup("x"), JobOptions::default().delayed(Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(log.lock().unwrap().is_empty());
        assert!(matches!(
            scheduler.snapshot()[0].state,
            JobState::Scheduled { .. }
        ));

        scheduler.wait_idle().await;
        assert_eq!(*log.lock().unwrap(), vec!["x"]);
        assert!(Instant::now() - admitted_at >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_job_type_is_dropped_without_retry() {
        let scheduler = Scheduler::new(SchedulerConfig::default(), HandlerRegistry::new());

        let _ = scheduler.add(JobPayload::investment_prices(None), JobOptions::default());
        scheduler.wait_idle().await;

        let stats = scheduler.stats();
        assert_eq!(stats.dropped_unknown, 1);
        assert_eq!(stats.retried, 0);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_handler_and_counts_as_failure() {
        let cancelled_seen = Arc::new(AtomicU32::new(0));
        let seen = cancelled_seen.clone();
        let mut registry = HandlerRegistry::new();
        registry.register(FnHandler::new(
            JobType::CleanupCache,
            move |_payload: JobPayload, ctx: JobContext| {
                let seen = seen.clone();
                async move {
                    let token = ctx.cancellation.clone();
                    tokio::spawn(async move {
                        token.cancelled().await;
                        seen.fetch_add(1, Ordering::SeqCst);
                    });
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            },
        ));
        let scheduler = Scheduler::new(SchedulerConfig::default(), registry);

        let _ = scheduler.add(
            cleanup("slow"),
            JobOptions::default()
                .with_timeout(Duration::from_secs(5))
                .with_max_attempts(2),
        );
        scheduler.wait_idle().await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let stats = scheduler.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.exhausted, 1);
        assert_eq!(cancelled_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_in_flight_job_and_rejects_new_ones() {
        let started = Arc::new(Notify::new());
        let signal = started.clone();
        let mut registry = HandlerRegistry::new();
        registry.register(FnHandler::new(
            JobType::CleanupCache,
            move |_payload: JobPayload, ctx: JobContext| {
                let signal = signal.clone();
                async move {
                    signal.notify_one();
                    ctx.cancellation.cancelled().await;
                    Err(HandlerError::Cancelled)
                }
            },
        ));
        let scheduler = Scheduler::new(SchedulerConfig::default(), registry);

        let _ = scheduler.add(cleanup("long"), JobOptions::default());
        started.notified().await;

        scheduler.shutdown();
        scheduler.wait_idle().await;

        assert!(scheduler.is_shut_down());
        assert_eq!(scheduler.stats().dropped_permanent, 1);
        assert_eq!(
            scheduler.add(cleanup("late"), JobOptions::default()),
            Admission::Rejected(RejectReason::ShuttingDown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_discards_queued_jobs() {
        let (scheduler, log) = recording_scheduler(SchedulerConfig::default());

        let _ = scheduler.add(cleanup("later"), JobOptions::default().delayed(Duration::from_secs(30)));
        let _ = scheduler.add(cleanup("much-later"), JobOptions::default().delayed(Duration::from_secs(60)));
        assert_eq!(scheduler.len(), 2);

        scheduler.shutdown();
        scheduler.wait_idle().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(scheduler.is_empty());
        let stats = scheduler.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.discarded, 2);
        assert!(log.lock().unwrap().is_empty());

        // A second call is a no-op.
        scheduler.shutdown();
        assert_eq!(scheduler.stats().discarded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_goes_idle_and_restarts_on_add() {
        let (scheduler, log) = recording_scheduler(SchedulerConfig::default());

        let _ = scheduler.add(cleanup("one"), JobOptions::default());
        scheduler.wait_idle().await;
        assert!(!scheduler.is_processing());

        let _ = scheduler.add(cleanup("two"), JobOptions::default());
        assert!(scheduler.is_processing());
        scheduler.wait_idle().await;

        assert_eq!(*log.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_stale_scheduled_jobs() {
        let (scheduler, log) = recording_scheduler(SchedulerConfig::default());

        let _ = scheduler.add(
            cleanup("far-future"),
            JobOptions::default().delayed(Duration::from_secs(2 * 3600)),
        );
        tokio::time::sleep(Duration::from_secs(3601)).await;

        assert_eq!(scheduler.sweep_expired(), 1);
        scheduler.wait_idle().await;

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(scheduler.stats().swept, 1);
    }

    #[test]
    fn instances_are_isolated() {
        let (a, _) = recording_scheduler(SchedulerConfig::default());
        let (b, _) = recording_scheduler(SchedulerConfig::default());

        // No runtime here: jobs stay queued.
        let _ = a.add(cleanup("only-a"), JobOptions::default());

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 0);
        assert!(!a.is_processing());
    }
}
