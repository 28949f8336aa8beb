//! Integration tests for the full job pipeline.
//!
//! Tests: TriggerRule → Scheduler → Handler → Storage/Cache
//!
//! Verifies:
//! - Fan-out rules produce one completed job per user
//! - Transient storage failures are retried with backoff and then succeed
//! - Invalid payloads are dropped without touching storage
//! - Shutdown order leaves no running tasks behind

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};

    use taskforge_core::UserId;

    use crate::cache::{CacheKeys, InMemoryCache};
    use crate::config::SchedulerConfig;
    use crate::jobs::{
        AnalyticsKind, HandlerRegistry, JobOptions, JobPayload, Jobs, RetentionSweeper, Scheduler,
        TriggerDriver, default_rules, register_default_handlers,
    };
    use crate::storage::{CourseProgress, InMemoryStorage, Storage, User};

    struct Harness {
        scheduler: Scheduler,
        storage: Arc<InMemoryStorage>,
        cache: Arc<InMemoryCache>,
    }

    fn setup(config: SchedulerConfig) -> Harness {
        let storage = InMemoryStorage::arc();
        let cache = InMemoryCache::arc();
        let mut registry = HandlerRegistry::new();
        register_default_handlers(&mut registry, storage.clone(), cache.clone());

        Harness {
            scheduler: Scheduler::new(config, registry),
            storage,
            cache,
        }
    }

    fn seed_user(storage: &InMemoryStorage, active_minutes_ago: i64) -> UserId {
        let id = UserId::new();
        storage.insert_user(User {
            id,
            last_active_at: Utc::now() - ChronoDuration::minutes(active_minutes_ago),
        });
        storage.insert_progress(CourseProgress {
            user_id: id,
            course_id: "budgeting-101".to_string(),
            progress: 100.0,
            completed: true,
        });
        id
    }

    fn rule(name: &str) -> crate::jobs::TriggerRule {
        default_rules()
            .unwrap()
            .into_iter()
            .find(|r| r.name == name)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn nightly_fan_out_computes_analytics_for_every_user() {
        let h = setup(SchedulerConfig::default());
        let users: Vec<_> = (0..5).map(|_| seed_user(&h.storage, 600)).collect();

        let report = rule("nightly-analytics")
            .fire(&h.scheduler, h.storage.as_ref())
            .await
            .unwrap();
        assert_eq!(report.accepted, 10);

        h.scheduler.wait_idle().await;

        for user in &users {
            let learning = h.storage.learning_analytics_for(*user).unwrap();
            assert_eq!(learning.completed_courses, 1);
            assert!(h.storage.financial_insights_for(*user).is_some());
        }
        let stats = h.scheduler.stats();
        assert_eq!(stats.succeeded, 10);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_storage_failure_is_retried_then_succeeds() {
        let h = setup(SchedulerConfig::default());
        let recent = seed_user(&h.storage, 5);
        let _idle = seed_user(&h.storage, 600);
        for key in CacheKeys::for_user(recent) {
            h.cache.set(key, serde_json::json!({}), Duration::from_secs(3600));
        }

        let report = rule("user-statistics")
            .fire(&h.scheduler, h.storage.as_ref())
            .await
            .unwrap();
        assert_eq!(report.accepted, 1);

        // The worker has not run yet; its first storage call fails.
        h.storage.fail_next(1);
        h.scheduler.wait_idle().await;

        let stats = h.scheduler.stats();
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(h.storage.statistics_for(recent).unwrap().courses_completed, 1);
        assert!(h.cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_payload_is_dropped_without_retry() {
        let h = setup(SchedulerConfig::default());

        let admission = h.scheduler.add(
            JobPayload::analytics(None, AnalyticsKind::FinancialInsights),
            JobOptions::default().with_max_attempts(5),
        );
        assert!(!admission.is_rejected());
        h.scheduler.wait_idle().await;

        let stats = h.scheduler.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.dropped_permanent, 1);
        assert_eq!(stats.retried, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn on_demand_jobs_reach_storage() {
        let h = setup(SchedulerConfig::default());
        let user = seed_user(&h.storage, 1);
        let jobs = Jobs::new(h.scheduler.clone());

        let _ = jobs.generate_credit_report(user, "transunion");
        let _ = jobs.send_notification(user, "report_ready", "Your credit report is ready", None);
        h.scheduler.wait_idle().await;

        assert_eq!(h.storage.credit_reports_for(user).len(), 1);
        assert_eq!(h.storage.notifications_for(user).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_tasks_shut_down_cleanly() {
        let h = setup(SchedulerConfig::default());
        let storage: Arc<dyn Storage> = h.storage.clone();

        let sweeper = RetentionSweeper::from_config(h.scheduler.config()).spawn(h.scheduler.clone());
        let triggers = TriggerDriver::spawn(default_rules().unwrap(), h.scheduler.clone(), storage);

        tokio::time::sleep(Duration::from_secs(5)).await;

        triggers.shutdown().await;
        sweeper.shutdown().await;
        h.scheduler.shutdown();
        h.scheduler.wait_idle().await;

        assert!(!h.scheduler.is_processing());
        assert!(h.scheduler.is_shut_down());
        assert_eq!(h.scheduler.stats().accepted, 0);
    }
}
