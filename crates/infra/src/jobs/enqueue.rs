//! Typed enqueuers for on-demand jobs.

use taskforge_core::UserId;

use super::scheduler::Scheduler;
use super::types::{Admission, AnalyticsKind, JobOptions, JobPayload, NotificationPriority};

/// Priority given to credit report requests.
pub const CREDIT_REPORT_PRIORITY: i32 = 5;

/// Request-path helpers over a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct Jobs {
    scheduler: Scheduler,
}

impl Jobs {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn update_user_stats(&self, user_id: UserId) -> Admission {
        self.scheduler
            .add(JobPayload::user_statistics(user_id), JobOptions::default())
    }

    pub fn calculate_user_analytics(&self, user_id: UserId, kind: AnalyticsKind) -> Admission {
        self.scheduler.add(
            JobPayload::analytics(Some(user_id), kind),
            JobOptions::default(),
        )
    }

    pub fn generate_credit_report(&self, user_id: UserId, bureau: impl Into<String>) -> Admission {
        self.scheduler.add(
            JobPayload::credit_report(user_id, bureau),
            JobOptions::default().with_priority(CREDIT_REPORT_PRIORITY),
        )
    }

    /// `priority` defaults to [`NotificationPriority::Medium`].
    pub fn send_notification(
        &self,
        user_id: UserId,
        notification_type: impl Into<String>,
        message: impl Into<String>,
        priority: Option<NotificationPriority>,
    ) -> Admission {
        self.scheduler.add(
            JobPayload::notification(
                user_id,
                notification_type,
                message,
                priority.unwrap_or_default(),
            ),
            JobOptions::default(),
        )
    }

    pub fn update_investment_prices(&self, symbols: Option<Vec<String>>) -> Admission {
        self.scheduler
            .add(JobPayload::investment_prices(symbols), JobOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::SchedulerConfig;
    use crate::jobs::registry::HandlerRegistry;
    use crate::jobs::types::JobType;

    // Outside a runtime nothing executes, so the queue can be inspected as admitted.
    fn jobs() -> (Jobs, Scheduler) {
        let scheduler = Scheduler::new(SchedulerConfig::default(), HandlerRegistry::new());
        (Jobs::new(scheduler.clone()), scheduler)
    }

    #[test]
    fn credit_reports_jump_the_queue() {
        let (jobs, scheduler) = jobs();
        let user = UserId::new();

        let _ = jobs.update_user_stats(user);
        let report = jobs.generate_credit_report(user, "experian");

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot[0].id, report.job_id().unwrap());
        assert_eq!(snapshot[0].job_type, JobType::GenerateCreditReport);
        assert_eq!(snapshot[0].priority, CREDIT_REPORT_PRIORITY);
    }

    #[test]
    fn notification_priority_defaults_to_medium() {
        let (jobs, scheduler) = jobs();
        let user = UserId::new();

        let _ = jobs.send_notification(user, "reminder", "Finish your course", None);

        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.snapshot()[0].job_type, JobType::SendNotifications);
        assert_eq!(NotificationPriority::default(), NotificationPriority::Medium);
    }

    #[test]
    fn each_helper_enqueues_its_job_type() {
        let (jobs, scheduler) = jobs();
        let user = UserId::new();

        let _ = jobs.calculate_user_analytics(user, AnalyticsKind::FinancialInsights);
        let _ = jobs.update_investment_prices(Some(vec!["VTI".into()]));

        let mut types: Vec<_> = scheduler.snapshot().iter().map(|s| s.job_type).collect();
        types.sort();
        assert_eq!(
            types,
            vec![JobType::CalculateAnalytics, JobType::UpdateInvestmentPrices]
        );
    }
}
