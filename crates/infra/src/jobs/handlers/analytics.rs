use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use tracing::debug;

use taskforge_core::UserId;

use crate::jobs::registry::{HandlerError, JobContext, JobHandler};
use crate::jobs::types::{AnalyticsKind, JobPayload, JobType};
use crate::storage::{
    Budget, CourseProgress, FinancialAccount, FinancialInsights, LearningAnalytics,
    PlatformMetrics, Storage, Transaction,
};

use super::unexpected_payload;

/// Estimated study hours credited per completed course.
const HOURS_PER_COMPLETED_COURSE: u32 = 2;

/// Learning progress summary over a user's progress rows.
pub fn learning_analytics(progress: &[CourseProgress]) -> LearningAnalytics {
    let completed = progress.iter().filter(|p| p.completed).count() as u32;
    let average_progress = if progress.is_empty() {
        0.0
    } else {
        progress.iter().map(|p| p.progress).sum::<f64>() / progress.len() as f64
    };

    LearningAnalytics {
        total_courses: progress.len() as u32,
        completed_courses: completed,
        average_progress,
        hours_learned: completed * HOURS_PER_COMPLETED_COURSE,
    }
}

/// Financial summary for the calendar month containing `now`.
///
/// Spending is the sum of outgoing (negative) transactions this month.
/// Utilisation is measured against the first budget.
pub fn financial_insights(
    accounts: &[FinancialAccount],
    transactions: &[Transaction],
    budgets: &[Budget],
    now: DateTime<Utc>,
) -> FinancialInsights {
    let total_balance: i64 = accounts.iter().map(|a| a.balance).sum();
    let monthly_spending: i64 = transactions
        .iter()
        .filter(|t| t.amount < 0)
        .filter(|t| {
            t.transaction_date.year() == now.year() && t.transaction_date.month() == now.month()
        })
        .map(|t| t.amount.saturating_abs())
        .sum();

    let budget_utilization = match budgets.first() {
        Some(budget) if budget.budget_amount != 0 => {
            monthly_spending as f64 / budget.budget_amount as f64 * 100.0
        }
        _ => 0.0,
    };
    let savings_rate = if total_balance > 0 {
        (total_balance - monthly_spending) as f64 / total_balance as f64 * 100.0
    } else {
        0.0
    };

    FinancialInsights {
        total_balance,
        monthly_spending,
        budget_utilization,
        savings_rate,
    }
}

/// Computes and caches analytics aggregates.
pub struct AnalyticsHandler {
    storage: Arc<dyn Storage>,
}

impl AnalyticsHandler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    async fn learning_progress(&self, user_id: UserId) -> Result<(), HandlerError> {
        let progress = self.storage.user_progress(user_id).await?;
        let analytics = learning_analytics(&progress);
        debug!(user_id = %user_id, completed = analytics.completed_courses, "learning analytics computed");
        self.storage
            .cache_learning_analytics(user_id, analytics)
            .await?;
        Ok(())
    }

    async fn financial(&self, user_id: UserId) -> Result<(), HandlerError> {
        let accounts = self.storage.financial_accounts(user_id).await?;
        let transactions = self.storage.transactions(user_id).await?;
        let budgets = self.storage.budgets(user_id).await?;

        let insights = financial_insights(&accounts, &transactions, &budgets, Utc::now());
        self.storage
            .cache_financial_insights(user_id, insights)
            .await?;
        Ok(())
    }

    async fn platform(&self) -> Result<(), HandlerError> {
        let counts = self.storage.platform_counts().await?;
        self.storage
            .cache_platform_metrics(PlatformMetrics {
                total_users: counts.users,
                total_courses: counts.courses,
                total_communities: counts.communities,
                computed_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for AnalyticsHandler {
    fn job_type(&self) -> JobType {
        JobType::CalculateAnalytics
    }

    async fn run(&self, payload: &JobPayload, _ctx: &JobContext) -> Result<(), HandlerError> {
        let JobPayload::CalculateAnalytics { user_id, kind } = payload else {
            return Err(unexpected_payload(self.job_type(), payload));
        };

        match (kind, user_id) {
            (AnalyticsKind::PlatformMetrics, _) => self.platform().await,
            (AnalyticsKind::LearningProgress, Some(user_id)) => {
                self.learning_progress(*user_id).await
            }
            (AnalyticsKind::FinancialInsights, Some(user_id)) => self.financial(*user_id).await,
            (kind, None) => Err(HandlerError::invalid_payload(format!(
                "{} analytics requires a user_id",
                kind.as_str()
            ))),
        }
    }
}
