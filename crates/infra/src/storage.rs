//! Persistent-record access consumed by job handlers.
//!
//! The real backing store lives outside this workspace; handlers only see the
//! [`Storage`] trait. [`InMemoryStorage`] is the tests/dev implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use taskforge_core::{InvestmentId, ReportId, UserId};

use crate::jobs::types::NotificationPriority;

/// Storage error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A platform user as seen by background jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub last_active_at: DateTime<Utc>,
}

/// Course progress for a single user and course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseProgress {
    pub user_id: UserId,
    pub course_id: String,
    /// Percent complete, 0-100.
    pub progress: f64,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityMembership {
    pub user_id: UserId,
    pub community_id: String,
}

/// Denormalised counters stored on the user record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatistics {
    pub courses_completed: u32,
    pub communities_joined: u32,
}

/// Amounts are integer cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialAccount {
    pub user_id: UserId,
    pub name: String,
    pub balance: i64,
}

/// Negative `amount` is spending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub user_id: UserId,
    pub amount: i64,
    pub transaction_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub user_id: UserId,
    pub budget_amount: i64,
}

/// Row counts used for platform metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCounts {
    pub users: u64,
    pub courses: u64,
    pub communities: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningAnalytics {
    pub total_courses: u32,
    pub completed_courses: u32,
    pub average_progress: f64,
    pub hours_learned: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialInsights {
    pub total_balance: i64,
    pub monthly_spending: i64,
    /// Percent of the first budget used this month.
    pub budget_utilization: f64,
    pub savings_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformMetrics {
    pub total_users: u64,
    pub total_courses: u64,
    pub total_communities: u64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditReport {
    pub id: ReportId,
    pub user_id: UserId,
    pub bureau: String,
    pub credit_score: u16,
    pub report_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: UserId,
    pub notification_type: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub is_read: bool,
}

/// Prices are integer cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Investment {
    pub id: InvestmentId,
    pub user_id: UserId,
    pub symbol: String,
    pub current_price: i64,
}

/// Record access required by the job handlers and trigger rules.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn user_progress(&self, user_id: UserId) -> Result<Vec<CourseProgress>, StorageError>;

    async fn community_memberships(
        &self,
        user_id: UserId,
    ) -> Result<Vec<CommunityMembership>, StorageError>;

    async fn update_user_statistics(
        &self,
        user_id: UserId,
        stats: UserStatistics,
    ) -> Result<(), StorageError>;

    async fn financial_accounts(&self, user_id: UserId)
    -> Result<Vec<FinancialAccount>, StorageError>;

    async fn transactions(&self, user_id: UserId) -> Result<Vec<Transaction>, StorageError>;

    async fn budgets(&self, user_id: UserId) -> Result<Vec<Budget>, StorageError>;

    async fn platform_counts(&self) -> Result<PlatformCounts, StorageError>;

    async fn cache_learning_analytics(
        &self,
        user_id: UserId,
        analytics: LearningAnalytics,
    ) -> Result<(), StorageError>;

    async fn cache_financial_insights(
        &self,
        user_id: UserId,
        insights: FinancialInsights,
    ) -> Result<(), StorageError>;

    async fn cache_platform_metrics(&self, metrics: PlatformMetrics) -> Result<(), StorageError>;

    async fn save_credit_report(&self, report: CreditReport) -> Result<(), StorageError>;

    async fn create_notification(&self, notification: Notification) -> Result<(), StorageError>;

    /// All investments, optionally restricted to `symbols`.
    async fn investments(&self, symbols: Option<&[String]>)
    -> Result<Vec<Investment>, StorageError>;

    async fn update_investment_price(
        &self,
        id: InvestmentId,
        new_price: i64,
    ) -> Result<(), StorageError>;

    /// Users eligible for nightly fan-out.
    async fn active_users(&self) -> Result<Vec<User>, StorageError>;

    /// Users active within the last hour.
    async fn recently_active_users(&self) -> Result<Vec<User>, StorageError>;
}

#[async_trait]
impl<S> Storage for Arc<S>
where
    S: Storage + ?Sized,
{
    async fn user_progress(&self, user_id: UserId) -> Result<Vec<CourseProgress>, StorageError> {
        (**self).user_progress(user_id).await
    }

    async fn community_memberships(
        &self,
        user_id: UserId,
    ) -> Result<Vec<CommunityMembership>, StorageError> {
        (**self).community_memberships(user_id).await
    }

    async fn update_user_statistics(
        &self,
        user_id: UserId,
        stats: UserStatistics,
    ) -> Result<(), StorageError> {
        (**self).update_user_statistics(user_id, stats).await
    }

    async fn financial_accounts(
        &self,
        user_id: UserId,
    ) -> Result<Vec<FinancialAccount>, StorageError> {
        (**self).financial_accounts(user_id).await
    }

    async fn transactions(&self, user_id: UserId) -> Result<Vec<Transaction>, StorageError> {
        (**self).transactions(user_id).await
    }

    async fn budgets(&self, user_id: UserId) -> Result<Vec<Budget>, StorageError> {
        (**self).budgets(user_id).await
    }

    async fn platform_counts(&self) -> Result<PlatformCounts, StorageError> {
        (**self).platform_counts().await
    }

    async fn cache_learning_analytics(
        &self,
        user_id: UserId,
        analytics: LearningAnalytics,
    ) -> Result<(), StorageError> {
        (**self).cache_learning_analytics(user_id, analytics).await
    }

    async fn cache_financial_insights(
        &self,
        user_id: UserId,
        insights: FinancialInsights,
    ) -> Result<(), StorageError> {
        (**self).cache_financial_insights(user_id, insights).await
    }

    async fn cache_platform_metrics(&self, metrics: PlatformMetrics) -> Result<(), StorageError> {
        (**self).cache_platform_metrics(metrics).await
    }

    async fn save_credit_report(&self, report: CreditReport) -> Result<(), StorageError> {
        (**self).save_credit_report(report).await
    }

    async fn create_notification(&self, notification: Notification) -> Result<(), StorageError> {
        (**self).create_notification(notification).await
    }

    async fn investments(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<Vec<Investment>, StorageError> {
        (**self).investments(symbols).await
    }

    async fn update_investment_price(
        &self,
        id: InvestmentId,
        new_price: i64,
    ) -> Result<(), StorageError> {
        (**self).update_investment_price(id, new_price).await
    }

    async fn active_users(&self) -> Result<Vec<User>, StorageError> {
        (**self).active_users().await
    }

    async fn recently_active_users(&self) -> Result<Vec<User>, StorageError> {
        (**self).recently_active_users().await
    }
}

/// Cap on users returned for nightly fan-out.
pub const ACTIVE_USERS_LIMIT: usize = 100;
/// Cap on users returned by the recent-activity query.
pub const RECENTLY_ACTIVE_LIMIT: usize = 50;
/// Window for "recently active", in minutes.
pub const RECENT_ACTIVITY_MINUTES: i64 = 60;

#[derive(Debug, Default)]
struct State {
    users: Vec<User>,
    progress: Vec<CourseProgress>,
    memberships: Vec<CommunityMembership>,
    statistics: HashMap<UserId, UserStatistics>,
    accounts: Vec<FinancialAccount>,
    transactions: Vec<Transaction>,
    budgets: Vec<Budget>,
    courses: u64,
    communities: u64,
    learning_analytics: HashMap<UserId, LearningAnalytics>,
    financial_insights: HashMap<UserId, FinancialInsights>,
    platform_metrics: Option<PlatformMetrics>,
    credit_reports: Vec<CreditReport>,
    notifications: Vec<Notification>,
    investments: Vec<Investment>,
}

/// In-memory storage for tests/dev.
///
/// [`fail_next`](Self::fail_next) makes the next `n` trait calls return
/// [`StorageError::Unavailable`].
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: RwLock<State>,
    failures: AtomicU32,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StorageError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> Result<T, StorageError> {
        self.check()?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&state))
    }

    fn write<T>(&self, f: impl FnOnce(&mut State) -> T) -> Result<T, StorageError> {
        self.check()?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&mut state))
    }

    fn seed(&self, f: impl FnOnce(&mut State)) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }

    fn inspect<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    // -- seeding --

    pub fn insert_user(&self, user: User) {
        self.seed(|s| s.users.push(user));
    }

    pub fn insert_progress(&self, progress: CourseProgress) {
        self.seed(|s| s.progress.push(progress));
    }

    pub fn insert_membership(&self, membership: CommunityMembership) {
        self.seed(|s| s.memberships.push(membership));
    }

    pub fn insert_account(&self, account: FinancialAccount) {
        self.seed(|s| s.accounts.push(account));
    }

    pub fn insert_transaction(&self, transaction: Transaction) {
        self.seed(|s| s.transactions.push(transaction));
    }

    pub fn insert_budget(&self, budget: Budget) {
        self.seed(|s| s.budgets.push(budget));
    }

    pub fn insert_investment(&self, investment: Investment) {
        self.seed(|s| s.investments.push(investment));
    }

    pub fn set_catalog_counts(&self, courses: u64, communities: u64) {
        self.seed(|s| {
            s.courses = courses;
            s.communities = communities;
        });
    }

    // -- inspection --

    pub fn statistics_for(&self, user_id: UserId) -> Option<UserStatistics> {
        self.inspect(|s| s.statistics.get(&user_id).copied())
    }

    pub fn learning_analytics_for(&self, user_id: UserId) -> Option<LearningAnalytics> {
        self.inspect(|s| s.learning_analytics.get(&user_id).cloned())
    }

    pub fn financial_insights_for(&self, user_id: UserId) -> Option<FinancialInsights> {
        self.inspect(|s| s.financial_insights.get(&user_id).cloned())
    }

    pub fn platform_metrics(&self) -> Option<PlatformMetrics> {
        self.inspect(|s| s.platform_metrics.clone())
    }

    pub fn credit_reports_for(&self, user_id: UserId) -> Vec<CreditReport> {
        self.inspect(|s| {
            s.credit_reports
                .iter()
                .filter(|r| r.user_id == user_id)
                .cloned()
                .collect()
        })
    }

    pub fn notifications_for(&self, user_id: UserId) -> Vec<Notification> {
        self.inspect(|s| {
            s.notifications
                .iter()
                .filter(|n| n.user_id == user_id)
                .cloned()
                .collect()
        })
    }

    pub fn investment(&self, id: InvestmentId) -> Option<Investment> {
        self.inspect(|s| s.investments.iter().find(|i| i.id == id).cloned())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn user_progress(&self, user_id: UserId) -> Result<Vec<CourseProgress>, StorageError> {
        self.read(|s| {
            s.progress
                .iter()
                .filter(|p| p.user_id == user_id)
                .cloned()
                .collect()
        })
    }

    async fn community_memberships(
        &self,
        user_id: UserId,
    ) -> Result<Vec<CommunityMembership>, StorageError> {
        self.read(|s| {
            s.memberships
                .iter()
                .filter(|m| m.user_id == user_id)
                .cloned()
                .collect()
        })
    }

    async fn update_user_statistics(
        &self,
        user_id: UserId,
        stats: UserStatistics,
    ) -> Result<(), StorageError> {
        self.write(|s| {
            if !s.users.iter().any(|u| u.id == user_id) {
                return Err(StorageError::NotFound(format!("user {user_id}")));
            }
            s.statistics.insert(user_id, stats);
            Ok(())
        })?
    }

    async fn financial_accounts(
        &self,
        user_id: UserId,
    ) -> Result<Vec<FinancialAccount>, StorageError> {
        self.read(|s| {
            s.accounts
                .iter()
                .filter(|a| a.user_id == user_id)
                .cloned()
                .collect()
        })
    }

    async fn transactions(&self, user_id: UserId) -> Result<Vec<Transaction>, StorageError> {
        self.read(|s| {
            s.transactions
                .iter()
                .filter(|t| t.user_id == user_id)
                .cloned()
                .collect()
        })
    }

    async fn budgets(&self, user_id: UserId) -> Result<Vec<Budget>, StorageError> {
        self.read(|s| {
            s.budgets
                .iter()
                .filter(|b| b.user_id == user_id)
                .cloned()
                .collect()
        })
    }

    async fn platform_counts(&self) -> Result<PlatformCounts, StorageError> {
        self.read(|s| PlatformCounts {
            users: s.users.len() as u64,
            courses: s.courses,
            communities: s.communities,
        })
    }

    async fn cache_learning_analytics(
        &self,
        user_id: UserId,
        analytics: LearningAnalytics,
    ) -> Result<(), StorageError> {
        self.write(|s| {
            s.learning_analytics.insert(user_id, analytics);
        })
    }

    async fn cache_financial_insights(
        &self,
        user_id: UserId,
        insights: FinancialInsights,
    ) -> Result<(), StorageError> {
        self.write(|s| {
            s.financial_insights.insert(user_id, insights);
        })
    }

    async fn cache_platform_metrics(&self, metrics: PlatformMetrics) -> Result<(), StorageError> {
        self.write(|s| {
            s.platform_metrics = Some(metrics);
        })
    }

    async fn save_credit_report(&self, report: CreditReport) -> Result<(), StorageError> {
        self.write(|s| s.credit_reports.push(report))
    }

    async fn create_notification(&self, notification: Notification) -> Result<(), StorageError> {
        self.write(|s| s.notifications.push(notification))
    }

    async fn investments(
        &self,
        symbols: Option<&[String]>,
    ) -> Result<Vec<Investment>, StorageError> {
        self.read(|s| {
            s.investments
                .iter()
                .filter(|i| match symbols {
                    Some(wanted) if !wanted.is_empty() => wanted.contains(&i.symbol),
                    _ => true,
                })
                .cloned()
                .collect()
        })
    }

    async fn update_investment_price(
        &self,
        id: InvestmentId,
        new_price: i64,
    ) -> Result<(), StorageError> {
        self.write(|s| match s.investments.iter_mut().find(|i| i.id == id) {
            Some(investment) => {
                investment.current_price = new_price;
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("investment {id}"))),
        })?
    }

    async fn active_users(&self) -> Result<Vec<User>, StorageError> {
        self.read(|s| s.users.iter().take(ACTIVE_USERS_LIMIT).cloned().collect())
    }

    async fn recently_active_users(&self) -> Result<Vec<User>, StorageError> {
        let cutoff = Utc::now() - ChronoDuration::minutes(RECENT_ACTIVITY_MINUTES);
        self.read(|s| {
            s.users
                .iter()
                .filter(|u| u.last_active_at >= cutoff)
                .take(RECENTLY_ACTIVE_LIMIT)
                .cloned()
                .collect()
        })
    }
}
