//! Core job types: identity, typed payloads, options and retry state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use taskforge_core::{DomainError, UserId};

/// Upper bound for a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminator selecting which handler executes a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    UpdateUserStatistics,
    CalculateAnalytics,
    CleanupCache,
    GenerateCreditReport,
    SendNotifications,
    UpdateInvestmentPrices,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::UpdateUserStatistics,
        JobType::CalculateAnalytics,
        JobType::CleanupCache,
        JobType::GenerateCreditReport,
        JobType::SendNotifications,
        JobType::UpdateInvestmentPrices,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::UpdateUserStatistics => "update_user_statistics",
            JobType::CalculateAnalytics => "calculate_analytics",
            JobType::CleanupCache => "cleanup_cache",
            JobType::GenerateCreditReport => "generate_credit_report",
            JobType::SendNotifications => "send_notifications",
            JobType::UpdateInvestmentPrices => "update_investment_prices",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Which analytics aggregate a `calculate_analytics` job computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsKind {
    LearningProgress,
    FinancialInsights,
    PlatformMetrics,
}

impl AnalyticsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsKind::LearningProgress => "learning_progress",
            AnalyticsKind::FinancialInsights => "financial_insights",
            AnalyticsKind::PlatformMetrics => "platform_metrics",
        }
    }
}

/// Urgency carried by a user notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// Typed job payload; the variant determines the job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    UpdateUserStatistics {
        user_id: UserId,
    },
    CalculateAnalytics {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<UserId>,
        kind: AnalyticsKind,
    },
    CleanupCache {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
    GenerateCreditReport {
        user_id: UserId,
        bureau: String,
    },
    SendNotifications {
        user_id: UserId,
        notification_type: String,
        message: String,
        #[serde(default)]
        priority: NotificationPriority,
    },
    UpdateInvestmentPrices {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        symbols: Option<Vec<String>>,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::UpdateUserStatistics { .. } => JobType::UpdateUserStatistics,
            JobPayload::CalculateAnalytics { .. } => JobType::CalculateAnalytics,
            JobPayload::CleanupCache { .. } => JobType::CleanupCache,
            JobPayload::GenerateCreditReport { .. } => JobType::GenerateCreditReport,
            JobPayload::SendNotifications { .. } => JobType::SendNotifications,
            JobPayload::UpdateInvestmentPrices { .. } => JobType::UpdateInvestmentPrices,
        }
    }

    pub fn user_statistics(user_id: UserId) -> Self {
        Self::UpdateUserStatistics { user_id }
    }

    pub fn analytics(user_id: Option<UserId>, kind: AnalyticsKind) -> Self {
        Self::CalculateAnalytics { user_id, kind }
    }

    pub fn cleanup_cache(pattern: Option<String>) -> Self {
        Self::CleanupCache { pattern }
    }

    pub fn credit_report(user_id: UserId, bureau: impl Into<String>) -> Self {
        Self::GenerateCreditReport {
            user_id,
            bureau: bureau.into(),
        }
    }

    pub fn notification(
        user_id: UserId,
        notification_type: impl Into<String>,
        message: impl Into<String>,
        priority: NotificationPriority,
    ) -> Self {
        Self::SendNotifications {
            user_id,
            notification_type: notification_type.into(),
            message: message.into(),
            priority,
        }
    }

    pub fn investment_prices(symbols: Option<Vec<String>>) -> Self {
        Self::UpdateInvestmentPrices { symbols }
    }
}

/// Per-job admission options.
///
/// Unset fields fall back to the scheduler configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// Higher values run first among ready jobs.
    pub priority: i32,
    /// Delay before the job first becomes ready.
    pub delay: Option<Duration>,
    /// Execution attempts before the job is dropped.
    pub max_attempts: Option<u32>,
    /// Per-attempt execution timeout.
    pub timeout: Option<Duration>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Compute the retry delay after `attempts` executions: `2^attempts × base`.
///
/// Saturates at [`MAX_BACKOFF`].
pub fn backoff_delay(attempts: u32, base: Duration) -> Duration {
    2u32.checked_pow(attempts)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
}

/// What happens to a job after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-run after `delay`.
    Retry { delay: Duration },
    /// `attempts` reached `max_attempts`; the job is dropped.
    Exhausted,
}

/// A unit of deferred work held by the scheduler.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Typed payload (also selects the handler)
    pub payload: JobPayload,
    /// Selection priority (higher first)
    pub priority: i32,
    /// Executions started so far
    pub attempts: u32,
    /// Ceiling on `attempts`
    pub max_attempts: u32,
    /// Per-attempt timeout override
    pub timeout: Option<Duration>,
    /// Wall-clock admission time
    pub created_at: DateTime<Utc>,
    /// Monotonic admission time (retention checks)
    pub enqueued_at: Instant,
    /// Not ready before this instant
    pub scheduled_at: Option<Instant>,
    /// Admission order, breaks priority ties
    pub sequence: u64,
}

impl Job {
    /// Create a new job admitted at `now`.
    ///
    /// `max_attempts` of zero is raised to one: every job runs at least once.
    pub fn new(
        payload: JobPayload,
        options: JobOptions,
        default_max_attempts: u32,
        sequence: u64,
        now: Instant,
    ) -> Self {
        let max_attempts = options.max_attempts.unwrap_or(default_max_attempts).max(1);
        Self {
            id: JobId::new(),
            payload,
            priority: options.priority,
            attempts: 0,
            max_attempts,
            timeout: options.timeout,
            created_at: Utc::now(),
            enqueued_at: now,
            scheduled_at: options.delay.and_then(|d| now.checked_add(d)),
            sequence,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    /// Check if the job may be selected at `now`.
    pub fn is_ready_at(&self, now: Instant) -> bool {
        match self.scheduled_at {
            Some(at) => at <= now,
            None => true,
        }
    }

    /// Age relative to `now`, used by the retention sweep.
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    /// Record the start of an execution attempt.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Decide between retry and drop after a retryable failure.
    pub fn retry_decision(&self, backoff_base: Duration) -> RetryDecision {
        if self.attempts >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: backoff_delay(self.attempts, backoff_base),
            }
        }
    }
}

/// Reason an admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum RejectReason {
    /// The collection is at capacity.
    QueueFull { queued: usize, capacity: usize },
    /// The scheduler has been shut down.
    ShuttingDown,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::QueueFull { queued, capacity } => {
                write!(f, "queue full ({queued}/{capacity})")
            }
            RejectReason::ShuttingDown => f.write_str("scheduler shutting down"),
        }
    }
}

/// Result of `Scheduler::add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Admission {
    Accepted(JobId),
    Rejected(RejectReason),
}

impl Admission {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Admission::Accepted(id) => Some(*id),
            Admission::Rejected(_) => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Admission::Rejected(_))
    }
}

/// Where a live job currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobState {
    Ready,
    Scheduled { ready_in_ms: u64 },
    Executing,
}

/// Read-only view of a live job (inspection/logging).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub job_type: JobType,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub state: JobState,
}
