//! Trigger driver: periodic rules that enqueue jobs.
//!
//! Each rule runs on its own task. Calendar rules use 6-field cron syntax
//! (`sec min hour day_of_month month day_of_week`) evaluated in UTC.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskforge_core::UserId;

use crate::storage::{Storage, StorageError};

use super::scheduler::Scheduler;
use super::types::{AnalyticsKind, JobOptions, JobPayload};

/// Trigger error.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// When a rule fires.
#[derive(Debug, Clone)]
pub enum Cadence {
    /// Fixed interval, first firing one interval after spawn.
    Every(Duration),
    /// Calendar schedule.
    Cron {
        expression: String,
        schedule: Box<CronSchedule>,
    },
}

impl Cadence {
    pub fn every(interval: Duration) -> Self {
        Cadence::Every(interval)
    }

    pub fn cron(expression: &str) -> Result<Self, TriggerError> {
        let schedule =
            CronSchedule::from_str(expression).map_err(|e| TriggerError::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Cadence::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// Next firing strictly after `from`, or `None` if the schedule has ended.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                from.checked_add_signed(step)
            }
            Cadence::Cron { schedule, .. } => schedule.after(&from).next(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Cadence::Every(interval) => format!("every {}s", interval.as_secs()),
            Cadence::Cron { expression, .. } => expression.clone(),
        }
    }
}

/// Which users a fan-out rule enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSource {
    All,
    RecentlyActive,
}

impl UserSource {
    async fn load(&self, storage: &dyn Storage) -> Result<Vec<UserId>, StorageError> {
        let users = match self {
            UserSource::All => storage.active_users().await?,
            UserSource::RecentlyActive => storage.recently_active_users().await?,
        };
        Ok(users.into_iter().map(|u| u.id).collect())
    }
}

/// Jobs produced for one user by a fan-out rule.
pub type FanOutBuilder = fn(UserId) -> Vec<(JobPayload, JobOptions)>;

#[derive(Debug, Clone)]
pub enum TriggerAction {
    Single {
        payload: JobPayload,
        options: JobOptions,
    },
    /// One or more jobs per user in `source`, each admitted independently.
    FanOut {
        source: UserSource,
        build: FanOutBuilder,
    },
}

/// Admission results for one firing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FireReport {
    pub accepted: usize,
    pub rejected: usize,
}

impl FireReport {
    fn record(&mut self, rejected: bool) {
        if rejected {
            self.rejected += 1;
        } else {
            self.accepted += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriggerRule {
    pub name: &'static str,
    pub cadence: Cadence,
    pub action: TriggerAction,
}

impl TriggerRule {
    pub fn new(name: &'static str, cadence: Cadence, action: TriggerAction) -> Self {
        Self {
            name,
            cadence,
            action,
        }
    }

    /// Enqueue this rule's jobs once.
    ///
    /// Rejected admissions are counted, not retried.
    pub async fn fire(
        &self,
        scheduler: &Scheduler,
        storage: &dyn Storage,
    ) -> Result<FireReport, TriggerError> {
        let mut report = FireReport::default();

        match &self.action {
            TriggerAction::Single { payload, options } => {
                report.record(scheduler.add(payload.clone(), options.clone()).is_rejected());
            }
            TriggerAction::FanOut { source, build } => {
                for user_id in source.load(storage).await? {
                    for (payload, options) in build(user_id) {
                        report.record(scheduler.add(payload, options).is_rejected());
                    }
                }
            }
        }

        if report.rejected > 0 {
            warn!(
                rule = self.name,
                accepted = report.accepted,
                rejected = report.rejected,
                "trigger fired with rejected jobs"
            );
        } else {
            info!(rule = self.name, accepted = report.accepted, "trigger fired");
        }
        Ok(report)
    }
}

/// Handle to stop and join the trigger tasks.
#[derive(Debug)]
pub struct TriggerHandle {
    stop: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl TriggerHandle {
    pub async fn shutdown(self) {
        self.stop.cancel();
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(error = %err, "trigger task failed");
            }
        }
    }
}

pub struct TriggerDriver;

impl TriggerDriver {
    /// Spawn one task per rule on the current tokio runtime.
    pub fn spawn(
        rules: Vec<TriggerRule>,
        scheduler: Scheduler,
        storage: Arc<dyn Storage>,
    ) -> TriggerHandle {
        let stop = CancellationToken::new();
        let joins = rules
            .into_iter()
            .map(|rule| {
                tokio::spawn(run_rule(
                    rule,
                    scheduler.clone(),
                    storage.clone(),
                    stop.clone(),
                ))
            })
            .collect();

        TriggerHandle { stop, joins }
    }
}

async fn run_rule(
    rule: TriggerRule,
    scheduler: Scheduler,
    storage: Arc<dyn Storage>,
    stop: CancellationToken,
) {
    debug!(rule = rule.name, cadence = %rule.cadence.describe(), "trigger rule started");
    let mut last_fired: Option<DateTime<Utc>> = None;

    loop {
        let wait = match &rule.cadence {
            Cadence::Every(interval) => *interval,
            Cadence::Cron { schedule, .. } => {
                let now = Utc::now();
                // Never fire the same occurrence twice if the clock lags the timer.
                let from = last_fired.map_or(now, |last| last.max(now));
                let Some(next) = schedule.after(&from).next() else {
                    warn!(rule = rule.name, "cron schedule has no further occurrences");
                    break;
                };
                last_fired = Some(next);
                (next - now).to_std().unwrap_or(Duration::ZERO)
            }
        };

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        if scheduler.is_shut_down() {
            break;
        }
        if let Err(err) = rule.fire(&scheduler, storage.as_ref()).await {
            warn!(rule = rule.name, error = %err, "trigger rule failed to fire");
        }
    }

    debug!(rule = rule.name, "trigger rule stopped");
}

fn nightly_analytics(user_id: UserId) -> Vec<(JobPayload, JobOptions)> {
    let options = JobOptions::default().with_priority(1);
    vec![
        (
            JobPayload::analytics(Some(user_id), AnalyticsKind::LearningProgress),
            options.clone(),
        ),
        (
            JobPayload::analytics(Some(user_id), AnalyticsKind::FinancialInsights),
            options,
        ),
    ]
}

fn user_statistics(user_id: UserId) -> Vec<(JobPayload, JobOptions)> {
    vec![(JobPayload::user_statistics(user_id), JobOptions::default())]
}

/// The production rule set.
pub fn default_rules() -> Result<Vec<TriggerRule>, TriggerError> {
    Ok(vec![
        TriggerRule::new(
            "platform-metrics",
            Cadence::cron("0 0 * * * *")?,
            TriggerAction::Single {
                payload: JobPayload::analytics(None, AnalyticsKind::PlatformMetrics),
                options: JobOptions::default(),
            },
        ),
        TriggerRule::new(
            "investment-prices",
            Cadence::cron("0 */15 9-16 * * Mon-Fri")?,
            TriggerAction::Single {
                payload: JobPayload::investment_prices(None),
                options: JobOptions::default(),
            },
        ),
        TriggerRule::new(
            "cache-cleanup",
            Cadence::cron("0 0 */6 * * *")?,
            TriggerAction::Single {
                payload: JobPayload::cleanup_cache(None),
                options: JobOptions::default(),
            },
        ),
        TriggerRule::new(
            "nightly-analytics",
            Cadence::cron("0 0 0 * * *")?,
            TriggerAction::FanOut {
                source: UserSource::All,
                build: nightly_analytics,
            },
        ),
        TriggerRule::new(
            "user-statistics",
            Cadence::cron("0 */30 * * * *")?,
            TriggerAction::FanOut {
                source: UserSource::RecentlyActive,
                build: user_statistics,
            },
        ),
    ])
}
