//! Domain handlers for the built-in job types.
//!
//! Handlers reach external state only through [`Storage`] and
//! [`CacheInvalidation`]; wrong payload variants are reported as
//! [`HandlerError::InvalidPayload`] and never retried.

mod analytics;
mod cache_cleanup;
mod credit_report;
mod investment_prices;
mod notifications;
mod user_statistics;

use std::sync::Arc;

use crate::cache::CacheInvalidation;
use crate::storage::Storage;

use super::registry::{HandlerError, HandlerRegistry};
use super::types::{JobPayload, JobType};

pub use analytics::{AnalyticsHandler, financial_insights, learning_analytics};
pub use cache_cleanup::CacheCleanupHandler;
pub use credit_report::{CREDIT_SCORE_RANGE, CreditReportHandler};
pub use investment_prices::{InvestmentPriceHandler, MAX_PRICE_MOVE, apply_price_move};
pub use notifications::NotificationHandler;
pub use user_statistics::UserStatisticsHandler;

/// Register a handler for every built-in job type.
pub fn register_default_handlers(
    registry: &mut HandlerRegistry,
    storage: Arc<dyn Storage>,
    cache: Arc<dyn CacheInvalidation>,
) -> &mut HandlerRegistry {
    registry
        .register(UserStatisticsHandler::new(storage.clone(), cache.clone()))
        .register(AnalyticsHandler::new(storage.clone()))
        .register(CacheCleanupHandler::new(cache))
        .register(CreditReportHandler::new(storage.clone()))
        .register(NotificationHandler::new(storage.clone()))
        .register(InvestmentPriceHandler::new(storage))
}

fn unexpected_payload(expected: JobType, payload: &JobPayload) -> HandlerError {
    HandlerError::invalid_payload(format!(
        "{expected} handler received a {} payload",
        payload.job_type()
    ))
}

#[cfg(test)]
fn test_ctx() -> super::registry::JobContext {
    super::registry::JobContext {
        job_id: super::types::JobId::new(),
        attempt: 1,
        cancellation: tokio_util::sync::CancellationToken::new(),
    }
}
