use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::cache::CacheInvalidation;
use crate::jobs::registry::{HandlerError, JobContext, JobHandler};
use crate::jobs::types::{JobPayload, JobType};

use super::unexpected_payload;

/// Clears cache entries by pattern, or every expired entry when no pattern is given.
pub struct CacheCleanupHandler {
    cache: Arc<dyn CacheInvalidation>,
}

impl CacheCleanupHandler {
    pub fn new(cache: Arc<dyn CacheInvalidation>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl JobHandler for CacheCleanupHandler {
    fn job_type(&self) -> JobType {
        JobType::CleanupCache
    }

    async fn run(&self, payload: &JobPayload, _ctx: &JobContext) -> Result<(), HandlerError> {
        let JobPayload::CleanupCache { pattern } = payload else {
            return Err(unexpected_payload(self.job_type(), payload));
        };

        let removed = match pattern.as_deref() {
            Some(pattern) => self.cache.clear_pattern(pattern).await?,
            None => self.cache.clear_expired().await?,
        };
        info!(pattern = pattern.as_deref().unwrap_or("<expired>"), removed, "cache cleanup finished");
        Ok(())
    }
}
