use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::cache::CacheInvalidation;
use crate::jobs::registry::{HandlerError, JobContext, JobHandler};
use crate::jobs::types::{JobPayload, JobType};
use crate::storage::{Storage, UserStatistics};

use super::unexpected_payload;

/// Recomputes a user's denormalised counters and drops their cache entries.
pub struct UserStatisticsHandler {
    storage: Arc<dyn Storage>,
    cache: Arc<dyn CacheInvalidation>,
}

impl UserStatisticsHandler {
    pub fn new(storage: Arc<dyn Storage>, cache: Arc<dyn CacheInvalidation>) -> Self {
        Self { storage, cache }
    }
}

#[async_trait]
impl JobHandler for UserStatisticsHandler {
    fn job_type(&self) -> JobType {
        JobType::UpdateUserStatistics
    }

    async fn run(&self, payload: &JobPayload, _ctx: &JobContext) -> Result<(), HandlerError> {
        let JobPayload::UpdateUserStatistics { user_id } = payload else {
            return Err(unexpected_payload(self.job_type(), payload));
        };
        let user_id = *user_id;

        let progress = self.storage.user_progress(user_id).await?;
        let memberships = self.storage.community_memberships(user_id).await?;

        let stats = UserStatistics {
            courses_completed: progress.iter().filter(|p| p.completed).count() as u32,
            communities_joined: memberships.len() as u32,
        };
        self.storage.update_user_statistics(user_id, stats).await?;

        let invalidated = self.cache.invalidate_user(user_id).await?;
        debug!(
            user_id = %user_id,
            courses_completed = stats.courses_completed,
            communities_joined = stats.communities_joined,
            invalidated,
            "user statistics updated"
        );
        Ok(())
    }
}
