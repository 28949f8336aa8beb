use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::jobs::registry::{HandlerError, JobContext, JobHandler};
use crate::jobs::types::{JobPayload, JobType};
use crate::storage::{Notification, Storage};

use super::unexpected_payload;

/// Stores an unread notification for the user.
pub struct NotificationHandler {
    storage: Arc<dyn Storage>,
}

impl NotificationHandler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl JobHandler for NotificationHandler {
    fn job_type(&self) -> JobType {
        JobType::SendNotifications
    }

    async fn run(&self, payload: &JobPayload, _ctx: &JobContext) -> Result<(), HandlerError> {
        let JobPayload::SendNotifications {
            user_id,
            notification_type,
            message,
            priority,
        } = payload
        else {
            return Err(unexpected_payload(self.job_type(), payload));
        };

        info!(
            user_id = %user_id,
            notification_type = %notification_type,
            priority = ?priority,
            "sending notification"
        );
        self.storage
            .create_notification(Notification {
                user_id: *user_id,
                notification_type: notification_type.clone(),
                message: message.clone(),
                priority: *priority,
                is_read: false,
            })
            .await?;
        Ok(())
    }
}
