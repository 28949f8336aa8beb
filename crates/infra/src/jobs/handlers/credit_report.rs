use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tracing::info;

use taskforge_core::ReportId;

use crate::jobs::registry::{HandlerError, JobContext, JobHandler};
use crate::jobs::types::{JobPayload, JobType};
use crate::storage::{CreditReport, Storage};

use super::unexpected_payload;

/// Range of simulated bureau scores.
pub const CREDIT_SCORE_RANGE: Range<u16> = 700..850;

/// Produces a simulated bureau report and stores it.
pub struct CreditReportHandler {
    storage: Arc<dyn Storage>,
}

impl CreditReportHandler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl JobHandler for CreditReportHandler {
    fn job_type(&self) -> JobType {
        JobType::GenerateCreditReport
    }

    async fn run(&self, payload: &JobPayload, _ctx: &JobContext) -> Result<(), HandlerError> {
        let JobPayload::GenerateCreditReport { user_id, bureau } = payload else {
            return Err(unexpected_payload(self.job_type(), payload));
        };
        if bureau.trim().is_empty() {
            return Err(HandlerError::invalid_payload("credit report bureau is empty"));
        }

        let report = CreditReport {
            id: ReportId::new(),
            user_id: *user_id,
            bureau: bureau.clone(),
            credit_score: rand::thread_rng().gen_range(CREDIT_SCORE_RANGE),
            report_date: Utc::now(),
        };
        info!(
            user_id = %user_id,
            bureau = %bureau,
            report_id = %report.id,
            "credit report generated"
        );

        self.storage.save_credit_report(report).await?;
        Ok(())
    }
}
