use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info};

use crate::jobs::registry::{HandlerError, JobContext, JobHandler};
use crate::jobs::types::{JobPayload, JobType};
use crate::storage::Storage;

/// Largest simulated relative move per update (±5 %).
pub const MAX_PRICE_MOVE: f64 = 0.05;

/// Apply a relative `change` to a price in cents, rounding and flooring at 1.
pub fn apply_price_move(price: i64, change: f64) -> i64 {
    let moved = (price as f64 * (1.0 + change)).max(1.0);
    moved.round() as i64
}

/// Applies a simulated market move to tracked investments.
pub struct InvestmentPriceHandler {
    storage: Arc<dyn Storage>,
}

impl InvestmentPriceHandler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl JobHandler for InvestmentPriceHandler {
    fn job_type(&self) -> JobType {
        JobType::UpdateInvestmentPrices
    }

    async fn run(&self, payload: &JobPayload, ctx: &JobContext) -> Result<(), HandlerError> {
        let JobPayload::UpdateInvestmentPrices { symbols } = payload else {
            return Err(super::unexpected_payload(self.job_type(), payload));
        };

        let investments = self.storage.investments(symbols.as_deref()).await?;
        let total = investments.len();

        for investment in investments {
            if ctx.cancellation.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }

            let change = rand::thread_rng().gen_range(-MAX_PRICE_MOVE..=MAX_PRICE_MOVE);
            let new_price = apply_price_move(investment.current_price, change);
            self.storage
                .update_investment_price(investment.id, new_price)
                .await?;
            debug!(
                symbol = %investment.symbol,
                old_price = investment.current_price,
                new_price,
                "investment price updated"
            );
        }

        info!(updated = total, "investment prices updated");
        Ok(())
    }
}
