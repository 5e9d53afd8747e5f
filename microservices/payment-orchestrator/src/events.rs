//! Notification hook for the owning order or appointment

use crate::model::{PaymentIntent, PaymentStatus};
use async_trait::async_trait;
use tracing::info;

/// Told about every terminal transition so the payable can be marked paid,
/// released for another attempt, or reversed
#[async_trait]
pub trait PaymentEvents: Send + Sync {
    async fn on_terminal(&self, intent: &PaymentIntent, previous: PaymentStatus);
}

/// Default hook: log the settlement
pub struct LoggingEvents;

#[async_trait]
impl PaymentEvents for LoggingEvents {
    async fn on_terminal(&self, intent: &PaymentIntent, previous: PaymentStatus) {
        info!(
            merchant_reference = %intent.merchant_reference,
            payable = %intent.payable(),
            from = %previous,
            status = %intent.status,
            "Payment settled"
        );
    }
}
