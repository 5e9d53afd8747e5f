//! Persistence for payment intents and the callback audit trail

mod memory;
mod postgres;

pub use memory::MemoryPaymentStore;
pub use postgres::{PostgresPaymentStore, SCHEMA};

use crate::error::Result;
use crate::model::{CallbackEvent, PayableRef, PaymentIntent, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Insert a new intent.
    ///
    /// Fails with `Conflict` when the merchant reference is taken or the
    /// payable already has a non-terminal intent.
    async fn insert_intent(&self, intent: &PaymentIntent) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<PaymentIntent>>;

    async fn find_by_reference(&self, merchant_reference: &str) -> Result<Option<PaymentIntent>>;

    async fn find_by_tracking_id(
        &self,
        external_tracking_id: &str,
    ) -> Result<Option<PaymentIntent>>;

    async fn find_active_for_payable(&self, payable: PayableRef) -> Result<Option<PaymentIntent>>;

    /// Replace the stored intent only if its status is still `expected`.
    /// Returns `false` when another writer got there first.
    async fn update_intent(&self, intent: &PaymentIntent, expected: PaymentStatus) -> Result<bool>;

    /// `PENDING` intents last touched before `updated_before`, oldest first
    async fn list_pending(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentIntent>>;

    async fn append_event(&self, event: &CallbackEvent) -> Result<()>;

    async fn events_for(&self, external_tracking_id: &str) -> Result<Vec<CallbackEvent>>;

    async fn is_healthy(&self) -> bool {
        true
    }
}
