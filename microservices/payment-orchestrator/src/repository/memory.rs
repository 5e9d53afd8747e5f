//! In-process store backed by DashMap

use super::PaymentStore;
use crate::error::{PaymentError, Result};
use crate::model::{CallbackEvent, PayableRef, PaymentIntent, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct MemoryPaymentStore {
    intents: Arc<DashMap<Uuid, PaymentIntent>>,
    by_reference: Arc<DashMap<String, Uuid>>,
    by_tracking_id: Arc<DashMap<String, Uuid>>,
    /// At most one non-terminal intent per payable
    active: Arc<DashMap<PayableRef, Uuid>>,
    events: Arc<DashMap<String, Vec<CallbackEvent>>>,
}

impl MemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn load(&self, id: Option<Uuid>) -> Option<PaymentIntent> {
        id.and_then(|id| self.intents.get(&id).map(|i| i.clone()))
    }
}

#[async_trait]
impl PaymentStore for MemoryPaymentStore {
    async fn insert_intent(&self, intent: &PaymentIntent) -> Result<()> {
        {
            let slot = match self.active.entry(intent.payable()) {
                Entry::Occupied(existing) => {
                    return Err(PaymentError::Conflict(format!(
                        "{} already has active payment {}",
                        intent.payable(),
                        existing.get()
                    )))
                }
                Entry::Vacant(slot) => slot,
            };

            match self.by_reference.entry(intent.merchant_reference.clone()) {
                Entry::Occupied(_) => {
                    return Err(PaymentError::Conflict(format!(
                        "merchant reference {} already used",
                        intent.merchant_reference
                    )))
                }
                Entry::Vacant(reference) => {
                    reference.insert(intent.id);
                }
            }

            if !intent.status.is_terminal() {
                slot.insert(intent.id);
            }
        }

        self.intents.insert(intent.id, intent.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PaymentIntent>> {
        Ok(self.load(Some(id)))
    }

    async fn find_by_reference(&self, merchant_reference: &str) -> Result<Option<PaymentIntent>> {
        let id = self.by_reference.get(merchant_reference).map(|id| *id);
        Ok(self.load(id))
    }

    async fn find_by_tracking_id(
        &self,
        external_tracking_id: &str,
    ) -> Result<Option<PaymentIntent>> {
        let id = self.by_tracking_id.get(external_tracking_id).map(|id| *id);
        Ok(self.load(id))
    }

    async fn find_active_for_payable(&self, payable: PayableRef) -> Result<Option<PaymentIntent>> {
        let id = self.active.get(&payable).map(|id| *id);
        Ok(self.load(id))
    }

    async fn update_intent(&self, intent: &PaymentIntent, expected: PaymentStatus) -> Result<bool> {
        {
            let Some(mut stored) = self.intents.get_mut(&intent.id) else {
                return Err(PaymentError::NotFound(intent.id.to_string()));
            };
            if stored.status != expected {
                return Ok(false);
            }
            *stored = intent.clone();
        }

        if let Some(tracking_id) = &intent.external_tracking_id {
            self.by_tracking_id.insert(tracking_id.clone(), intent.id);
        }
        if intent.status.is_terminal() {
            self.active.remove_if(&intent.payable(), |_, id| *id == intent.id);
        }
        Ok(true)
    }

    async fn list_pending(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentIntent>> {
        let mut pending: Vec<PaymentIntent> = self
            .intents
            .iter()
            .filter(|i| i.status == PaymentStatus::Pending && i.updated_at < updated_before)
            .map(|i| i.clone())
            .collect();
        pending.sort_by_key(|i| i.updated_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn append_event(&self, event: &CallbackEvent) -> Result<()> {
        self.events
            .entry(event.external_tracking_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn events_for(&self, external_tracking_id: &str) -> Result<Vec<CallbackEvent>> {
        Ok(self
            .events
            .get(external_tracking_id)
            .map(|events| events.clone())
            .unwrap_or_default())
    }
}
