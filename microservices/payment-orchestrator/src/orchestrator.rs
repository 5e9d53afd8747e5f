//! Payment lifecycle: charge, reconcile, poll, cancel, refund
//!
//! Network calls never run under a lock. Local mutation of an intent runs
//! under its per-intent lock and is persisted with a conditional update on
//! the status it was read with, so a late callback racing a poll applies a
//! terminal transition at most once.

use crate::error::{PaymentError, Result};
use crate::events::{LoggingEvents, PaymentEvents};
use crate::ledger_recorder::{LedgerRecord, LedgerRecorder};
use crate::locks::KeyedLocks;
use crate::metrics::PaymentMetrics;
use crate::model::{
    merchant_reference, CallbackEvent, ChargeRequest, PayableRef, PaymentHandle,
    PaymentIntent, PaymentStatus, Rail, RailStatus, ReconcileOutcome, StatusUpdate, UpdateSource,
};
use crate::rails::{mpesa, InitiateRequest, RailRegistry};
use crate::repository::PaymentStore;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Distinct references tried for one payer/entity within the same second
const MAX_REFERENCE_ATTEMPTS: u32 = 10;

#[derive(Clone)]
pub struct PaymentOrchestrator {
    rails: RailRegistry,
    store: Arc<dyn PaymentStore>,
    locks: KeyedLocks,
    events: Arc<dyn PaymentEvents>,
    recorder: Option<LedgerRecorder>,
    metrics: Arc<PaymentMetrics>,
    mirror_mobile_money: bool,
}

impl PaymentOrchestrator {
    pub fn new(rails: RailRegistry, store: Arc<dyn PaymentStore>) -> Self {
        Self {
            rails,
            store,
            locks: KeyedLocks::new(),
            events: Arc::new(LoggingEvents),
            recorder: None,
            metrics: Arc::new(PaymentMetrics::new()),
            mirror_mobile_money: false,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn PaymentEvents>) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<PaymentMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Record successful ledger payments, and mobile-money ones when `mirror_mobile_money`
    pub fn with_ledger_recorder(
        mut self,
        recorder: LedgerRecorder,
        mirror_mobile_money: bool,
    ) -> Self {
        self.recorder = Some(recorder);
        self.mirror_mobile_money = mirror_mobile_money;
        self
    }

    pub fn rails(&self) -> &RailRegistry {
        &self.rails
    }

    pub fn store(&self) -> &Arc<dyn PaymentStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<PaymentMetrics> {
        &self.metrics
    }

    /// Start collecting money for a payable.
    ///
    /// Rejected with `Conflict` before any network call when the payable already
    /// has a non-terminal intent. An initiate failure marks the intent `FAILED`
    /// and is returned as is; retrying means calling `charge` again.
    pub async fn charge(&self, request: ChargeRequest) -> Result<PaymentHandle> {
        self.metrics.charges.inc();
        let adapter = self.rails.get(request.rail)?;
        let mut initiate = InitiateRequest {
            amount: request.amount,
            currency: request.currency.clone(),
            merchant_reference: String::new(),
            description: request.description.clone(),
            payer: request.payer.clone(),
            metadata: request.metadata.clone(),
        };
        adapter.validate(&initiate)?;

        let intent = self.create_intent(&request).await?;
        initiate.merchant_reference = intent.merchant_reference.clone();

        info!(
            merchant_reference = %intent.merchant_reference,
            payable = %intent.payable(),
            rail = %intent.rail,
            amount = %intent.amount,
            currency = %intent.currency,
            "Initiating payment"
        );

        let started = Instant::now();
        let result = adapter.initiate(&initiate).await;
        self.metrics
            .initiate_latency_ms
            .record(started.elapsed().as_secs_f64() * 1000.0);

        let _guard = self.locks.lock(intent_key(intent.id)).await;
        let current = self.load(intent.id).await?;

        match result {
            Ok(initiated) => {
                let mut accepted = current.clone();
                accepted.external_tracking_id = Some(initiated.external_tracking_id.clone());
                accepted.settlement_amount = initiated.settlement_amount;

                if current.status == PaymentStatus::Submitted {
                    let pending = accepted.transitioned(PaymentStatus::Pending, None);
                    if self.store.update_intent(&pending, PaymentStatus::Submitted).await? {
                        info!(
                            merchant_reference = %pending.merchant_reference,
                            external_tracking_id = %initiated.external_tracking_id,
                            "Payment pending"
                        );
                        return Ok(PaymentHandle {
                            intent_id: pending.id,
                            merchant_reference: pending.merchant_reference,
                            external_tracking_id: initiated.external_tracking_id,
                            rail: pending.rail,
                            status: pending.status,
                            next_action: initiated.next_action,
                        });
                    }
                }

                // Cancelled locally while the rail call was in flight. Keep the
                // tracking id so later notifications are audited against it.
                let latest = self.load(intent.id).await?;
                let mut late = latest.clone();
                late.external_tracking_id = Some(initiated.external_tracking_id.clone());
                late.settlement_amount = initiated.settlement_amount;
                late.updated_at = Utc::now();
                self.store.update_intent(&late, latest.status).await?;
                warn!(
                    merchant_reference = %late.merchant_reference,
                    external_tracking_id = %initiated.external_tracking_id,
                    status = %latest.status,
                    "Rail accepted a payment that was cancelled locally"
                );
                Err(PaymentError::Cancelled(late.merchant_reference))
            }
            Err(e) => {
                self.metrics.charge_failures.inc();
                warn!(
                    merchant_reference = %current.merchant_reference,
                    rail = %current.rail,
                    error = %e,
                    "Payment initiation failed"
                );
                if current.status == PaymentStatus::Submitted {
                    let failed = current.transitioned(PaymentStatus::Failed, Some(e.to_string()));
                    if self.store.update_intent(&failed, PaymentStatus::Submitted).await? {
                        self.events.on_terminal(&failed, PaymentStatus::Submitted).await;
                    }
                }
                Err(e)
            }
        }
    }

    /// Create the intent in `CREATED` and move it to `SUBMITTED`, under the payable lock
    async fn create_intent(&self, request: &ChargeRequest) -> Result<PaymentIntent> {
        let _guard = self.locks.lock(payable_key(request.payable)).await;

        if let Some(active) = self.store.find_active_for_payable(request.payable).await? {
            self.metrics.charge_conflicts.inc();
            info!(
                payable = %request.payable,
                merchant_reference = %active.merchant_reference,
                status = %active.status,
                "Rejected duplicate charge"
            );
            return Err(PaymentError::Conflict(format!(
                "{} already has a {} payment ({})",
                request.payable, active.status, active.merchant_reference
            )));
        }

        let reference = self.unique_reference(request).await?;
        let created = PaymentIntent::new(request, reference);
        if let Err(e) = self.store.insert_intent(&created).await {
            if matches!(e, PaymentError::Conflict(_)) {
                self.metrics.charge_conflicts.inc();
            }
            return Err(e);
        }

        let submitted = created.transitioned(PaymentStatus::Submitted, None);
        if !self.store.update_intent(&submitted, PaymentStatus::Created).await? {
            return Err(PaymentError::Conflict(format!(
                "payment {} changed during creation",
                created.merchant_reference
            )));
        }
        Ok(submitted)
    }

    async fn unique_reference(&self, request: &ChargeRequest) -> Result<String> {
        let base = merchant_reference(
            request.payable.payable_type.reference_prefix(),
            request.provider_id,
            request.payer.id,
            Utc::now().timestamp(),
        );
        for attempt in 1..=MAX_REFERENCE_ATTEMPTS {
            let candidate = if attempt == 1 {
                base.clone()
            } else {
                format!("{base}-{attempt}")
            };
            if self.store.find_by_reference(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(PaymentError::Conflict(format!(
            "could not allocate a merchant reference from {base}"
        )))
    }

    /// Look an intent up by merchant reference, rail tracking id, or intent id
    pub async fn get_status(&self, key: &str) -> Result<PaymentIntent> {
        if let Some(intent) = self.store.find_by_reference(key).await? {
            return Ok(intent);
        }
        if let Some(intent) = self.store.find_by_tracking_id(key).await? {
            return Ok(intent);
        }
        if let Ok(id) = Uuid::parse_str(key) {
            if let Some(intent) = self.store.get(id).await? {
                return Ok(intent);
            }
        }
        Err(PaymentError::NotFound(key.to_string()))
    }

    /// Query the rail directly and apply the result through `reconcile`
    pub async fn poll_status(&self, key: &str) -> Result<(PaymentIntent, ReconcileOutcome)> {
        let intent = self.get_status(key).await?;
        if intent.status.is_terminal() {
            return Ok((intent.clone(), ReconcileOutcome::AlreadyTerminal(intent.status)));
        }
        let Some(tracking_id) = intent.external_tracking_id.clone() else {
            return Ok((intent, ReconcileOutcome::Unresolved));
        };

        let adapter = self.rails.get(intent.rail)?;
        let report = adapter.query_status(&tracking_id).await?;
        let outcome = self
            .reconcile(StatusUpdate {
                rail: intent.rail,
                external_tracking_id: tracking_id,
                status: report.status,
                raw: report.raw,
                source: UpdateSource::Poll,
            })
            .await?;

        Ok((self.load(intent.id).await?, outcome))
    }

    /// Apply a rail status observation to the intent carrying its tracking id.
    ///
    /// Idempotent: an update against a terminal intent is recorded as a no-op.
    /// Statuses that do not classify as terminal leave the intent `PENDING`.
    pub async fn reconcile(&self, update: StatusUpdate) -> Result<ReconcileOutcome> {
        let found = match self.store.find_by_tracking_id(&update.external_tracking_id).await? {
            Some(found) if found.rail == update.rail => found,
            Some(found) => {
                let note = format!("tracking id belongs to a {} payment", found.rail);
                return self.orphan(&update, note).await;
            }
            None => return self.orphan(&update, "orphan".to_string()).await,
        };

        let _guard = self.locks.lock(intent_key(found.id)).await;
        let intent = self.load(found.id).await?;

        if intent.status.is_terminal() {
            self.metrics.noop_updates.inc();
            warn!(
                merchant_reference = %intent.merchant_reference,
                external_tracking_id = %update.external_tracking_id,
                status = %intent.status,
                source = update.source.as_str(),
                "Status update for settled payment ignored"
            );
            self.store
                .append_event(&CallbackEvent::record(
                    &update,
                    false,
                    Some(format!("already {}", intent.status)),
                ))
                .await?;
            return Ok(ReconcileOutcome::AlreadyTerminal(intent.status));
        }

        let adapter = match self.rails.get(intent.rail) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(
                    merchant_reference = %intent.merchant_reference,
                    external_tracking_id = %update.external_tracking_id,
                    error = %e,
                    "Status update for a rail that is no longer configured; left pending"
                );
                self.metrics.unresolved_statuses.inc();
                self.store
                    .append_event(&CallbackEvent::record(
                        &update,
                        false,
                        Some(format!("rail {} not configured", intent.rail)),
                    ))
                    .await?;
                return Ok(ReconcileOutcome::Unresolved);
            }
        };
        let outcome = adapter.classify(&update.status);
        let Some(target) = outcome.target_status() else {
            return self.leave_pending(&intent, &update).await;
        };

        if !intent.status.can_transition_to(target) {
            self.store
                .append_event(&CallbackEvent::record(
                    &update,
                    false,
                    Some(format!("{} -> {} not allowed", intent.status, target)),
                ))
                .await?;
            return Err(PaymentError::InvalidTransition {
                from: intent.status,
                to: target,
            });
        }

        let updated = intent.transitioned(target, describe(&update.status));
        if !self.store.update_intent(&updated, intent.status).await? {
            let latest = self.load(intent.id).await?;
            self.metrics.noop_updates.inc();
            self.store
                .append_event(&CallbackEvent::record(
                    &update,
                    false,
                    Some(format!("lost race, now {}", latest.status)),
                ))
                .await?;
            return Ok(ReconcileOutcome::AlreadyTerminal(latest.status));
        }

        self.store
            .append_event(&CallbackEvent::record(&update, true, None))
            .await?;
        self.metrics.transitions.inc();
        info!(
            merchant_reference = %updated.merchant_reference,
            external_tracking_id = %update.external_tracking_id,
            from = %intent.status,
            to = %updated.status,
            source = update.source.as_str(),
            "Payment status applied"
        );

        self.events.on_terminal(&updated, intent.status).await;
        if updated.status == PaymentStatus::Succeeded {
            self.record_on_ledger(&updated, &update);
        }

        Ok(ReconcileOutcome::Applied {
            from: intent.status,
            to: updated.status,
        })
    }

    async fn orphan(&self, update: &StatusUpdate, note: String) -> Result<ReconcileOutcome> {
        self.metrics.orphan_callbacks.inc();
        warn!(
            rail = %update.rail,
            external_tracking_id = %update.external_tracking_id,
            source = update.source.as_str(),
            note = %note,
            "Status update for unknown payment"
        );
        self.store
            .append_event(&CallbackEvent::record(update, false, Some(note)))
            .await?;
        Ok(ReconcileOutcome::Orphan)
    }

    async fn leave_pending(
        &self,
        intent: &PaymentIntent,
        update: &StatusUpdate,
    ) -> Result<ReconcileOutcome> {
        self.metrics.unresolved_statuses.inc();
        if update.status == RailStatus::Processing {
            debug!(
                merchant_reference = %intent.merchant_reference,
                "Rail still processing"
            );
        } else {
            let ambiguous = PaymentError::AmbiguousStatus {
                rail: update.rail,
                status: describe(&update.status).unwrap_or_default(),
            };
            warn!(
                merchant_reference = %intent.merchant_reference,
                external_tracking_id = %update.external_tracking_id,
                "{ambiguous}; left pending for follow-up"
            );
        }

        // Touch the intent so the poller waits a full window before asking again
        if intent.status == PaymentStatus::Pending {
            let touched = intent.transitioned(PaymentStatus::Pending, None);
            self.store.update_intent(&touched, PaymentStatus::Pending).await?;
        }
        self.store
            .append_event(&CallbackEvent::record(update, false, Some("unresolved".to_string())))
            .await?;
        Ok(ReconcileOutcome::Unresolved)
    }

    /// Cancel a payment.
    ///
    /// Before `PENDING` this is local. Once pending, the rail is asked and the
    /// cancellation only happens if the rail itself reports it cancelled.
    pub async fn cancel(&self, key: &str) -> Result<PaymentIntent> {
        let found = self.get_status(key).await?;
        {
            let _guard = self.locks.lock(intent_key(found.id)).await;
            let intent = self.load(found.id).await?;
            match intent.status {
                PaymentStatus::Created | PaymentStatus::Submitted => {
                    let cancelled = intent.transitioned(
                        PaymentStatus::Cancelled,
                        Some("cancelled before rail acceptance".to_string()),
                    );
                    if !self.store.update_intent(&cancelled, intent.status).await? {
                        return Err(PaymentError::Conflict(format!(
                            "payment {} changed during cancellation",
                            intent.merchant_reference
                        )));
                    }
                    self.audit_operator(&cancelled, "cancelled locally").await?;
                    info!(
                        merchant_reference = %cancelled.merchant_reference,
                        "Payment cancelled locally"
                    );
                    self.events.on_terminal(&cancelled, intent.status).await;
                    return Ok(cancelled);
                }
                PaymentStatus::Cancelled => return Ok(intent),
                PaymentStatus::Pending => {}
                _ => return Err(PaymentError::NotCancellable(intent.merchant_reference)),
            }
        }

        let (intent, _) = self.poll_status(&found.merchant_reference).await?;
        match intent.status {
            PaymentStatus::Cancelled => Ok(intent),
            _ => Err(PaymentError::NotCancellable(intent.merchant_reference)),
        }
    }

    /// Reverse a successful payment. Only `SUCCEEDED -> REFUNDED` is allowed.
    pub async fn refund(&self, key: &str, authorized_by: &str) -> Result<PaymentIntent> {
        let authorized_by = authorized_by.trim();
        if authorized_by.is_empty() {
            return Err(PaymentError::Validation("refund requires authorized_by".into()));
        }

        let found = self.get_status(key).await?;
        let _guard = self.locks.lock(intent_key(found.id)).await;
        let intent = self.load(found.id).await?;

        if !intent.status.can_transition_to(PaymentStatus::Refunded) {
            return Err(PaymentError::InvalidTransition {
                from: intent.status,
                to: PaymentStatus::Refunded,
            });
        }

        let refunded = intent.transitioned(
            PaymentStatus::Refunded,
            Some(format!("refund authorized by {authorized_by}")),
        );
        if !self.store.update_intent(&refunded, PaymentStatus::Succeeded).await? {
            return Err(PaymentError::Conflict(format!(
                "payment {} changed during refund",
                intent.merchant_reference
            )));
        }
        self.audit_operator(&refunded, &format!("refunded by {authorized_by}"))
            .await?;
        info!(
            merchant_reference = %refunded.merchant_reference,
            authorized_by,
            "Payment refunded"
        );
        self.events.on_terminal(&refunded, PaymentStatus::Succeeded).await;
        Ok(refunded)
    }

    /// Audit trail for the intent behind `key`
    pub async fn events(&self, key: &str) -> Result<Vec<CallbackEvent>> {
        let intent = self.get_status(key).await?;
        match &intent.external_tracking_id {
            Some(tracking_id) => self.store.events_for(tracking_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Pending intents with no update since `updated_before`
    pub async fn stale_pending(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentIntent>> {
        self.store.list_pending(updated_before, limit).await
    }

    async fn load(&self, id: Uuid) -> Result<PaymentIntent> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(id.to_string()))
    }

    async fn audit_operator(&self, intent: &PaymentIntent, note: &str) -> Result<()> {
        let Some(tracking_id) = &intent.external_tracking_id else {
            return Ok(());
        };
        let update = StatusUpdate {
            rail: intent.rail,
            external_tracking_id: tracking_id.clone(),
            status: RailStatus::Processing,
            raw: json!({ "status": intent.status, "reason": intent.status_reason }),
            source: UpdateSource::Operator,
        };
        self.store
            .append_event(&CallbackEvent::record(&update, true, Some(note.to_string())))
            .await
    }

    fn record_on_ledger(&self, intent: &PaymentIntent, update: &StatusUpdate) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        let record = match intent.rail {
            Rail::Ledger => LedgerRecord {
                receipt: update.external_tracking_id.clone(),
                merchant_reference: intent.merchant_reference.clone(),
                amount_local: intent.amount,
                amount_settlement: intent.settlement_amount,
                phone: None,
                timestamp: Utc::now(),
                checkout_request_id: update.external_tracking_id.clone(),
                source_rail: Rail::Ledger,
            },
            Rail::MobileMoney if self.mirror_mobile_money => {
                let callback = mpesa::parse_callback(&update.raw).ok();
                LedgerRecord {
                    receipt: callback
                        .as_ref()
                        .and_then(|c| c.receipt_number.clone())
                        .unwrap_or_else(|| update.external_tracking_id.clone()),
                    merchant_reference: intent.merchant_reference.clone(),
                    amount_local: callback
                        .as_ref()
                        .and_then(|c| c.amount)
                        .unwrap_or(intent.amount),
                    amount_settlement: None,
                    phone: callback.and_then(|c| c.phone_number),
                    timestamp: Utc::now(),
                    checkout_request_id: update.external_tracking_id.clone(),
                    source_rail: Rail::MobileMoney,
                }
            }
            _ => return,
        };
        recorder.enqueue(record);
    }
}

/// Human-readable form of a rail status, kept as the intent's status reason
fn describe(status: &RailStatus) -> Option<String> {
    match status {
        RailStatus::ResultCode { code, description } => Some(match description {
            Some(d) => format!("{code}: {d}"),
            None => code.to_string(),
        }),
        RailStatus::Description { value } => Some(value.clone()),
        RailStatus::Ledger { verified, successful } => {
            Some(format!("verified={verified} successful={successful}"))
        }
        RailStatus::Processing => None,
    }
}

fn payable_key(payable: PayableRef) -> String {
    format!("payable:{}:{}", payable.payable_type, payable.payable_id)
}

fn intent_key(id: Uuid) -> String {
    format!("intent:{id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NextAction, Outcome, PayableType, Payer};
    use crate::rails::{ConnectionCheck, Initiated, RailAdapter, StatusReport};
    use crate::repository::MemoryPaymentStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tiba_core::PhoneNumber;

    /// Scripted mobile-money rail that counts calls
    struct FakeRail {
        initiate_calls: AtomicUsize,
        query_calls: AtomicUsize,
        initiate_result: Mutex<Option<Result<Initiated>>>,
        statuses: Mutex<VecDeque<RailStatus>>,
        gate: Option<Arc<tokio::sync::Notify>>,
    }

    impl FakeRail {
        fn accepting(tracking_id: &str) -> Arc<Self> {
            Arc::new(Self::with_result(Ok(Initiated {
                external_tracking_id: tracking_id.into(),
                next_action: NextAction::Prompt { message: "Enter PIN".into() },
                settlement_amount: None,
                raw: json!({"CheckoutRequestID": tracking_id}),
            })))
        }

        fn with_result(result: Result<Initiated>) -> Self {
            Self {
                initiate_calls: AtomicUsize::new(0),
                query_calls: AtomicUsize::new(0),
                initiate_result: Mutex::new(Some(result)),
                statuses: Mutex::new(VecDeque::new()),
                gate: None,
            }
        }

        fn push_status(&self, status: RailStatus) {
            self.statuses.lock().push_back(status);
        }
    }

    #[async_trait]
    impl RailAdapter for FakeRail {
        fn rail(&self) -> Rail {
            Rail::MobileMoney
        }

        async fn initiate(&self, _request: &InitiateRequest) -> Result<Initiated> {
            self.initiate_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.initiate_result.lock().take().unwrap_or_else(|| {
                Err(PaymentError::gateway(Rail::MobileMoney, Some(500), "no script"))
            })
        }

        async fn query_status(&self, _id: &str) -> Result<StatusReport> {
            self.query_calls.fetch_add(1, Ordering::SeqCst);
            let status = self.statuses.lock().pop_front().unwrap_or(RailStatus::Processing);
            Ok(StatusReport {
                status,
                raw: json!({}),
            })
        }

        fn classify(&self, status: &RailStatus) -> Outcome {
            mpesa::classify(status)
        }

        async fn check_connection(&self) -> Result<ConnectionCheck> {
            Ok(ConnectionCheck {
                rail: Rail::MobileMoney,
                reachable: true,
                token_preview: None,
                detail: None,
            })
        }
    }

    fn lab_charge(payable_id: i64) -> ChargeRequest {
        ChargeRequest {
            payable: PayableRef::new(PayableType::LabAppointment, payable_id),
            provider_id: 7,
            payer: Payer {
                id: 42,
                phone: Some(PhoneNumber::new("0708374149")),
                email: None,
                first_name: Some("Amina".into()),
                last_name: None,
                ledger_address: None,
            },
            amount: dec!(1500),
            currency: "KES".into(),
            rail: Rail::MobileMoney,
            description: "Full blood count".into(),
            metadata: json!({}),
        }
    }

    fn orchestrator(rail: Arc<FakeRail>) -> (PaymentOrchestrator, Arc<MemoryPaymentStore>) {
        let store = Arc::new(MemoryPaymentStore::new());
        let orchestrator = PaymentOrchestrator::new(RailRegistry::new().with(rail), store.clone());
        (orchestrator, store)
    }

    fn callback(tracking_id: &str, code: i64) -> StatusUpdate {
        StatusUpdate {
            rail: Rail::MobileMoney,
            external_tracking_id: tracking_id.into(),
            status: RailStatus::ResultCode { code, description: None },
            raw: json!({"ResultCode": code}),
            source: UpdateSource::Callback,
        }
    }

    #[tokio::test]
    async fn test_charge_creates_pending_intent() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, _) = orchestrator(rail.clone());

        let handle = orchestrator.charge(lab_charge(42)).await.unwrap();

        assert_eq!(handle.status, PaymentStatus::Pending);
        assert_eq!(handle.external_tracking_id, "ws_CO_1");
        assert!(handle.merchant_reference.starts_with("LAB-7-42-"));
        assert_eq!(rail.initiate_calls.load(Ordering::SeqCst), 1);

        let intent = orchestrator.get_status("ws_CO_1").await.unwrap();
        assert_eq!(intent.status, PaymentStatus::Pending);
        assert_eq!(intent.merchant_reference, handle.merchant_reference);
    }

    #[tokio::test]
    async fn test_second_charge_conflicts_without_rail_call() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, _) = orchestrator(rail.clone());
        orchestrator.charge(lab_charge(42)).await.unwrap();

        let second = orchestrator.charge(lab_charge(42)).await;

        assert!(matches!(second, Err(PaymentError::Conflict(_))));
        assert_eq!(rail.initiate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.metrics().charge_conflicts.get(), 1);
    }

    #[tokio::test]
    async fn test_initiate_failure_marks_failed_and_frees_payable() {
        let rail = Arc::new(FakeRail::with_result(Err(PaymentError::gateway(
            Rail::MobileMoney,
            Some(400),
            "Invalid PhoneNumber",
        ))));
        let (orchestrator, store) = orchestrator(rail.clone());

        let result = orchestrator.charge(lab_charge(42)).await;
        assert!(matches!(result, Err(PaymentError::Gateway { http_status: Some(400), .. })));
        assert_eq!(rail.initiate_calls.load(Ordering::SeqCst), 1);

        let payable = PayableRef::new(PayableType::LabAppointment, 42);
        assert!(store.find_active_for_payable(payable).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_validation_happens_before_any_state() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, store) = orchestrator(rail.clone());
        let mut request = lab_charge(42);
        request.amount = dec!(0);

        assert!(matches!(
            orchestrator.charge(request).await,
            Err(PaymentError::Validation(_))
        ));
        assert_eq!(rail.initiate_calls.load(Ordering::SeqCst), 0);
        let payable = PayableRef::new(PayableType::LabAppointment, 42);
        assert!(store.find_active_for_payable(payable).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_rail_is_config_error() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, _) = orchestrator(rail);
        let mut request = lab_charge(42);
        request.rail = Rail::Ledger;
        assert!(matches!(
            orchestrator.charge(request).await,
            Err(PaymentError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, store) = orchestrator(rail);
        orchestrator.charge(lab_charge(42)).await.unwrap();

        let first = orchestrator.reconcile(callback("ws_CO_1", 0)).await.unwrap();
        let second = orchestrator.reconcile(callback("ws_CO_1", 0)).await.unwrap();

        assert_eq!(
            first,
            ReconcileOutcome::Applied {
                from: PaymentStatus::Pending,
                to: PaymentStatus::Succeeded
            }
        );
        assert_eq!(second, ReconcileOutcome::AlreadyTerminal(PaymentStatus::Succeeded));

        let events = store.events_for("ws_CO_1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].applied);
        assert!(!events[1].applied);
    }

    #[tokio::test]
    async fn test_conflicting_late_callback_does_not_flip_terminal() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, _) = orchestrator(rail);
        orchestrator.charge(lab_charge(42)).await.unwrap();

        orchestrator.reconcile(callback("ws_CO_1", 1032)).await.unwrap();
        let late = orchestrator.reconcile(callback("ws_CO_1", 0)).await.unwrap();

        assert_eq!(late, ReconcileOutcome::AlreadyTerminal(PaymentStatus::Cancelled));
        let intent = orchestrator.get_status("ws_CO_1").await.unwrap();
        assert_eq!(intent.status, PaymentStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_poll_and_callback_agree() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (polled, _) = orchestrator(rail.clone());
        polled.charge(lab_charge(42)).await.unwrap();
        rail.push_status(RailStatus::ResultCode { code: 1032, description: None });
        let (via_poll, _) = polled.poll_status("ws_CO_1").await.unwrap();

        let rail = FakeRail::accepting("ws_CO_2");
        let (called_back, _) = orchestrator(rail);
        called_back.charge(lab_charge(42)).await.unwrap();
        called_back.reconcile(callback("ws_CO_2", 1032)).await.unwrap();
        let via_callback = called_back.get_status("ws_CO_2").await.unwrap();

        assert_eq!(via_poll.status, PaymentStatus::Cancelled);
        assert_eq!(via_callback.status, via_poll.status);
    }

    #[tokio::test]
    async fn test_unresolved_status_stays_pending() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, _) = orchestrator(rail.clone());
        orchestrator.charge(lab_charge(42)).await.unwrap();

        rail.push_status(RailStatus::Processing);
        let (intent, outcome) = orchestrator.poll_status("ws_CO_1").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unresolved);
        assert_eq!(intent.status, PaymentStatus::Pending);

        let odd = StatusUpdate {
            status: RailStatus::Description { value: "REVERSED".into() },
            ..callback("ws_CO_1", 0)
        };
        assert_eq!(orchestrator.reconcile(odd).await.unwrap(), ReconcileOutcome::Unresolved);
        assert_eq!(
            orchestrator.get_status("ws_CO_1").await.unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_polled_timeout_stays_pending_until_success() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, _) = orchestrator(rail.clone());
        orchestrator.charge(lab_charge(42)).await.unwrap();

        rail.push_status(RailStatus::ResultCode {
            code: mpesa::RESULT_TIMEOUT,
            description: Some("DS timeout user cannot be reached".into()),
        });
        let (intent, outcome) = orchestrator.poll_status("ws_CO_1").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unresolved);
        assert_eq!(intent.status, PaymentStatus::Pending);

        rail.push_status(RailStatus::ResultCode { code: 0, description: None });
        let (intent, outcome) = orchestrator.poll_status("ws_CO_1").await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                from: PaymentStatus::Pending,
                to: PaymentStatus::Succeeded,
            }
        );
        assert_eq!(intent.status, PaymentStatus::Succeeded);
        assert_eq!(rail.query_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_update_from_another_rail_is_an_orphan() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, _) = orchestrator(rail);
        orchestrator.charge(lab_charge(42)).await.unwrap();

        let misrouted = StatusUpdate {
            rail: Rail::CardRedirect,
            status: RailStatus::Description { value: "COMPLETED".into() },
            ..callback("ws_CO_1", 0)
        };
        assert_eq!(orchestrator.reconcile(misrouted).await.unwrap(), ReconcileOutcome::Orphan);
        assert_eq!(
            orchestrator.get_status("ws_CO_1").await.unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_orphan_update_is_recorded_without_mutation() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, store) = orchestrator(rail);

        let outcome = orchestrator.reconcile(callback("ws_CO_unknown", 0)).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Orphan);
        let events = store.events_for("ws_CO_unknown").await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].applied);
        assert_eq!(orchestrator.metrics().orphan_callbacks.get(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_terminal_updates_apply_once() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, store) = orchestrator(rail);
        orchestrator.charge(lab_charge(42)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let orchestrator = orchestrator.clone();
            handles.push(tokio::spawn(async move {
                orchestrator.reconcile(callback("ws_CO_1", 0)).await.unwrap()
            }));
        }
        let mut applied = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ReconcileOutcome::Applied { .. }) {
                applied += 1;
            }
        }

        assert_eq!(applied, 1);
        let events = store.events_for("ws_CO_1").await.unwrap();
        assert_eq!(events.iter().filter(|e| e.applied).count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_initiate_in_flight() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let mut rail = FakeRail::with_result(Ok(Initiated {
            external_tracking_id: "ws_CO_late".into(),
            next_action: NextAction::Prompt { message: "Enter PIN".into() },
            settlement_amount: None,
            raw: json!({}),
        }));
        rail.gate = Some(gate.clone());
        let rail = Arc::new(rail);
        let (orchestrator, store) = orchestrator(rail.clone());

        let charging = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.charge(lab_charge(42)).await })
        };
        while rail.initiate_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let payable = PayableRef::new(PayableType::LabAppointment, 42);
        let submitted = store.find_active_for_payable(payable).await.unwrap().unwrap();
        let cancelled = orchestrator.cancel(&submitted.merchant_reference).await.unwrap();
        assert_eq!(cancelled.status, PaymentStatus::Cancelled);

        gate.notify_one();
        let result = charging.await.unwrap();
        assert!(matches!(result, Err(PaymentError::Cancelled(_))));

        let intent = orchestrator.get_status("ws_CO_late").await.unwrap();
        assert_eq!(intent.status, PaymentStatus::Cancelled);
        let late = orchestrator.reconcile(callback("ws_CO_late", 0)).await.unwrap();
        assert_eq!(late, ReconcileOutcome::AlreadyTerminal(PaymentStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_pending_requires_rail_confirmation() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, _) = orchestrator(rail.clone());
        orchestrator.charge(lab_charge(42)).await.unwrap();

        rail.push_status(RailStatus::Processing);
        assert!(matches!(
            orchestrator.cancel("ws_CO_1").await,
            Err(PaymentError::NotCancellable(_))
        ));

        rail.push_status(RailStatus::ResultCode { code: 1032, description: None });
        let cancelled = orchestrator.cancel("ws_CO_1").await.unwrap();
        assert_eq!(cancelled.status, PaymentStatus::Cancelled);
        assert_eq!(rail.query_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_refund_only_from_succeeded() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, _) = orchestrator(rail);
        orchestrator.charge(lab_charge(42)).await.unwrap();

        assert!(matches!(
            orchestrator.refund("ws_CO_1", "finance@tiba").await,
            Err(PaymentError::InvalidTransition { .. })
        ));

        orchestrator.reconcile(callback("ws_CO_1", 0)).await.unwrap();
        assert!(matches!(
            orchestrator.refund("ws_CO_1", "  ").await,
            Err(PaymentError::Validation(_))
        ));
        let refunded = orchestrator.refund("ws_CO_1", "finance@tiba").await.unwrap();
        assert_eq!(refunded.status, PaymentStatus::Refunded);
        assert!(refunded.status_reason.unwrap().contains("finance@tiba"));

        assert!(matches!(
            orchestrator.refund("ws_CO_1", "finance@tiba").await,
            Err(PaymentError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_new_attempt_after_failure_gets_new_reference() {
        let rail = FakeRail::accepting("ws_CO_1");
        let (orchestrator, _) = orchestrator(rail);
        let first = orchestrator.charge(lab_charge(42)).await.unwrap();
        orchestrator.reconcile(callback("ws_CO_1", 2001)).await.unwrap();

        let rail = FakeRail::accepting("ws_CO_2");
        let retry = PaymentOrchestrator::new(
            RailRegistry::new().with(rail),
            orchestrator.store().clone(),
        );
        let second = retry.charge(lab_charge(42)).await.unwrap();

        assert_ne!(first.merchant_reference, second.merchant_reference);
        assert_eq!(second.status, PaymentStatus::Pending);
    }
}
