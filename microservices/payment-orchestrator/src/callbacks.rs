//! Inbound rail notifications
//!
//! Every well-formed notification is acknowledged, including ones that match
//! no local intent; those are audited as orphans. Only a payload missing its
//! correlation fields is rejected.

use crate::error::{PaymentError, Result};
use crate::model::{CallbackEvent, Rail, RailStatus, ReconcileOutcome, StatusUpdate, UpdateSource};
use crate::orchestrator::PaymentOrchestrator;
use crate::rails::{mpesa, pesapal};
use serde_json::{json, Value};
use tiba_telemetry::redact_json;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct CallbackReceiver {
    orchestrator: PaymentOrchestrator,
}

/// What the receiver did with a notification, plus the body to answer the rail with
#[derive(Debug, Clone)]
pub struct CallbackAck {
    pub outcome: ReconcileOutcome,
    pub body: Value,
}

impl CallbackReceiver {
    pub fn new(orchestrator: PaymentOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// STK push result posted by the mobile-money rail
    pub async fn handle_mpesa(&self, payload: Value) -> Result<CallbackAck> {
        self.orchestrator.metrics().callbacks.inc();
        debug!(payload = %redact_json(&payload), "Mobile money callback received");

        let callback = mpesa::parse_callback(&payload)
            .map_err(|e| self.malformed(Rail::MobileMoney, e))?;
        info!(
            external_tracking_id = %callback.checkout_request_id,
            result_code = callback.result_code,
            "Mobile money callback"
        );

        let outcome = self
            .orchestrator
            .reconcile(StatusUpdate {
                rail: Rail::MobileMoney,
                external_tracking_id: callback.checkout_request_id.clone(),
                status: callback.status(),
                raw: payload,
                source: UpdateSource::Callback,
            })
            .await?;

        Ok(CallbackAck {
            outcome,
            body: json!({ "ResultCode": 0, "ResultDesc": "Accepted" }),
        })
    }

    /// Card-redirect IPN, from a JSON body or query parameters.
    ///
    /// The notification carries no status, so the rail is asked before
    /// reconciling. A failed status query leaves the intent for the poller.
    pub async fn handle_pesapal(&self, params: Value) -> Result<CallbackAck> {
        self.orchestrator.metrics().callbacks.inc();
        debug!(payload = %redact_json(&params), "Card redirect IPN received");

        let ipn = pesapal::parse_ipn(&params).map_err(|e| self.malformed(Rail::CardRedirect, e))?;
        info!(
            external_tracking_id = %ipn.order_tracking_id,
            merchant_reference = %ipn.merchant_reference,
            notification_type = %ipn.notification_type,
            "Card redirect IPN"
        );

        let found = self
            .orchestrator
            .store()
            .find_by_tracking_id(&ipn.order_tracking_id)
            .await?;

        if let Some(intent) = &found {
            if intent.merchant_reference != ipn.merchant_reference {
                return self.reference_mismatch(&ipn, &intent.merchant_reference, params).await;
            }
        }

        let (status, raw) = if found.is_some() {
            match self.query_card_status(&ipn.order_tracking_id).await {
                Ok(report) => (report.status, json!({ "ipn": params, "status": report.raw })),
                Err(e) => {
                    warn!(
                        external_tracking_id = %ipn.order_tracking_id,
                        error = %e,
                        "Status query after IPN failed; left for polling"
                    );
                    (RailStatus::Processing, json!({ "ipn": params, "error": e.to_string() }))
                }
            }
        } else {
            (RailStatus::Processing, json!({ "ipn": params }))
        };

        let outcome = self
            .orchestrator
            .reconcile(StatusUpdate {
                rail: Rail::CardRedirect,
                external_tracking_id: ipn.order_tracking_id.clone(),
                status,
                raw,
                source: UpdateSource::Callback,
            })
            .await?;

        Ok(CallbackAck {
            outcome,
            body: ipn.ack(200),
        })
    }

    /// Acknowledged so the rail stops retrying, but never reconciled
    async fn reference_mismatch(
        &self,
        ipn: &pesapal::PesapalIpn,
        expected: &str,
        params: Value,
    ) -> Result<CallbackAck> {
        self.orchestrator.metrics().orphan_callbacks.inc();
        warn!(
            external_tracking_id = %ipn.order_tracking_id,
            merchant_reference = %ipn.merchant_reference,
            expected_reference = %expected,
            "IPN merchant reference does not match the payment; ignored"
        );
        let update = StatusUpdate {
            rail: Rail::CardRedirect,
            external_tracking_id: ipn.order_tracking_id.clone(),
            status: RailStatus::Processing,
            raw: json!({ "ipn": params }),
            source: UpdateSource::Callback,
        };
        self.orchestrator
            .store()
            .append_event(&CallbackEvent::record(
                &update,
                false,
                Some(format!("merchant reference {} does not match", ipn.merchant_reference)),
            ))
            .await?;

        Ok(CallbackAck {
            outcome: ReconcileOutcome::Orphan,
            body: ipn.ack(200),
        })
    }

    async fn query_card_status(&self, tracking_id: &str) -> Result<crate::rails::StatusReport> {
        let adapter = self.orchestrator.rails().get(Rail::CardRedirect)?;
        adapter.query_status(tracking_id).await
    }

    fn malformed(&self, rail: Rail, error: PaymentError) -> PaymentError {
        self.orchestrator.metrics().malformed_callbacks.inc();
        warn!(rail = %rail, error = %error, "Rejected malformed callback");
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ChargeRequest, NextAction, Outcome, PayableRef, PayableType, Payer, PaymentStatus,
    };
    use crate::rails::{
        ConnectionCheck, InitiateRequest, Initiated, RailAdapter, RailRegistry, StatusReport,
    };
    use crate::repository::{MemoryPaymentStore, PaymentStore};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tiba_core::PhoneNumber;

    struct StubRail {
        rail: Rail,
        tracking_id: &'static str,
        report: RailStatus,
        queries: AtomicUsize,
    }

    impl StubRail {
        fn new(rail: Rail, tracking_id: &'static str, report: RailStatus) -> Arc<Self> {
            Arc::new(Self {
                rail,
                tracking_id,
                report,
                queries: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RailAdapter for StubRail {
        fn rail(&self) -> Rail {
            self.rail
        }

        async fn initiate(&self, _request: &InitiateRequest) -> Result<Initiated> {
            Ok(Initiated {
                external_tracking_id: self.tracking_id.into(),
                next_action: NextAction::None,
                settlement_amount: None,
                raw: json!({}),
            })
        }

        async fn query_status(&self, _id: &str) -> Result<StatusReport> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Ok(StatusReport {
                status: self.report.clone(),
                raw: json!({"payment_status_description": "Completed"}),
            })
        }

        fn classify(&self, status: &RailStatus) -> Outcome {
            match self.rail {
                Rail::MobileMoney => mpesa::classify(status),
                _ => pesapal::classify(status),
            }
        }

        async fn check_connection(&self) -> Result<ConnectionCheck> {
            Ok(ConnectionCheck {
                rail: self.rail,
                reachable: true,
                token_preview: None,
                detail: None,
            })
        }
    }

    fn charge(rail: Rail) -> ChargeRequest {
        ChargeRequest {
            payable: PayableRef::new(PayableType::MedicineOrder, 9),
            provider_id: 3,
            payer: Payer {
                id: 11,
                phone: Some(PhoneNumber::new("0712345678")),
                email: Some("amina@example.com".into()),
                first_name: None,
                last_name: None,
                ledger_address: None,
            },
            amount: dec!(250),
            currency: "KES".into(),
            rail,
            description: "Prescription".into(),
            metadata: json!({}),
        }
    }

    fn stk_callback(checkout_id: &str, code: i64) -> Value {
        json!({
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": checkout_id,
                    "ResultCode": code,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            {"Name": "Amount", "Value": 250},
                            {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                            {"Name": "PhoneNumber", "Value": 254712345678u64}
                        ]
                    }
                }
            }
        })
    }

    fn receiver_with(adapter: Arc<StubRail>) -> (CallbackReceiver, PaymentOrchestrator) {
        let store: Arc<dyn PaymentStore> = Arc::new(MemoryPaymentStore::new());
        let orchestrator = PaymentOrchestrator::new(RailRegistry::new().with(adapter), store);
        (CallbackReceiver::new(orchestrator.clone()), orchestrator)
    }

    #[tokio::test]
    async fn test_mpesa_callback_settles_payment() {
        let rail = StubRail::new(Rail::MobileMoney, "ws_CO_9", RailStatus::Processing);
        let (receiver, orchestrator) = receiver_with(rail);
        orchestrator.charge(charge(Rail::MobileMoney)).await.unwrap();

        let ack = receiver.handle_mpesa(stk_callback("ws_CO_9", 0)).await.unwrap();

        assert!(matches!(ack.outcome, ReconcileOutcome::Applied { .. }));
        assert_eq!(ack.body["ResultCode"], 0);
        let intent = orchestrator.get_status("ws_CO_9").await.unwrap();
        assert_eq!(intent.status, PaymentStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_mpesa_orphan_is_acknowledged() {
        let rail = StubRail::new(Rail::MobileMoney, "ws_CO_9", RailStatus::Processing);
        let (receiver, orchestrator) = receiver_with(rail);

        let ack = receiver.handle_mpesa(stk_callback("ws_CO_nobody", 0)).await.unwrap();

        assert_eq!(ack.outcome, ReconcileOutcome::Orphan);
        assert_eq!(ack.body["ResultDesc"], "Accepted");
        assert_eq!(orchestrator.metrics().orphan_callbacks.get(), 1);
    }

    #[tokio::test]
    async fn test_mpesa_malformed_is_rejected() {
        let rail = StubRail::new(Rail::MobileMoney, "ws_CO_9", RailStatus::Processing);
        let (receiver, orchestrator) = receiver_with(rail);
        orchestrator.charge(charge(Rail::MobileMoney)).await.unwrap();

        let result = receiver
            .handle_mpesa(json!({"Body": {"stkCallback": {"ResultCode": 0}}}))
            .await;

        assert!(matches!(result, Err(PaymentError::MalformedCallback(_))));
        assert_eq!(orchestrator.metrics().malformed_callbacks.get(), 1);
        let intent = orchestrator.get_status("ws_CO_9").await.unwrap();
        assert_eq!(intent.status, PaymentStatus::Pending);
        assert!(orchestrator.events("ws_CO_9").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pesapal_ipn_queries_rail_then_reconciles() {
        let rail = StubRail::new(
            Rail::CardRedirect,
            "b945e4af-80a5-4ec1-8706-e03f8332fb04",
            RailStatus::Description { value: "COMPLETED".into() },
        );
        let (receiver, orchestrator) = receiver_with(rail.clone());
        let handle = orchestrator.charge(charge(Rail::CardRedirect)).await.unwrap();

        let ack = receiver
            .handle_pesapal(json!({
                "OrderTrackingId": "b945e4af-80a5-4ec1-8706-e03f8332fb04",
                "OrderMerchantReference": handle.merchant_reference,
                "OrderNotificationType": "IPNCHANGE"
            }))
            .await
            .unwrap();

        assert_eq!(rail.queries.load(Ordering::SeqCst), 1);
        assert_eq!(ack.body["status"], 200);
        assert_eq!(ack.body["orderTrackingId"], "b945e4af-80a5-4ec1-8706-e03f8332fb04");
        let intent = orchestrator.get_status(&handle.merchant_reference).await.unwrap();
        assert_eq!(intent.status, PaymentStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_pesapal_orphan_skips_status_query() {
        let rail = StubRail::new(
            Rail::CardRedirect,
            "known",
            RailStatus::Description { value: "COMPLETED".into() },
        );
        let (receiver, _) = receiver_with(rail.clone());

        let ack = receiver
            .handle_pesapal(json!({
                "OrderTrackingId": "unknown",
                "OrderMerchantReference": "MED-3-11-1",
                "OrderNotificationType": "IPNCHANGE"
            }))
            .await
            .unwrap();

        assert_eq!(ack.outcome, ReconcileOutcome::Orphan);
        assert_eq!(rail.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mpesa_timeout_stays_pending_until_success() {
        let rail = StubRail::new(Rail::MobileMoney, "ws_CO_9", RailStatus::Processing);
        let (receiver, orchestrator) = receiver_with(rail);
        orchestrator.charge(charge(Rail::MobileMoney)).await.unwrap();

        let ack = receiver.handle_mpesa(stk_callback("ws_CO_9", 1037)).await.unwrap();
        assert_eq!(ack.outcome, ReconcileOutcome::Unresolved);
        assert_eq!(ack.body["ResultCode"], 0);
        let intent = orchestrator.get_status("ws_CO_9").await.unwrap();
        assert_eq!(intent.status, PaymentStatus::Pending);

        let ack = receiver.handle_mpesa(stk_callback("ws_CO_9", 0)).await.unwrap();
        assert_eq!(
            ack.outcome,
            ReconcileOutcome::Applied {
                from: PaymentStatus::Pending,
                to: PaymentStatus::Succeeded,
            }
        );
    }

    #[tokio::test]
    async fn test_callback_for_unconfigured_rail_is_acknowledged() {
        let rail = StubRail::new(Rail::CardRedirect, "known", RailStatus::Processing);
        let (receiver, orchestrator) = receiver_with(rail);

        let ack = receiver.handle_mpesa(stk_callback("ws_CO_9", 0)).await.unwrap();

        assert_eq!(ack.outcome, ReconcileOutcome::Orphan);
        assert_eq!(ack.body["ResultDesc"], "Accepted");
        assert_eq!(orchestrator.metrics().orphan_callbacks.get(), 1);
    }

    #[tokio::test]
    async fn test_callback_after_rail_removed_leaves_intent_pending() {
        let store: Arc<dyn PaymentStore> = Arc::new(MemoryPaymentStore::new());
        let rail = StubRail::new(Rail::MobileMoney, "ws_CO_9", RailStatus::Processing);
        let charging = PaymentOrchestrator::new(RailRegistry::new().with(rail), store.clone());
        charging.charge(charge(Rail::MobileMoney)).await.unwrap();

        let restarted = PaymentOrchestrator::new(RailRegistry::new(), store.clone());
        let receiver = CallbackReceiver::new(restarted.clone());

        let ack = receiver.handle_mpesa(stk_callback("ws_CO_9", 0)).await.unwrap();

        assert_eq!(ack.outcome, ReconcileOutcome::Unresolved);
        assert_eq!(ack.body["ResultCode"], 0);
        let intent = restarted.get_status("ws_CO_9").await.unwrap();
        assert_eq!(intent.status, PaymentStatus::Pending);
        let events = store.events_for("ws_CO_9").await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].applied);
    }

    #[tokio::test]
    async fn test_pesapal_ipn_with_wrong_reference_is_ignored() {
        let rail = StubRail::new(
            Rail::CardRedirect,
            "b945e4af-80a5-4ec1-8706-e03f8332fb04",
            RailStatus::Description { value: "COMPLETED".into() },
        );
        let (receiver, orchestrator) = receiver_with(rail.clone());
        let handle = orchestrator.charge(charge(Rail::CardRedirect)).await.unwrap();

        let ack = receiver
            .handle_pesapal(json!({
                "OrderTrackingId": "b945e4af-80a5-4ec1-8706-e03f8332fb04",
                "OrderMerchantReference": "MED-99-99-1",
                "OrderNotificationType": "IPNCHANGE"
            }))
            .await
            .unwrap();

        assert_eq!(ack.outcome, ReconcileOutcome::Orphan);
        assert_eq!(ack.body["status"], 200);
        assert_eq!(rail.queries.load(Ordering::SeqCst), 0);
        let intent = orchestrator.get_status(&handle.merchant_reference).await.unwrap();
        assert_eq!(intent.status, PaymentStatus::Pending);
        let events = orchestrator.events(&handle.merchant_reference).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].applied);
    }
}
