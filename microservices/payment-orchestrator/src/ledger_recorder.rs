//! Secondary on-chain bookkeeping of settled payments
//!
//! Records are queued and delivered by a background worker with bounded
//! exponential backoff. A recording that never lands is logged and dropped;
//! it has no effect on the payment it describes.

use crate::config::StellarConfig;
use crate::error::{PaymentError, Result};
use crate::fx::CurrencyNormalizer;
use crate::metrics::PaymentMetrics;
use crate::model::Rail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerRecord {
    /// Rail receipt: M-Pesa receipt number or ledger transaction hash
    pub receipt: String,
    pub merchant_reference: String,
    pub amount_local: Decimal,
    /// Converted by the worker when absent
    pub amount_settlement: Option<Decimal>,
    pub phone: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub checkout_request_id: String,
    pub source_rail: Rail,
}

#[async_trait]
pub trait LedgerSink: Send + Sync {
    async fn record_payment(&self, record: &LedgerRecord) -> Result<Value>;
}

/// Invokes the payment-recording contract over Soroban JSON-RPC
pub struct SorobanSink {
    rpc_url: String,
    contract_address: String,
    source_account: String,
    http_client: reqwest::Client,
}

impl SorobanSink {
    /// `None` when no contract is configured
    pub fn from_config(config: &StellarConfig, timeout: Duration) -> Result<Option<Self>> {
        let Some(contract_address) = config.contract_address.clone() else {
            return Ok(None);
        };
        Ok(Some(Self {
            rpc_url: config.soroban_url.clone(),
            contract_address,
            source_account: config.public_key.clone(),
            http_client: crate::rails::http_client(timeout)?,
        }))
    }

    fn invocation(&self, record: &LedgerRecord) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": "simulateTransaction",
            "params": {
                "contract_address": self.contract_address,
                "function": "record_payment",
                "source": self.source_account,
                "args": {
                    "receipt": record.receipt,
                    "amount_kes": record.amount_local.to_string(),
                    "amount_usdc": record.amount_settlement.map(|a| a.to_string()),
                    "phone": record.phone,
                    "timestamp": record.timestamp.timestamp(),
                    "checkout_request_id": record.checkout_request_id,
                },
            },
        })
    }
}

#[async_trait]
impl LedgerSink for SorobanSink {
    async fn record_payment(&self, record: &LedgerRecord) -> Result<Value> {
        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&self.invocation(record))
            .send()
            .await
            .map_err(|e| PaymentError::transport(Rail::Ledger, e))?;
        let body = crate::rails::read_json(Rail::Ledger, response).await?;

        if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
            return Err(PaymentError::gateway(Rail::Ledger, Some(200), err.to_string()));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first
    pub max_retries: u32,
    /// Doubles after each failure
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// Handle for enqueueing ledger recordings
#[derive(Clone)]
pub struct LedgerRecorder {
    tx: mpsc::Sender<LedgerRecord>,
    metrics: Arc<PaymentMetrics>,
}

impl LedgerRecorder {
    /// Start the delivery worker. The worker exits once every handle is dropped.
    pub fn spawn(
        sink: Arc<dyn LedgerSink>,
        normalizer: Arc<CurrencyNormalizer>,
        policy: RetryPolicy,
        metrics: Arc<PaymentMetrics>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let worker = tokio::spawn(run_worker(rx, sink, normalizer, policy, metrics.clone()));
        (Self { tx, metrics }, worker)
    }

    /// Queue a record without waiting; returns false if the queue is full or closed
    pub fn enqueue(&self, record: LedgerRecord) -> bool {
        let receipt = record.receipt.clone();
        match self.tx.try_send(record) {
            Ok(()) => {
                self.metrics.ledger_queue_depth.inc();
                debug!(receipt = %receipt, "Queued ledger recording");
                true
            }
            Err(e) => {
                self.metrics.ledger_recording_failures.inc();
                warn!(receipt = %receipt, error = %e, "Ledger recording not queued");
                false
            }
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<LedgerRecord>,
    sink: Arc<dyn LedgerSink>,
    normalizer: Arc<CurrencyNormalizer>,
    policy: RetryPolicy,
    metrics: Arc<PaymentMetrics>,
) {
    while let Some(mut record) = rx.recv().await {
        metrics.ledger_queue_depth.dec();

        if record.amount_settlement.is_none() {
            match normalizer.to_settlement_asset(record.amount_local).await {
                Ok(quote) => record.amount_settlement = Some(quote.settlement_amount),
                Err(e) => warn!(
                    receipt = %record.receipt,
                    error = %e,
                    "Recording without settlement amount"
                ),
            }
        }

        match deliver(sink.as_ref(), &record, policy).await {
            Ok(result) => {
                metrics.ledger_recordings.inc();
                info!(
                    receipt = %record.receipt,
                    merchant_reference = %record.merchant_reference,
                    result = %result,
                    "Payment recorded on ledger"
                );
            }
            Err(e) => {
                metrics.ledger_recording_failures.inc();
                error!(
                    receipt = %record.receipt,
                    merchant_reference = %record.merchant_reference,
                    error = %e,
                    "Ledger recording failed after retries"
                );
            }
        }
    }
    debug!("Ledger recorder stopped");
}

async fn deliver(
    sink: &dyn LedgerSink,
    record: &LedgerRecord,
    policy: RetryPolicy,
) -> Result<Value> {
    for attempt in 0..policy.max_retries {
        match sink.record_payment(record).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let delay = policy.base_delay * 2u32.pow(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    receipt = %record.receipt,
                    "Ledger recording failed, retrying in {delay:?}: {e}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    sink.record_payment(record).await
}
