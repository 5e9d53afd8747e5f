//! Ledger rail: Stellar payment settled in a token asset
//!
//! The charge amount is converted to the settlement asset, wrapped in an
//! unsigned payment envelope and handed to the signing relay. Verification
//! reads the transaction back from Horizon. Stellar has no webhook, so
//! ledger intents resolve through polling.

use super::{
    http_client, read_json, ConnectionCheck, InitiateRequest, Initiated, RailAdapter, StatusReport,
};
use crate::config::StellarConfig;
use crate::error::{PaymentError, Result};
use crate::fx::CurrencyNormalizer;
use crate::model::{NextAction, Outcome, Rail, RailStatus};
use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tiba_telemetry::redact_json;
use tracing::{debug, info, warn};

pub const BASE_FEE_STROOPS: u32 = 100;
const MEMO_TEXT_MAX_BYTES: usize = 28;

pub struct StellarAdapter {
    config: StellarConfig,
    normalizer: Arc<CurrencyNormalizer>,
    http_client: reqwest::Client,
}

impl StellarAdapter {
    pub fn new(
        config: StellarConfig,
        normalizer: Arc<CurrencyNormalizer>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            config,
            normalizer,
            http_client: http_client(timeout)?,
        })
    }

    /// Current sequence number of `account`
    pub async fn account_sequence(&self, account: &str) -> Result<i64> {
        let response = self
            .http_client
            .get(format!("{}/accounts/{}", self.config.horizon_url, account))
            .send()
            .await
            .map_err(|e| PaymentError::transport(Rail::Ledger, e))?;
        let body = read_json(Rail::Ledger, response).await?;

        body.get("sequence")
            .and_then(|v| match v {
                Value::String(s) => s.parse::<i64>().ok(),
                other => other.as_i64(),
            })
            .ok_or_else(|| {
                PaymentError::gateway(Rail::Ledger, Some(200), "account has no sequence")
            })
    }

    fn asset(&self) -> Value {
        match &self.config.asset_issuer {
            Some(issuer) if self.config.asset_code != "XLM" => {
                let asset_type = if self.config.asset_code.len() <= 4 {
                    "credit_alphanum4"
                } else {
                    "credit_alphanum12"
                };
                json!({
                    "type": asset_type,
                    "code": self.config.asset_code,
                    "issuer": issuer,
                })
            }
            _ => json!({ "type": "native" }),
        }
    }

    /// Text memo `{prefix}{merchant_reference}`, cut to the 28-byte memo limit
    pub fn memo(&self, merchant_reference: &str) -> String {
        let full = format!("{}{}", self.config.memo_prefix, merchant_reference);
        let mut end = full.len().min(MEMO_TEXT_MAX_BYTES);
        while !full.is_char_boundary(end) {
            end -= 1;
        }
        full[..end].to_string()
    }

    fn payment_envelope(
        &self,
        sequence: i64,
        destination: &str,
        amount: Decimal,
        memo: &str,
    ) -> Value {
        json!({
            "network": match self.config.network {
                crate::config::StellarNetwork::Testnet => "testnet",
                crate::config::StellarNetwork::Mainnet => "mainnet",
            },
            "source_account": self.config.public_key,
            "sequence": (sequence + 1).to_string(),
            "fee": BASE_FEE_STROOPS.to_string(),
            "memo": { "type": "text", "value": memo },
            "operations": [{
                "type": "payment",
                "destination": destination,
                "asset": self.asset(),
                "amount": amount.normalize().to_string(),
            }],
        })
    }
}

pub fn classify(status: &RailStatus) -> Outcome {
    match status {
        RailStatus::Ledger { verified: true, successful: true } => Outcome::Succeeded,
        RailStatus::Ledger { verified: true, successful: false } => Outcome::Failed,
        _ => Outcome::Unresolved,
    }
}

#[async_trait]
impl RailAdapter for StellarAdapter {
    fn rail(&self) -> Rail {
        Rail::Ledger
    }

    fn validate(&self, request: &InitiateRequest) -> Result<()> {
        if request.amount <= Decimal::ZERO {
            return Err(PaymentError::Validation(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        let local = &self.normalizer.config().local_currency;
        if &request.currency != local {
            return Err(PaymentError::Validation(format!(
                "ledger charges are priced in {local}, got {}",
                request.currency
            )));
        }
        if request.payer.ledger_address.is_none() && self.config.destination_wallet.is_none() {
            return Err(PaymentError::Validation(
                "no destination wallet for ledger payment".into(),
            ));
        }
        Ok(())
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<Initiated> {
        self.validate(request)?;
        let destination = request
            .payer
            .ledger_address
            .clone()
            .or_else(|| self.config.destination_wallet.clone())
            .ok_or_else(|| PaymentError::Validation("no destination wallet".into()))?;

        let quote = self.normalizer.to_settlement_asset(request.amount).await?;
        let sequence = self.account_sequence(&self.config.public_key).await?;
        let memo = self.memo(&request.merchant_reference);
        let envelope =
            self.payment_envelope(sequence, &destination, quote.settlement_amount, &memo);
        debug!(envelope = %redact_json(&envelope), "Submitting ledger payment");

        let mut submit = self.http_client.post(&self.config.submit_url).json(&envelope);
        if let Some(token) = &self.config.submit_token {
            submit = submit.bearer_auth(token);
        }
        let response = submit
            .send()
            .await
            .map_err(|e| PaymentError::transport(Rail::Ledger, e))?;
        let body = read_json(Rail::Ledger, response).await?;

        if body.get("successful").and_then(Value::as_bool) == Some(false) {
            return Err(PaymentError::gateway(
                Rail::Ledger,
                Some(200),
                format!("transaction rejected: {}", body.get("result_xdr").unwrap_or(&body)),
            ));
        }
        let hash = match body.get("hash").and_then(Value::as_str) {
            Some(hash) if !hash.is_empty() => hash.to_string(),
            _ => {
                return Err(PaymentError::gateway(
                    Rail::Ledger,
                    Some(200),
                    "submit response missing hash",
                ))
            }
        };

        info!(
            merchant_reference = %request.merchant_reference,
            external_tracking_id = %hash,
            settlement_amount = %quote.settlement_amount,
            asset = %self.config.asset_code,
            "Ledger payment submitted"
        );

        Ok(Initiated {
            external_tracking_id: hash,
            next_action: NextAction::None,
            settlement_amount: Some(quote.settlement_amount),
            raw: json!({ "submit": body, "quote": quote }),
        })
    }

    async fn query_status(&self, external_tracking_id: &str) -> Result<StatusReport> {
        let response = self
            .http_client
            .get(format!(
                "{}/transactions/{}",
                self.config.horizon_url, external_tracking_id
            ))
            .send()
            .await
            .map_err(|e| PaymentError::transport(Rail::Ledger, e))?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(external_tracking_id, "Ledger transaction not visible yet");
            return Ok(StatusReport {
                status: RailStatus::Ledger {
                    verified: false,
                    successful: false,
                },
                raw: json!({ "hash": external_tracking_id, "found": false }),
            });
        }

        let body = read_json(Rail::Ledger, response).await?;
        let successful = body.get("successful").and_then(Value::as_bool).unwrap_or(false);
        Ok(StatusReport {
            status: RailStatus::Ledger {
                verified: true,
                successful,
            },
            raw: body,
        })
    }

    fn classify(&self, status: &RailStatus) -> Outcome {
        classify(status)
    }

    async fn check_connection(&self) -> Result<ConnectionCheck> {
        match self.account_sequence(&self.config.public_key).await {
            Ok(sequence) => Ok(ConnectionCheck {
                rail: Rail::Ledger,
                reachable: true,
                token_preview: None,
                detail: Some(format!("account sequence {sequence}")),
            }),
            Err(e) => {
                warn!(error = %e, "Horizon connection check failed");
                Ok(ConnectionCheck {
                    rail: Rail::Ledger,
                    reachable: false,
                    token_preview: None,
                    detail: Some(e.to_string()),
                })
            }
        }
    }
}
