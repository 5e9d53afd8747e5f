//! Mobile money rail: M-Pesa Daraja STK push

use super::{
    http_client, read_json, required_str, ConnectionCheck, InitiateRequest, Initiated, RailAdapter,
    StatusReport,
};
use crate::config::MpesaConfig;
use crate::error::{PaymentError, Result};
use crate::model::{NextAction, Outcome, Rail, RailStatus};
use crate::token_cache::{FetchedToken, TokenCache, TokenPolicy};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, FixedOffset, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tiba_core::Operator;
use tiba_telemetry::{redact_json, redact_secret};
use tracing::{debug, info, warn};

pub const RESULT_SUCCESS: i64 = 0;
pub const RESULT_CANCELLED_BY_USER: i64 = 1032;
pub const RESULT_TIMEOUT: i64 = 1037;

const EAT_OFFSET_SECS: i32 = 3 * 3600;

pub struct MpesaAdapter {
    config: MpesaConfig,
    tokens: Arc<TokenCache>,
    http_client: reqwest::Client,
}

impl MpesaAdapter {
    pub fn new(config: MpesaConfig, tokens: Arc<TokenCache>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            config,
            tokens,
            http_client: http_client(timeout)?,
        })
    }

    fn token_policy(&self) -> TokenPolicy {
        match self.config.token_cache {
            Some(ttl) => TokenPolicy::Fixed(ttl),
            None => TokenPolicy::AlwaysFresh,
        }
    }

    async fn access_token(&self) -> Result<String> {
        self.tokens
            .get_token(Rail::MobileMoney, self.token_policy(), || self.fetch_token())
            .await
    }

    async fn fetch_token(&self) -> Result<FetchedToken> {
        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url
        );
        let response = self
            .http_client
            .get(&url)
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await
            .map_err(|e| auth_error(format!("token request failed: {e}")))?;

        let body = read_json(Rail::MobileMoney, response)
            .await
            .map_err(|e| auth_error(e.to_string()))?;

        let token = match body.get("access_token").and_then(Value::as_str) {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => return Err(auth_error("token response missing access_token".into())),
        };

        let expires_at = body
            .get("expires_in")
            .and_then(|v| match v {
                Value::String(s) => s.parse::<i64>().ok(),
                other => other.as_i64(),
            })
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));

        Ok(FetchedToken { token, expires_at })
    }

    /// `base64(short_code + passkey + timestamp)`
    pub fn password(&self, timestamp: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(format!(
            "{}{}{}",
            self.config.short_code, self.config.passkey, timestamp
        ))
    }

    async fn post_authorized(&self, path: &str, payload: &Value) -> Result<Value> {
        let token = self.access_token().await?;
        debug!(path, payload = %redact_json(payload), "M-Pesa request");

        let response = self
            .http_client
            .post(format!("{}{}", self.config.base_url, path))
            .bearer_auth(&token)
            .json(payload)
            .send()
            .await
            .map_err(|e| PaymentError::transport(Rail::MobileMoney, e))?;

        let result = read_json(Rail::MobileMoney, response).await;
        if let Err(PaymentError::Authentication { .. }) = &result {
            self.tokens.invalidate(Rail::MobileMoney);
        }
        result
    }
}

/// Daraja timestamp, `YYYYMMDDHHMMSS` in East Africa Time
pub fn timestamp(now: DateTime<Utc>) -> String {
    match FixedOffset::east_opt(EAT_OFFSET_SECS) {
        Some(eat) => now.with_timezone(&eat).format("%Y%m%d%H%M%S").to_string(),
        None => now.format("%Y%m%d%H%M%S").to_string(),
    }
}

pub fn classify(status: &RailStatus) -> Outcome {
    match status {
        RailStatus::ResultCode { code, .. } => match *code {
            RESULT_SUCCESS => Outcome::Succeeded,
            RESULT_CANCELLED_BY_USER => Outcome::Cancelled,
            // Subscriber unreachable or slow to answer; the push can still complete
            RESULT_TIMEOUT => Outcome::Unresolved,
            _ => Outcome::Failed,
        },
        _ => Outcome::Unresolved,
    }
}

/// Daraja answers status queries for in-flight pushes with an error body
fn is_processing_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("being processed")
        || message.contains("under processing")
        || message.contains("transaction is processing")
}

fn parse_result_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn auth_error(message: String) -> PaymentError {
    PaymentError::Authentication {
        rail: Rail::MobileMoney,
        message,
    }
}

/// Parsed `Body.stkCallback` notification
#[derive(Debug, Clone, PartialEq)]
pub struct StkCallback {
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: String,
    pub result_code: i64,
    pub result_desc: Option<String>,
    pub receipt_number: Option<String>,
    pub amount: Option<Decimal>,
    pub phone_number: Option<String>,
}

impl StkCallback {
    pub fn status(&self) -> RailStatus {
        RailStatus::ResultCode {
            code: self.result_code,
            description: self.result_desc.clone(),
        }
    }
}

/// Validate and parse an STK callback payload
pub fn parse_callback(payload: &Value) -> Result<StkCallback> {
    let callback = payload
        .get("Body")
        .and_then(|b| b.get("stkCallback"))
        .ok_or_else(|| PaymentError::MalformedCallback("missing Body.stkCallback".into()))?;

    let checkout_request_id = callback
        .get("CheckoutRequestID")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PaymentError::MalformedCallback("missing CheckoutRequestID".into()))?
        .to_string();

    let result_code = callback
        .get("ResultCode")
        .and_then(parse_result_code)
        .ok_or_else(|| PaymentError::MalformedCallback("missing ResultCode".into()))?;

    let metadata = callback_metadata(callback);

    Ok(StkCallback {
        merchant_request_id: callback
            .get("MerchantRequestID")
            .and_then(Value::as_str)
            .map(str::to_string),
        checkout_request_id,
        result_code,
        result_desc: callback
            .get("ResultDesc")
            .and_then(Value::as_str)
            .map(str::to_string),
        receipt_number: metadata
            .iter()
            .find(|(name, _)| name == "MpesaReceiptNumber")
            .and_then(|(_, v)| v.as_str().map(str::to_string)),
        amount: metadata
            .iter()
            .find(|(name, _)| name == "Amount")
            .and_then(|(_, v)| match v {
                Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
                Value::String(s) => Decimal::from_str(s).ok(),
                _ => None,
            }),
        phone_number: metadata
            .iter()
            .find(|(name, _)| name == "PhoneNumber")
            .map(|(_, v)| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
    })
}

fn callback_metadata(callback: &Value) -> Vec<(String, Value)> {
    callback
        .get("CallbackMetadata")
        .and_then(|m| m.get("Item"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let name = item.get("Name")?.as_str()?.to_string();
                    Some((name, item.get("Value").cloned().unwrap_or(Value::Null)))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl RailAdapter for MpesaAdapter {
    fn rail(&self) -> Rail {
        Rail::MobileMoney
    }

    fn validate(&self, request: &InitiateRequest) -> Result<()> {
        if request.currency != "KES" {
            return Err(PaymentError::Validation(format!(
                "mobile money only accepts KES, got {}",
                request.currency
            )));
        }
        if request.amount < self.config.min_amount || request.amount > self.config.max_amount {
            return Err(PaymentError::Validation(format!(
                "amount must be between {} and {}",
                self.config.min_amount, self.config.max_amount
            )));
        }
        if !request.amount.fract().is_zero() {
            return Err(PaymentError::Validation(
                "mobile money amounts must be whole shillings".into(),
            ));
        }
        match &request.payer.phone {
            Some(phone) if !phone.is_valid_mobile() => Err(PaymentError::Validation(format!(
                "{} is not a valid mobile number",
                phone.as_str()
            ))),
            Some(phone) => match phone.operator() {
                Operator::Airtel | Operator::Telkom => Err(PaymentError::Validation(format!(
                    "{} is not on the M-Pesa network",
                    phone.as_str()
                ))),
                Operator::Safaricom | Operator::Unknown => Ok(()),
            },
            None => Err(PaymentError::Validation(
                "payer phone number is required for mobile money".into(),
            )),
        }
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<Initiated> {
        self.validate(request)?;
        let phone = request
            .payer
            .phone
            .as_ref()
            .map(|p| p.as_str().to_string())
            .unwrap_or_default();
        let amount = request
            .amount
            .to_i64()
            .ok_or_else(|| PaymentError::Validation("amount out of range".into()))?;

        let ts = timestamp(Utc::now());
        let account_reference: String = request.merchant_reference.chars().take(50).collect();
        let description: String = request.description.chars().take(100).collect();
        let payload = json!({
            "BusinessShortCode": self.config.short_code,
            "Password": self.password(&ts),
            "Timestamp": ts,
            "TransactionType": self.config.transaction_type,
            "Amount": amount,
            "PartyA": phone,
            "PartyB": self.config.short_code,
            "PhoneNumber": phone,
            "CallBackURL": self.config.callback_url,
            "AccountReference": account_reference,
            "TransactionDesc": description,
        });

        let body = self.post_authorized("/mpesa/stkpush/v1/processrequest", &payload).await?;

        if let Some(code) = body.get("ResponseCode").and_then(parse_result_code) {
            if code != 0 {
                return Err(PaymentError::gateway(
                    Rail::MobileMoney,
                    Some(200),
                    body.get("ResponseDescription")
                        .and_then(Value::as_str)
                        .unwrap_or("STK push rejected")
                        .to_string(),
                ));
            }
        }

        let checkout_request_id = required_str(Rail::MobileMoney, &body, "CheckoutRequestID")?;
        info!(
            merchant_reference = %request.merchant_reference,
            external_tracking_id = %checkout_request_id,
            amount,
            "STK push accepted"
        );

        let message = body
            .get("CustomerMessage")
            .and_then(Value::as_str)
            .unwrap_or("Confirm the payment on your phone")
            .to_string();

        Ok(Initiated {
            external_tracking_id: checkout_request_id,
            next_action: NextAction::Prompt { message },
            settlement_amount: None,
            raw: body,
        })
    }

    async fn query_status(&self, external_tracking_id: &str) -> Result<StatusReport> {
        let ts = timestamp(Utc::now());
        let payload = json!({
            "BusinessShortCode": self.config.short_code,
            "Password": self.password(&ts),
            "Timestamp": ts,
            "CheckoutRequestID": external_tracking_id,
        });

        match self.post_authorized("/mpesa/stkpushquery/v1/query", &payload).await {
            Ok(body) => {
                let status = match body.get("ResultCode").and_then(parse_result_code) {
                    Some(code) => RailStatus::ResultCode {
                        code,
                        description: body
                            .get("ResultDesc")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    },
                    None => RailStatus::Processing,
                };
                Ok(StatusReport { status, raw: body })
            }
            Err(PaymentError::Gateway { body, .. }) if is_processing_message(&body) => {
                debug!(external_tracking_id, "STK push still processing");
                let raw = serde_json::from_str(&body).unwrap_or(Value::String(body));
                Ok(StatusReport {
                    status: RailStatus::Processing,
                    raw,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn classify(&self, status: &RailStatus) -> Outcome {
        classify(status)
    }

    async fn check_connection(&self) -> Result<ConnectionCheck> {
        match self.fetch_token().await {
            Ok(fetched) => Ok(ConnectionCheck {
                rail: Rail::MobileMoney,
                reachable: true,
                token_preview: Some(redact_secret(&fetched.token)),
                detail: Some(self.config.base_url.clone()),
            }),
            Err(e) => {
                warn!(error = %e, "M-Pesa connection check failed");
                Ok(ConnectionCheck {
                    rail: Rail::MobileMoney,
                    reachable: false,
                    token_preview: None,
                    detail: Some(e.to_string()),
                })
            }
        }
    }
}
