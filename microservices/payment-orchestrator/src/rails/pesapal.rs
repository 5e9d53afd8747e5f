//! Card redirect rail: Pesapal v3 hosted checkout

use super::{
    http_client, read_json, required_str, ConnectionCheck, InitiateRequest, Initiated, RailAdapter,
    StatusReport,
};
use crate::config::PesapalConfig;
use crate::error::{PaymentError, Result};
use crate::model::{NextAction, Outcome, Rail, RailStatus};
use crate::token_cache::{FetchedToken, TokenCache, TokenPolicy};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tiba_telemetry::{redact_json, redact_secret};
use tracing::{debug, info, warn};

const TOKEN_SKEW: Duration = Duration::from_secs(30);

pub struct PesapalAdapter {
    config: PesapalConfig,
    tokens: Arc<TokenCache>,
    http_client: reqwest::Client,
    /// Registered notification id, reused when per-order registration is off
    ipn_id: RwLock<Option<String>>,
}

impl PesapalAdapter {
    pub fn new(config: PesapalConfig, tokens: Arc<TokenCache>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            config,
            tokens,
            http_client: http_client(timeout)?,
            ipn_id: RwLock::new(None),
        })
    }

    async fn access_token(&self) -> Result<String> {
        self.tokens
            .get_token(
                Rail::CardRedirect,
                TokenPolicy::Advertised { skew: TOKEN_SKEW },
                || self.fetch_token(),
            )
            .await
    }

    async fn fetch_token(&self) -> Result<FetchedToken> {
        let payload = json!({
            "consumer_key": self.config.consumer_key,
            "consumer_secret": self.config.consumer_secret,
        });
        let response = self
            .http_client
            .post(format!("{}/api/Auth/RequestToken", self.config.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| auth_error(format!("token request failed: {e}")))?;

        let body = read_json(Rail::CardRedirect, response)
            .await
            .map_err(|e| auth_error(e.to_string()))?;

        let token = match body.get("token").and_then(Value::as_str) {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => {
                return Err(auth_error(format!(
                    "token missing from response: {}",
                    error_message(&body).unwrap_or_else(|| "no error given".into())
                )))
            }
        };

        Ok(FetchedToken {
            token,
            expires_at: body
                .get("expiryDate")
                .and_then(Value::as_str)
                .and_then(parse_expiry),
        })
    }

    /// Register the IPN URL and return its notification id
    pub async fn register_ipn(&self) -> Result<String> {
        if !self.config.register_ipn_per_order {
            if let Some(id) = self.ipn_id.read().clone() {
                return Ok(id);
            }
        }

        let payload = json!({
            "url": self.config.ipn_url,
            "ipn_notification_type": "POST",
        });
        let body = self
            .send_authorized(
                reqwest::Method::POST,
                "/api/URLSetup/RegisterIPN",
                &[],
                Some(&payload),
            )
            .await?;
        let ipn_id = required_str(Rail::CardRedirect, &body, "ipn_id")?;
        debug!(ipn_id = %ipn_id, url = %self.config.ipn_url, "Registered IPN URL");

        if !self.config.register_ipn_per_order {
            *self.ipn_id.write() = Some(ipn_id.clone());
        }
        Ok(ipn_id)
    }

    async fn send_authorized(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        payload: Option<&Value>,
    ) -> Result<Value> {
        let token = self.access_token().await?;
        let mut request = self
            .http_client
            .request(method, format!("{}{}", self.config.base_url, path))
            .bearer_auth(&token)
            .header(reqwest::header::ACCEPT, "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(payload) = payload {
            debug!(path, payload = %redact_json(payload), "Pesapal request");
            request = request.json(payload);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PaymentError::transport(Rail::CardRedirect, e))?;

        let result = read_json(Rail::CardRedirect, response).await;
        if let Err(PaymentError::Authentication { .. }) = &result {
            self.tokens.invalidate(Rail::CardRedirect);
        }
        let body = result?;

        // Pesapal reports some failures as 200 with an error object. Status
        // lookups also carry one describing why a payment failed.
        if body.get("payment_status_description").is_none() {
            if let Some(message) = error_message(&body) {
                return Err(PaymentError::gateway(Rail::CardRedirect, Some(200), message));
            }
        }
        Ok(body)
    }
}

fn auth_error(message: String) -> PaymentError {
    PaymentError::Authentication {
        rail: Rail::CardRedirect,
        message,
    }
}

/// Non-null `error` member of a Pesapal body, as text
fn error_message(body: &Value) -> Option<String> {
    match body.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        // Status responses carry an error object whose members are all null
        Some(Value::Object(obj)) if obj.values().all(Value::is_null) => None,
        Some(Value::Object(obj)) => Some(
            obj.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        ),
        Some(other) => Some(other.to_string()),
    }
}

/// `expiryDate` arrives with or without an offset; offset-less values are UTC
fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

pub fn classify(status: &RailStatus) -> Outcome {
    match status {
        RailStatus::Description { value } => match value.trim().to_ascii_uppercase().as_str() {
            "COMPLETED" | "SUCCESS" => Outcome::Succeeded,
            "FAILED" | "INVALID" => Outcome::Failed,
            "CANCELLED" => Outcome::Cancelled,
            _ => Outcome::Unresolved,
        },
        _ => Outcome::Unresolved,
    }
}

/// IPN notification fields; the notification carries no payment status
#[derive(Debug, Clone, PartialEq)]
pub struct PesapalIpn {
    pub order_tracking_id: String,
    pub merchant_reference: String,
    pub notification_type: String,
}

impl PesapalIpn {
    /// Body Pesapal expects back to stop re-sending the notification
    pub fn ack(&self, status: u16) -> Value {
        json!({
            "orderNotificationType": self.notification_type,
            "orderTrackingId": self.order_tracking_id,
            "orderMerchantReference": self.merchant_reference,
            "status": status,
        })
    }
}

/// Validate an IPN from either a JSON body or query parameters
pub fn parse_ipn(params: &Value) -> Result<PesapalIpn> {
    let field = |name: &str| {
        params
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let order_tracking_id = field("OrderTrackingId")
        .ok_or_else(|| PaymentError::MalformedCallback("missing OrderTrackingId".into()))?;
    let merchant_reference = field("OrderMerchantReference")
        .ok_or_else(|| PaymentError::MalformedCallback("missing OrderMerchantReference".into()))?;

    Ok(PesapalIpn {
        order_tracking_id,
        merchant_reference,
        notification_type: field("OrderNotificationType").unwrap_or_else(|| "IPNCHANGE".into()),
    })
}

#[async_trait]
impl RailAdapter for PesapalAdapter {
    fn rail(&self) -> Rail {
        Rail::CardRedirect
    }

    fn validate(&self, request: &InitiateRequest) -> Result<()> {
        if request.amount <= rust_decimal::Decimal::ZERO {
            return Err(PaymentError::Validation(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        if request.currency != self.config.currency {
            return Err(PaymentError::Validation(format!(
                "card checkout is configured for {}, got {}",
                self.config.currency, request.currency
            )));
        }
        if request.payer.email.is_none() && request.payer.phone.is_none() {
            return Err(PaymentError::Validation(
                "card checkout needs the payer's email or phone".into(),
            ));
        }
        Ok(())
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<Initiated> {
        self.validate(request)?;
        let notification_id = self.register_ipn().await?;
        let payer = &request.payer;
        let amount = request
            .amount
            .to_f64()
            .ok_or_else(|| PaymentError::Validation("amount out of range".into()))?;

        let mut payload = json!({
            "id": request.merchant_reference,
            "currency": self.config.currency,
            "amount": amount,
            "description": request.description.chars().take(100).collect::<String>(),
            "redirect_mode": "PARENT_WINDOW",
            "callback_url": self.config.callback_url,
            "notification_id": notification_id,
            "billing_address": {
                "email_address": payer.email.clone().unwrap_or_default(),
                "phone_number": payer
                    .phone
                    .as_ref()
                    .map(|p| p.as_str().to_string())
                    .unwrap_or_default(),
                "country_code": "KE",
                "first_name": payer.first_name.clone().unwrap_or_default(),
                "middle_name": "",
                "last_name": payer.last_name.clone().unwrap_or_default(),
                "line_1": request
                    .metadata
                    .get("address")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
                "line_2": "",
                "city": request.metadata.get("city").and_then(Value::as_str).unwrap_or("Nairobi"),
                "state": request.metadata.get("state").and_then(Value::as_str).unwrap_or("Nairobi"),
                "postal_code": "00100",
                "zip_code": "00100",
            },
        });
        if let Some(url) = &self.config.cancellation_url {
            payload["cancellation_url"] = json!(url);
        }

        let body = self
            .send_authorized(
                reqwest::Method::POST,
                "/api/Transactions/SubmitOrderRequest",
                &[],
                Some(&payload),
            )
            .await?;

        let order_tracking_id = required_str(Rail::CardRedirect, &body, "order_tracking_id")?;
        let redirect_url = required_str(Rail::CardRedirect, &body, "redirect_url")?;
        info!(
            merchant_reference = %request.merchant_reference,
            external_tracking_id = %order_tracking_id,
            "Pesapal order submitted"
        );

        Ok(Initiated {
            external_tracking_id: order_tracking_id,
            next_action: NextAction::Redirect { url: redirect_url },
            settlement_amount: None,
            raw: body,
        })
    }

    async fn query_status(&self, external_tracking_id: &str) -> Result<StatusReport> {
        let body = self
            .send_authorized(
                reqwest::Method::GET,
                "/api/Transactions/GetTransactionStatus",
                &[("orderTrackingId", external_tracking_id)],
                None,
            )
            .await?;

        let status = match body.get("payment_status_description").and_then(Value::as_str) {
            Some(value) if !value.trim().is_empty() => RailStatus::Description {
                value: value.to_string(),
            },
            _ => RailStatus::Processing,
        };
        Ok(StatusReport { status, raw: body })
    }

    fn classify(&self, status: &RailStatus) -> Outcome {
        classify(status)
    }

    async fn check_connection(&self) -> Result<ConnectionCheck> {
        match self.fetch_token().await {
            Ok(fetched) => Ok(ConnectionCheck {
                rail: Rail::CardRedirect,
                reachable: true,
                token_preview: Some(redact_secret(&fetched.token)),
                detail: Some(self.config.base_url.clone()),
            }),
            Err(e) => {
                warn!(error = %e, "Pesapal connection check failed");
                Ok(ConnectionCheck {
                    rail: Rail::CardRedirect,
                    reachable: false,
                    token_preview: None,
                    detail: Some(e.to_string()),
                })
            }
        }
    }
}
