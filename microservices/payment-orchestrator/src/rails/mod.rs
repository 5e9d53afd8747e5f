//! Payment rail adapters
//!
//! One adapter per rail, each owning its wire format. The orchestrator only
//! sees the uniform [`RailAdapter`] contract.

pub mod mpesa;
pub mod pesapal;
pub mod stellar;

pub use mpesa::MpesaAdapter;
pub use pesapal::PesapalAdapter;
pub use stellar::StellarAdapter;

use crate::error::{PaymentError, Result};
use crate::model::{NextAction, Outcome, Payer, Rail, RailStatus};
use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What an adapter needs to start a payment
#[derive(Debug, Clone)]
pub struct InitiateRequest {
    pub amount: Decimal,
    pub currency: String,
    /// Unique per attempt; doubles as the rail-side idempotency key
    pub merchant_reference: String,
    pub description: String,
    pub payer: Payer,
    pub metadata: serde_json::Value,
}

/// Rail acknowledgement of an initiate call
#[derive(Debug, Clone)]
pub struct Initiated {
    pub external_tracking_id: String,
    pub next_action: NextAction,
    /// Amount actually moved in the settlement asset, when it differs from the charge currency
    pub settlement_amount: Option<Decimal>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: RailStatus,
    pub raw: serde_json::Value,
}

/// Result of a connection check, safe to show operators
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCheck {
    pub rail: Rail,
    pub reachable: bool,
    pub token_preview: Option<String>,
    pub detail: Option<String>,
}

#[async_trait]
pub trait RailAdapter: Send + Sync {
    fn rail(&self) -> Rail;

    /// Reject requests this rail can never accept, before any state is created
    fn validate(&self, request: &InitiateRequest) -> Result<()> {
        if request.amount <= Decimal::ZERO {
            return Err(PaymentError::Validation(format!(
                "amount must be positive, got {}",
                request.amount
            )));
        }
        Ok(())
    }

    /// Submit the payment to the rail. One outbound order/push/submit call.
    async fn initiate(&self, request: &InitiateRequest) -> Result<Initiated>;

    /// Read-only status lookup; safe to repeat
    async fn query_status(&self, external_tracking_id: &str) -> Result<StatusReport>;

    /// Map a rail status onto the intent state machine.
    /// Both the callback path and the polling path go through this.
    fn classify(&self, status: &RailStatus) -> Outcome;

    fn is_terminal_success(&self, status: &RailStatus) -> bool {
        self.classify(status) == Outcome::Succeeded
    }

    fn is_terminal_failure(&self, status: &RailStatus) -> bool {
        matches!(self.classify(status), Outcome::Failed | Outcome::Cancelled)
    }

    async fn check_connection(&self) -> Result<ConnectionCheck>;
}

/// Enabled adapters keyed by rail
#[derive(Clone, Default)]
pub struct RailRegistry {
    adapters: HashMap<Rail, Arc<dyn RailAdapter>>,
}

impl RailRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn RailAdapter>) {
        self.adapters.insert(adapter.rail(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn RailAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, rail: Rail) -> Result<Arc<dyn RailAdapter>> {
        self.adapters
            .get(&rail)
            .cloned()
            .ok_or_else(|| PaymentError::Config(format!("rail {rail} is not configured")))
    }

    pub fn enabled(&self) -> Vec<Rail> {
        let mut rails: Vec<Rail> = self.adapters.keys().copied().collect();
        rails.sort_by_key(|r| r.as_str());
        rails
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("tiba-payment-orchestrator/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| PaymentError::Config(format!("http client: {e}")))
}

/// Read a rail response body as JSON.
///
/// 401 becomes `Authentication`; any other non-2xx or an unparseable body
/// becomes `Gateway` carrying the status and body.
pub(crate) async fn read_json(
    rail: Rail,
    response: reqwest::Response,
) -> Result<serde_json::Value> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| PaymentError::transport(rail, e))?;

    if status == StatusCode::UNAUTHORIZED {
        return Err(PaymentError::Authentication {
            rail,
            message: format!("rail rejected credentials: {}", truncate(&body)),
        });
    }
    if !status.is_success() {
        return Err(PaymentError::gateway(rail, Some(status.as_u16()), truncate(&body)));
    }

    serde_json::from_str(&body).map_err(|_| {
        PaymentError::gateway(
            rail,
            Some(status.as_u16()),
            format!("malformed body: {}", truncate(&body)),
        )
    })
}

/// Required string field of a rail response
pub(crate) fn required_str(
    rail: Rail,
    body: &serde_json::Value,
    field: &str,
) -> Result<String> {
    match body.get(field) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        _ => Err(PaymentError::gateway(
            rail,
            Some(200),
            format!("response missing {field}"),
        )),
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_required_str() {
        let body = json!({"order_tracking_id": "abc", "empty": ""});
        assert_eq!(
            required_str(Rail::CardRedirect, &body, "order_tracking_id").unwrap(),
            "abc"
        );
        assert!(required_str(Rail::CardRedirect, &body, "empty").is_err());
        assert!(required_str(Rail::CardRedirect, &body, "missing").is_err());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(400);
        let cut = truncate(&long);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= 515);
    }

    #[test]
    fn test_registry_reports_missing_rail() {
        let registry = RailRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(registry.get(Rail::Ledger), Err(PaymentError::Config(_))));
    }
}
