//! Local currency to settlement asset conversion

use crate::config::FxConfig;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const RATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of live exchange rates
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn rate(&self, from: &str, to: &str) -> Result<Decimal>;
}

/// Rate API answering `GET {base_url}/{from}` with `{"rates": {"USD": 0.0077, ...}}`
pub struct HttpRateSource {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpRateSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(RATE_TIMEOUT)
            .build()
            .map_err(|e| PaymentError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            http_client,
        })
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn rate(&self, from: &str, to: &str) -> Result<Decimal> {
        let url = format!("{}/{}", self.base_url, from);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| PaymentError::Validation(format!("rate fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(PaymentError::Validation(format!(
                "rate source answered HTTP {}",
                response.status().as_u16()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PaymentError::Validation(format!("rate body unreadable: {e}")))?;

        let rate = match &body["rates"][to] {
            serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
                .or_else(|_| Decimal::from_scientific(&n.to_string()))
                .ok(),
            serde_json::Value::String(s) => Decimal::from_str(s).ok(),
            _ => None,
        };

        match rate {
            Some(rate) if rate > Decimal::ZERO => Ok(rate),
            _ => Err(PaymentError::Validation(format!("no {from}->{to} rate in response"))),
        }
    }
}

/// Result of a conversion, kept for audit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementQuote {
    pub local_amount: Decimal,
    pub rate: Decimal,
    pub settlement_amount: Decimal,
    pub fallback_used: bool,
}

#[derive(Clone)]
pub struct CurrencyNormalizer {
    source: Option<Arc<dyn RateSource>>,
    config: FxConfig,
}

impl CurrencyNormalizer {
    pub fn new(config: FxConfig, source: Option<Arc<dyn RateSource>>) -> Self {
        Self { source, config }
    }

    pub fn from_config(config: FxConfig) -> Result<Self> {
        let source = match &config.rate_api {
            Some(url) => Some(Arc::new(HttpRateSource::new(url.clone())?) as Arc<dyn RateSource>),
            None => None,
        };
        Ok(Self::new(config, source))
    }

    pub fn config(&self) -> &FxConfig {
        &self.config
    }

    /// Convert a local-currency amount into the settlement asset.
    ///
    /// A failed or missing live rate falls back to the configured rate; the
    /// result is always rounded half away from zero to the configured precision.
    pub async fn to_settlement_asset(&self, local_amount: Decimal) -> Result<SettlementQuote> {
        if local_amount <= Decimal::ZERO {
            return Err(PaymentError::Validation(format!(
                "amount must be positive, got {local_amount}"
            )));
        }

        let live = match &self.source {
            Some(source) => match source
                .rate(&self.config.local_currency, &self.config.settlement_currency)
                .await
            {
                Ok(rate) => Some(rate),
                Err(e) => {
                    warn!(error = %e, "Exchange rate fetch failed, using fallback rate");
                    None
                }
            },
            None => None,
        };

        let fallback_used = live.is_none();
        let rate = live.unwrap_or(self.config.fallback_rate);
        let settlement_amount = convert(local_amount, rate, self.config.precision)?;

        info!(
            local_amount = %local_amount,
            rate = %rate,
            settlement_amount = %settlement_amount,
            fallback_used,
            "Currency conversion"
        );

        Ok(SettlementQuote {
            local_amount,
            rate,
            settlement_amount,
            fallback_used,
        })
    }
}

/// `amount * rate`, rounded half away from zero to `precision` places
pub fn convert(amount: Decimal, rate: Decimal, precision: u32) -> Result<Decimal> {
    amount
        .checked_mul(rate)
        .map(|v| v.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero))
        .ok_or_else(|| PaymentError::Validation("amount overflows settlement conversion".into()))
}
