//! Payment orchestrator configuration

use crate::error::{PaymentError, Result};
use crate::model::Rail;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tiba_db::PoolConfig;

/// Upper bound for any outbound rail call
pub const MAX_RAIL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    pub http_bind: String,
    /// PostgreSQL store; in-memory when absent
    pub database: Option<PoolConfig>,
    pub mpesa: Option<MpesaConfig>,
    pub pesapal: Option<PesapalConfig>,
    pub stellar: Option<StellarConfig>,
    pub fx: FxConfig,
    pub rail_timeout: Duration,
    pub callback_window: Duration,
    pub poll_interval: Duration,
    pub ledger_mirror_mobile_money: bool,
}

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub short_code: String,
    pub passkey: String,
    pub callback_url: String,
    pub transaction_type: String,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    /// Token reuse window; `None` fetches a fresh token for every call
    pub token_cache: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct PesapalConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub ipn_url: String,
    pub callback_url: String,
    pub cancellation_url: Option<String>,
    pub currency: String,
    /// Register the IPN URL before every order instead of once
    pub register_ipn_per_order: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StellarNetwork {
    Testnet,
    Mainnet,
}

impl StellarNetwork {
    pub fn horizon_url(&self) -> &'static str {
        match self {
            StellarNetwork::Testnet => "https://horizon-testnet.stellar.org",
            StellarNetwork::Mainnet => "https://horizon.stellar.org",
        }
    }

    pub fn soroban_url(&self) -> &'static str {
        match self {
            StellarNetwork::Testnet => "https://soroban-testnet.stellar.org",
            StellarNetwork::Mainnet => "https://soroban-mainnet.stellar.org",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StellarConfig {
    pub network: StellarNetwork,
    pub horizon_url: String,
    pub soroban_url: String,
    pub public_key: String,
    pub destination_wallet: Option<String>,
    pub asset_code: String,
    /// Required for anything other than the native asset
    pub asset_issuer: Option<String>,
    pub contract_address: Option<String>,
    pub memo_prefix: String,
    /// Signing relay that accepts the unsigned payment envelope.
    /// The account secret lives with the relay, never in this service.
    pub submit_url: String,
    pub submit_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FxConfig {
    /// Base URL of the rate source; `{rate_api}/{from}` returns a `rates` map
    pub rate_api: Option<String>,
    pub local_currency: String,
    pub settlement_currency: String,
    pub fallback_rate: Decimal,
    pub precision: u32,
}

impl Default for FxConfig {
    fn default() -> Self {
        Self {
            rate_api: Some("https://api.exchangerate-api.com/v4/latest".to_string()),
            local_currency: "KES".to_string(),
            settlement_currency: "USD".to_string(),
            fallback_rate: Decimal::ONE / Decimal::from(130),
            precision: 6,
        }
    }
}

impl PaymentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup so tests need not touch the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let database = env.get("DATABASE_URL").map(|url| PoolConfig {
            url,
            max_size: env.parse_or("DB_POOL_SIZE", 16),
        });

        let rail_timeout =
            Duration::from_secs(env.parse_or("RAIL_TIMEOUT_SECS", 60u64)).min(MAX_RAIL_TIMEOUT);

        let stellar = Self::stellar_from(&env)?;
        let mirror_default = stellar
            .as_ref()
            .is_some_and(|s| s.contract_address.is_some());

        Ok(Self {
            http_bind: env.or("HTTP_BIND", "0.0.0.0:8080"),
            database,
            mpesa: Self::mpesa_from(&env)?,
            pesapal: Self::pesapal_from(&env)?,
            stellar,
            fx: Self::fx_from(&env)?,
            rail_timeout,
            callback_window: Duration::from_secs(env.parse_or("CALLBACK_WINDOW_SECS", 120u64)),
            poll_interval: Duration::from_secs(env.parse_or("POLL_INTERVAL_SECS", 30u64)),
            ledger_mirror_mobile_money: env.parse_or("LEDGER_MIRROR_MOBILE_MONEY", mirror_default),
        })
    }

    pub fn rail_enabled(&self, rail: Rail) -> bool {
        match rail {
            Rail::MobileMoney => self.mpesa.is_some(),
            Rail::CardRedirect => self.pesapal.is_some(),
            Rail::Ledger => self.stellar.is_some(),
        }
    }

    fn mpesa_from(env: &Env<'_>) -> Result<Option<MpesaConfig>> {
        let (Some(consumer_key), Some(consumer_secret)) =
            (env.get("MPESA_CONSUMER_KEY"), env.get("MPESA_CONSUMER_SECRET"))
        else {
            return Ok(None);
        };

        let base_url = match env.get("MPESA_BASE_URL") {
            Some(url) => url,
            None => match env.or("MPESA_ENVIRONMENT", "sandbox").as_str() {
                "sandbox" => "https://sandbox.safaricom.co.ke".to_string(),
                "production" => "https://api.safaricom.co.ke".to_string(),
                other => {
                    return Err(PaymentError::Config(format!(
                        "MPESA_ENVIRONMENT must be sandbox or production, got {other}"
                    )))
                }
            },
        };

        let min_amount = env.decimal_or("MPESA_MIN_AMOUNT", Decimal::ONE)?;
        let max_amount = env.decimal_or("MPESA_MAX_AMOUNT", Decimal::from(70_000))?;
        if min_amount <= Decimal::ZERO {
            return Err(PaymentError::Config(format!(
                "MPESA_MIN_AMOUNT must be positive, got {min_amount}"
            )));
        }
        if min_amount > max_amount {
            return Err(PaymentError::Config(
                "MPESA_MIN_AMOUNT exceeds MPESA_MAX_AMOUNT".into(),
            ));
        }

        Ok(Some(MpesaConfig {
            base_url: trim_slash(base_url),
            consumer_key,
            consumer_secret,
            short_code: env.or("MPESA_BUSINESS_SHORT_CODE", "174379"),
            passkey: env.require("MPESA_PASSKEY")?,
            callback_url: env.require("MPESA_CALLBACK_URL")?,
            transaction_type: env.or("MPESA_TRANSACTION_TYPE", "CustomerPayBillOnline"),
            min_amount,
            max_amount,
            token_cache: env
                .get("MPESA_TOKEN_CACHE_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }))
    }

    fn pesapal_from(env: &Env<'_>) -> Result<Option<PesapalConfig>> {
        let (Some(consumer_key), Some(consumer_secret)) = (
            env.get("PESAPAL_CONSUMER_KEY"),
            env.get("PESAPAL_CONSUMER_SECRET"),
        ) else {
            return Ok(None);
        };

        let base_url = match env.get("PESAPAL_BASE_URL") {
            Some(url) => url,
            None => match env.or("PESAPAL_ENVIRONMENT", "live").as_str() {
                "sandbox" => "https://cybqa.pesapal.com/pesapalv3".to_string(),
                "live" => "https://pay.pesapal.com/v3".to_string(),
                other => {
                    return Err(PaymentError::Config(format!(
                        "PESAPAL_ENVIRONMENT must be sandbox or live, got {other}"
                    )))
                }
            },
        };

        Ok(Some(PesapalConfig {
            base_url: trim_slash(base_url),
            consumer_key,
            consumer_secret,
            ipn_url: env.require("PESAPAL_IPN_URL")?,
            callback_url: env.require("PESAPAL_CALLBACK_URL")?,
            cancellation_url: env.get("PESAPAL_CANCELLATION_URL"),
            currency: env.or("PESAPAL_CURRENCY", "KES"),
            register_ipn_per_order: env.parse_or("PESAPAL_REGISTER_IPN_PER_ORDER", true),
        }))
    }

    fn stellar_from(env: &Env<'_>) -> Result<Option<StellarConfig>> {
        let (Some(public_key), Some(submit_url)) =
            (env.get("STELLAR_PUBLIC_KEY"), env.get("STELLAR_SUBMIT_URL"))
        else {
            return Ok(None);
        };

        let network = match env.or("STELLAR_NETWORK", "testnet").as_str() {
            "testnet" => StellarNetwork::Testnet,
            "mainnet" => StellarNetwork::Mainnet,
            other => {
                return Err(PaymentError::Config(format!(
                    "STELLAR_NETWORK must be testnet or mainnet, got {other}"
                )))
            }
        };

        let asset_code = env.or("STELLAR_ASSET_CODE", "USDC");
        let asset_issuer = env.get("STELLAR_ASSET_ISSUER");
        if asset_code != "XLM" && asset_issuer.is_none() {
            return Err(PaymentError::Config(format!(
                "STELLAR_ASSET_ISSUER is required for asset {asset_code}"
            )));
        }

        Ok(Some(StellarConfig {
            network,
            horizon_url: trim_slash(env.or("STELLAR_HORIZON_URL", network.horizon_url())),
            soroban_url: trim_slash(env.or("STELLAR_SOROBAN_URL", network.soroban_url())),
            public_key,
            destination_wallet: env.get("STELLAR_DESTINATION_WALLET"),
            asset_code,
            asset_issuer,
            contract_address: env.get("STELLAR_CONTRACT_ADDRESS"),
            memo_prefix: env.or("STELLAR_MEMO_PREFIX", "TIBA-"),
            submit_url: trim_slash(submit_url),
            submit_token: env.get("STELLAR_SUBMIT_TOKEN"),
        }))
    }

    fn fx_from(env: &Env<'_>) -> Result<FxConfig> {
        let defaults = FxConfig::default();
        let fallback_rate = match env.get("FX_FALLBACK_RATE") {
            Some(raw) => parse_rate(&raw)?,
            None => defaults.fallback_rate,
        };
        let precision: u32 = env.parse_or("FX_PRECISION", defaults.precision);
        if precision > 18 {
            return Err(PaymentError::Config("FX_PRECISION must be at most 18".into()));
        }

        Ok(FxConfig {
            rate_api: match env.get("FX_RATE_API") {
                Some(url) if url.is_empty() => None,
                Some(url) => Some(trim_slash(url)),
                None => defaults.rate_api,
            },
            local_currency: env.or("FX_LOCAL_CURRENCY", &defaults.local_currency),
            settlement_currency: env.or("FX_SETTLEMENT_CURRENCY", &defaults.settlement_currency),
            fallback_rate,
            precision,
        })
    }
}

/// Parse a rate given either as a decimal (`0.0077`) or a fraction (`1/130`)
pub fn parse_rate(raw: &str) -> Result<Decimal> {
    let invalid = || PaymentError::Config(format!("invalid exchange rate: {raw}"));
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num = Decimal::from_str(num.trim()).map_err(|_| invalid())?;
            let den = Decimal::from_str(den.trim()).map_err(|_| invalid())?;
            num.checked_div(den).ok_or_else(invalid)?
        }
        None => Decimal::from_str(raw.trim()).map_err(|_| invalid())?,
    };
    if rate <= Decimal::ZERO {
        return Err(invalid());
    }
    Ok(rate)
}

fn trim_slash(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn require(&self, key: &str) -> Result<String> {
        self.get(key)
            .ok_or_else(|| PaymentError::Config(format!("{key} must be set")))
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn decimal_or(&self, key: &str, default: Decimal) -> Result<Decimal> {
        match self.get(key) {
            Some(raw) => Decimal::from_str(&raw)
                .map_err(|_| PaymentError::Config(format!("{key} is not a number: {raw}"))),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<PaymentConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PaymentConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_credentials() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.http_bind, "0.0.0.0:8080");
        assert!(cfg.database.is_none());
        assert!(!cfg.rail_enabled(Rail::MobileMoney));
        assert!(!cfg.rail_enabled(Rail::CardRedirect));
        assert!(!cfg.rail_enabled(Rail::Ledger));
        assert_eq!(cfg.fx.precision, 6);
        assert_eq!(cfg.fx.fallback_rate * dec!(130), Decimal::ONE);
        assert!(!cfg.ledger_mirror_mobile_money);
    }

    #[test]
    fn test_mpesa_min_amount_must_be_positive() {
        let mpesa = [
            ("MPESA_CONSUMER_KEY", "key"),
            ("MPESA_CONSUMER_SECRET", "secret"),
            ("MPESA_PASSKEY", "pass"),
            ("MPESA_CALLBACK_URL", "https://example.test/cb"),
        ];
        for min in ["0", "-5"] {
            let mut vars = mpesa.to_vec();
            vars.push(("MPESA_MIN_AMOUNT", min));
            assert!(matches!(config(&vars), Err(PaymentError::Config(_))));
        }
        let mut vars = mpesa.to_vec();
        vars.push(("MPESA_MIN_AMOUNT", "10"));
        assert_eq!(config(&vars).unwrap().mpesa.unwrap().min_amount, dec!(10));
    }

    #[test]
    fn test_mpesa_enabled() {
        let cfg = config(&[
            ("MPESA_CONSUMER_KEY", "key"),
            ("MPESA_CONSUMER_SECRET", "secret"),
            ("MPESA_PASSKEY", "pass"),
            ("MPESA_CALLBACK_URL", "https://example.test/cb"),
        ])
        .unwrap();
        let mpesa = cfg.mpesa.unwrap();
        assert_eq!(mpesa.base_url, "https://sandbox.safaricom.co.ke");
        assert_eq!(mpesa.short_code, "174379");
        assert_eq!(mpesa.max_amount, dec!(70000));
        assert!(mpesa.token_cache.is_none());
    }

    #[test]
    fn test_mpesa_missing_passkey() {
        let result = config(&[
            ("MPESA_CONSUMER_KEY", "key"),
            ("MPESA_CONSUMER_SECRET", "secret"),
            ("MPESA_CALLBACK_URL", "https://example.test/cb"),
        ]);
        assert!(matches!(result, Err(PaymentError::Config(_))));
    }

    #[test]
    fn test_timeout_clamped() {
        let cfg = config(&[("RAIL_TIMEOUT_SECS", "300")]).unwrap();
        assert_eq!(cfg.rail_timeout, MAX_RAIL_TIMEOUT);
    }

    #[test]
    fn test_stellar_requires_issuer_for_tokens() {
        let result = config(&[
            ("STELLAR_PUBLIC_KEY", "GPUB"),
            ("STELLAR_SUBMIT_URL", "https://relay.example.test/submit"),
        ]);
        assert!(result.is_err());

        let cfg = config(&[
            ("STELLAR_PUBLIC_KEY", "GPUB"),
            ("STELLAR_SUBMIT_URL", "https://relay.example.test/submit"),
            ("STELLAR_ASSET_CODE", "XLM"),
            ("STELLAR_CONTRACT_ADDRESS", "CCONTRACT"),
        ])
        .unwrap();
        let stellar = cfg.stellar.as_ref().unwrap();
        assert_eq!(stellar.horizon_url, "https://horizon-testnet.stellar.org");
        assert!(cfg.ledger_mirror_mobile_money);
    }

    #[test]
    fn test_parse_rate() {
        assert_eq!(parse_rate("0.5").unwrap(), dec!(0.5));
        assert_eq!(parse_rate("1/4").unwrap(), dec!(0.25));
        assert!(parse_rate("1/0").is_err());
        assert!(parse_rate("-1").is_err());
        assert!(parse_rate("abc").is_err());
    }
}
