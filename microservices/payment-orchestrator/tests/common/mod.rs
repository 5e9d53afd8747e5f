//! Shared fixtures for the adapter and flow tests

#![allow(dead_code)]

use payment_orchestrator::config::{
    FxConfig, MpesaConfig, PesapalConfig, StellarConfig, StellarNetwork,
};
use payment_orchestrator::fx::CurrencyNormalizer;
use payment_orchestrator::rails::InitiateRequest;
use payment_orchestrator::{ChargeRequest, PayableRef, PayableType, Payer, Rail};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tiba_core::PhoneNumber;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const MPESA_TOKEN: &str = "Gx7ShqWZpZtLcJYFc1h8JjwA8EAm";
pub const PESAPAL_TOKEN: &str = "eyJhbGciOiJodHRwOi8vd3d3LnczLm9yZy8yMDAx";

pub fn mpesa_config(server: &MockServer) -> MpesaConfig {
    MpesaConfig {
        base_url: server.uri(),
        consumer_key: "consumer-key".into(),
        consumer_secret: "consumer-secret".into(),
        short_code: "174379".into(),
        passkey: "bfb279f9aa9bdbcf158e97dd71a467cd2e0c893059b10f78e6b72ada1ed2c919".into(),
        callback_url: "https://pay.tiba.example/v1/callbacks/mpesa".into(),
        transaction_type: "CustomerPayBillOnline".into(),
        min_amount: dec!(1),
        max_amount: dec!(70000),
        token_cache: None,
    }
}

pub fn pesapal_config(server: &MockServer) -> PesapalConfig {
    PesapalConfig {
        base_url: server.uri(),
        consumer_key: "qkio1BGGYAXTu2JOfm7XSXNruoZsrqEW".into(),
        consumer_secret: "osGQ364R49cXKeOYSpaOnT++rHs=".into(),
        ipn_url: "https://pay.tiba.example/v1/callbacks/pesapal".into(),
        callback_url: "https://tiba.example/payments/return".into(),
        cancellation_url: None,
        currency: "KES".into(),
        register_ipn_per_order: true,
    }
}

pub fn stellar_config(server: &MockServer) -> StellarConfig {
    StellarConfig {
        network: StellarNetwork::Testnet,
        horizon_url: server.uri(),
        soroban_url: format!("{}/rpc", server.uri()),
        public_key: "GSOURCEACCOUNT".into(),
        destination_wallet: Some("GTIBATREASURY".into()),
        asset_code: "USDC".into(),
        asset_issuer: Some("GA5ZSEJYB37JRC5AVCIA5MOP4RHTM335X2KGX3IHOJAPP5RE34K4KZVN".into()),
        contract_address: None,
        memo_prefix: "TIBA-".into(),
        submit_url: format!("{}/submit", server.uri()),
        submit_token: Some("relay-token".into()),
    }
}

/// Normalizer with a fixed 1/130 rate and no live source
pub fn fixed_normalizer() -> Arc<CurrencyNormalizer> {
    Arc::new(CurrencyNormalizer::new(
        FxConfig {
            rate_api: None,
            ..FxConfig::default()
        },
        None,
    ))
}

pub fn payer() -> Payer {
    Payer {
        id: 42,
        phone: Some(PhoneNumber::new("0708374149")),
        email: Some("amina@example.com".into()),
        first_name: Some("Amina".into()),
        last_name: Some("Otieno".into()),
        ledger_address: None,
    }
}

pub fn initiate_request(amount: Decimal, reference: &str) -> InitiateRequest {
    InitiateRequest {
        amount,
        currency: "KES".into(),
        merchant_reference: reference.into(),
        description: "Full blood count".into(),
        payer: payer(),
        metadata: json!({}),
    }
}

pub fn lab_charge(payable_id: i64, rail: Rail) -> ChargeRequest {
    ChargeRequest {
        payable: PayableRef::new(PayableType::LabAppointment, payable_id),
        provider_id: 7,
        payer: payer(),
        amount: dec!(1500),
        currency: "KES".into(),
        rail,
        description: "Full blood count".into(),
        metadata: json!({}),
    }
}

pub async fn mount_mpesa_token(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/oauth/v1/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": MPESA_TOKEN,
            "expires_in": "3599"
        })))
        .mount(server)
        .await;
}

pub async fn mount_pesapal_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/Auth/RequestToken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": PESAPAL_TOKEN,
            "expiryDate": "2099-01-01T00:00:00Z",
            "error": null,
            "status": "200",
            "message": "Request processed successfully"
        })))
        .mount(server)
        .await;
}

pub fn stk_callback(checkout_request_id: &str, result_code: i64) -> serde_json::Value {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": result_code,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        {"Name": "Amount", "Value": 1500},
                        {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                        {"Name": "TransactionDate", "Value": 20191219102115u64},
                        {"Name": "PhoneNumber", "Value": 254708374149u64}
                    ]
                }
            }
        }
    })
}
