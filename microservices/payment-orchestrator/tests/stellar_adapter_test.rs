//! Ledger adapter and currency normalizer against mocked Horizon, relay and rate APIs

mod common;

use common::*;
use payment_orchestrator::config::FxConfig;
use payment_orchestrator::fx::{CurrencyNormalizer, HttpRateSource, RateSource};
use payment_orchestrator::rails::{RailAdapter, StellarAdapter};
use payment_orchestrator::{NextAction, Outcome, PaymentError, RailStatus};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TX_HASH: &str = "3389e9f0f1a65f19736cacf544c2e825313e8447f569233bb8db39aa607c8889";

async fn mount_rates(server: &MockServer, usd: f64) {
    Mock::given(method("GET"))
        .and(path("/latest/KES"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "base": "KES",
            "rates": { "USD": usd, "EUR": 0.0071 }
        })))
        .mount(server)
        .await;
}

async fn mount_account(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/accounts/GSOURCEACCOUNT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "GSOURCEACCOUNT",
            "account_id": "GSOURCEACCOUNT",
            "sequence": "3298702387052545"
        })))
        .mount(server)
        .await;
}

fn live_normalizer(server: &MockServer) -> Arc<CurrencyNormalizer> {
    Arc::new(
        CurrencyNormalizer::from_config(FxConfig {
            rate_api: Some(format!("{}/latest", server.uri())),
            ..FxConfig::default()
        })
        .expect("normalizer"),
    )
}

#[tokio::test]
async fn test_rate_source_reads_target_currency() {
    let server = MockServer::start().await;
    mount_rates(&server, 0.0077).await;

    let source = HttpRateSource::new(format!("{}/latest", server.uri())).expect("source");

    assert_eq!(source.rate("KES", "USD").await.expect("rate"), dec!(0.0077));
    assert!(source.rate("KES", "JPY").await.is_err());
}

#[tokio::test]
async fn test_normalizer_falls_back_when_rate_api_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/latest/KES"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let quote = live_normalizer(&server)
        .to_settlement_asset(dec!(13000))
        .await
        .expect("quote");

    assert!(quote.fallback_used);
    assert_eq!(quote.settlement_amount, dec!(100));
}

#[tokio::test]
async fn test_payment_submitted_through_relay() {
    let server = MockServer::start().await;
    mount_rates(&server, 0.0077).await;
    mount_account(&server).await;

    Mock::given(method("POST"))
        .and(path("/submit"))
        .and(header("Authorization", "Bearer relay-token"))
        .and(body_partial_json(json!({
            "network": "testnet",
            "source_account": "GSOURCEACCOUNT",
            "sequence": "3298702387052546",
            "fee": "100",
            "memo": { "type": "text", "value": "TIBA-LAB-7-42-1700000000" },
            "operations": [{
                "type": "payment",
                "destination": "GTIBATREASURY",
                "asset": { "type": "credit_alphanum4", "code": "USDC" },
                "amount": "11.55"
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hash": TX_HASH,
            "ledger": 1234567,
            "successful": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = StellarAdapter::new(stellar_config(&server), live_normalizer(&server), TIMEOUT)
        .expect("adapter");
    let initiated = adapter
        .initiate(&initiate_request(dec!(1500), "LAB-7-42-1700000000"))
        .await
        .expect("initiate");

    assert_eq!(initiated.external_tracking_id, TX_HASH);
    assert_eq!(initiated.next_action, NextAction::None);
    assert_eq!(initiated.settlement_amount, Some(dec!(11.55)));
    assert_eq!(initiated.raw["quote"]["fallback_used"], false);
}

#[tokio::test]
async fn test_relay_rejection_is_gateway_error() {
    let server = MockServer::start().await;
    mount_account(&server).await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hash": TX_HASH,
            "successful": false,
            "result_xdr": "AAAAAAAAAGT/////AAAAAQAAAAAAAAAB////+wAAAAA="
        })))
        .mount(&server)
        .await;

    let adapter = StellarAdapter::new(stellar_config(&server), fixed_normalizer(), TIMEOUT)
        .expect("adapter");
    let err = adapter
        .initiate(&initiate_request(dec!(1500), "LAB-7-42-1700000000"))
        .await
        .unwrap_err();

    assert!(matches!(err, PaymentError::Gateway { .. }));
}

#[tokio::test]
async fn test_unknown_transaction_is_unresolved() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/transactions/{TX_HASH}")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "type": "https://stellar.org/horizon-errors/not_found",
            "title": "Resource Missing",
            "status": 404
        })))
        .mount(&server)
        .await;

    let adapter = StellarAdapter::new(stellar_config(&server), fixed_normalizer(), TIMEOUT)
        .expect("adapter");
    let report = adapter.query_status(TX_HASH).await.expect("query");

    assert_eq!(report.status, RailStatus::Ledger { verified: false, successful: false });
    assert_eq!(adapter.classify(&report.status), Outcome::Unresolved);
}

#[tokio::test]
async fn test_visible_transaction_is_verified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/transactions/{TX_HASH}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": TX_HASH,
            "hash": TX_HASH,
            "successful": true,
            "ledger": 1234567,
            "memo": "TIBA-LAB-7-42-1700000000"
        })))
        .mount(&server)
        .await;

    let adapter = StellarAdapter::new(stellar_config(&server), fixed_normalizer(), TIMEOUT)
        .expect("adapter");
    let report = adapter.query_status(TX_HASH).await.expect("query");

    assert_eq!(adapter.classify(&report.status), Outcome::Succeeded);
}
