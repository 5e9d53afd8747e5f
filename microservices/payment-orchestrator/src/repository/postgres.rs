//! PostgreSQL store over the shared tiba-db pool

use super::PaymentStore;
use crate::error::{PaymentError, Result};
use crate::model::{CallbackEvent, PayableRef, PaymentIntent, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use tiba_db::{DbError, DbPool, Row, ToSql};
use tracing::info;
use uuid::Uuid;

/// Tables and indexes; safe to apply repeatedly
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS payment_intents (
    id                   UUID PRIMARY KEY,
    payable_type         TEXT NOT NULL,
    payable_id           BIGINT NOT NULL,
    payer_id             BIGINT NOT NULL,
    amount               NUMERIC(18, 4) NOT NULL,
    currency             TEXT NOT NULL,
    rail                 TEXT NOT NULL,
    merchant_reference   TEXT NOT NULL UNIQUE,
    external_tracking_id TEXT,
    status               TEXT NOT NULL,
    status_reason        TEXT,
    settlement_amount    NUMERIC(28, 8),
    created_at           TIMESTAMPTZ NOT NULL,
    updated_at           TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS payment_intents_one_active
    ON payment_intents (payable_type, payable_id)
    WHERE status IN ('CREATED', 'SUBMITTED', 'PENDING');

CREATE INDEX IF NOT EXISTS payment_intents_tracking
    ON payment_intents (external_tracking_id);

CREATE INDEX IF NOT EXISTS payment_intents_pending
    ON payment_intents (updated_at)
    WHERE status = 'PENDING';

CREATE TABLE IF NOT EXISTS payment_callback_events (
    id                   UUID PRIMARY KEY,
    rail                 TEXT NOT NULL,
    external_tracking_id TEXT NOT NULL,
    source               TEXT NOT NULL,
    raw_payload          JSONB NOT NULL,
    received_at          TIMESTAMPTZ NOT NULL,
    applied              BOOLEAN NOT NULL,
    note                 TEXT
);

CREATE INDEX IF NOT EXISTS payment_callback_events_tracking
    ON payment_callback_events (external_tracking_id, received_at);
"#;

const INTENT_COLUMNS: &str = "id, payable_type, payable_id, payer_id, amount, currency, rail, \
     merchant_reference, external_tracking_id, status, status_reason, settlement_amount, \
     created_at, updated_at";

#[derive(Clone)]
pub struct PostgresPaymentStore {
    pool: DbPool,
}

impl PostgresPaymentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        self.pool.batch_execute(SCHEMA).await?;
        info!("Payment schema ready");
        Ok(())
    }

    async fn query_intent(
        &self,
        filter: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Option<PaymentIntent>> {
        let conn = self.pool.get().await?;
        let sql = format!("SELECT {INTENT_COLUMNS} FROM payment_intents WHERE {filter} LIMIT 1");
        let row = conn
            .query_opt(sql.as_str(), params)
            .await
            .map_err(DbError::from_driver)?;
        row.map(|r| intent_from_row(&r)).transpose()
    }
}

fn parse_column<T: FromStr<Err = String>>(row: &Row, column: &str) -> Result<T> {
    let raw: String = row.try_get(column).map_err(DbError::from_driver)?;
    raw.parse().map_err(PaymentError::Store)
}

fn intent_from_row(row: &Row) -> Result<PaymentIntent> {
    let get = |e: tokio_postgres::Error| PaymentError::from(DbError::from_driver(e));
    Ok(PaymentIntent {
        id: row.try_get("id").map_err(get)?,
        payable_type: parse_column(row, "payable_type")?,
        payable_id: row.try_get("payable_id").map_err(get)?,
        payer_id: row.try_get("payer_id").map_err(get)?,
        amount: row.try_get("amount").map_err(get)?,
        currency: row.try_get("currency").map_err(get)?,
        rail: parse_column(row, "rail")?,
        merchant_reference: row.try_get("merchant_reference").map_err(get)?,
        external_tracking_id: row.try_get("external_tracking_id").map_err(get)?,
        status: parse_column(row, "status")?,
        status_reason: row.try_get("status_reason").map_err(get)?,
        settlement_amount: row.try_get("settlement_amount").map_err(get)?,
        created_at: row.try_get("created_at").map_err(get)?,
        updated_at: row.try_get("updated_at").map_err(get)?,
    })
}

fn event_from_row(row: &Row) -> Result<CallbackEvent> {
    let get = |e: tokio_postgres::Error| PaymentError::from(DbError::from_driver(e));
    let source: String = row.try_get("source").map_err(get)?;
    Ok(CallbackEvent {
        id: row.try_get("id").map_err(get)?,
        rail: parse_column(row, "rail")?,
        external_tracking_id: row.try_get("external_tracking_id").map_err(get)?,
        source: match source.as_str() {
            "poll" => crate::model::UpdateSource::Poll,
            "operator" => crate::model::UpdateSource::Operator,
            _ => crate::model::UpdateSource::Callback,
        },
        raw_payload: row.try_get("raw_payload").map_err(get)?,
        received_at: row.try_get("received_at").map_err(get)?,
        applied: row.try_get("applied").map_err(get)?,
        note: row.try_get("note").map_err(get)?,
    })
}

#[async_trait]
impl PaymentStore for PostgresPaymentStore {
    async fn insert_intent(&self, intent: &PaymentIntent) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            "INSERT INTO payment_intents (id, payable_type, payable_id, payer_id, amount, \
             currency, rail, merchant_reference, external_tracking_id, status, status_reason, \
             settlement_amount, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            &[
                &intent.id,
                &intent.payable_type.as_str(),
                &intent.payable_id,
                &intent.payer_id,
                &intent.amount,
                &intent.currency,
                &intent.rail.as_str(),
                &intent.merchant_reference,
                &intent.external_tracking_id,
                &intent.status.as_str(),
                &intent.status_reason,
                &intent.settlement_amount,
                &intent.created_at,
                &intent.updated_at,
            ],
        )
        .await
        .map_err(DbError::from_driver)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PaymentIntent>> {
        self.query_intent("id = $1", &[&id]).await
    }

    async fn find_by_reference(&self, merchant_reference: &str) -> Result<Option<PaymentIntent>> {
        self.query_intent("merchant_reference = $1", &[&merchant_reference])
            .await
    }

    async fn find_by_tracking_id(
        &self,
        external_tracking_id: &str,
    ) -> Result<Option<PaymentIntent>> {
        self.query_intent("external_tracking_id = $1", &[&external_tracking_id])
            .await
    }

    async fn find_active_for_payable(&self, payable: PayableRef) -> Result<Option<PaymentIntent>> {
        self.query_intent(
            "payable_type = $1 AND payable_id = $2 \
             AND status IN ('CREATED', 'SUBMITTED', 'PENDING')",
            &[&payable.payable_type.as_str(), &payable.payable_id],
        )
        .await
    }

    async fn update_intent(&self, intent: &PaymentIntent, expected: PaymentStatus) -> Result<bool> {
        let conn = self.pool.get().await?;
        let updated = conn
            .execute(
                "UPDATE payment_intents SET status = $2, status_reason = $3, \
                 external_tracking_id = $4, settlement_amount = $5, updated_at = $6 \
                 WHERE id = $1 AND status = $7",
                &[
                    &intent.id,
                    &intent.status.as_str(),
                    &intent.status_reason,
                    &intent.external_tracking_id,
                    &intent.settlement_amount,
                    &intent.updated_at,
                    &expected.as_str(),
                ],
            )
            .await
            .map_err(DbError::from_driver)?;
        Ok(updated == 1)
    }

    async fn list_pending(
        &self,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PaymentIntent>> {
        let conn = self.pool.get().await?;
        let sql = format!(
            "SELECT {INTENT_COLUMNS} FROM payment_intents \
             WHERE status = 'PENDING' AND updated_at < $1 ORDER BY updated_at LIMIT $2"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = conn
            .query(sql.as_str(), &[&updated_before, &limit])
            .await
            .map_err(DbError::from_driver)?;
        rows.iter().map(intent_from_row).collect()
    }

    async fn append_event(&self, event: &CallbackEvent) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            "INSERT INTO payment_callback_events (id, rail, external_tracking_id, source, \
             raw_payload, received_at, applied, note) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &event.id,
                &event.rail.as_str(),
                &event.external_tracking_id,
                &event.source.as_str(),
                &event.raw_payload,
                &event.received_at,
                &event.applied,
                &event.note,
            ],
        )
        .await
        .map_err(DbError::from_driver)?;
        Ok(())
    }

    async fn events_for(&self, external_tracking_id: &str) -> Result<Vec<CallbackEvent>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "SELECT id, rail, external_tracking_id, source, raw_payload, received_at, \
                 applied, note FROM payment_callback_events \
                 WHERE external_tracking_id = $1 ORDER BY received_at",
                &[&external_tracking_id],
            )
            .await
            .map_err(DbError::from_driver)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn is_healthy(&self) -> bool {
        self.pool.is_healthy().await
    }
}
