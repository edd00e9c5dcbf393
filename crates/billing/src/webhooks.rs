//! Inbound payment-processor webhook ingestion.
//!
//! Ingestion is split from processing: we validate the payload shape, verify
//! the checksum, durably persist the raw event, and enqueue exactly one
//! processing job. Redeliveries are detected by the checksum uniqueness
//! constraint and acknowledged without side effects, so processing can be
//! retried later without re-receiving or re-verifying the webhook.

use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::jobs::{kind, JobQueue};
use crate::signature::{self, SignatureBlock};

/// Webhook body as delivered by the processor.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    pub event: String,
    pub data: Value,
    pub signature: SignatureBlock,
    pub timestamp: i64,
}

impl InboundEvent {
    /// Parse and shape-check a raw body. Anything that doesn't carry the
    /// four required fields is an `invalid_payload`.
    pub fn parse(body: &Value) -> BillingResult<Self> {
        serde_json::from_value(body.clone())
            .map_err(|e| BillingError::InvalidPayload(e.to_string()))
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub provider: String,
    pub event_name: String,
    pub checksum: String,
    pub payload: Value,
    pub headers: Value,
    pub provider_timestamp: Option<i64>,
    pub status: String,
    pub error_message: Option<String>,
    pub received_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

/// Outcome of an ingestion attempt. Duplicates are success, not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted { event_id: Uuid },
    Duplicate,
}

#[derive(Clone)]
pub struct WebhookIngestion {
    pool: PgPool,
    queue: JobQueue,
}

impl WebhookIngestion {
    pub fn new(pool: PgPool, queue: JobQueue) -> Self {
        Self { pool, queue }
    }

    /// Verify and persist an inbound event, then enqueue processing.
    ///
    /// The insert uses the checksum uniqueness constraint as the idempotency
    /// gate: `ON CONFLICT DO NOTHING RETURNING id` returns no row for a
    /// redelivery, in which case nothing is enqueued and the caller responds
    /// success with a dedup marker.
    pub async fn ingest(
        &self,
        body: &Value,
        headers: &Value,
        header_checksum: Option<&str>,
        events_secret: &str,
    ) -> BillingResult<IngestOutcome> {
        let event = InboundEvent::parse(body)?;

        let checksum = signature::verify(
            &event.data,
            &event.signature,
            event.timestamp,
            events_secret,
            header_checksum,
        )?;

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (provider, event_name, checksum, payload, headers, provider_timestamp)
            VALUES ('processor', $1, $2, $3, $4, $5)
            ON CONFLICT (checksum) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&event.event)
        .bind(&checksum)
        .bind(body)
        .bind(headers)
        .bind(event.timestamp)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let Some((event_id,)) = inserted else {
            tracing::info!(
                checksum = %checksum,
                event_name = %event.event,
                "Duplicate webhook delivery, acknowledged without side effects"
            );
            return Ok(IngestOutcome::Duplicate);
        };

        self.queue
            .enqueue(
                kind::PROCESS_PAYMENT_EVENT,
                serde_json::json!({ "webhook_event_id": event_id }),
            )
            .await?;

        tracing::info!(
            webhook_event_id = %event_id,
            event_name = %event.event,
            "Webhook event persisted and queued for processing"
        );

        Ok(IngestOutcome::Accepted { event_id })
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Option<WebhookEventRecord>> {
        let record: Option<WebhookEventRecord> =
            sqlx::query_as("SELECT * FROM webhook_events WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(record)
    }

    pub async fn list_recent(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let records: Vec<WebhookEventRecord> =
            sqlx::query_as("SELECT * FROM webhook_events ORDER BY received_at DESC LIMIT $1")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(records)
    }

    /// Event counts grouped by status, for the daily operations report.
    pub async fn status_counts(&self) -> BillingResult<Vec<(String, i64)>> {
        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM webhook_events GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(counts)
    }

    /// Delete events older than `days`. Worker maintenance.
    pub async fn purge_old(&self, days: i64) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_events
            WHERE received_at < NOW() - ($1 || ' days')::INTERVAL
              AND status <> 'RECEIVED'
            "#,
        )
        .bind(days.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_accepts_wellformed_body() {
        let body = json!({
            "event": "transaction.updated",
            "data": {"transaction": {"id": "t1"}},
            "signature": {"checksum": "abc", "properties": ["transaction.id"]},
            "timestamp": 1700000000
        });
        let event = InboundEvent::parse(&body).unwrap();
        assert_eq!(event.event, "transaction.updated");
        assert_eq!(event.timestamp, 1700000000);
        assert_eq!(event.signature.properties, vec!["transaction.id"]);
    }

    #[test]
    fn parse_rejects_missing_fields() {
        let body = json!({"event": "transaction.updated"});
        let err = InboundEvent::parse(&body).unwrap_err();
        assert!(matches!(err, BillingError::InvalidPayload(_)));

        let body = json!({
            "event": "x",
            "data": {},
            "signature": {"checksum": "abc"},
            "timestamp": 1
        });
        assert!(InboundEvent::parse(&body).is_err());
    }
}
