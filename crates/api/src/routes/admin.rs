//! Admin surface: operational visibility and manual interventions.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use billflow_billing::{
    ChatwootMessageRecord, JobRecord, PaymentRecord, SegmentRule, WebhookEventRecord,
};

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    limit: Option<i64>,
}

impl ListQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
    }
}

fn iso(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_default()
}

fn iso_opt(t: Option<OffsetDateTime>) -> Option<String> {
    t.map(iso)
}

pub async fn create_payment_link(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let link = state.billing.charges.create_manual_link(id).await?;
    Ok(Json(json!({
        "payment_id": link.payment_id,
        "link_id": link.link_id,
        "checkout_url": link.checkout_url,
        "cycle": link.cycle,
        "reused": link.reused,
    })))
}

pub async fn retry_failed_jobs(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let reset = state.billing.jobs.retry_all_failed().await?;
    Ok(Json(json!({ "reset": reset })))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let jobs = state.billing.jobs.list_recent(query.limit()).await?;
    Ok(Json(json!({
        "jobs": jobs.iter().map(job_json).collect::<Vec<_>>()
    })))
}

pub async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let payments = state.billing.payments.list_recent(query.limit()).await?;
    Ok(Json(json!({
        "payments": payments.iter().map(payment_json).collect::<Vec<_>>()
    })))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let messages = state
        .billing
        .notifications
        .list_messages(query.limit())
        .await?;
    Ok(Json(json!({
        "messages": messages.iter().map(message_json).collect::<Vec<_>>()
    })))
}

pub async fn list_webhook_events(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let events = state.billing.webhooks.list_recent(query.limit()).await?;
    Ok(Json(json!({
        "events": events.iter().map(webhook_event_json).collect::<Vec<_>>()
    })))
}

pub async fn tenant_usage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let counters = state.billing.metering.tenant_usage(id).await?;
    Ok(Json(json!({ "usage": counters })))
}

#[derive(Debug, Deserialize)]
pub struct ResetUsageQuery {
    service_key: String,
    period_key: String,
}

pub async fn reset_tenant_usage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<ResetUsageQuery>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state
        .billing
        .metering
        .reset_counters(id, &query.service_key, &query.period_key)
        .await?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
pub struct PutCredentialBody {
    value: String,
}

pub async fn put_credential(
    State(state): State<AppState>,
    Path((provider, key)): Path<(String, String)>,
    Json(body): Json<PutCredentialBody>,
) -> Result<Json<Value>, ApiError> {
    if body.value.is_empty() {
        return Err(ApiError::InvalidPayload("value must not be empty".into()));
    }
    state
        .billing
        .credentials
        .set(&provider, &key, &body.value)
        .await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct SegmentPreviewBody {
    rule: SegmentRule,
    context: Value,
}

/// Evaluate a segment rule tree against a sample context without storing
/// anything. Lets operators check a rule before saving it.
pub async fn preview_segment(
    Json(body): Json<SegmentPreviewBody>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!({ "matches": body.rule.evaluate(&body.context) })))
}

// Record views. Raw payloads are included for jobs and webhook events
// because operators debug with them; credential values never appear here.

fn job_json(job: &JobRecord) -> Value {
    json!({
        "id": job.id,
        "kind": job.kind,
        "payload": job.payload,
        "status": job.status,
        "attempts": job.attempts,
        "max_attempts": job.max_attempts,
        "run_at": iso(job.run_at),
        "locked_by": job.locked_by,
        "last_error": job.last_error,
        "created_at": iso(job.created_at),
    })
}

fn payment_json(payment: &PaymentRecord) -> Value {
    json!({
        "id": payment.id,
        "subscription_id": payment.subscription_id,
        "cycle_number": payment.cycle_number,
        "cycle_key": payment.cycle_key,
        "amount_in_cents": payment.amount_in_cents,
        "currency": payment.currency,
        "status": payment.status,
        "processor_transaction_id": payment.processor_transaction_id,
        "checkout_url": payment.checkout_url,
        "created_at": iso(payment.created_at),
        "approved_at": iso_opt(payment.approved_at),
    })
}

fn message_json(message: &ChatwootMessageRecord) -> Value {
    json!({
        "id": message.id,
        "customer_id": message.customer_id,
        "subscription_id": message.subscription_id,
        "message_type": message.message_type,
        "status": message.status,
        "content": message.content,
        "created_at": iso(message.created_at),
        "sent_at": iso_opt(message.sent_at),
    })
}

fn webhook_event_json(event: &WebhookEventRecord) -> Value {
    json!({
        "id": event.id,
        "provider": event.provider,
        "event_name": event.event_name,
        "checksum": event.checksum,
        "status": event.status,
        "error_message": event.error_message,
        "received_at": iso(event.received_at),
        "processed_at": iso_opt(event.processed_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_preview_body_evaluates_stored_rule_shape() {
        let body: SegmentPreviewBody = serde_json::from_value(json!({
            "rule": {
                "op": "and",
                "rules": [
                    {"op": "eq", "field": "plan.currency", "value": "COP"},
                    {"op": "gte", "field": "subscription.current_cycle", "value": 3}
                ]
            },
            "context": {
                "plan": {"currency": "COP"},
                "subscription": {"current_cycle": 4}
            }
        }))
        .unwrap();
        assert!(body.rule.evaluate(&body.context));

        let body: SegmentPreviewBody = serde_json::from_value(json!({
            "rule": {"op": "eq", "field": "plan.currency", "value": "USD"},
            "context": {"plan": {"currency": "COP"}}
        }))
        .unwrap();
        assert!(!body.rule.evaluate(&body.context));
    }

    #[test]
    fn segment_preview_rejects_unknown_ops() {
        let result = serde_json::from_value::<SegmentPreviewBody>(json!({
            "rule": {"op": "regex", "field": "x", "value": "y"},
            "context": {}
        }));
        assert!(result.is_err());
    }

    #[test]
    fn list_query_clamps_limits() {
        let q = ListQuery { limit: None };
        assert_eq!(q.limit(), DEFAULT_LIST_LIMIT);
        let q = ListQuery { limit: Some(0) };
        assert_eq!(q.limit(), 1);
        let q = ListQuery { limit: Some(10_000) };
        assert_eq!(q.limit(), MAX_LIST_LIMIT);
    }
}
