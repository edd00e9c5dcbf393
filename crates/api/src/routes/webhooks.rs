//! Inbound webhook endpoints.
//!
//! Payment events acknowledge with 200 only after the event is durably
//! recorded; everything downstream happens through the job queue. The
//! messaging webhook always answers 200 so the provider never retries.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Map, Value};

use billflow_billing::IngestOutcome;

use crate::error::ApiError;
use crate::state::AppState;

const CHECKSUM_HEADER: &str = "x-event-checksum";
const MESSAGING_SECRET_HEADER: &str = "x-webhook-secret";

fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            // Never persist credentials delivered in headers.
            if name == axum::http::header::AUTHORIZATION {
                continue;
            }
            map.insert(name.as_str().to_string(), json!(v));
        }
    }
    Value::Object(map)
}

fn source_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn payment_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    // Advisory only: an over-limit source is logged, never refused, because
    // a dropped payment webhook costs more than the extra processing.
    let rate = state
        .rate_limiter
        .check(
            &format!("payment-events:{}", source_key(&headers)),
            state.config.webhook_rate_limit,
        )
        .await;
    if !rate.allowed {
        tracing::warn!(
            source = %source_key(&headers),
            "Payment webhook source exceeded the advisory rate limit"
        );
    }

    let header_checksum = headers.get(CHECKSUM_HEADER).and_then(|v| v.to_str().ok());

    let events_secret = state
        .billing
        .client
        .events_secret()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    let outcome = state
        .billing
        .webhooks
        .ingest(&body, &headers_to_json(&headers), header_checksum, &events_secret)
        .await?;

    let response = match outcome {
        IngestOutcome::Accepted { .. } => json!({ "ok": true }),
        IngestOutcome::Duplicate => json!({ "ok": true, "deduped": true }),
    };
    Ok(Json(response))
}

#[derive(Debug, serde::Deserialize)]
pub struct MessagingQuery {
    secret: Option<String>,
}

/// Inbound events from the messaging provider. Always 200: this webhook is
/// best-effort enrichment, and a non-2xx would only make the provider
/// hammer us with retries.
pub async fn messaging(
    State(state): State<AppState>,
    Query(query): Query<MessagingQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    if let Some(expected) = &state.config.messaging_webhook_secret {
        let provided = headers
            .get(MESSAGING_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .or_else(|| {
                headers
                    .get(axum::http::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
            })
            .or(query.secret.as_deref());

        if provided != Some(expected.as_str()) {
            tracing::warn!("Messaging webhook with missing or wrong secret, ignored");
            return Json(json!({ "ok": true }));
        }
    }

    if let Err(e) = link_contact(&state, &body).await {
        tracing::warn!(error = %e, "Messaging webhook contact link failed, ignored");
    }

    Json(json!({ "ok": true }))
}

/// Attach the provider's contact id to the matching customer, when the
/// payload carries enough to match on.
async fn link_contact(state: &AppState, body: &Value) -> anyhow::Result<()> {
    let contact = body.get("contact").unwrap_or(body);
    let Some(contact_id) = contact.get("id").and_then(|v| v.as_i64()) else {
        return Ok(());
    };
    let Some(email) = contact
        .get("email")
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
    else {
        return Ok(());
    };

    let updated = sqlx::query(
        r#"
        UPDATE customers
        SET extensions = jsonb_set(extensions, '{chatwoot_contact_id}', to_jsonb($2::TEXT), TRUE),
            updated_at = NOW()
        WHERE email = $1
        "#,
    )
    .bind(email)
    .bind(contact_id.to_string())
    .execute(&state.pool)
    .await?;

    if updated.rows_affected() > 0 {
        tracing::info!(
            email = email,
            contact_id = contact_id,
            "Messaging contact linked to customer"
        );
    }
    Ok(())
}
