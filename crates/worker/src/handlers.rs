//! Job dispatch: one handler per job kind.
//!
//! Handlers return the billing error unchanged; the loop in `main` maps
//! `is_retryable()` onto the queue's backoff-or-fail decision. A payload
//! that doesn't parse is a non-retryable precondition because retrying
//! cannot fix stored bytes.

use billflow_billing::{
    jobs::kind, BillingError, BillingResult, BillingService, CustomerRecord, JobRecord,
    ReminderPayload,
};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

pub async fn dispatch(
    billing: &BillingService,
    pool: &PgPool,
    job: &JobRecord,
) -> BillingResult<()> {
    match job.kind.as_str() {
        kind::PROCESS_PAYMENT_EVENT => {
            let event_id = payload_uuid(&job.payload, "webhook_event_id")?;
            billing.processor_events.process(event_id).await?;
            Ok(())
        }
        kind::FORWARD_ORDER => {
            let event_id = payload_uuid(&job.payload, "webhook_event_id")?;
            billing.processor_events.forward_order(event_id).await
        }
        kind::AUTO_DEBIT => {
            let subscription_id = payload_uuid(&job.payload, "subscription_id")?;
            billing.charges.auto_debit(subscription_id).await?;
            Ok(())
        }
        kind::SUBSCRIPTION_REMINDER => {
            let payload: ReminderPayload = serde_json::from_value(job.payload.clone())
                .map_err(|e| BillingError::Precondition(format!("bad reminder payload: {}", e)))?;
            billing
                .notifications
                .dispatch(&payload, &billing.charges)
                .await?;
            Ok(())
        }
        kind::SEND_MESSAGE => {
            let message_id = payload_uuid(&job.payload, "message_id")?;
            send_message(billing, pool, message_id).await
        }
        other => Err(BillingError::Precondition(format!(
            "unknown job kind {}",
            other
        ))),
    }
}

async fn send_message(
    billing: &BillingService,
    pool: &PgPool,
    message_id: Uuid,
) -> BillingResult<()> {
    let Some(chatwoot) = &billing.chatwoot else {
        return Err(BillingError::Configuration(
            "chatwoot is not configured".into(),
        ));
    };

    let message = billing
        .notifications
        .get_message(message_id)
        .await?
        .ok_or_else(|| {
            BillingError::Precondition(format!("message {} not found", message_id))
        })?;

    // Redelivered job after a crash between send and status update.
    if message.status == "SENT" {
        tracing::debug!(message_id = %message_id, "Message already sent, skipping");
        return Ok(());
    }

    let customer: CustomerRecord = sqlx::query_as("SELECT * FROM customers WHERE id = $1")
        .bind(message.customer_id)
        .fetch_one(pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

    match chatwoot.deliver(&customer, &message.content).await {
        Ok(response) => {
            billing
                .notifications
                .mark_message_sent(message_id, &response)
                .await
        }
        Err(e) => {
            billing
                .notifications
                .mark_message_failed(message_id, &e.to_string())
                .await?;
            Err(e)
        }
    }
}

fn payload_uuid(payload: &Value, field: &str) -> BillingResult<Uuid> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| {
            BillingError::Precondition(format!("payload missing uuid field {}", field))
        })
}
