//! Payment event processing.
//!
//! Reconciles a persisted webhook event against subscription and payment
//! state. Re-entry is idempotent: a PROCESSED event is a no-op, and payment
//! upserts are keyed so redelivery and out-of-order processing cannot
//! double-apply. Forwarded external orders never touch our billing state.

use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use billflow_shared::types::{PaymentStatus, WebhookStatus};

use crate::error::{BillingError, BillingResult};
use crate::jobs::{kind, JobQueue};
use crate::notifications::{NotificationScheduler, Trigger};
use crate::payments::PaymentStore;
use crate::reference::PaymentReference;
use crate::subscriptions::SubscriptionService;
use crate::webhooks::WebhookEventRecord;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(15);

/// Forward target for external storefront orders, if one is configured.
#[derive(Debug, Clone)]
pub struct ForwardTarget {
    pub url: String,
    pub auth_token: String,
}

impl ForwardTarget {
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("ORDER_FORWARD_URL").ok().filter(|v| !v.is_empty())?;
        let auth_token = std::env::var("ORDER_FORWARD_TOKEN").unwrap_or_default();
        Some(Self { url, auth_token })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed,
    AlreadyProcessed,
    Skipped(&'static str),
}

#[derive(Clone)]
pub struct PaymentEventProcessor {
    pool: PgPool,
    payments: PaymentStore,
    subscriptions: SubscriptionService,
    scheduler: NotificationScheduler,
    queue: JobQueue,
    forward: Option<ForwardTarget>,
    http: reqwest::Client,
}

impl PaymentEventProcessor {
    pub fn new(
        pool: PgPool,
        payments: PaymentStore,
        subscriptions: SubscriptionService,
        scheduler: NotificationScheduler,
        queue: JobQueue,
        forward: Option<ForwardTarget>,
    ) -> Self {
        Self {
            pool,
            payments,
            subscriptions,
            scheduler,
            queue,
            forward,
            http: reqwest::Client::new(),
        }
    }

    /// Process one persisted webhook event by id.
    pub async fn process(&self, webhook_event_id: Uuid) -> BillingResult<ProcessOutcome> {
        let event = self
            .load_event(webhook_event_id)
            .await?
            .ok_or_else(|| {
                // The row is inserted before the job is enqueued, so a
                // missing row will not appear on retry.
                BillingError::Precondition(format!(
                    "webhook event {} not found",
                    webhook_event_id
                ))
            })?;

        if event.status == WebhookStatus::Processed.as_str() {
            tracing::debug!(webhook_event_id = %event.id, "Event already processed, skipping");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        let Some(transaction) = event.payload.pointer("/data/transaction") else {
            self.mark_event(
                event.id,
                WebhookStatus::Failed,
                Some("payload missing data.transaction"),
            )
            .await?;
            return Err(BillingError::Precondition(
                "payload missing data.transaction".into(),
            ));
        };

        let reference = transaction
            .pointer("/reference")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        match PaymentReference::classify(reference) {
            PaymentReference::ExternalOrder { .. } => {
                // Not our subscription; hand the raw payload to the forward
                // queue when a target exists and keep billing state untouched.
                if self.forward.is_some() {
                    self.queue
                        .enqueue(
                            kind::FORWARD_ORDER,
                            serde_json::json!({ "webhook_event_id": event.id }),
                        )
                        .await?;
                    self.mark_event(event.id, WebhookStatus::Skipped, None).await?;
                    tracing::info!(
                        webhook_event_id = %event.id,
                        reference = reference,
                        "External order queued for forwarding"
                    );
                    return Ok(ProcessOutcome::Skipped("forwarded external order"));
                }
                self.mark_event(event.id, WebhookStatus::Skipped, None).await?;
                return Ok(ProcessOutcome::Skipped("external order, no forward target"));
            }
            PaymentReference::Unknown => {
                self.mark_event(event.id, WebhookStatus::Skipped, None).await?;
                tracing::info!(
                    webhook_event_id = %event.id,
                    reference = reference,
                    "Unrecognized reference, event skipped"
                );
                return Ok(ProcessOutcome::Skipped("unrecognized reference"));
            }
            PaymentReference::Subscription {
                subscription_id,
                cycle,
            } => {
                self.reconcile_subscription_payment(&event, transaction, subscription_id, cycle)
                    .await
            }
        }
    }

    async fn reconcile_subscription_payment(
        &self,
        event: &WebhookEventRecord,
        transaction: &Value,
        subscription_id: Uuid,
        cycle: Option<i64>,
    ) -> BillingResult<ProcessOutcome> {
        let Some(subscription) = self.subscriptions.get(subscription_id).await? else {
            let message = format!("subscription {} not found", subscription_id);
            self.mark_event(event.id, WebhookStatus::Failed, Some(&message))
                .await?;
            // Left retryable: out-of-order delivery can land the webhook
            // before the subscription row; max_attempts bounds the waste.
            return Err(BillingError::NotFound(message));
        };

        let provider_status = transaction
            .pointer("/status")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let status = PaymentStatus::from_processor(provider_status);

        let amount_in_cents = transaction
            .pointer("/amount_in_cents")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let currency = transaction
            .pointer("/currency")
            .and_then(|v| v.as_str())
            .unwrap_or("COP");
        let transaction_id = transaction.pointer("/id").and_then(|v| v.as_str());

        // References minted by the billing service always carry the cycle;
        // hand-built ones fall back to the live cycle at processing time.
        let cycle = match resolve_cycle(cycle, subscription.current_cycle) {
            Ok(cycle) => cycle,
            Err(e) => {
                self.mark_event(event.id, WebhookStatus::Failed, Some(&e.to_string()))
                    .await?;
                return Err(e);
            }
        };

        if transaction_id.is_none() {
            // Documented limitation: without a transaction id the only dedup
            // key is the cycle itself.
            tracing::warn!(
                webhook_event_id = %event.id,
                subscription_id = %subscription_id,
                "Transaction without id, deduplicating by cycle key only"
            );
        }

        let payment = self
            .payments
            .reconcile_transaction(
                subscription_id,
                cycle,
                amount_in_cents,
                currency,
                status,
                transaction_id,
                transaction,
            )
            .await?;

        match status {
            PaymentStatus::Approved => {
                self.subscriptions
                    .advance_cycle(subscription_id, cycle)
                    .await?;
                let ctx = self.subscriptions.billing_context(subscription_id).await?;
                self.scheduler
                    .schedule(Trigger::PaymentApproved, &ctx, Some(&payment))
                    .await?;
            }
            PaymentStatus::Declined => {
                self.subscriptions.mark_past_due(subscription_id).await?;
                let ctx = self.subscriptions.billing_context(subscription_id).await?;
                self.scheduler
                    .schedule(Trigger::PaymentDeclined, &ctx, Some(&payment))
                    .await?;
            }
            _ => {}
        }

        self.mark_event(event.id, WebhookStatus::Processed, None).await?;

        tracing::info!(
            webhook_event_id = %event.id,
            subscription_id = %subscription_id,
            cycle = cycle,
            payment_id = %payment.id,
            status = %payment.status,
            "Payment event reconciled"
        );

        Ok(ProcessOutcome::Processed)
    }

    /// Forward a stored external-order payload to the configured target.
    /// Non-2xx responses fail the job so the queue retries with backoff.
    pub async fn forward_order(&self, webhook_event_id: Uuid) -> BillingResult<()> {
        let target = self.forward.as_ref().ok_or_else(|| {
            BillingError::Configuration("order forwarding is not configured".into())
        })?;

        let event = self
            .load_event(webhook_event_id)
            .await?
            .ok_or_else(|| {
                BillingError::Precondition(format!("webhook event {} not found", webhook_event_id))
            })?;

        let response = self
            .http
            .post(&target.url)
            .bearer_auth(&target.auth_token)
            .timeout(FORWARD_TIMEOUT)
            .json(&event.payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(BillingError::ProcessorApi(format!(
                "forward target returned {}",
                status
            )));
        }

        tracing::info!(
            webhook_event_id = %webhook_event_id,
            target = %target.url,
            "External order forwarded"
        );
        Ok(())
    }

    async fn load_event(&self, id: Uuid) -> BillingResult<Option<WebhookEventRecord>> {
        let event: Option<WebhookEventRecord> =
            sqlx::query_as("SELECT * FROM webhook_events WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(event)
    }

    async fn mark_event(
        &self,
        id: Uuid,
        status: WebhookStatus,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, error_message = $3,
                processed_at = CASE WHEN $2 = 'PROCESSED' THEN NOW() ELSE processed_at END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }
}

/// Narrow a reference-supplied cycle to the storage width, falling back to
/// the subscription's live cycle when the reference carried none.
/// Out-of-range cycles fail terminally instead of wrapping into a bogus
/// cycle key.
fn resolve_cycle(reference_cycle: Option<i64>, current_cycle: i32) -> BillingResult<i32> {
    let Some(cycle) = reference_cycle else {
        return Ok(current_cycle);
    };
    i32::try_from(cycle)
        .ok()
        .filter(|c| *c >= 0)
        .ok_or_else(|| BillingError::Precondition(format!("cycle {} out of range", cycle)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_falls_back_to_live_cycle() {
        assert_eq!(resolve_cycle(None, 7).unwrap(), 7);
        assert_eq!(resolve_cycle(Some(12), 7).unwrap(), 12);
        assert_eq!(resolve_cycle(Some(0), 7).unwrap(), 0);
    }

    #[test]
    fn out_of_range_cycles_are_rejected() {
        let err = resolve_cycle(Some(i64::from(i32::MAX) + 1), 7).unwrap_err();
        assert!(matches!(err, BillingError::Precondition(_)));
        assert!(resolve_cycle(Some(-1), 7).is_err());
        assert!(resolve_cycle(Some(i64::MAX), 7).is_err());
        // the widest representable cycle still passes
        assert_eq!(resolve_cycle(Some(i64::from(i32::MAX)), 7).unwrap(), i32::MAX);
    }
}
