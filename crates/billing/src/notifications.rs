//! Customer notification scheduling, dispatch guards, and template
//! rendering.
//!
//! Scheduling is cheap and optimistic: every enabled rule fans out one
//! delayed job per minute-offset. Correctness lives at dispatch time, where
//! the current subscription state decides whether the reminder still
//! applies. A reminder scheduled for a cycle that has since been paid or
//! advanced is dropped, not sent.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::charges::ChargeService;
use crate::error::{BillingError, BillingResult};
use crate::jobs::{kind, JobQueue};
use crate::payments::{PaymentRecord, PaymentStore};
use crate::subscriptions::{BillingContext, SubscriptionRecord, SubscriptionService};

const DEDUP_WINDOW_DAYS: i64 = 7;

/// What caused a batch of reminders to be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    SubscriptionDue,
    PaymentApproved,
    PaymentDeclined,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionDue => "subscription_due",
            Self::PaymentApproved => "payment_approved",
            Self::PaymentDeclined => "payment_declined",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "subscription_due" => Some(Self::SubscriptionDue),
            "payment_approved" => Some(Self::PaymentApproved),
            "payment_declined" => Some(Self::PaymentDeclined),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReminderRule {
    pub id: Uuid,
    pub trigger_kind: String,
    pub offsets_minutes: Vec<i32>,
    pub template: String,
    pub require_status_in: Option<Vec<String>>,
    pub skip_status_in: Option<Vec<String>>,
    pub ensure_payment_link: bool,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
}

/// Job payload for a scheduled reminder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderPayload {
    pub rule_id: Uuid,
    pub subscription_id: Uuid,
    pub cycle: i32,
    /// Anchor the offsets were computed from, pinned at schedule time.
    pub anchor: String,
    pub trigger: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Created { message_id: Uuid },
    Dropped(&'static str),
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChatwootMessageRecord {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub payment_id: Option<Uuid>,
    pub message_type: String,
    pub status: String,
    pub content: String,
    pub provider_response: Option<Value>,
    pub created_at: OffsetDateTime,
    pub sent_at: Option<OffsetDateTime>,
}

#[derive(Clone)]
pub struct NotificationScheduler {
    pool: PgPool,
    queue: JobQueue,
    payments: PaymentStore,
    subscriptions: SubscriptionService,
}

impl NotificationScheduler {
    pub fn new(
        pool: PgPool,
        queue: JobQueue,
        payments: PaymentStore,
        subscriptions: SubscriptionService,
    ) -> Self {
        Self {
            pool,
            queue,
            payments,
            subscriptions,
        }
    }

    /// Fan out reminder jobs for every enabled rule matching the trigger.
    /// Returns how many jobs were enqueued.
    pub async fn schedule(
        &self,
        trigger: Trigger,
        ctx: &BillingContext,
        payment: Option<&PaymentRecord>,
    ) -> BillingResult<u32> {
        let rules: Vec<ReminderRule> = sqlx::query_as(
            "SELECT * FROM notification_rules WHERE trigger_kind = $1 AND enabled",
        )
        .bind(trigger.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let anchor = match trigger {
            Trigger::SubscriptionDue => ctx.subscription.current_period_end_at,
            Trigger::PaymentApproved | Trigger::PaymentDeclined => OffsetDateTime::now_utc(),
        };
        let anchor_iso = anchor
            .format(&Rfc3339)
            .map_err(|e| BillingError::Configuration(e.to_string()))?;
        let cycle = payment
            .map(|p| p.cycle_number)
            .unwrap_or(ctx.subscription.current_cycle);

        let mut enqueued = 0u32;
        for rule in &rules {
            let payload = ReminderPayload {
                rule_id: rule.id,
                subscription_id: ctx.subscription.id,
                cycle,
                anchor: anchor_iso.clone(),
                trigger: trigger.as_str().to_string(),
            };
            let payload = serde_json::to_value(&payload)
                .map_err(|e| BillingError::InvalidPayload(e.to_string()))?;

            for offset in &rule.offsets_minutes {
                let run_at = anchor + Duration::minutes(*offset as i64);
                self.queue
                    .enqueue_at(
                        kind::SUBSCRIPTION_REMINDER,
                        payload.clone(),
                        run_at,
                        crate::jobs::DEFAULT_MAX_ATTEMPTS,
                    )
                    .await?;
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            tracing::info!(
                subscription_id = %ctx.subscription.id,
                trigger = trigger.as_str(),
                jobs = enqueued,
                "Reminder jobs scheduled"
            );
        }
        Ok(enqueued)
    }

    /// Dispatch one scheduled reminder, re-checking every condition against
    /// current state. Guard failures drop the reminder successfully.
    pub async fn dispatch(
        &self,
        payload: &ReminderPayload,
        charges: &ChargeService,
    ) -> BillingResult<DispatchOutcome> {
        let Some(rule) = self.rule(payload.rule_id).await? else {
            return Ok(DispatchOutcome::Dropped("rule deleted"));
        };
        if !rule.enabled {
            return Ok(DispatchOutcome::Dropped("rule disabled"));
        }

        let ctx = self
            .subscriptions
            .billing_context(payload.subscription_id)
            .await?;

        // Approved reminders celebrate a payment, so a paid cycle never
        // disqualifies them; everything else checks for one.
        let cycle_paid = if payload.trigger == Trigger::PaymentApproved.as_str() {
            false
        } else {
            self.payments
                .approved_exists(payload.subscription_id, payload.cycle)
                .await?
        };

        if let Some(reason) = reminder_guard(&ctx.subscription, &rule, payload, cycle_paid) {
            return Ok(DispatchOutcome::Dropped(reason));
        }

        // Make sure there is something to pay against before reminding.
        if rule.ensure_payment_link {
            charges
                .ensure_payment_link(payload.subscription_id, payload.cycle)
                .await?;
        }

        let payment = self
            .payments
            .find_by_cycle_key(&crate::payments::subscription_cycle_key(
                payload.subscription_id,
                payload.cycle,
            ))
            .await?;

        let content = render_template(&rule.template, &ctx, payment.as_ref());

        if self
            .is_duplicate(ctx.customer.id, &rule.trigger_kind, &content)
            .await?
        {
            return Ok(DispatchOutcome::Dropped("duplicate within window"));
        }

        let message_id = self
            .create_message(
                ctx.customer.id,
                Some(payload.subscription_id),
                payment.as_ref().map(|p| p.id),
                &rule.trigger_kind,
                &content,
            )
            .await?;

        self.queue
            .enqueue(kind::SEND_MESSAGE, json!({ "message_id": message_id }))
            .await?;

        tracing::info!(
            message_id = %message_id,
            customer_id = %ctx.customer.id,
            rule_id = %rule.id,
            "Notification created and queued for sending"
        );

        Ok(DispatchOutcome::Created { message_id })
    }

    async fn rule(&self, id: Uuid) -> BillingResult<Option<ReminderRule>> {
        let rule: Option<ReminderRule> =
            sqlx::query_as("SELECT * FROM notification_rules WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(rule)
    }

    /// Same customer, same message type, same rendered content within the
    /// window means the customer already heard this.
    async fn is_duplicate(
        &self,
        customer_id: Uuid,
        message_type: &str,
        content: &str,
    ) -> BillingResult<bool> {
        let existing: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM chatwoot_messages
            WHERE customer_id = $1 AND message_type = $2 AND content = $3
              AND created_at > NOW() - ($4 || ' days')::INTERVAL
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .bind(message_type)
        .bind(content)
        .bind(DEDUP_WINDOW_DAYS.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(existing.is_some())
    }

    async fn create_message(
        &self,
        customer_id: Uuid,
        subscription_id: Option<Uuid>,
        payment_id: Option<Uuid>,
        message_type: &str,
        content: &str,
    ) -> BillingResult<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO chatwoot_messages
                (customer_id, subscription_id, payment_id, message_type, content)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(customer_id)
        .bind(subscription_id)
        .bind(payment_id)
        .bind(message_type)
        .bind(content)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(id)
    }

    pub async fn get_message(&self, id: Uuid) -> BillingResult<Option<ChatwootMessageRecord>> {
        let message: Option<ChatwootMessageRecord> =
            sqlx::query_as("SELECT * FROM chatwoot_messages WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(message)
    }

    pub async fn list_messages(&self, limit: i64) -> BillingResult<Vec<ChatwootMessageRecord>> {
        let messages: Vec<ChatwootMessageRecord> =
            sqlx::query_as("SELECT * FROM chatwoot_messages ORDER BY created_at DESC LIMIT $1")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(messages)
    }

    pub async fn mark_message_sent(
        &self,
        id: Uuid,
        provider_response: &Value,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE chatwoot_messages
            SET status = 'SENT', provider_response = $2, sent_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(provider_response)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn mark_message_failed(&self, id: Uuid, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE chatwoot_messages
            SET status = 'FAILED', provider_response = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(json!({ "error": error }))
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }
}

/// Decide whether a scheduled reminder still applies against current state.
/// Returns the drop reason, or `None` when the reminder should go out.
///
/// Checks, in order: the subscription is still on the scheduled cycle, a
/// due-date reminder's anchor has not moved (replan reschedules, it does not
/// redeliver), the cycle has not been paid in the meantime, and the rule's
/// status conditions hold.
pub fn reminder_guard(
    subscription: &SubscriptionRecord,
    rule: &ReminderRule,
    payload: &ReminderPayload,
    cycle_paid: bool,
) -> Option<&'static str> {
    if subscription.current_cycle != payload.cycle {
        return Some("cycle advanced");
    }
    if payload.trigger == Trigger::SubscriptionDue.as_str() {
        let current_anchor = subscription
            .current_period_end_at
            .format(&Rfc3339)
            .unwrap_or_default();
        if current_anchor != payload.anchor {
            return Some("anchor changed");
        }
    }
    if cycle_paid {
        return Some("cycle already paid");
    }
    let status = &subscription.status;
    if let Some(required) = &rule.require_status_in {
        if !required.iter().any(|s| s == status) {
            return Some("status not in required set");
        }
    }
    if let Some(skipped) = &rule.skip_status_in {
        if skipped.iter().any(|s| s == status) {
            return Some("status in skip set");
        }
    }
    None
}

/// Substitute `{{path.to.field}}` placeholders against the billing context.
/// Unknown paths render as empty strings, dates as ISO-8601.
pub fn render_template(
    template: &str,
    ctx: &BillingContext,
    payment: Option<&PaymentRecord>,
) -> String {
    let data = template_data(ctx, payment);
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let path = after[..end].trim();
                out.push_str(&render_value(lookup(&data, path)));
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated placeholder, emit literally.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn template_data(ctx: &BillingContext, payment: Option<&PaymentRecord>) -> Value {
    let iso = |t: OffsetDateTime| t.format(&Rfc3339).unwrap_or_default();
    json!({
        "customer": {
            "name": ctx.customer.name,
            "email": ctx.customer.email,
            "phone": ctx.customer.phone,
        },
        "subscription": {
            "id": ctx.subscription.id.to_string(),
            "status": ctx.subscription.status,
            "current_cycle": ctx.subscription.current_cycle,
            "current_period_start_at": iso(ctx.subscription.current_period_start_at),
            "current_period_end_at": iso(ctx.subscription.current_period_end_at),
        },
        "plan": {
            "name": ctx.plan.name,
            "amount_in_cents": ctx.plan.amount_in_cents,
            "currency": ctx.plan.currency,
        },
        "payment": payment.map(|p| json!({
            "amount_in_cents": p.amount_in_cents,
            "currency": p.currency,
            "status": p.status,
            "cycle": p.cycle_number,
            "checkout_url": p.checkout_url,
        })).unwrap_or(Value::Null),
    })
}

fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn render_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::{CustomerRecord, PlanRecord, SubscriptionRecord};
    use time::macros::datetime;

    fn context() -> BillingContext {
        BillingContext {
            subscription: SubscriptionRecord {
                id: Uuid::nil(),
                customer_id: Uuid::nil(),
                plan_id: Uuid::nil(),
                status: "ACTIVE".into(),
                current_cycle: 3,
                current_period_start_at: datetime!(2024-01-01 00:00 UTC),
                current_period_end_at: datetime!(2024-02-01 00:00 UTC),
                canceled_at: None,
                created_at: datetime!(2024-01-01 00:00 UTC),
                updated_at: datetime!(2024-01-01 00:00 UTC),
            },
            customer: CustomerRecord {
                id: Uuid::nil(),
                name: "Ana Gomez".into(),
                email: Some("ana@example.com".into()),
                phone: None,
                extensions: json!({}),
                created_at: datetime!(2024-01-01 00:00 UTC),
                updated_at: datetime!(2024-01-01 00:00 UTC),
            },
            plan: PlanRecord {
                id: Uuid::nil(),
                name: "Pro Monthly".into(),
                amount_in_cents: 5_990_000,
                currency: "COP".into(),
                interval_unit: "month".into(),
                interval_count: 1,
                collection_mode: "manual_link".into(),
                extensions: json!({}),
                created_at: datetime!(2024-01-01 00:00 UTC),
            },
        }
    }

    #[test]
    fn renders_nested_paths() {
        let out = render_template(
            "Hola {{customer.name}}, tu plan {{plan.name}} vence el {{subscription.current_period_end_at}}.",
            &context(),
            None,
        );
        assert_eq!(
            out,
            "Hola Ana Gomez, tu plan Pro Monthly vence el 2024-02-01T00:00:00Z."
        );
    }

    #[test]
    fn missing_paths_render_empty() {
        let out = render_template(
            "x{{customer.missing}}y{{payment.checkout_url}}z",
            &context(),
            None,
        );
        assert_eq!(out, "xyz");
    }

    #[test]
    fn numbers_and_unterminated_braces() {
        let out = render_template("cycle {{subscription.current_cycle}} {{oops", &context(), None);
        assert_eq!(out, "cycle 3 {{oops");
    }

    #[test]
    fn trigger_roundtrip() {
        for t in [
            Trigger::SubscriptionDue,
            Trigger::PaymentApproved,
            Trigger::PaymentDeclined,
        ] {
            assert_eq!(Trigger::parse(t.as_str()), Some(t));
        }
        assert_eq!(Trigger::parse("nope"), None);
    }
}
