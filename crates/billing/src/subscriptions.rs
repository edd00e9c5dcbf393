//! Subscription state and cycle management.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use billflow_shared::types::{ExtensionMap, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};
use crate::period::{add_interval, IntervalUnit};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    pub current_cycle: i32,
    pub current_period_start_at: OffsetDateTime,
    pub current_period_end_at: OffsetDateTime,
    pub canceled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    pub fn status(&self) -> Option<SubscriptionStatus> {
        SubscriptionStatus::parse(&self.status)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CustomerRecord {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub extensions: serde_json::Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl CustomerRecord {
    pub fn extensions(&self) -> ExtensionMap {
        serde_json::from_value(self.extensions.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanRecord {
    pub id: Uuid,
    pub name: String,
    pub amount_in_cents: i64,
    pub currency: String,
    pub interval_unit: String,
    pub interval_count: i32,
    pub collection_mode: String,
    pub extensions: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Everything the billing and notification pipeline needs about one
/// subscription, loaded in one place.
#[derive(Debug, Clone)]
pub struct BillingContext {
    pub subscription: SubscriptionRecord,
    pub customer: CustomerRecord,
    pub plan: PlanRecord,
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let sub: Option<SubscriptionRecord> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(sub)
    }

    /// Load a subscription with its customer and plan.
    pub async fn billing_context(&self, id: Uuid) -> BillingResult<BillingContext> {
        let subscription = self
            .get(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {} not found", id)))?;

        let customer: CustomerRecord = sqlx::query_as("SELECT * FROM customers WHERE id = $1")
            .bind(subscription.customer_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let plan: PlanRecord = sqlx::query_as("SELECT * FROM plans WHERE id = $1")
            .bind(subscription.plan_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(BillingContext {
            subscription,
            customer,
            plan,
        })
    }

    /// Advance a subscription to its next billing cycle after an approved
    /// payment. The new period starts where the old one ended; the cycle
    /// counter only moves forward, and only from the cycle just paid, so a
    /// redelivered approval for an already-advanced cycle is a no-op.
    pub async fn advance_cycle(&self, id: Uuid, paid_cycle: i32) -> BillingResult<bool> {
        let ctx = self.billing_context(id).await?;
        let plan = &ctx.plan;
        let sub = &ctx.subscription;

        if sub.current_cycle != paid_cycle {
            tracing::debug!(
                subscription_id = %id,
                current_cycle = sub.current_cycle,
                paid_cycle = paid_cycle,
                "Cycle already advanced, skipping"
            );
            return Ok(false);
        }

        let unit = IntervalUnit::parse(&plan.interval_unit).ok_or_else(|| {
            BillingError::Configuration(format!("unknown interval unit {}", plan.interval_unit))
        })?;
        let next_end = add_interval(sub.current_period_end_at, unit, plan.interval_count as i64);

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET current_cycle = current_cycle + 1,
                current_period_start_at = current_period_end_at,
                current_period_end_at = $2,
                status = 'ACTIVE',
                updated_at = NOW()
            WHERE id = $1 AND current_cycle = $3
            "#,
        )
        .bind(id)
        .bind(next_end)
        .bind(paid_cycle)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let advanced = result.rows_affected() > 0;
        if advanced {
            tracing::info!(
                subscription_id = %id,
                new_cycle = paid_cycle + 1,
                period_end = %next_end,
                "Subscription advanced to next cycle"
            );
        }
        Ok(advanced)
    }

    /// Mark a subscription past due after a declined payment. Terminal
    /// statuses are left alone.
    pub async fn mark_past_due(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'PAST_DUE', updated_at = NOW()
            WHERE id = $1 AND status IN ('ACTIVE', 'PAST_DUE')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn cancel(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'CANCELED', canceled_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('CANCELED', 'EXPIRED')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }
}
