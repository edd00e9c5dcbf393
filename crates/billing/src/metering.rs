//! Usage metering and the billing-block engine.
//!
//! Every consume call leaves an append-only usage event, blocked or not.
//! Counters only move through atomic increments inside the same transaction
//! as the event, so concurrent consumers can never lose updates, and overage
//! is computed from the counter values returned by that increment. Resets
//! are explicit deletes, never decrements.

use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Lifetime counters use a single fixed period key.
pub const PERIOD_TOTAL: &str = "total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodType {
    Month,
    Total,
}

impl PeriodType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "month" => Some(Self::Month),
            "total" => Some(Self::Total),
            _ => None,
        }
    }

    /// Counter key for a point in time: `YYYY-MM` in UTC, or `total`.
    pub fn period_key(&self, at: OffsetDateTime) -> String {
        match self {
            Self::Month => format!("{:04}-{:02}", at.year(), u8::from(at.month())),
            Self::Total => PERIOD_TOTAL.to_string(),
        }
    }
}

/// Per-service limit inside a plan snapshot's `limits` JSONB.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanLimit {
    pub kind: String,
    #[serde(default)]
    pub max_value: i64,
    #[serde(default)]
    pub unit_price_in_cents: i64,
}

/// Outcome of one consume call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageResult {
    pub blocked: bool,
    pub period_key: String,
    pub new_total: i64,
    pub billed_quantity: i64,
    pub billed_amount_in_cents: i64,
}

impl UsageResult {
    fn blocked(period_key: String) -> Self {
        Self {
            blocked: true,
            period_key,
            new_total: 0,
            billed_quantity: 0,
            billed_amount_in_cents: 0,
        }
    }
}

/// Billable quantity for a metered limit when a counter moves from
/// `prev_total` to `new_total` against an included allowance of `max_value`.
/// Only the newly-crossed portion above the allowance is billed, so the
/// same units are never billed twice.
pub fn metered_overage(prev_total: i64, new_total: i64, max_value: i64) -> i64 {
    (new_total - max_value).max(0) - (prev_total - max_value).max(0)
}

#[derive(Clone)]
pub struct MeteringService {
    pool: PgPool,
}

impl MeteringService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record `amount` units of usage for a tenant against a service.
    ///
    /// Throws only for configuration problems (unknown service key,
    /// malformed limit definitions). A disabled module records a blocked
    /// event and touches no counters.
    pub async fn consume(
        &self,
        tenant_id: Uuid,
        service_key: &str,
        amount: i64,
        source: &str,
        meta: &Value,
    ) -> BillingResult<UsageResult> {
        if amount <= 0 {
            return Err(BillingError::Configuration(format!(
                "usage amount must be positive, got {}",
                amount
            )));
        }

        let period_type: Option<(String,)> =
            sqlx::query_as("SELECT period_type FROM service_limits WHERE service_key = $1")
                .bind(service_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        let Some((period_type,)) = period_type else {
            return Err(BillingError::Configuration(format!(
                "unknown service key {}",
                service_key
            )));
        };
        let period_type = PeriodType::parse(&period_type).ok_or_else(|| {
            BillingError::Configuration(format!(
                "service {} has invalid period type {}",
                service_key, period_type
            ))
        })?;
        let period_key = period_type.period_key(OffsetDateTime::now_utc());

        if !self.module_enabled(tenant_id, service_key).await? {
            self.record_event(&self.pool, tenant_id, service_key, amount, source, meta, true)
                .await?;
            tracing::info!(
                tenant_id = %tenant_id,
                service_key = service_key,
                amount = amount,
                "Usage blocked, module disabled for tenant"
            );
            return Ok(UsageResult::blocked(period_key));
        }

        let limit = self.plan_limit(tenant_id, service_key).await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        self.record_event(&mut *tx, tenant_id, service_key, amount, source, meta, false)
            .await?;

        let (new_total,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO usage_counters (tenant_id, service_key, period_key, total)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, service_key, period_key)
            DO UPDATE SET total = usage_counters.total + EXCLUDED.total
            RETURNING total
            "#,
        )
        .bind(tenant_id)
        .bind(service_key)
        .bind(&period_key)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        let prev_total = new_total - amount;

        let (billed_quantity, billed_amount_in_cents) = match &limit {
            None => (0, 0),
            Some(limit) => match limit.kind.as_str() {
                "unlimited" => (0, 0),
                "on_demand" => (amount, amount * limit.unit_price_in_cents),
                "metered" => {
                    let quantity = metered_overage(prev_total, new_total, limit.max_value);
                    (quantity, quantity * limit.unit_price_in_cents)
                }
                other => {
                    return Err(BillingError::Configuration(format!(
                        "plan limit for {} has unknown kind {}",
                        service_key, other
                    )));
                }
            },
        };

        if billed_quantity > 0 {
            sqlx::query(
                r#"
                INSERT INTO billing_events
                    (tenant_id, service_key, period_key, quantity, amount_in_cents)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(tenant_id)
            .bind(service_key)
            .bind(&period_key)
            .bind(billed_quantity)
            .bind(billed_amount_in_cents)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO billing_counters
                    (tenant_id, service_key, period_key, total_quantity, total_in_cents)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (tenant_id, service_key, period_key)
                DO UPDATE SET
                    total_quantity = billing_counters.total_quantity + EXCLUDED.total_quantity,
                    total_in_cents = billing_counters.total_in_cents + EXCLUDED.total_in_cents
                "#,
            )
            .bind(tenant_id)
            .bind(service_key)
            .bind(&period_key)
            .bind(billed_quantity)
            .bind(billed_amount_in_cents)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::debug!(
            tenant_id = %tenant_id,
            service_key = service_key,
            amount = amount,
            new_total = new_total,
            billed_quantity = billed_quantity,
            "Usage recorded"
        );

        Ok(UsageResult {
            blocked: false,
            period_key,
            new_total,
            billed_quantity,
            billed_amount_in_cents,
        })
    }

    async fn module_enabled(&self, tenant_id: Uuid, service_key: &str) -> BillingResult<bool> {
        // Absent row means enabled; settings only exist to switch modules off.
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT enabled FROM tenant_module_settings WHERE tenant_id = $1 AND service_key = $2",
        )
        .bind(tenant_id)
        .bind(service_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(row.map(|(enabled,)| enabled).unwrap_or(true))
    }

    /// The tenant's active plan snapshot limit for one service, if any.
    /// No snapshot or no entry for the service means nothing is billed.
    async fn plan_limit(
        &self,
        tenant_id: Uuid,
        service_key: &str,
    ) -> BillingResult<Option<PlanLimit>> {
        let snapshot: Option<(Value,)> = sqlx::query_as(
            r#"
            SELECT limits FROM plan_snapshots
            WHERE tenant_id = $1 AND active
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let Some((limits,)) = snapshot else {
            return Ok(None);
        };
        let Some(entry) = limits.get(service_key) else {
            return Ok(None);
        };
        let limit: PlanLimit = serde_json::from_value(entry.clone()).map_err(|e| {
            BillingError::Configuration(format!(
                "plan limit for {} is malformed: {}",
                service_key, e
            ))
        })?;
        Ok(Some(limit))
    }

    async fn record_event<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        service_key: &str,
        amount: i64,
        source: &str,
        meta: &Value,
        blocked: bool,
    ) -> BillingResult<()>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO usage_events (tenant_id, service_key, amount, source, meta, blocked)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(tenant_id)
        .bind(service_key)
        .bind(amount)
        .bind(source)
        .bind(meta)
        .bind(blocked)
        .execute(executor)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }

    /// Replace a tenant's plan snapshot wholesale. Snapshots are immutable;
    /// the previous one is deactivated, never edited.
    pub async fn replace_plan_snapshot(
        &self,
        tenant_id: Uuid,
        plan_name: &str,
        limits: &Value,
    ) -> BillingResult<Uuid> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        sqlx::query("UPDATE plan_snapshots SET active = FALSE WHERE tenant_id = $1 AND active")
            .bind(tenant_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO plan_snapshots (tenant_id, plan_name, limits)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(tenant_id)
        .bind(plan_name)
        .bind(limits)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(tenant_id = %tenant_id, plan_name = plan_name, "Plan snapshot replaced");
        Ok(id)
    }

    /// Explicit admin reset: delete a period's counters for a service.
    /// Usage and billing events are append-only and stay.
    pub async fn reset_counters(
        &self,
        tenant_id: Uuid,
        service_key: &str,
        period_key: &str,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM usage_counters
            WHERE tenant_id = $1 AND service_key = $2 AND period_key = $3
            "#,
        )
        .bind(tenant_id)
        .bind(service_key)
        .bind(period_key)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            tenant_id = %tenant_id,
            service_key = service_key,
            period_key = period_key,
            "Usage counters reset"
        );
        Ok(result.rows_affected())
    }

    pub async fn tenant_usage(&self, tenant_id: Uuid) -> BillingResult<Vec<UsageCounterRow>> {
        let rows: Vec<UsageCounterRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, service_key, period_key, total
            FROM usage_counters
            WHERE tenant_id = $1
            ORDER BY service_key, period_key
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct UsageCounterRow {
    pub tenant_id: Uuid,
    pub service_key: String,
    pub period_key: String,
    pub total: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn period_keys() {
        let at = datetime!(2024-03-07 15:30 UTC);
        assert_eq!(PeriodType::Month.period_key(at), "2024-03");
        assert_eq!(PeriodType::Total.period_key(at), "total");
        assert_eq!(
            PeriodType::Month.period_key(datetime!(2024-12-31 23:59 UTC)),
            "2024-12"
        );
    }

    #[test]
    fn metered_overage_boundary() {
        // allowance 100: 80 -> 110 bills the 10 above the line
        assert_eq!(metered_overage(80, 110, 100), 10);
        // next increment of 5 bills exactly 5 more
        assert_eq!(metered_overage(110, 115, 100), 5);
        // fully inside the allowance bills nothing
        assert_eq!(metered_overage(10, 90, 100), 0);
        // landing exactly on the allowance bills nothing
        assert_eq!(metered_overage(90, 100, 100), 0);
        // fully above the allowance bills the whole increment
        assert_eq!(metered_overage(200, 250, 100), 50);
    }

    #[test]
    fn metered_overage_never_double_bills() {
        let max = 100;
        let increments = [30, 30, 30, 30, 30];
        let mut total = 0;
        let mut billed = 0;
        for inc in increments {
            let new_total = total + inc;
            billed += metered_overage(total, new_total, max);
            total = new_total;
        }
        assert_eq!(total, 150);
        assert_eq!(billed, 50);
    }
}
