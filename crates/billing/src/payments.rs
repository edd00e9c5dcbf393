//! Payment records and idempotent reconciliation upserts.
//!
//! A payment row exists per (subscription, cycle), keyed by the derived
//! `cycle_key`, and optionally carries the processor's transaction id once
//! one is known. Both keys are unique, which is what makes link creation and
//! webhook reconciliation safe under redelivery and out-of-order processing:
//! the same cycle always lands on the same row, and an APPROVED status is
//! never downgraded.

use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use billflow_shared::types::PaymentStatus;

use crate::error::{BillingError, BillingResult};

/// Deterministic per-cycle idempotency key.
pub fn subscription_cycle_key(subscription_id: Uuid, cycle: i32) -> String {
    format!("{}:{}", subscription_id, cycle)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub cycle_number: i32,
    pub cycle_key: String,
    pub amount_in_cents: i64,
    pub currency: String,
    pub status: String,
    pub processor_transaction_id: Option<String>,
    pub processor_link_id: Option<String>,
    pub checkout_url: Option<String>,
    pub raw_response: Option<Value>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub approved_at: Option<OffsetDateTime>,
}

impl PaymentRecord {
    pub fn status(&self) -> Option<PaymentStatus> {
        PaymentStatus::parse(&self.status)
    }

    pub fn is_approved(&self) -> bool {
        self.status == PaymentStatus::Approved.as_str()
    }
}

#[derive(Clone)]
pub struct PaymentStore {
    pool: PgPool,
}

impl PaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_cycle_key(&self, cycle_key: &str) -> BillingResult<Option<PaymentRecord>> {
        let payment: Option<PaymentRecord> =
            sqlx::query_as("SELECT * FROM payments WHERE cycle_key = $1")
                .bind(cycle_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(payment)
    }

    pub async fn find_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        let payment: Option<PaymentRecord> =
            sqlx::query_as("SELECT * FROM payments WHERE processor_transaction_id = $1")
                .bind(transaction_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(payment)
    }

    /// Whether an APPROVED payment exists for a subscription cycle.
    pub async fn approved_exists(&self, subscription_id: Uuid, cycle: i32) -> BillingResult<bool> {
        let exists: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM payments WHERE cycle_key = $1 AND status = 'APPROVED'",
        )
        .bind(subscription_cycle_key(subscription_id, cycle))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(exists.is_some())
    }

    /// Create the PENDING row for a cycle if none exists yet, returning the
    /// row for that cycle either way.
    pub async fn ensure_pending(
        &self,
        subscription_id: Uuid,
        cycle: i32,
        amount_in_cents: i64,
        currency: &str,
    ) -> BillingResult<PaymentRecord> {
        let payment: PaymentRecord = sqlx::query_as(
            r#"
            INSERT INTO payments
                (subscription_id, cycle_number, cycle_key, amount_in_cents, currency, status)
            VALUES ($1, $2, $3, $4, $5, 'PENDING')
            ON CONFLICT (cycle_key) DO UPDATE SET updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(cycle)
        .bind(subscription_cycle_key(subscription_id, cycle))
        .bind(amount_in_cents)
        .bind(currency)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(payment)
    }

    /// Attach processor link details to a cycle's payment row.
    pub async fn attach_link(
        &self,
        payment_id: Uuid,
        link_id: &str,
        checkout_url: &str,
    ) -> BillingResult<PaymentRecord> {
        let payment: PaymentRecord = sqlx::query_as(
            r#"
            UPDATE payments
            SET processor_link_id = $2, checkout_url = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(link_id)
        .bind(checkout_url)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(payment)
    }

    /// Attach a processor transaction id after a direct charge.
    pub async fn attach_transaction(
        &self,
        payment_id: Uuid,
        transaction_id: &str,
        status: PaymentStatus,
        raw_response: &Value,
    ) -> BillingResult<PaymentRecord> {
        let payment: PaymentRecord = sqlx::query_as(
            r#"
            UPDATE payments
            SET processor_transaction_id = $2,
                status = CASE WHEN payments.status = 'APPROVED' THEN payments.status ELSE $3 END,
                raw_response = $4,
                approved_at = CASE
                    WHEN payments.approved_at IS NULL AND $3 = 'APPROVED' THEN NOW()
                    ELSE payments.approved_at
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(transaction_id)
        .bind(status.as_str())
        .bind(raw_response)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(payment)
    }

    /// Reconcile a webhook transaction into the payment table.
    ///
    /// Keyed by the processor transaction id when present (idempotent under
    /// redelivery); otherwise the cycle-key upsert merges into the row
    /// created at link time. An APPROVED status is never downgraded, and
    /// an existing transaction id is never overwritten by a different one.
    pub async fn reconcile_transaction(
        &self,
        subscription_id: Uuid,
        cycle: i32,
        amount_in_cents: i64,
        currency: &str,
        status: PaymentStatus,
        transaction_id: Option<&str>,
        raw_response: &Value,
    ) -> BillingResult<PaymentRecord> {
        if let Some(txn_id) = transaction_id {
            let updated: Option<PaymentRecord> = sqlx::query_as(
                r#"
                UPDATE payments
                SET status = CASE WHEN payments.status = 'APPROVED' THEN payments.status ELSE $2 END,
                    raw_response = $3,
                    approved_at = CASE
                        WHEN payments.approved_at IS NULL AND $2 = 'APPROVED' THEN NOW()
                        ELSE payments.approved_at
                    END,
                    updated_at = NOW()
                WHERE processor_transaction_id = $1
                RETURNING *
                "#,
            )
            .bind(txn_id)
            .bind(status.as_str())
            .bind(raw_response)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

            if let Some(payment) = updated {
                return Ok(payment);
            }
        }

        let payment: PaymentRecord = sqlx::query_as(
            r#"
            INSERT INTO payments
                (subscription_id, cycle_number, cycle_key, amount_in_cents, currency,
                 status, processor_transaction_id, raw_response, approved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8,
                    CASE WHEN $6 = 'APPROVED' THEN NOW() ELSE NULL END)
            ON CONFLICT (cycle_key) DO UPDATE SET
                status = CASE WHEN payments.status = 'APPROVED' THEN payments.status
                              ELSE EXCLUDED.status END,
                processor_transaction_id =
                    COALESCE(payments.processor_transaction_id, EXCLUDED.processor_transaction_id),
                raw_response = EXCLUDED.raw_response,
                approved_at = CASE
                    WHEN payments.approved_at IS NULL AND EXCLUDED.status = 'APPROVED' THEN NOW()
                    ELSE payments.approved_at
                END,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(cycle)
        .bind(subscription_cycle_key(subscription_id, cycle))
        .bind(amount_in_cents)
        .bind(currency)
        .bind(status.as_str())
        .bind(transaction_id)
        .bind(raw_response)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(payment)
    }

    pub async fn list_recent(&self, limit: i64) -> BillingResult<Vec<PaymentRecord>> {
        let payments: Vec<PaymentRecord> =
            sqlx::query_as("SELECT * FROM payments ORDER BY created_at DESC LIMIT $1")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(payments)
    }

    /// Audit row for a link/charge attempt.
    pub async fn log_attempt(
        &self,
        subscription_id: Uuid,
        cycle: i32,
        kind: &str,
        outcome: &str,
        detail: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO charge_attempts (subscription_id, cycle_number, kind, outcome, detail)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(subscription_id)
        .bind(cycle)
        .bind(kind)
        .bind(outcome)
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_key_is_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(
            subscription_cycle_key(id, 3),
            subscription_cycle_key(id, 3)
        );
        assert_eq!(subscription_cycle_key(id, 3), format!("{}:3", id));
        assert_ne!(
            subscription_cycle_key(id, 3),
            subscription_cycle_key(id, 4)
        );
    }
}
