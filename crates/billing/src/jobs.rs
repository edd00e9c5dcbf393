//! Durable at-least-once retry-job queue.
//!
//! Jobs are claimed with a single atomic statement built on
//! `FOR UPDATE SKIP LOCKED`, so no two workers ever hold the same job and
//! claiming never blocks behind in-flight work. Failed handlers re-enter
//! PENDING with capped exponential backoff until `max_attempts`, after which
//! the job is terminally FAILED.

use serde_json::Value;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Job type identifiers dispatched by the worker loop.
pub mod kind {
    pub const PROCESS_PAYMENT_EVENT: &str = "process_payment_event";
    pub const FORWARD_ORDER: &str = "forward_order";
    pub const AUTO_DEBIT: &str = "auto_debit";
    pub const SUBSCRIPTION_REMINDER: &str = "subscription_reminder";
    pub const SEND_MESSAGE: &str = "send_message";
}

pub const DEFAULT_MAX_ATTEMPTS: i32 = 10;

const BASE_DELAY_SECS: i64 = 5;
const MAX_DELAY_SECS: i64 = 300;

/// Delay before the next attempt, given the attempt count after the failure.
/// attempts = 0,1,2,3 -> 5s, 10s, 20s, 40s, capped at 300s.
pub fn retry_delay(attempts: i32) -> Duration {
    let shift = attempts.clamp(0, 16) as u32;
    let secs = BASE_DELAY_SECS
        .saturating_mul(1i64 << shift)
        .min(MAX_DELAY_SECS);
    Duration::seconds(secs)
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: String,
    pub payload: Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: OffsetDateTime,
    pub locked_at: Option<OffsetDateTime>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: PgPool,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Enqueue a job for immediate dispatch.
    pub async fn enqueue(&self, kind: &str, payload: Value) -> BillingResult<Uuid> {
        self.enqueue_at(kind, payload, OffsetDateTime::now_utc(), DEFAULT_MAX_ATTEMPTS)
            .await
    }

    /// Enqueue a job with an explicit earliest dispatch time.
    pub async fn enqueue_at(
        &self,
        kind: &str,
        payload: Value,
        run_at: OffsetDateTime,
        max_attempts: i32,
    ) -> BillingResult<Uuid> {
        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO retry_jobs (kind, payload, run_at, max_attempts)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(kind)
        .bind(&payload)
        .bind(run_at)
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::debug!(job_id = %id.0, kind = kind, run_at = %run_at, "Job enqueued");
        Ok(id.0)
    }

    /// Atomically claim up to `limit` due PENDING jobs for `worker_id`.
    ///
    /// Single statement: the inner SELECT takes row locks with SKIP LOCKED so
    /// concurrent claimers never double-claim and never wait on each other,
    /// and the UPDATE transitions the claimed rows to RUNNING before any
    /// handler runs.
    pub async fn claim(&self, worker_id: &str, limit: i64) -> BillingResult<Vec<JobRecord>> {
        let jobs: Vec<JobRecord> = sqlx::query_as(
            r#"
            UPDATE retry_jobs
            SET status = 'RUNNING', locked_at = NOW(), locked_by = $1, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM retry_jobs
                WHERE status = 'PENDING' AND run_at <= NOW()
                ORDER BY run_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok(jobs)
    }

    /// Mark a job SUCCEEDED and release its lock.
    pub async fn complete(&self, job_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE retry_jobs
            SET status = 'SUCCEEDED', locked_at = NULL, locked_by = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }

    /// Record a handler failure.
    ///
    /// Increments `attempts` and either reschedules with backoff or, once the
    /// attempts budget is spent (or the error is known to be non-retryable),
    /// marks the job terminally FAILED.
    pub async fn fail(&self, job: &JobRecord, error: &str, retryable: bool) -> BillingResult<()> {
        let attempts = job.attempts + 1;

        if retryable && attempts < job.max_attempts {
            let next_run_at = OffsetDateTime::now_utc() + retry_delay(attempts);
            sqlx::query(
                r#"
                UPDATE retry_jobs
                SET status = 'PENDING', attempts = $2, run_at = $3, last_error = $4,
                    locked_at = NULL, locked_by = NULL, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(attempts)
            .bind(next_run_at)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

            tracing::warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempts = attempts,
                next_run_at = %next_run_at,
                error = error,
                "Job failed, rescheduled with backoff"
            );
        } else {
            sqlx::query(
                r#"
                UPDATE retry_jobs
                SET status = 'FAILED', attempts = $2, last_error = $3,
                    locked_at = NULL, locked_by = NULL, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(attempts)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

            tracing::error!(
                job_id = %job.id,
                kind = %job.kind,
                attempts = attempts,
                error = error,
                "Job terminally failed"
            );
        }

        Ok(())
    }

    /// Bulk-reset all FAILED jobs to PENDING with cleared lock fields.
    /// Admin operation; attempts restart from zero.
    pub async fn retry_all_failed(&self) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE retry_jobs
            SET status = 'PENDING', attempts = 0, run_at = NOW(), last_error = NULL,
                locked_at = NULL, locked_by = NULL, updated_at = NOW()
            WHERE status = 'FAILED'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        let reset = result.rows_affected();
        if reset > 0 {
            tracing::info!(reset = reset, "Failed jobs reset to pending");
        }
        Ok(reset)
    }

    /// List recent jobs for the admin surface.
    pub async fn list_recent(&self, limit: i64) -> BillingResult<Vec<JobRecord>> {
        let jobs: Vec<JobRecord> = sqlx::query_as(
            "SELECT * FROM retry_jobs ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(jobs)
    }

    /// Job counts grouped by status, for the daily operations report.
    pub async fn status_counts(&self) -> BillingResult<Vec<(String, i64)>> {
        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM retry_jobs GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(counts)
    }

    /// Delete SUCCEEDED jobs older than `days`. Worker maintenance.
    pub async fn purge_succeeded(&self, days: i64) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM retry_jobs
            WHERE status = 'SUCCEEDED' AND updated_at < NOW() - ($1 || ' days')::INTERVAL
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

    #[test]
    fn backoff_doubles_from_five_seconds() {
        assert_eq!(retry_delay(0), Duration::seconds(5));
        assert_eq!(retry_delay(1), Duration::seconds(10));
        assert_eq!(retry_delay(2), Duration::seconds(20));
        assert_eq!(retry_delay(3), Duration::seconds(40));
    }

    #[test]
    fn backoff_caps_at_five_minutes() {
        assert_eq!(retry_delay(6), Duration::seconds(300));
        assert_eq!(retry_delay(20), Duration::seconds(300));
        assert_eq!(retry_delay(i32::MAX), Duration::seconds(300));
    }

    #[test]
    fn backoff_is_monotonic() {
        let mut previous = Duration::ZERO;
        for attempts in 0..12 {
            let delay = retry_delay(attempts);
            assert!(delay >= previous, "delay shrank at attempt {}", attempts);
            previous = delay;
        }
    }
}
