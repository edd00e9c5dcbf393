//! Route tree assembly.

mod admin;
mod webhooks;

use axum::middleware;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;

use crate::auth::require_admin;
use crate::error::ApiError;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let admin = Router::new()
        .route(
            "/subscriptions/{id}/payment-link",
            post(admin::create_payment_link),
        )
        .route("/jobs/retry-failed", post(admin::retry_failed_jobs))
        .route("/jobs", get(admin::list_jobs))
        .route("/payments", get(admin::list_payments))
        .route("/messages", get(admin::list_messages))
        .route("/webhook-events", get(admin::list_webhook_events))
        .route(
            "/tenants/{id}/usage",
            get(admin::tenant_usage).delete(admin::reset_tenant_usage),
        )
        .route(
            "/credentials/{provider}/{key}",
            put(admin::put_credential),
        )
        .route("/segments/preview", post(admin::preview_segment))
        .layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/payment-events", post(webhooks::payment_events))
        .route("/webhooks/messaging", post(webhooks::messaging))
        .nest("/admin", admin)
        .with_state(state)
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "status": "ok" })))
}
