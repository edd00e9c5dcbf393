//! API error responses.
//!
//! Every error renders as `{"error": "<stable_code>"}` with an optional
//! human-readable `reason`, so integrators can branch on the code without
//! parsing prose.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use billflow_billing::BillingError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited")]
    RateLimited,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidPayload(_) | Self::InvalidSignature(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "invalid_payload",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::RateLimited => "rate_limited",
            Self::Internal(_) => "internal_error",
        }
    }

    fn reason(&self) -> Option<String> {
        match self {
            Self::InvalidPayload(r)
            | Self::InvalidSignature(r)
            | Self::NotFound(r)
            | Self::Conflict(r) => Some(r.clone()),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let mut body = json!({ "error": self.code() });
        if let Some(reason) = self.reason() {
            body["reason"] = json!(reason);
        }
        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::InvalidPayload(r) => Self::InvalidPayload(r),
            BillingError::InvalidSignature(r) => Self::InvalidSignature(r),
            BillingError::NotFound(r) => Self::NotFound(r),
            BillingError::Precondition(r) => Self::Conflict(r),
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_errors_map_to_stable_codes() {
        let api: ApiError = BillingError::InvalidSignature("checksum mismatch".into()).into();
        assert_eq!(api.code(), "invalid_signature");
        assert_eq!(api.status(), StatusCode::BAD_REQUEST);

        let api: ApiError = BillingError::Precondition("subscription canceled".into()).into();
        assert_eq!(api.code(), "conflict");
        assert_eq!(api.status(), StatusCode::CONFLICT);

        let api: ApiError = BillingError::Database("down".into()).into();
        assert_eq!(api.code(), "internal_error");
        assert_eq!(api.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
