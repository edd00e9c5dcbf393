//! Admin bearer-token authentication.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::error::ApiError;
use crate::state::AppState;

/// Constant-time token comparison; length differences short-circuit but the
/// token itself is never compared byte-by-byte with early exit.
pub fn token_matches(provided: &str, expected: &str) -> bool {
    provided.len() == expected.len()
        && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

/// Middleware guarding the `/admin` surface with `Authorization: Bearer`.
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if !token_matches(provided, &state.config.admin_api_token) {
        tracing::warn!(path = %request.uri().path(), "Rejected admin request with bad token");
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}
