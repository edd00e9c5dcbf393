//! Billing error types.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("processor API error: {0}")]
    ProcessorApi(String),

    #[error("messaging API error: {0}")]
    MessagingApi(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Precondition that retrying cannot fix (missing payment source,
    /// canceled subscription, missing email).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// Misconfiguration (unknown service key, missing plan snapshot,
    /// missing encryption key). These fail loudly.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("SMTP error: {0}")]
    Smtp(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        Self::ProcessorApi(e.to_string())
    }
}

impl BillingError {
    /// Whether the retry-job queue should keep retrying after this error.
    /// Preconditions and configuration errors will not change on their own.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Precondition(_) | Self::Configuration(_))
    }
}
