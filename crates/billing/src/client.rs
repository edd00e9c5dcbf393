//! Payment-processor HTTP client.
//!
//! Thin reqwest wrapper over the processor's REST API: checkout-link
//! creation, direct charges against a stored payment source, and merchant
//! acceptance tokens. Secrets are resolved per call through the runtime
//! config layer so credential rotation takes effect without a restart.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::credentials::RuntimeConfig;
use crate::error::{BillingError, BillingResult};

pub const PROVIDER: &str = "processor";

/// Stored-credential keys resolved through [`RuntimeConfig`].
pub mod keys {
    /// Bearer key for outbound API calls.
    pub const PRIVATE_KEY: &str = "PRIVATE_KEY";
    /// Shared secret for inbound webhook checksums.
    pub const EVENTS_SECRET: &str = "EVENTS_SECRET";
    /// Secret mixed into the charge integrity signature.
    pub const INTEGRITY_SECRET: &str = "INTEGRITY_SECRET";
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Integrity signature for a direct charge:
/// sha256(reference + amount_in_cents + currency + secret), hex-encoded.
pub fn integrity_signature(
    reference: &str,
    amount_in_cents: i64,
    currency: &str,
    secret: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(reference.as_bytes());
    hasher.update(amount_in_cents.to_string().as_bytes());
    hasher.update(currency.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatePaymentLink {
    pub name: String,
    pub description: String,
    pub amount_in_cents: i64,
    pub currency: String,
    pub reference: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentLink {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct CreateTransaction {
    pub amount_in_cents: i64,
    pub currency: String,
    pub reference: String,
    pub customer_email: String,
    pub payment_source_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorTransaction {
    pub id: String,
    pub status: String,
}

#[derive(Clone)]
pub struct ProcessorClient {
    http: reqwest::Client,
    base_url: String,
    config: RuntimeConfig,
}

impl ProcessorClient {
    pub fn new(base_url: String, config: RuntimeConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
        }
    }

    async fn private_key(&self) -> BillingResult<String> {
        self.config
            .resolve(PROVIDER, keys::PRIVATE_KEY)
            .await
            .ok_or_else(|| {
                BillingError::Configuration("processor private key not configured".into())
            })
    }

    /// Shared secret used to verify inbound webhook checksums.
    pub async fn events_secret(&self) -> BillingResult<String> {
        self.config
            .resolve(PROVIDER, keys::EVENTS_SECRET)
            .await
            .ok_or_else(|| {
                BillingError::Configuration("processor events secret not configured".into())
            })
    }

    pub async fn integrity_secret(&self) -> BillingResult<String> {
        self.config
            .resolve(PROVIDER, keys::INTEGRITY_SECRET)
            .await
            .ok_or_else(|| {
                BillingError::Configuration("processor integrity secret not configured".into())
            })
    }

    /// Create a hosted checkout link.
    pub async fn create_payment_link(&self, req: &CreatePaymentLink) -> BillingResult<PaymentLink> {
        let key = self.private_key().await?;
        let response = self
            .http
            .post(format!("{}/payment_links", self.base_url))
            .bearer_auth(&key)
            .timeout(REQUEST_TIMEOUT)
            .json(req)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::ProcessorApi(format!(
                "create_payment_link returned {}: {}",
                status, body
            )));
        }

        let link: PaymentLink = response
            .json::<DataEnvelope<PaymentLink>>()
            .await
            .map(|e| e.data)?;

        tracing::info!(
            link_id = %link.id,
            reference = %req.reference,
            amount_in_cents = req.amount_in_cents,
            "Payment link created"
        );
        Ok(link)
    }

    /// Charge a stored payment source directly.
    pub async fn create_transaction(
        &self,
        req: &CreateTransaction,
    ) -> BillingResult<ProcessorTransaction> {
        let key = self.private_key().await?;
        let integrity = self.integrity_secret().await?;
        let acceptance_token = self.merchant_acceptance_token().await?;

        let signature =
            integrity_signature(&req.reference, req.amount_in_cents, &req.currency, &integrity);

        let body = json!({
            "amount_in_cents": req.amount_in_cents,
            "currency": req.currency,
            "reference": req.reference,
            "customer_email": req.customer_email,
            "payment_source_id": req.payment_source_token,
            "acceptance_token": acceptance_token,
            "signature": signature,
        });

        let response = self
            .http
            .post(format!("{}/transactions", self.base_url))
            .bearer_auth(&key)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(BillingError::ProcessorApi(format!(
                "create_transaction returned {}: {}",
                status, text
            )));
        }

        let txn: ProcessorTransaction = response
            .json::<DataEnvelope<ProcessorTransaction>>()
            .await
            .map(|e| e.data)?;

        tracing::info!(
            transaction_id = %txn.id,
            status = %txn.status,
            reference = %req.reference,
            "Processor transaction created"
        );
        Ok(txn)
    }

    /// Fetch the merchant's current acceptance token, required on every
    /// direct charge.
    pub async fn merchant_acceptance_token(&self) -> BillingResult<String> {
        let key = self.private_key().await?;
        let response = self
            .http
            .get(format!("{}/merchants/me", self.base_url))
            .bearer_auth(&key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| BillingError::ProcessorApi(e.to_string()))?;

        let body: serde_json::Value = response.json().await?;
        body.pointer("/data/presigned_acceptance/acceptance_token")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                BillingError::ProcessorApi("merchant response missing acceptance token".into())
            })
    }
}

/// The processor wraps every response in `{"data": ...}`.
#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_signature_is_deterministic() {
        let a = integrity_signature("SUB_x_1", 50000, "COP", "secret");
        let b = integrity_signature("SUB_x_1", 50000, "COP", "secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn integrity_signature_covers_every_input() {
        let base = integrity_signature("SUB_x_1", 50000, "COP", "secret");
        assert_ne!(base, integrity_signature("SUB_x_2", 50000, "COP", "secret"));
        assert_ne!(base, integrity_signature("SUB_x_1", 50001, "COP", "secret"));
        assert_ne!(base, integrity_signature("SUB_x_1", 50000, "USD", "secret"));
        assert_ne!(base, integrity_signature("SUB_x_1", 50000, "COP", "other"));
    }
}
