//! Chatwoot messaging client.
//!
//! Outbound customer messages go through Chatwoot: resolve (or create) the
//! contact, open a conversation in the configured inbox, post the message.
//! The resolved contact id is written back into the customer's extension
//! map so later sends skip the search.

use std::time::Duration;

use serde_json::{json, Value};
use sqlx::PgPool;

use billflow_shared::types::ExtensionMap;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::CustomerRecord;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ChatwootConfig {
    pub base_url: String,
    pub account_id: i64,
    pub inbox_id: i64,
    pub api_token: String,
}

impl ChatwootConfig {
    /// Build from the environment; `None` when Chatwoot is not configured.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("CHATWOOT_BASE_URL").ok().filter(|v| !v.is_empty())?;
        let api_token = std::env::var("CHATWOOT_API_TOKEN").ok().filter(|v| !v.is_empty())?;
        let account_id = std::env::var("CHATWOOT_ACCOUNT_ID").ok()?.parse().ok()?;
        let inbox_id = std::env::var("CHATWOOT_INBOX_ID").ok()?.parse().ok()?;
        Some(Self {
            base_url,
            account_id,
            inbox_id,
            api_token,
        })
    }
}

#[derive(Clone)]
pub struct ChatwootClient {
    http: reqwest::Client,
    config: ChatwootConfig,
    pool: PgPool,
}

impl ChatwootClient {
    pub fn new(config: ChatwootConfig, pool: PgPool) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            pool,
        }
    }

    fn account_url(&self, path: &str) -> String {
        format!(
            "{}/api/v1/accounts/{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_id,
            path
        )
    }

    /// Resolve the Chatwoot contact for a customer, creating one when
    /// needed, and cache the id on the customer record.
    pub async fn sync_contact(&self, customer: &CustomerRecord) -> BillingResult<i64> {
        let extensions = customer.extensions();
        if let Some(id) = extensions
            .get_i64(ExtensionMap::CHATWOOT_CONTACT_ID)
            .or_else(|| {
                extensions
                    .get_str(ExtensionMap::CHATWOOT_CONTACT_ID)
                    .and_then(|s| s.parse().ok())
            })
        {
            return Ok(id);
        }

        let contact_id = match self.search_contact(customer).await? {
            Some(id) => id,
            None => self.create_contact(customer).await?,
        };

        sqlx::query(
            r#"
            UPDATE customers
            SET extensions = jsonb_set(extensions, $2, to_jsonb($3::TEXT), TRUE),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(customer.id)
        .bind(vec![ExtensionMap::CHATWOOT_CONTACT_ID.to_string()])
        .bind(contact_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            customer_id = %customer.id,
            contact_id = contact_id,
            "Chatwoot contact linked"
        );
        Ok(contact_id)
    }

    async fn search_contact(&self, customer: &CustomerRecord) -> BillingResult<Option<i64>> {
        let Some(query) = customer
            .email
            .as_deref()
            .filter(|v| !v.is_empty())
            .or(customer.phone.as_deref().filter(|v| !v.is_empty()))
        else {
            return Ok(None);
        };

        let body: Value = self
            .http
            .get(self.account_url("/contacts/search"))
            .header("api_access_token", &self.config.api_token)
            .query(&[("q", query)])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| BillingError::MessagingApi(e.to_string()))?
            .json()
            .await?;

        Ok(body
            .pointer("/payload/0/id")
            .and_then(|v| v.as_i64()))
    }

    async fn create_contact(&self, customer: &CustomerRecord) -> BillingResult<i64> {
        let body: Value = self
            .http
            .post(self.account_url("/contacts"))
            .header("api_access_token", &self.config.api_token)
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({
                "inbox_id": self.config.inbox_id,
                "name": customer.name,
                "email": customer.email,
                "phone_number": customer.phone,
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| BillingError::MessagingApi(e.to_string()))?
            .json()
            .await?;

        body.pointer("/payload/contact/id")
            .or_else(|| body.pointer("/id"))
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                BillingError::MessagingApi("contact create response missing id".into())
            })
    }

    /// Deliver one message: contact, conversation, message. Returns the
    /// provider response for the audit record.
    pub async fn deliver(
        &self,
        customer: &CustomerRecord,
        content: &str,
    ) -> BillingResult<Value> {
        let contact_id = self.sync_contact(customer).await?;

        let conversation: Value = self
            .http
            .post(self.account_url("/conversations"))
            .header("api_access_token", &self.config.api_token)
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({
                "contact_id": contact_id,
                "inbox_id": self.config.inbox_id,
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| BillingError::MessagingApi(e.to_string()))?
            .json()
            .await?;

        let conversation_id = conversation
            .pointer("/id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                BillingError::MessagingApi("conversation response missing id".into())
            })?;

        let message: Value = self
            .http
            .post(self.account_url(&format!("/conversations/{}/messages", conversation_id)))
            .header("api_access_token", &self.config.api_token)
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({
                "content": content,
                "message_type": "outgoing",
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| BillingError::MessagingApi(e.to_string()))?
            .json()
            .await?;

        tracing::info!(
            customer_id = %customer.id,
            conversation_id = conversation_id,
            "Chatwoot message sent"
        );

        Ok(json!({
            "contact_id": contact_id,
            "conversation_id": conversation_id,
            "message": message,
        }))
    }
}
