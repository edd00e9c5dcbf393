//! Common domain types shared across the API, billing, and worker crates.
//!
//! Status enums are stored as TEXT in Postgres; records carry the raw string
//! and services convert at the edges with `as_str` / `parse`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lifecycle of an inbound webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookStatus {
    Received,
    Processed,
    Skipped,
    Failed,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Processed => "PROCESSED",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RECEIVED" => Some(Self::Received),
            "PROCESSED" => Some(Self::Processed),
            "SKIPPED" => Some(Self::Skipped),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Lifecycle of a retry job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }
}

/// Lifecycle of a billing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Declined,
    Error,
    Voided,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Declined => "DECLINED",
            Self::Error => "ERROR",
            Self::Voided => "VOIDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "APPROVED" => Some(Self::Approved),
            "DECLINED" => Some(Self::Declined),
            "ERROR" => Some(Self::Error),
            "VOIDED" => Some(Self::Voided),
            _ => None,
        }
    }

    /// Map a processor transaction status onto our payment lifecycle.
    /// Anything the processor reports that we don't recognize lands in ERROR
    /// so an operator sees it rather than it silently staying PENDING.
    pub fn from_processor(status: &str) -> Self {
        match status {
            "APPROVED" => Self::Approved,
            "DECLINED" => Self::Declined,
            "VOIDED" => Self::Voided,
            _ => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Suspended,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::PastDue => "PAST_DUE",
            Self::Suspended => "SUSPENDED",
            Self::Canceled => "CANCELED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "PAST_DUE" => Some(Self::PastDue),
            "SUSPENDED" => Some(Self::Suspended),
            "CANCELED" => Some(Self::Canceled),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Statuses for which no new billing resources may be created.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Canceled | Self::Expired)
    }
}

/// Typed extension map for provider-specific fields on domain entities
/// (payment-source ids, Chatwoot contact ids, forwarded-order metadata).
///
/// Stored as JSONB. Known keys are documented as constants so business logic
/// never threads raw dictionaries around.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionMap(pub BTreeMap<String, serde_json::Value>);

impl ExtensionMap {
    /// Stored payment-source token for auto-debit.
    pub const PAYMENT_SOURCE_TOKEN: &'static str = "payment_source_token";
    /// Chatwoot contact id after the first successful sync.
    pub const CHATWOOT_CONTACT_ID: &'static str = "chatwoot_contact_id";
    /// Forward target URL for external orders.
    pub const FORWARD_URL: &'static str = "forward_url";

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(|v| v.as_i64())
    }

    pub fn set(&mut self, key: &str, value: serde_json::Value) {
        self.0.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processor_status_mapping() {
        assert_eq!(
            PaymentStatus::from_processor("APPROVED"),
            PaymentStatus::Approved
        );
        assert_eq!(
            PaymentStatus::from_processor("DECLINED"),
            PaymentStatus::Declined
        );
        assert_eq!(
            PaymentStatus::from_processor("VOIDED"),
            PaymentStatus::Voided
        );
        // Unknown statuses must land in ERROR, never PENDING
        assert_eq!(
            PaymentStatus::from_processor("SOMETHING_NEW"),
            PaymentStatus::Error
        );
        assert_eq!(PaymentStatus::from_processor(""), PaymentStatus::Error);
    }

    #[test]
    fn status_roundtrip() {
        for s in [
            WebhookStatus::Received,
            WebhookStatus::Processed,
            WebhookStatus::Skipped,
            WebhookStatus::Failed,
        ] {
            assert_eq!(WebhookStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(WebhookStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_subscription_statuses() {
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(SubscriptionStatus::Expired.is_terminal());
        assert!(!SubscriptionStatus::Active.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());
    }

    #[test]
    fn extension_map_known_keys() {
        let mut ext = ExtensionMap::default();
        ext.set(
            ExtensionMap::PAYMENT_SOURCE_TOKEN,
            serde_json::json!("tok_123"),
        );
        ext.set(ExtensionMap::CHATWOOT_CONTACT_ID, serde_json::json!(42));

        assert_eq!(
            ext.get_str(ExtensionMap::PAYMENT_SOURCE_TOKEN),
            Some("tok_123")
        );
        assert_eq!(ext.get_i64(ExtensionMap::CHATWOOT_CONTACT_ID), Some(42));
        assert_eq!(ext.get_str("missing"), None);
    }
}
