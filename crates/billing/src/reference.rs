//! Merchant reference classification.
//!
//! Payment links and charges carry an opaque reference string. The prefix
//! convention tells us whether a processor transaction belongs to one of our
//! subscriptions (`SUB_<id>[_<cycle>]`), is a forwarded external order
//! (`SHOPIFY_...`), or is something we should ignore.

use uuid::Uuid;

/// Semantic intent of a merchant reference. Total classification: every
/// string maps to exactly one variant, parsing never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentReference {
    /// A subscription payment, optionally pinned to a billing cycle.
    Subscription {
        subscription_id: Uuid,
        cycle: Option<i64>,
    },
    /// An order originated by an external storefront; forwarded, never
    /// reconciled against our subscription state.
    ExternalOrder { reference: String },
    /// Anything else. Ignored.
    Unknown,
}

impl PaymentReference {
    pub fn classify(reference: &str) -> Self {
        if reference.starts_with("SHOPIFY_") {
            return Self::ExternalOrder {
                reference: reference.to_string(),
            };
        }

        let Some(rest) = reference.strip_prefix("SUB_") else {
            return Self::Unknown;
        };

        // `SUB_<uuid>` or `SUB_<uuid>_<cycle>`. The uuid itself contains no
        // underscores, so everything after the 36th character is the cycle.
        let (id_part, cycle_part) = match rest.split_at_checked(36) {
            Some((id, tail)) => (id, tail.strip_prefix('_')),
            None => (rest, None),
        };

        let Ok(subscription_id) = id_part.parse::<Uuid>() else {
            return Self::Unknown;
        };

        match cycle_part {
            None | Some("") => Self::Subscription {
                subscription_id,
                cycle: None,
            },
            Some(tail) => match tail.parse::<i64>() {
                Ok(cycle) if cycle > 0 => Self::Subscription {
                    subscription_id,
                    cycle: Some(cycle),
                },
                _ => Self::Unknown,
            },
        }
    }
}

/// Build the reference for a subscription cycle's payment link or charge.
pub fn subscription_reference(subscription_id: Uuid, cycle: i64) -> String {
    format!("SUB_{}_{}", subscription_id, cycle)
}
