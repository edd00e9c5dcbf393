//! Payment-processor webhook signature verification.
//!
//! The processor signs each event by concatenating the string rendering of a
//! list of property paths resolved against the event `data`, the event
//! timestamp, and the shared secret, then hashing with SHA-256. We recompute
//! the checksum and compare in constant time. A caller-supplied header
//! checksum takes precedence over the in-body value.

use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

/// Signature block as delivered inside the webhook body.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SignatureBlock {
    pub checksum: String,
    pub properties: Vec<String>,
}

/// Resolve a dotted property path against `data`.
///
/// Missing paths render as the empty string; objects and arrays render as
/// their JSON serialization; scalars render without quoting.
fn render_property(data: &Value, path: &str) -> String {
    let mut current = data;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    render_value(current)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Compute the expected checksum for a signature block.
pub fn compute_checksum(
    data: &Value,
    properties: &[String],
    timestamp: i64,
    secret: &str,
) -> String {
    let mut concatenated = String::new();
    for path in properties {
        concatenated.push_str(&render_property(data, path));
    }
    concatenated.push_str(&timestamp.to_string());
    concatenated.push_str(secret);

    let digest = Sha256::digest(concatenated.as_bytes());
    hex::encode(digest)
}

/// Verify a webhook event's checksum.
///
/// `header_checksum`, when present, overrides the in-body checksum both for
/// verification and as the canonical value the caller should persist.
/// Returns the canonical checksum on success so ingestion stores exactly
/// what was verified.
pub fn verify(
    data: &Value,
    signature: &SignatureBlock,
    timestamp: i64,
    secret: &str,
    header_checksum: Option<&str>,
) -> BillingResult<String> {
    let provided = header_checksum.unwrap_or(&signature.checksum);
    if provided.is_empty() {
        return Err(BillingError::InvalidSignature("missing checksum".into()));
    }

    let expected = compute_checksum(data, &signature.properties, timestamp, secret);

    // Constant-time comparison over the lowercased hex rendering
    let provided_lower = provided.to_ascii_lowercase();
    let matches: bool = expected
        .as_bytes()
        .ct_eq(provided_lower.as_bytes())
        .into();

    if !matches {
        return Err(BillingError::InvalidSignature("checksum mismatch".into()));
    }

    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_data() -> Value {
        json!({
            "transaction": {
                "id": "txn-123",
                "amount_in_cents": 50000,
                "status": "APPROVED",
                "reference": "SUB_abc_3"
            }
        })
    }

    fn props() -> Vec<String> {
        vec![
            "transaction.id".to_string(),
            "transaction.status".to_string(),
            "transaction.amount_in_cents".to_string(),
        ]
    }

    #[test]
    fn checksum_is_deterministic() {
        let a = compute_checksum(&sample_data(), &props(), 1700000000, "secret");
        let b = compute_checksum(&sample_data(), &props(), 1700000000, "secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn flipping_data_changes_checksum() {
        let base = compute_checksum(&sample_data(), &props(), 1700000000, "secret");

        let mut tampered = sample_data();
        tampered["transaction"]["amount_in_cents"] = json!(50001);
        let changed = compute_checksum(&tampered, &props(), 1700000000, "secret");
        assert_ne!(base, changed);

        let changed_ts = compute_checksum(&sample_data(), &props(), 1700000001, "secret");
        assert_ne!(base, changed_ts);

        let changed_secret = compute_checksum(&sample_data(), &props(), 1700000000, "secreu");
        assert_ne!(base, changed_secret);
    }

    #[test]
    fn verify_accepts_valid_checksum() {
        let checksum = compute_checksum(&sample_data(), &props(), 1700000000, "secret");
        let block = SignatureBlock {
            checksum: checksum.clone(),
            properties: props(),
        };
        let canonical = verify(&sample_data(), &block, 1700000000, "secret", None).unwrap();
        assert_eq!(canonical, checksum);
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let checksum = compute_checksum(&sample_data(), &props(), 1700000000, "wrong-secret");
        let block = SignatureBlock {
            checksum,
            properties: props(),
        };
        let err = verify(&sample_data(), &block, 1700000000, "secret", None).unwrap_err();
        assert!(matches!(err, BillingError::InvalidSignature(_)));
    }

    #[test]
    fn header_checksum_overrides_body() {
        let good = compute_checksum(&sample_data(), &props(), 1700000000, "secret");
        let block = SignatureBlock {
            checksum: "garbage".to_string(),
            properties: props(),
        };
        // Body checksum is wrong, header is right: header wins
        let canonical =
            verify(&sample_data(), &block, 1700000000, "secret", Some(&good)).unwrap();
        assert_eq!(canonical, good);

        // Header is wrong even though body is right: header still wins
        let block = SignatureBlock {
            checksum: good,
            properties: props(),
        };
        assert!(verify(&sample_data(), &block, 1700000000, "secret", Some("garbage")).is_err());
    }

    #[test]
    fn verify_accepts_uppercase_hex() {
        let checksum = compute_checksum(&sample_data(), &props(), 1700000000, "secret");
        let block = SignatureBlock {
            checksum: checksum.to_ascii_uppercase(),
            properties: props(),
        };
        assert!(verify(&sample_data(), &block, 1700000000, "secret", None).is_ok());
    }

    #[test]
    fn missing_property_renders_empty() {
        assert_eq!(render_property(&sample_data(), "transaction.missing"), "");
        assert_eq!(render_property(&sample_data(), "nope.nope"), "");
    }

    #[test]
    fn object_property_renders_as_json() {
        let rendered = render_property(&sample_data(), "transaction");
        assert!(rendered.starts_with('{'));
        assert!(rendered.contains("\"id\":\"txn-123\""));
    }

    #[test]
    fn missing_checksum_rejected() {
        let block = SignatureBlock {
            checksum: String::new(),
            properties: props(),
        };
        let err = verify(&sample_data(), &block, 1700000000, "secret", None).unwrap_err();
        assert!(matches!(err, BillingError::InvalidSignature(_)));
    }
}
