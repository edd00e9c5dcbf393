//! Customer segment rule trees.
//!
//! A segment is a JSON-encoded expression tree: leaves compare one field of
//! the evaluation context against a literal, branches combine children with
//! and/or. Evaluation is a pure recursive walk; a missing field simply
//! fails the leaf rather than erroring.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One node of a segment rule tree. The serde tag keeps stored trees
/// readable: `{"op": "and", "rules": [...]}` vs
/// `{"op": "eq", "field": "plan.currency", "value": "COP"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SegmentRule {
    And { rules: Vec<SegmentRule> },
    Or { rules: Vec<SegmentRule> },
    Eq { field: String, value: Value },
    Neq { field: String, value: Value },
    Gt { field: String, value: f64 },
    Gte { field: String, value: f64 },
    Lt { field: String, value: f64 },
    Lte { field: String, value: f64 },
    Contains { field: String, value: String },
}

impl SegmentRule {
    /// Evaluate against a context object using dotted field paths.
    pub fn evaluate(&self, context: &Value) -> bool {
        match self {
            Self::And { rules } => rules.iter().all(|r| r.evaluate(context)),
            Self::Or { rules } => rules.iter().any(|r| r.evaluate(context)),
            Self::Eq { field, value } => resolve(context, field) == Some(value),
            Self::Neq { field, value } => resolve(context, field) != Some(value),
            Self::Gt { field, value } => numeric(context, field).is_some_and(|n| n > *value),
            Self::Gte { field, value } => numeric(context, field).is_some_and(|n| n >= *value),
            Self::Lt { field, value } => numeric(context, field).is_some_and(|n| n < *value),
            Self::Lte { field, value } => numeric(context, field).is_some_and(|n| n <= *value),
            Self::Contains { field, value } => resolve(context, field)
                .and_then(|v| v.as_str())
                .is_some_and(|s| s.contains(value.as_str())),
        }
    }
}

fn resolve<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn numeric(context: &Value, path: &str) -> Option<f64> {
    resolve(context, path)?.as_f64()
}
