//! Condition evaluation against a record's attribute map.

use super::ast::{CompareOp, Condition, Literal, LogicalOp};
use crate::core::{AttributeValue, TelemetryRecord};
use std::cmp::Ordering;
use std::collections::BTreeMap;

impl Condition {
    /// True when the record's attributes satisfy the condition
    pub fn matches(&self, record: &TelemetryRecord) -> bool {
        self.matches_attrs(&record.attributes)
    }

    /// Evaluate against a bare attribute map
    pub fn matches_attrs(&self, attrs: &BTreeMap<String, AttributeValue>) -> bool {
        match self {
            Condition::Always => true,
            Condition::Exists(name) => attrs.contains_key(name),
            Condition::Not(inner) => !inner.matches_attrs(attrs),
            Condition::Logical { op, left, right } => match op {
                LogicalOp::And => left.matches_attrs(attrs) && right.matches_attrs(attrs),
                LogicalOp::Or => left.matches_attrs(attrs) || right.matches_attrs(attrs),
            },
            Condition::Compare {
                attribute,
                op,
                value,
            } => match attrs.get(attribute) {
                Some(actual) => compare(actual, *op, value),
                None => false,
            },
        }
    }
}

fn compare(actual: &AttributeValue, op: CompareOp, expected: &Literal) -> bool {
    match op {
        CompareOp::Eq => equals(actual, expected),
        CompareOp::NotEq => !equals(actual, expected),
        CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
            let Some(ord) = numeric_order(actual, expected) else {
                return false;
            };
            match op {
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Gte => ord != Ordering::Less,
                CompareOp::Lt => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            }
        },
        CompareOp::Contains => actual.to_string().contains(&literal_text(expected)),
        CompareOp::Regex => match expected {
            Literal::Pattern(p) => p.0.is_match(&actual.to_string()),
            _ => false,
        },
    }
}

fn equals(actual: &AttributeValue, expected: &Literal) -> bool {
    match expected {
        Literal::Int(_) | Literal::Float(_) => numeric_order(actual, expected) == Some(Ordering::Equal),
        Literal::Bool(b) => actual.as_bool() == Some(*b),
        Literal::Str(s) => actual.to_string() == *s,
        Literal::Pattern(p) => actual.to_string() == p.0.as_str(),
    }
}

/// Integers compare exactly; anything involving a float goes through f64
fn numeric_order(actual: &AttributeValue, expected: &Literal) -> Option<Ordering> {
    if let (Literal::Int(b), Some(a)) = (expected, actual.as_i64()) {
        return Some(a.cmp(b));
    }
    let (a, b) = (actual.as_f64()?, expected.as_f64()?);
    if (a - b).abs() < f64::EPSILON {
        return Some(Ordering::Equal);
    }
    a.partial_cmp(&b)
}

fn literal_text(lit: &Literal) -> String {
    match lit {
        Literal::Str(s) => s.clone(),
        Literal::Pattern(p) => p.0.as_str().to_string(),
        other => other.to_string(),
    }
}
