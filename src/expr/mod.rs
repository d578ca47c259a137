//! Condition language for sampling rules.
//!
//! Rule conditions are parsed once into a [`Condition`] tree and then
//! evaluated against each record's attributes:
//! - Comparisons: `duration_ms > 1000`, `db.name = orders`, `db.user != 'batch'`
//! - Substring and regex: `db.statement contains VACUUM`, `db.statement =~ "^SELECT"`
//! - Presence: `exists(db.query.plan.hash)`
//! - Logic: `&&`/`and`, `||`/`or`, `!`/`not`, parentheses

pub mod ast;
pub mod eval;
pub mod parser;

pub use ast::{CompareOp, Condition, Literal, LogicalOp};
pub use parser::parse_condition;

use crate::core::{ConditionConfig, ConditionOperator, GuardError, Result, RuleConfig};

/// Compile a rule's expression and structured conditions into one tree
pub fn compile_rule_condition(rule: &RuleConfig) -> Result<Condition> {
    let mut compiled = match &rule.condition {
        Some(text) => parse_condition(text)?,
        None => Condition::Always,
    };
    for structured in &rule.conditions {
        compiled = compiled.and(compile_structured(&rule.name, structured)?);
    }
    Ok(compiled)
}

fn compile_structured(rule: &str, cond: &ConditionConfig) -> Result<Condition> {
    if cond.attribute.is_empty() {
        return Err(GuardError::config(format!(
            "condition attribute cannot be empty in rule '{rule}'"
        )));
    }
    if cond.operator == ConditionOperator::Exists {
        return Ok(Condition::Exists(cond.attribute.clone()));
    }

    let value = cond.value.as_ref().ok_or_else(|| {
        GuardError::config(format!(
            "condition on '{}' in rule '{rule}' requires a value",
            cond.attribute
        ))
    })?;
    let literal = match value {
        crate::core::AttributeValue::Bool(b) => Literal::Bool(*b),
        crate::core::AttributeValue::Int(v) => Literal::Int(*v),
        crate::core::AttributeValue::Float(v) => Literal::Float(*v),
        crate::core::AttributeValue::Str(s) => Literal::Str(s.clone()),
    };
    let op = match cond.operator {
        ConditionOperator::Eq => CompareOp::Eq,
        ConditionOperator::Ne => CompareOp::NotEq,
        ConditionOperator::Gt => CompareOp::Gt,
        ConditionOperator::Gte => CompareOp::Gte,
        ConditionOperator::Lt => CompareOp::Lt,
        ConditionOperator::Lte => CompareOp::Lte,
        ConditionOperator::Contains | ConditionOperator::Exists => CompareOp::Contains,
    };

    Ok(Condition::Compare {
        attribute: cond.attribute.clone(),
        op,
        value: literal,
    })
}
