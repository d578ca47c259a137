//! Abstract syntax tree for rule conditions.

use std::fmt;

/// Condition expression over a record's attributes
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Simple comparison: attribute op value
    Compare {
        /// Dotted attribute name
        attribute: String,
        /// Comparison operator
        op: CompareOp,
        /// Right-hand side
        value: Literal,
    },
    /// Attribute presence test
    Exists(String),
    /// Negation
    Not(Box<Condition>),
    /// Logical combination of conditions
    Logical {
        /// `And` or `Or`
        op: LogicalOp,
        /// Evaluated first
        left: Box<Condition>,
        /// Skipped when `left` decides the result
        right: Box<Condition>,
    },
    /// Matches every record
    Always,
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// Equals
    Eq,
    /// Not equals
    NotEq,
    /// Greater than
    Gt,
    /// Greater than or equal
    Gte,
    /// Less than
    Lt,
    /// Less than or equal
    Lte,
    /// Regex match
    Regex,
    /// Contains substring
    Contains,
}

/// Literal values on the right-hand side of a comparison
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// String literal
    Str(String),
    /// Integer literal
    Int(i64),
    /// Float literal
    Float(f64),
    /// Boolean literal
    Bool(bool),
    /// Regex compiled at parse time
    Pattern(Pattern),
}

/// A compiled regular expression, compared by source text
#[derive(Debug, Clone)]
pub struct Pattern(pub regex::Regex);

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

/// Logical operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    /// Both sides must match
    And,
    /// Either side may match
    Or,
}

impl Condition {
    /// Combine two conditions with AND, skipping `Always` operands
    pub fn and(self, other: Condition) -> Condition {
        match (self, other) {
            (Condition::Always, c) | (c, Condition::Always) => c,
            (left, right) => Condition::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            },
        }
    }
}

impl Literal {
    /// Numeric view used for ordered comparisons
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Int(v) => Some(*v as f64),
            Literal::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Gte => ">=",
            CompareOp::Lt => "<",
            CompareOp::Lte => "<=",
            CompareOp::Regex => "=~",
            CompareOp::Contains => "contains",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Str(s) => write!(f, "\"{s}\""),
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Float(v) => write!(f, "{v:?}"),
            Literal::Bool(b) => write!(f, "{b}"),
            Literal::Pattern(p) => write!(f, "\"{}\"", p.0.as_str()),
        }
    }
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::And => write!(f, "&&"),
            LogicalOp::Or => write!(f, "||"),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Compare {
                attribute,
                op,
                value,
            } => write!(f, "{attribute} {op} {value}"),
            Condition::Exists(attribute) => write!(f, "exists({attribute})"),
            Condition::Not(inner) => write!(f, "!({inner})"),
            Condition::Logical { op, left, right } => write!(f, "({left} {op} {right})"),
            Condition::Always => write!(f, "true"),
        }
    }
}
