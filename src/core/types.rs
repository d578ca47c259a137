//! Telemetry records, resource ids and attribute values.

use crate::core::error::{GuardError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Well-known attribute keys read or written by the admission layer.
pub mod attrs {
    /// Monitored resource (database) the record belongs to
    pub const RESOURCE_ID: &str = "db.name";
    /// Normalized query identifier
    pub const QUERY_ID: &str = "db.query.id";
    /// Database user that issued the statement
    pub const USER_ID: &str = "db.user";
    /// Statement duration in milliseconds
    pub const DURATION_MS: &str = "duration_ms";
    /// Error flag
    pub const ERROR: &str = "error";
    /// Error text accompanying the error flag
    pub const ERROR_MESSAGE: &str = "error.message";
    /// Execution plan hash used for deduplication
    pub const PLAN_HASH: &str = "db.query.plan.hash";

    /// Rate applied by the sampler to a kept record
    pub const SAMPLING_RATE: &str = "sampling.rate";
    /// Rate correction weight (inverse of the applied rate)
    pub const SAMPLING_WEIGHT: &str = "sampling.weight";
    /// Name of the rule that decided the verdict
    pub const SAMPLING_RULE: &str = "sampling.rule";
    /// Breaker state when a record is admitted outside Closed
    pub const CIRCUIT_STATE: &str = "circuit.state";
    /// Set when a key was coalesced into the overflow bucket
    pub const CARDINALITY_OVERFLOW: &str = "cardinality.overflow";

    /// Replacement value for coalesced keys
    pub const OVERFLOW_VALUE: &str = "__overflow__";
}

/// Identifier of a monitored resource (usually a database name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(Arc<str>);

impl ResourceId {
    /// Creates a new ResourceId after validation
    pub fn new(id: &str) -> Result<Self> {
        if id.is_empty() {
            return Err(GuardError::config("resource id cannot be empty"));
        }
        Ok(ResourceId(Arc::from(id)))
    }

    /// Returns the string representation of the resource id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Attribute value carried by a telemetry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean flag
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    Str(String),
}

impl AttributeValue {
    /// Numeric view of the value. Strings that parse as numbers are coerced.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(v) => Some(*v as f64),
            AttributeValue::Float(v) => Some(*v),
            AttributeValue::Str(s) => s.trim().parse().ok(),
            AttributeValue::Bool(_) => None,
        }
    }

    /// Exact integer view; integral strings are coerced
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            AttributeValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean view of the value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            AttributeValue::Str(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// String view; only defined for string values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{b}"),
            AttributeValue::Int(v) => write!(f, "{v}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        AttributeValue::Int(i64::from(v))
    }
}

impl From<u32> for AttributeValue {
    fn from(v: u32) -> Self {
        AttributeValue::Int(i64::from(v))
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Str(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Str(v)
    }
}

/// A structured metric or log record flowing through the admission layer.
///
/// The layer treats records as opaque apart from the keys in [`attrs`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Metric or event name
    pub name: String,
    /// When the record was produced
    pub timestamp: SystemTime,
    /// Attribute map
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl TelemetryRecord {
    /// Creates a record with no attributes, stamped now
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            timestamp: SystemTime::now(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute, builder style
    pub fn with_attr<K: Into<String>, V: Into<AttributeValue>>(mut self, key: K, value: V) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Sets an attribute in place
    pub fn set_attr<K: Into<String>, V: Into<AttributeValue>>(&mut self, key: K, value: V) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Gets an attribute value by key
    pub fn attr(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Gets an attribute rendered as text; numbers and booleans are formatted
    pub fn attr_text(&self, key: &str) -> Option<String> {
        self.attributes.get(key).map(ToString::to_string)
    }

    /// Resource id of the record, if present and non-empty
    pub fn resource_id(&self) -> Option<ResourceId> {
        self.resource_id_from(attrs::RESOURCE_ID)
    }

    /// Resource id read from a configurable attribute
    pub fn resource_id_from(&self, attribute: &str) -> Option<ResourceId> {
        self.attr(attribute)
            .and_then(AttributeValue::as_str)
            .and_then(|s| ResourceId::new(s).ok())
    }

    /// True when the record carries the error flag
    pub fn is_error(&self) -> bool {
        self.attr(attrs::ERROR)
            .and_then(AttributeValue::as_bool)
            .unwrap_or(false)
    }

    /// Error text, falling back to an empty string
    pub fn error_message(&self) -> &str {
        self.attr(attrs::ERROR_MESSAGE)
            .and_then(AttributeValue::as_str)
            .unwrap_or("")
    }
}
