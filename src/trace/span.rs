//! Span data model

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Data category a batch is fed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Tracing,
    Profiling,
    Logging,
    Metric,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Tracing => "tracing",
            Category::Profiling => "profiling",
            Category::Logging => "logging",
            Category::Metric => "metric",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed field value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::String(s)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// One decoded unit of trace telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub category: Category,
    /// Operation name
    pub name: String,
    /// Service the span was reported by
    pub service: String,
    /// Resource (endpoint, query, ...) the span operated on
    pub resource: String,
    /// Trace ID, empty if the decoder had none
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub span_id: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: HashMap<String, FieldValue>,
    /// Start time in nanoseconds since epoch
    pub timestamp: i64,
    /// Duration in nanoseconds
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub error: bool,
}

impl Span {
    pub fn new(service: impl Into<String>, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        Self {
            category: Category::Tracing,
            name: resource.clone(),
            service: service.into(),
            resource,
            trace_id: String::new(),
            span_id: String::new(),
            parent_id: String::new(),
            tags: BTreeMap::new(),
            fields: HashMap::new(),
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            duration: 0,
            error: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    pub fn with_error(mut self, error: bool) -> Self {
        self.error = error;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}
