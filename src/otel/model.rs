//! OTLP/HTTP JSON wire format (trace export requests)

use serde::Deserialize;

use crate::trace::FieldValue;

/// Span kind from OTel spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Unspecified,
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Unspecified => "unspecified",
            SpanKind::Internal => "internal",
            SpanKind::Server => "server",
            SpanKind::Client => "client",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => SpanKind::Internal,
            2 => SpanKind::Server,
            3 => SpanKind::Client,
            4 => SpanKind::Producer,
            5 => SpanKind::Consumer,
            _ => SpanKind::Unspecified,
        }
    }
}

/// Status code that marks a span as failed
pub const STATUS_CODE_ERROR: i32 = 2;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportTraceServiceRequest {
    #[serde(default)]
    pub resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpans {
    pub resource: Option<Resource>,
    #[serde(default)]
    pub scope_spans: Vec<ScopeSpans>,
}

#[derive(Debug, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
}

impl Resource {
    pub fn service_name(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|kv| kv.key == "service.name")
            .and_then(|kv| kv.value.string_value.as_deref())
    }
}

#[derive(Debug, Deserialize)]
pub struct ScopeSpans {
    pub scope: Option<InstrumentationScope>,
    #[serde(default)]
    pub spans: Vec<Span>,
}

#[derive(Debug, Deserialize)]
pub struct InstrumentationScope {
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: Option<i32>,
    #[serde(default, with = "nanos")]
    pub start_time_unix_nano: i64,
    #[serde(default, with = "nanos")]
    pub end_time_unix_nano: i64,
    #[serde(default)]
    pub attributes: Vec<KeyValue>,
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
    #[serde(default)]
    pub links: Vec<serde_json::Value>,
    pub status: Option<Status>,
}

#[derive(Debug, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnyValue {
    pub string_value: Option<String>,
    /// int64 is sent as a string in OTLP JSON, but some exporters use numbers
    pub int_value: Option<serde_json::Value>,
    pub double_value: Option<f64>,
    pub bool_value: Option<bool>,
}

impl AnyValue {
    pub fn to_field_value(&self) -> Option<FieldValue> {
        if let Some(s) = &self.string_value {
            return Some(FieldValue::String(s.clone()));
        }
        if let Some(i) = &self.int_value {
            let parsed = match i {
                serde_json::Value::String(s) => s.parse::<i64>().ok(),
                other => other.as_i64(),
            };
            if let Some(v) = parsed {
                return Some(FieldValue::Int(v));
            }
        }
        if let Some(d) = self.double_value {
            return Some(FieldValue::Float(d));
        }
        self.bool_value.map(FieldValue::Bool)
    }

    /// Value rendered as a tag string
    pub fn to_tag(&self) -> Option<String> {
        self.to_field_value().map(|v| match v {
            FieldValue::String(s) => s,
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Bool(b) => b.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct Status {
    pub code: Option<i32>,
    pub message: Option<String>,
}

/// Nanosecond timestamps arrive as decimal strings (or plain numbers)
mod nanos {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(i64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
