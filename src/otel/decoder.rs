use crate::ingest::{DecodeError, SpanDecoder};
use crate::trace::{FieldValue, Span};

use super::model::{ExportTraceServiceRequest, SpanKind, STATUS_CODE_ERROR};

const UNKNOWN_SERVICE: &str = "unknown";

/// Decodes OTLP/HTTP JSON trace exports
#[derive(Debug, Default, Clone, Copy)]
pub struct OtlpJsonDecoder;

impl OtlpJsonDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl SpanDecoder for OtlpJsonDecoder {
    fn name(&self) -> &str {
        "otlp-json"
    }

    fn decode(&self, body: &[u8], content_type: Option<&str>) -> Result<Vec<Span>, DecodeError> {
        if let Some(ct) = content_type {
            if !ct.contains("json") {
                return Err(DecodeError::UnsupportedContentType(ct.to_string()));
            }
        }

        let request: ExportTraceServiceRequest = serde_json::from_slice(body)?;
        let mut spans = Vec::new();

        for resource_spans in request.resource_spans {
            let resource = resource_spans.resource.as_ref();
            let service = resource
                .and_then(|r| r.service_name())
                .unwrap_or(UNKNOWN_SERVICE)
                .to_string();

            let resource_tags: Vec<(String, String)> = resource
                .map(|r| {
                    r.attributes
                        .iter()
                        .filter_map(|kv| kv.value.to_tag().map(|v| (kv.key.clone(), v)))
                        .collect()
                })
                .unwrap_or_default();

            for scope_spans in resource_spans.scope_spans {
                let scope_name = scope_spans.scope.as_ref().and_then(|s| s.name.clone());
                let scope_version = scope_spans.scope.as_ref().and_then(|s| s.version.clone());

                for raw in scope_spans.spans {
                    let status_code = raw.status.as_ref().and_then(|s| s.code).unwrap_or(0);

                    let mut span = Span::new(service.clone(), raw.name)
                        .with_trace_id(raw.trace_id)
                        .with_error(status_code == STATUS_CODE_ERROR)
                        .with_timestamp(raw.start_time_unix_nano);
                    span.span_id = raw.span_id;
                    span.parent_id = raw.parent_span_id.unwrap_or_default();
                    span.duration = raw
                        .end_time_unix_nano
                        .saturating_sub(raw.start_time_unix_nano)
                        .max(0);

                    span.tags.extend(resource_tags.iter().cloned());
                    if let Some(name) = &scope_name {
                        span.tags.insert("otel.scope.name".to_string(), name.clone());
                    }
                    if let Some(version) = &scope_version {
                        span.tags.insert("otel.scope.version".to_string(), version.clone());
                    }
                    span.tags.insert(
                        "span_kind".to_string(),
                        SpanKind::from_i32(raw.kind.unwrap_or(0)).as_str().to_string(),
                    );

                    for kv in &raw.attributes {
                        if let Some(value) = kv.value.to_field_value() {
                            span.fields.insert(kv.key.clone(), value);
                        }
                    }
                    if let Some(message) = raw.status.and_then(|s| s.message).filter(|m| !m.is_empty()) {
                        span.fields.insert("message".to_string(), FieldValue::String(message));
                    }
                    span.fields.insert("events_count".to_string(), FieldValue::Int(raw.events.len() as i64));
                    span.fields.insert("links_count".to_string(), FieldValue::Int(raw.links.len() as i64));

                    spans.push(span);
                }
            }
        }

        Ok(spans)
    }
}
