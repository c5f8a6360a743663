//! OpenTelemetry intake
//!
//! Send traces via OTLP/HTTP:
//! ```bash
//! # Configure your app's OTLP exporter
//! OTEL_EXPORTER_OTLP_TRACES_ENDPOINT=http://localhost:9529/v1/traces
//! OTEL_EXPORTER_OTLP_PROTOCOL=http/json
//! ```
//!
//! Only the JSON encoding is decoded; protobuf bodies are rejected with an
//! unsupported content type error.

mod decoder;
mod model;

pub use decoder::OtlpJsonDecoder;
pub use model::SpanKind;
