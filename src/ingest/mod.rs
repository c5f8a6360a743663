//! Inbound side of the agent: decoding, admission and the orchestration that
//! ties the worker pool, filter chain, feeder and durable buffer together.
//!
//! Intake sources:
//! - HTTP (the configured endpoint, see [`crate::api`])
//! - UDP datagrams (optional, see [`udp`])

mod pipeline;
pub mod udp;

pub use pipeline::{IngestPipeline, IngestPipelineBuilder, PipelineStats, PipelineStatsSnapshot};
pub use udp::UdpListener;

use std::time::Duration;

use crate::trace::Span;
use crate::workerpool::PoolError;

/// Turns a raw request body into spans
pub trait SpanDecoder: Send + Sync {
    fn name(&self) -> &str;

    fn decode(&self, body: &[u8], content_type: Option<&str>) -> Result<Vec<Span>, DecodeError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid payload: {0}")]
    Invalid(String),
}

/// Terminal state of one inbound request that was accepted for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// This many spans reached the feeder
    Fed(usize),
    /// Decoded, but every span was filtered out
    Filtered,
    /// Feed failed; the raw request is on disk awaiting replay
    Buffered,
    /// Feed failed and there was nowhere to buffer it
    Dropped,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Rejected: worker pool saturated for {0:?}")]
    AdmissionRejected(Duration),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Processing crashed: {0}")]
    Crashed(String),

    #[error("Worker pool error: {0}")]
    Pool(PoolError),

    #[error("Processing abandoned before completion")]
    Abandoned,
}

impl From<PoolError> for IngestError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::AdmissionRejected(waited) => IngestError::AdmissionRejected(waited),
            other => IngestError::Pool(other),
        }
    }
}
