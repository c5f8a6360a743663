//! Spanline: resilient span-ingestion agent
//!
//! Receives spans from tracer clients over HTTP and UDP, filters and samples
//! them, and forwards the survivors to a downstream collector. When the
//! collector is unreachable, raw requests are buffered on disk and replayed
//! once it recovers.
//!
//! # Features
//!
//! - **Admission control**: bounded worker pool that rejects work when saturated
//! - **Filter chain**: close-resource, error penetration, rare-resource keeper
//!   and trace-consistent sampling, with force-keep overrides
//! - **Durable buffer**: capacity-bounded, crash-safe disk queue with replay
//! - **OTLP/HTTP JSON** decoding out of the box
//!
//! # Example
//!
//! ```no_run
//! use spanline::feed::HttpFeeder;
//! use spanline::ingest::IngestPipeline;
//! use spanline::otel::OtlpJsonDecoder;
//! use spanline::filter::{AfterGather, ErrorPenetration, Sampler};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let feeder = Arc::new(HttpFeeder::new("http://127.0.0.1:9528/v1/write/tracing")?);
//! let mut chain = AfterGather::builder(feeder).build();
//! chain.append_filter(ErrorPenetration);
//! chain.append_filter(Sampler::new(0.1)?);
//!
//! let pipeline = IngestPipeline::builder("otlp", Arc::new(OtlpJsonDecoder), chain).build();
//! let outcome = pipeline.handle_datagram(br#"{"resourceSpans":[]}"#.to_vec()).await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod feed;
pub mod filter;
pub mod ingest;
pub mod otel;
pub mod storage;
pub mod trace;
pub mod workerpool;

// Re-export commonly used types
pub use config::{AgentConfig, ConfigError};
pub use ingest::{IngestError, IngestPipeline, Outcome, SpanDecoder};
pub use storage::{Storage, StorageConfig, StorageError};
pub use trace::{Category, Span};
pub use workerpool::{WorkerPool, WorkerPoolConfig};
