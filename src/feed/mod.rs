//! Downstream sink for accepted spans.
//!
//! An error from [`Feeder::feed`] is what triggers retries and, when
//! those are exhausted, the durable buffer.

mod http;
#[cfg(any(test, feature = "testing"))]
mod memory;

pub use http::HttpFeeder;
#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryFeeder;

use async_trait::async_trait;
use std::time::Duration;

use crate::trace::{Category, Span};

/// Per-call feed options
#[derive(Debug, Clone, Default)]
pub struct FeedOptions {
    /// Time spent collecting (decode + filter) this batch
    pub collect_cost: Duration,
    /// Whether the data is subject to election/deduplication downstream
    pub election: bool,
    /// Identifier of the input that produced the batch
    pub input: String,
}

#[async_trait]
pub trait Feeder: Send + Sync {
    async fn feed(
        &self,
        category: Category,
        spans: &[Span],
        options: &FeedOptions,
    ) -> Result<(), FeedError>;
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Collector rejected batch: {status} {message}")]
    Rejected { status: u16, message: String },

    #[error("Feeder unavailable: {0}")]
    Unavailable(String),
}
