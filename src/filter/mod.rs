//! Ordered span filter chain.
//!
//! Filters run strictly in the order they were appended, each one receiving the
//! previous stage's output. Dropping a span removes it from the list; keeping
//! a span regardless of later stages is expressed with the per-span
//! `force_keep` annotation, which every drop-capable stage after it must honor.
//!
//! The agent wires the chain as:
//!
//! 1. [`CloseResource`] drops blocked resources unconditionally
//! 2. [`ErrorPenetration`] force-keeps error spans
//! 3. [`RareResourceKeeper`] force-keeps the first sighting of a resource
//! 4. [`Sampler`] drops a share of whatever is not force-kept

mod chain;
mod close_resource;
mod error_penetration;
mod rare_resource;
mod sampler;

pub use chain::{AfterGather, AfterGatherBuilder, GatherOutcome, RetryPolicy};
pub use close_resource::CloseResource;
pub use error_penetration::ErrorPenetration;
pub use rare_resource::{RareResourceKeeper, DEFAULT_RARE_WINDOW};
pub use sampler::Sampler;

use crate::trace::Span;

/// A span travelling through the chain together with its keep annotation
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredSpan {
    pub span: Span,
    /// Set by a stage that wants the span to survive every later stage
    pub force_keep: bool,
}

impl FilteredSpan {
    pub fn new(span: Span) -> Self {
        Self {
            span,
            force_keep: false,
        }
    }
}

impl From<Span> for FilteredSpan {
    fn from(span: Span) -> Self {
        Self::new(span)
    }
}

/// One stage of the chain
pub trait Filter: Send + Sync {
    fn name(&self) -> &str {
        "filter"
    }

    fn filter(&self, spans: Vec<FilteredSpan>) -> Vec<FilteredSpan>;
}

impl<F> Filter for F
where
    F: Fn(Vec<FilteredSpan>) -> Vec<FilteredSpan> + Send + Sync,
{
    fn filter(&self, spans: Vec<FilteredSpan>) -> Vec<FilteredSpan> {
        self(spans)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("Invalid sampling rate {0}: must be within [0, 1]")]
    InvalidSamplingRate(f64),

    #[error("Invalid pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
}
