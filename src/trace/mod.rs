//! Decoded span model shared by decoders, filters and feeders.

mod span;

pub use span::{Category, FieldValue, Span};
