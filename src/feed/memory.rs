use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{FeedError, FeedOptions, Feeder};
use crate::trace::{Category, Span};

/// In-process feeder that records every batch. Failures can be injected to
/// simulate a collector outage.
#[derive(Debug, Default)]
pub struct MemoryFeeder {
    batches: Mutex<Vec<(Category, Vec<Span>, FeedOptions)>>,
    failing: AtomicBool,
    fail_next: AtomicUsize,
    calls: AtomicUsize,
}

impl MemoryFeeder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `n` calls
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of feed calls, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<(Category, Vec<Span>, FeedOptions)> {
        self.batches.lock().clone()
    }

    /// All spans fed so far, flattened
    pub fn spans(&self) -> Vec<Span> {
        self.batches
            .lock()
            .iter()
            .flat_map(|(_, spans, _)| spans.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl Feeder for MemoryFeeder {
    async fn feed(
        &self,
        category: Category,
        spans: &[Span],
        options: &FeedOptions,
    ) -> Result<(), FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(FeedError::Unavailable("collector down".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(FeedError::Unavailable("injected failure".to_string()));
        }

        self.batches
            .lock()
            .push((category, spans.to_vec(), options.clone()));
        Ok(())
    }
}
