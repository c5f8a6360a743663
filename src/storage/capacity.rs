use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks bytes held on disk against a fixed capacity
#[derive(Debug)]
pub struct CapacityTracker {
    /// Current usage in bytes
    used_bytes: AtomicU64,
    /// Peak usage in bytes
    peak_bytes: AtomicU64,
    /// Maximum allowed bytes
    max_bytes: u64,
}

impl CapacityTracker {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            used_bytes: AtomicU64::new(0),
            peak_bytes: AtomicU64::new(0),
            max_bytes,
        }
    }

    /// Reserve `bytes` if they fit. Returns true if successful.
    pub fn try_allocate(&self, bytes: u64) -> bool {
        loop {
            let current = self.used_bytes.load(Ordering::SeqCst);
            let Some(next) = current.checked_add(bytes) else {
                return false;
            };
            if next > self.max_bytes {
                return false;
            }
            if self
                .used_bytes
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.peak_bytes.fetch_max(next, Ordering::SeqCst);
                return true;
            }
        }
    }

    /// Account for bytes that already exist, ignoring the limit
    pub fn allocate(&self, bytes: u64) {
        let next = self.used_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak_bytes.fetch_max(next, Ordering::SeqCst);
    }

    pub fn free(&self, bytes: u64) {
        let _ = self
            .used_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    pub fn used(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> u64 {
        self.peak_bytes.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> u64 {
        self.max_bytes
    }

    /// Usage as a fraction (0.0 to 1.0+)
    pub fn usage_ratio(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        self.used() as f64 / self.max_bytes as f64
    }
}
