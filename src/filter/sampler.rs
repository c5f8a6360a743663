use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Filter, FilterError, FilteredSpan};

/// Resolution of the trace-id based sampling decision
const UNITS_BASE: u64 = 10_000;

/// Global probabilistic sampler.
///
/// Spans carrying a trace id are sampled by a hash of that id, so every span
/// of one trace gets the same decision. Spans without one fall back to a
/// random draw. Force-kept spans always survive.
pub struct Sampler {
    rate: f64,
    rng: Mutex<StdRng>,
    dropped: AtomicU64,
}

impl Sampler {
    pub fn new(rate: f64) -> Result<Self, FilterError> {
        Self::with_rng(rate, StdRng::from_entropy())
    }

    /// Deterministic sampler for tests
    pub fn with_seed(rate: f64, seed: u64) -> Result<Self, FilterError> {
        Self::with_rng(rate, StdRng::seed_from_u64(seed))
    }

    fn with_rng(rate: f64, rng: StdRng) -> Result<Self, FilterError> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(FilterError::InvalidSamplingRate(rate));
        }
        Ok(Self {
            rate,
            rng: Mutex::new(rng),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Spans dropped by this sampler so far
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn should_keep(&self, trace_id: &str) -> bool {
        if self.rate >= 1.0 {
            return true;
        }
        if self.rate <= 0.0 {
            return false;
        }
        if trace_id.is_empty() {
            return self.rng.lock().gen::<f64>() < self.rate;
        }
        let threshold = (self.rate * UNITS_BASE as f64) as u64;
        fxhash::hash64(trace_id) % UNITS_BASE < threshold
    }
}

impl Filter for Sampler {
    fn name(&self) -> &str {
        "sampler"
    }

    fn filter(&self, mut spans: Vec<FilteredSpan>) -> Vec<FilteredSpan> {
        let before = spans.len();
        spans.retain(|s| s.force_keep || self.should_keep(&s.span.trace_id));
        self.dropped
            .fetch_add((before - spans.len()) as u64, Ordering::Relaxed);
        spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Span;

    fn batch(n: usize, with_trace_ids: bool) -> Vec<FilteredSpan> {
        (0..n)
            .map(|i| {
                let span = Span::new("web", format!("GET /{}", i));
                let span = if with_trace_ids {
                    span.with_trace_id(format!("{:032x}", i * 7919))
                } else {
                    span
                };
                FilteredSpan::new(span)
            })
            .collect()
    }

    #[test]
    fn test_rate_bounds() {
        assert!(matches!(
            Sampler::new(1.5),
            Err(FilterError::InvalidSamplingRate(_))
        ));
        assert!(Sampler::new(-0.1).is_err());
        assert!(Sampler::new(0.0).is_ok());
        assert!(Sampler::new(1.0).is_ok());
    }

    #[test]
    fn test_rate_zero_drops_all_but_forced() {
        let sampler = Sampler::new(0.0).unwrap();
        let mut input = batch(10, true);
        input[3].force_keep = true;

        let out = sampler.filter(input);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].span.resource, "GET /3");
        assert_eq!(sampler.dropped_count(), 9);
    }

    #[test]
    fn test_rate_one_keeps_all() {
        let sampler = Sampler::new(1.0).unwrap();
        assert_eq!(sampler.filter(batch(50, false)).len(), 50);
    }

    #[test]
    fn test_trace_decision_is_consistent() {
        let sampler = Sampler::new(0.5).unwrap();
        let spans: Vec<FilteredSpan> = (0..20)
            .map(|i| {
                FilteredSpan::new(
                    Span::new("web", format!("op{}", i)).with_trace_id("5b8aa5a2d2c872e8321cf37308d69df2"),
                )
            })
            .collect();
        let kept = sampler.filter(spans).len();
        assert!(kept == 0 || kept == 20);
    }

    #[test]
    fn test_random_rate_roughly_honored() {
        let sampler = Sampler::with_seed(0.3, 42).unwrap();
        let kept = sampler.filter(batch(10_000, false)).len();
        assert!((2_500..3_500).contains(&kept), "kept {}", kept);
    }
}
