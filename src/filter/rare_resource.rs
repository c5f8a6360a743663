use moka::sync::Cache;
use std::time::Duration;

use super::{Filter, FilteredSpan};

/// Default period a resource counts as seen
pub const DEFAULT_RARE_WINDOW: Duration = Duration::from_secs(3600);

const MAX_TRACKED_RESOURCES: u64 = 100_000;

/// Force-keeps the first span seen for each `(service, resource)` pair within
/// a sliding time window. Later sightings pass through unmarked so the rest of
/// the chain decides.
pub struct RareResourceKeeper {
    seen: Cache<(String, String), ()>,
    window: Duration,
}

impl RareResourceKeeper {
    pub fn new(window: Duration) -> Self {
        Self {
            seen: Cache::builder()
                .max_capacity(MAX_TRACKED_RESOURCES)
                .time_to_live(window)
                .build(),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for RareResourceKeeper {
    fn default() -> Self {
        Self::new(DEFAULT_RARE_WINDOW)
    }
}

impl Filter for RareResourceKeeper {
    fn name(&self) -> &str {
        "rare_resource"
    }

    fn filter(&self, mut spans: Vec<FilteredSpan>) -> Vec<FilteredSpan> {
        for s in spans.iter_mut() {
            let key = (s.span.service.clone(), s.span.resource.clone());
            if self.seen.entry(key).or_insert(()).is_fresh() {
                s.force_keep = true;
            }
        }
        spans
    }
}
