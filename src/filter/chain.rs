use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Filter, FilteredSpan};
use crate::feed::{FeedError, FeedOptions, Feeder};
use crate::trace::{Category, Span};

/// Field removed from spans when message deletion is enabled
const MESSAGE_FIELD: &str = "message";

/// Bounded retry around the terminal feed call
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// Retries after the first failed attempt
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(interval: Duration, attempts: u32) -> Self {
        Self { interval, attempts }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            attempts: 3,
        }
    }
}

/// Result of one chain run that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherOutcome {
    /// This many spans were handed to the feeder
    Fed(usize),
    /// Every span was filtered out; the feeder was not called
    Empty,
}

/// Runs gathered spans through the filter stages and feeds the survivors
pub struct AfterGather {
    input: String,
    feeder: Arc<dyn Feeder>,
    filters: Vec<Box<dyn Filter>>,
    extra_tags: BTreeMap<String, String>,
    ignore_tags: Vec<Regex>,
    delete_message: bool,
    retry: Option<RetryPolicy>,
}

impl AfterGather {
    pub fn builder(feeder: Arc<dyn Feeder>) -> AfterGatherBuilder {
        AfterGatherBuilder {
            input: "spanline".to_string(),
            feeder,
            extra_tags: BTreeMap::new(),
            ignore_tags: Vec::new(),
            delete_message: false,
            retry: None,
        }
    }

    /// Append a stage. Stages run in append order.
    pub fn append_filter<F: Filter + 'static>(&mut self, filter: F) {
        tracing::debug!(
            input = %self.input,
            filter = filter.name(),
            position = self.filters.len(),
            "Appending filter"
        );
        self.filters.push(Box::new(filter));
    }

    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    /// Run the filter stages only, without feeding
    pub fn apply_filters(&self, spans: Vec<Span>) -> Vec<FilteredSpan> {
        let mut batch: Vec<FilteredSpan> = spans.into_iter().map(FilteredSpan::new).collect();
        for f in &self.filters {
            if batch.is_empty() {
                break;
            }
            batch = f.filter(batch);
        }
        batch
    }

    /// Filter `spans` and feed whatever survives. An empty result skips the
    /// feed call.
    pub async fn run(&self, category: Category, spans: Vec<Span>) -> Result<GatherOutcome, FeedError> {
        let started = Instant::now();
        let received = spans.len();

        let spans: Vec<Span> = self
            .apply_filters(spans)
            .into_iter()
            .map(|s| self.finish(s.span))
            .collect();

        if spans.is_empty() {
            tracing::debug!(input = %self.input, received, "All spans filtered out");
            return Ok(GatherOutcome::Empty);
        }

        let options = FeedOptions {
            collect_cost: started.elapsed(),
            election: false,
            input: self.input.clone(),
        };
        self.feed_with_retry(category, &spans, &options).await?;

        tracing::debug!(
            input = %self.input,
            received,
            fed = spans.len(),
            "Fed filtered spans"
        );
        Ok(GatherOutcome::Fed(spans.len()))
    }

    fn finish(&self, mut span: Span) -> Span {
        if !self.ignore_tags.is_empty() {
            span.tags
                .retain(|k, _| !self.ignore_tags.iter().any(|re| re.is_match(k)));
        }
        for (k, v) in &self.extra_tags {
            span.tags.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if self.delete_message {
            span.fields.remove(MESSAGE_FIELD);
        }
        span
    }

    async fn feed_with_retry(
        &self,
        category: Category,
        spans: &[Span],
        options: &FeedOptions,
    ) -> Result<(), FeedError> {
        let retry = self.retry.unwrap_or(RetryPolicy {
            interval: Duration::ZERO,
            attempts: 0,
        });

        let mut attempt = 0;
        loop {
            match self.feeder.feed(category, spans, options).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retry.attempts => {
                    attempt += 1;
                    tracing::warn!(
                        input = %self.input,
                        attempt,
                        max_attempts = retry.attempts,
                        "Feed failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(retry.interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

pub struct AfterGatherBuilder {
    input: String,
    feeder: Arc<dyn Feeder>,
    extra_tags: BTreeMap<String, String>,
    ignore_tags: Vec<Regex>,
    delete_message: bool,
    retry: Option<RetryPolicy>,
}

impl AfterGatherBuilder {
    /// Identifier passed to the feeder with every batch
    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    /// Tags added to every fed span unless the span already has the key
    pub fn extra_tags<I, K, V>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.extra_tags
            .extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Tag keys matching any of these patterns are removed before feeding.
    /// Invalid patterns are logged and skipped.
    pub fn ignore_tags<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for p in patterns {
            match Regex::new(p.as_ref()) {
                Ok(re) => self.ignore_tags.push(re),
                Err(e) => tracing::warn!("Skipping ignore_tags pattern {:?}: {}", p.as_ref(), e),
            }
        }
        self
    }

    pub fn delete_message(mut self, delete: bool) -> Self {
        self.delete_message = delete;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn build(self) -> AfterGather {
        AfterGather {
            input: self.input,
            feeder: self.feeder,
            filters: Vec::new(),
            extra_tags: self.extra_tags,
            ignore_tags: self.ignore_tags,
            delete_message: self.delete_message,
            retry: self.retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeeder;
    use crate::filter::{CloseResource, ErrorPenetration, RareResourceKeeper, Sampler};
    use std::collections::HashMap;

    fn chain(feeder: &Arc<MemoryFeeder>) -> AfterGather {
        AfterGather::builder(Arc::clone(feeder) as Arc<dyn Feeder>)
            .input("test")
            .build()
    }

    fn standard_chain(
        feeder: &Arc<MemoryFeeder>,
        close: &[(&str, &str)],
        keep_rare: bool,
        rate: f64,
    ) -> AfterGather {
        let mut ag = chain(feeder);
        if !close.is_empty() {
            let mut rules: HashMap<String, Vec<String>> = HashMap::new();
            for (service, pattern) in close {
                rules
                    .entry(service.to_string())
                    .or_default()
                    .push(pattern.to_string());
            }
            ag.append_filter(CloseResource::try_from_rules(&rules).unwrap());
        }
        ag.append_filter(ErrorPenetration);
        if keep_rare {
            ag.append_filter(RareResourceKeeper::default());
        }
        ag.append_filter(Sampler::new(rate).unwrap());
        ag
    }

    #[tokio::test]
    async fn test_filters_run_in_append_order() {
        let feeder = Arc::new(MemoryFeeder::new());
        let mut ag = chain(&feeder);

        ag.append_filter(|mut spans: Vec<FilteredSpan>| {
            for s in spans.iter_mut() {
                s.span.tags.insert("order".to_string(), "1".to_string());
            }
            spans
        });
        ag.append_filter(|mut spans: Vec<FilteredSpan>| {
            for s in spans.iter_mut() {
                let prev = s.span.tags.get("order").cloned().unwrap_or_default();
                s.span.tags.insert("order".to_string(), format!("{}2", prev));
            }
            spans
        });

        let outcome = ag
            .run(Category::Tracing, vec![Span::new("web", "GET /")])
            .await
            .unwrap();
        assert_eq!(outcome, GatherOutcome::Fed(1));
        assert_eq!(feeder.spans()[0].tags["order"], "12");
    }

    #[tokio::test]
    async fn test_empty_result_skips_feed() {
        let feeder = Arc::new(MemoryFeeder::new());
        let mut ag = chain(&feeder);
        ag.append_filter(|_: Vec<FilteredSpan>| -> Vec<FilteredSpan> { Vec::new() });

        let outcome = ag
            .run(Category::Tracing, vec![Span::new("web", "GET /")])
            .await
            .unwrap();
        assert_eq!(outcome, GatherOutcome::Empty);
        assert_eq!(feeder.calls(), 0);
    }

    #[tokio::test]
    async fn test_errors_survive_zero_rate() {
        let feeder = Arc::new(MemoryFeeder::new());
        let ag = standard_chain(&feeder, &[], false, 0.0);

        let spans: Vec<Span> = (0..100)
            .map(|i| {
                Span::new("web", format!("GET /{}", i))
                    .with_trace_id(format!("{:032x}", i))
                    .with_error(i % 10 == 0)
            })
            .collect();

        let outcome = ag.run(Category::Tracing, spans).await.unwrap();
        assert_eq!(outcome, GatherOutcome::Fed(10));

        let fed = feeder.spans();
        assert_eq!(fed.len(), 10);
        assert!(fed.iter().all(|s| s.error));
        assert_eq!(feeder.calls(), 1);
    }

    #[tokio::test]
    async fn test_closed_resource_beats_later_filters() {
        let feeder = Arc::new(MemoryFeeder::new());
        let ag = standard_chain(&feeder, &[("s1", "r.*")], true, 1.0);

        let spans = vec![
            Span::new("s1", "rpc.call").with_error(true),
            Span::new("s1", "GET /"),
            Span::new("s2", "rpc.call"),
        ];
        ag.run(Category::Tracing, spans).await.unwrap();

        let fed = feeder.spans();
        assert_eq!(fed.len(), 2);
        assert!(!fed
            .iter()
            .any(|s| s.service == "s1" && s.resource.contains('r')));
    }

    #[tokio::test]
    async fn test_rare_resource_kept_once_at_zero_rate() {
        let feeder = Arc::new(MemoryFeeder::new());
        let ag = standard_chain(&feeder, &[], true, 0.0);

        let first = ag
            .run(Category::Tracing, vec![Span::new("web", "GET /rare")])
            .await
            .unwrap();
        assert_eq!(first, GatherOutcome::Fed(1));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = ag
            .run(Category::Tracing, vec![Span::new("web", "GET /rare")])
            .await
            .unwrap();
        assert_eq!(second, GatherOutcome::Empty);
        assert_eq!(feeder.spans().len(), 1);
    }

    #[tokio::test]
    async fn test_tags_finishing() {
        let feeder = Arc::new(MemoryFeeder::new());
        let ag = AfterGather::builder(Arc::clone(&feeder) as Arc<dyn Feeder>)
            .extra_tags([("host", "node-1"), ("env", "default")])
            .ignore_tags(["^secret", "(invalid"])
            .delete_message(true)
            .build();

        let span = Span::new("web", "GET /")
            .with_tag("env", "prod")
            .with_tag("secret_token", "x")
            .with_field("message", "raw payload");
        ag.run(Category::Tracing, vec![span]).await.unwrap();

        let fed = &feeder.spans()[0];
        assert_eq!(fed.tags["host"], "node-1");
        assert_eq!(fed.tags["env"], "prod");
        assert!(!fed.tags.contains_key("secret_token"));
        assert!(!fed.fields.contains_key("message"));
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_failure() {
        let feeder = Arc::new(MemoryFeeder::new());
        feeder.fail_next(2);
        let ag = AfterGather::builder(Arc::clone(&feeder) as Arc<dyn Feeder>)
            .retry(RetryPolicy::new(Duration::from_millis(5), 3))
            .build();

        let outcome = ag
            .run(Category::Tracing, vec![Span::new("web", "GET /")])
            .await
            .unwrap();
        assert_eq!(outcome, GatherOutcome::Fed(1));
        assert_eq!(feeder.calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let feeder = Arc::new(MemoryFeeder::new());
        feeder.set_failing(true);
        let ag = AfterGather::builder(Arc::clone(&feeder) as Arc<dyn Feeder>)
            .retry(RetryPolicy::new(Duration::from_millis(1), 2))
            .build();

        let result = ag
            .run(Category::Tracing, vec![Span::new("web", "GET /")])
            .await;
        assert!(matches!(result, Err(FeedError::Unavailable(_))));
        assert_eq!(feeder.calls(), 3);
    }

    #[tokio::test]
    async fn test_no_retry_without_policy() {
        let feeder = Arc::new(MemoryFeeder::new());
        feeder.set_failing(true);
        let ag = chain(&feeder);

        assert!(ag
            .run(Category::Tracing, vec![Span::new("web", "GET /")])
            .await
            .is_err());
        assert_eq!(feeder.calls(), 1);
    }
}
