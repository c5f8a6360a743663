use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::{FeedError, FeedOptions, Feeder};
use crate::trace::{Category, Span};

/// Feeds span batches to a collector over HTTP as JSON
#[derive(Debug, Clone)]
pub struct HttpFeeder {
    http_client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct FeedBody<'a> {
    category: Category,
    input: &'a str,
    cost_ms: u64,
    election: bool,
    spans: &'a [Span],
}

impl HttpFeeder {
    pub fn new(url: impl Into<String>) -> Result<Self, FeedError> {
        Self::with_timeout(url, Duration::from_secs(30))
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::Unavailable(e.to_string()))?;

        Ok(Self {
            http_client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Feeder for HttpFeeder {
    async fn feed(
        &self,
        category: Category,
        spans: &[Span],
        options: &FeedOptions,
    ) -> Result<(), FeedError> {
        let body = FeedBody {
            category,
            input: &options.input,
            cost_ms: options.collect_cost.as_millis() as u64,
            election: options.election,
            spans,
        };

        let response = self
            .http_client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| FeedError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(FeedError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        tracing::debug!(
            input = %options.input,
            category = %category,
            spans = spans.len(),
            "Fed batch to collector"
        );
        Ok(())
    }
}
