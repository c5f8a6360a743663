use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

use super::{IngestError, Outcome, SpanDecoder};
use crate::feed::FeedError;
use crate::filter::{AfterGather, GatherOutcome};
use crate::storage::{BufferedRequest, ConsumerError, Storage, StorageError, HTTP_KEY, UDP_KEY};
use crate::trace::{Category, Span};
use crate::workerpool::{panic_message, Job, JobError, WorkerPool};

/// Counters for one pipeline
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    fed_spans: AtomicU64,
    filtered: AtomicU64,
    buffered: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    decode_errors: AtomicU64,
    crashed: AtomicU64,
    replayed: AtomicU64,
    replay_failed: AtomicU64,
    replay_discarded: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub received: u64,
    pub fed_spans: u64,
    pub filtered: u64,
    pub buffered: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub decode_errors: u64,
    pub crashed: u64,
    pub replayed: u64,
    pub replay_failed: u64,
    pub replay_discarded: u64,
}

impl PipelineStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStatsSnapshot {
            received: load(&self.received),
            fed_spans: load(&self.fed_spans),
            filtered: load(&self.filtered),
            buffered: load(&self.buffered),
            dropped: load(&self.dropped),
            rejected: load(&self.rejected),
            decode_errors: load(&self.decode_errors),
            crashed: load(&self.crashed),
            replayed: load(&self.replayed),
            replay_failed: load(&self.replay_failed),
            replay_discarded: load(&self.replay_discarded),
        }
    }
}

/// One unit of intake, kept in raw form so it can be buffered as received
enum Inbound {
    Http(BufferedRequest),
    Udp(Vec<u8>),
}

impl Inbound {
    fn key(&self) -> &'static str {
        match self {
            Inbound::Http(_) => HTTP_KEY,
            Inbound::Udp(_) => UDP_KEY,
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            Inbound::Http(req) => &req.body,
            Inbound::Udp(data) => data,
        }
    }

    fn content_type(&self) -> Option<&str> {
        match self {
            Inbound::Http(req) => req.content_type(),
            Inbound::Udp(_) => None,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        match self {
            Inbound::Http(req) => req.encode(),
            Inbound::Udp(data) => Ok(data.clone()),
        }
    }
}

/// Receives raw requests, runs them through admission, decoding and the
/// filter chain, and buffers them to disk when the feed fails.
pub struct IngestPipeline {
    name: String,
    category: Category,
    decoder: Arc<dyn SpanDecoder>,
    chain: AfterGather,
    pool: Option<Arc<WorkerPool>>,
    storage: Option<Arc<Storage>>,
    stats: PipelineStats,
}

pub struct IngestPipelineBuilder {
    name: String,
    category: Category,
    decoder: Arc<dyn SpanDecoder>,
    chain: AfterGather,
    pool: Option<Arc<WorkerPool>>,
    storage: Option<Arc<Storage>>,
}

impl IngestPipelineBuilder {
    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    /// Run requests on a worker pool. Without one they run inline.
    pub fn pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Buffer requests whose feed failed
    pub fn storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn build(self) -> Arc<IngestPipeline> {
        tracing::info!(
            input = %self.name,
            decoder = self.decoder.name(),
            filters = ?self.chain.filter_names(),
            pooled = self.pool.is_some(),
            buffered = self.storage.as_ref().is_some_and(|s| s.enabled()),
            "Ingest pipeline created"
        );
        Arc::new(IngestPipeline {
            name: self.name,
            category: self.category,
            decoder: self.decoder,
            chain: self.chain,
            pool: self.pool,
            storage: self.storage,
            stats: PipelineStats::default(),
        })
    }
}

impl IngestPipeline {
    pub fn builder(
        name: impl Into<String>,
        decoder: Arc<dyn SpanDecoder>,
        chain: AfterGather,
    ) -> IngestPipelineBuilder {
        IngestPipelineBuilder {
            name: name.into(),
            category: Category::Tracing,
            decoder,
            chain,
            pool: None,
            storage: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }

    pub fn storage(&self) -> Option<&Arc<Storage>> {
        self.storage.as_ref()
    }

    /// Process one HTTP request
    pub async fn handle_request(self: &Arc<Self>, request: BufferedRequest) -> Result<Outcome, IngestError> {
        self.dispatch(Inbound::Http(request)).await
    }

    /// Process one UDP datagram
    pub async fn handle_datagram(self: &Arc<Self>, data: Vec<u8>) -> Result<Outcome, IngestError> {
        self.dispatch(Inbound::Udp(data)).await
    }

    async fn dispatch(self: &Arc<Self>, inbound: Inbound) -> Result<Outcome, IngestError> {
        PipelineStats::incr(&self.stats.received);

        let result = match &self.pool {
            None => self.ingest_inline(inbound).await,
            Some(pool) => self.run_on_pool(pool, inbound).await,
        };

        match &result {
            Err(IngestError::AdmissionRejected(waited)) => {
                PipelineStats::incr(&self.stats.rejected);
                tracing::warn!(input = %self.name, waited = ?waited, "Request rejected, worker pool saturated");
            }
            Err(IngestError::Crashed(msg)) => {
                PipelineStats::incr(&self.stats.crashed);
                tracing::error!(input = %self.name, "Request processing crashed: {}", msg);
            }
            _ => {}
        }
        result
    }

    async fn run_on_pool(self: &Arc<Self>, pool: &WorkerPool, inbound: Inbound) -> Result<Outcome, IngestError> {
        let (tx, rx) = oneshot::channel();
        let pipeline = Arc::clone(self);

        let job = Job::new(format!("{}/{}", self.name, inbound.key()), async move {
            let result = pipeline.ingest(inbound).await;
            let status = match &result {
                Ok(_) => Ok(()),
                Err(e) => Err(JobError::Failed(e.to_string())),
            };
            let _ = tx.send(result);
            status
        });

        let handle = pool.submit(job).await?;
        match handle.wait().await {
            Err(JobError::Crashed(msg)) => Err(IngestError::Crashed(msg)),
            _ => rx.await.unwrap_or(Err(IngestError::Abandoned)),
        }
    }

    /// Run on the caller's task. A panic is contained the same way the pool
    /// contains it.
    async fn ingest_inline(&self, inbound: Inbound) -> Result<Outcome, IngestError> {
        AssertUnwindSafe(self.ingest(inbound))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(IngestError::Crashed(panic_message(panic.as_ref()))))
    }

    async fn ingest(&self, inbound: Inbound) -> Result<Outcome, IngestError> {
        let spans = match self.decoder.decode(inbound.body(), inbound.content_type()) {
            Ok(spans) => spans,
            Err(e) => {
                PipelineStats::incr(&self.stats.decode_errors);
                tracing::warn!(input = %self.name, source = inbound.key(), "Failed to decode request: {}", e);
                return Err(e.into());
            }
        };

        match self.process(spans).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Ok(self.buffer(&inbound, &e).await),
        }
    }

    /// Filter and feed decoded spans. Shared by live intake and replay.
    async fn process(&self, spans: Vec<Span>) -> Result<Outcome, FeedError> {
        match self.chain.run(self.category, spans).await? {
            GatherOutcome::Fed(n) => {
                self.stats.fed_spans.fetch_add(n as u64, Ordering::Relaxed);
                Ok(Outcome::Fed(n))
            }
            GatherOutcome::Empty => {
                PipelineStats::incr(&self.stats.filtered);
                Ok(Outcome::Filtered)
            }
        }
    }

    async fn buffer(&self, inbound: &Inbound, cause: &FeedError) -> Outcome {
        let key = inbound.key();
        let Some(storage) = self.storage.as_ref().filter(|s| s.enabled()) else {
            PipelineStats::incr(&self.stats.dropped);
            tracing::error!(input = %self.name, source = key, "Feed failed and no storage, dropping: {}", cause);
            return Outcome::Dropped;
        };

        let stored = match inbound.encode() {
            Ok(payload) => {
                let storage = Arc::clone(storage);
                tokio::task::spawn_blocking(move || storage.put(key, &payload))
                    .await
                    .unwrap_or_else(|e| Err(StorageError::Io(std::io::Error::other(e))))
            }
            Err(e) => Err(e),
        };
        match stored {
            Ok(()) => {
                PipelineStats::incr(&self.stats.buffered);
                tracing::warn!(input = %self.name, source = key, "Feed failed, request buffered: {}", cause);
                Outcome::Buffered
            }
            Err(e) => {
                PipelineStats::incr(&self.stats.dropped);
                tracing::error!(
                    input = %self.name,
                    source = key,
                    "Feed failed ({}) and buffering failed, dropping: {}",
                    cause,
                    e
                );
                Outcome::Dropped
            }
        }
    }

    /// Register replay consumers for buffered HTTP requests and UDP datagrams
    /// and start the storage consume worker.
    pub fn register_replay(self: &Arc<Self>) -> Result<(), StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        if !storage.enabled() {
            return Err(StorageError::Disabled);
        }

        for key in [HTTP_KEY, UDP_KEY] {
            let pipeline = Arc::downgrade(self);
            storage.register_consumer(key, move |payload| {
                let pipeline = Weak::clone(&pipeline);
                async move {
                    match pipeline.upgrade() {
                        Some(pipeline) => pipeline.replay(key, payload).await,
                        None => Err(ConsumerError::from("pipeline closed")),
                    }
                }
            })?;
        }

        match storage.run_consume_worker() {
            Ok(()) | Err(StorageError::AlreadyRunning) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Replay one buffered entry. Entries that can never succeed, including
    /// ones whose processing panics, are acknowledged so they do not block
    /// the queue.
    async fn replay(&self, key: &str, payload: Vec<u8>) -> Result<(), ConsumerError> {
        match AssertUnwindSafe(self.replay_entry(key, payload)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                PipelineStats::incr(&self.stats.crashed);
                self.discard(key, &format!("processing panicked: {}", panic_message(panic.as_ref())));
                Ok(())
            }
        }
    }

    async fn replay_entry(&self, key: &str, payload: Vec<u8>) -> Result<(), ConsumerError> {
        let inbound = match key {
            HTTP_KEY => match BufferedRequest::decode(&payload) {
                Ok(req) => Inbound::Http(req),
                Err(e) => {
                    self.discard(key, &e);
                    return Ok(());
                }
            },
            _ => Inbound::Udp(payload),
        };

        let spans = match self.decoder.decode(inbound.body(), inbound.content_type()) {
            Ok(spans) => spans,
            Err(e) => {
                self.discard(key, &e);
                return Ok(());
            }
        };

        match self.process(spans).await {
            Ok(outcome) => {
                PipelineStats::incr(&self.stats.replayed);
                tracing::info!(input = %self.name, source = key, outcome = ?outcome, "Replayed buffered request");
                Ok(())
            }
            Err(e) => {
                PipelineStats::incr(&self.stats.replay_failed);
                Err(e.into())
            }
        }
    }

    fn discard(&self, key: &str, e: &dyn std::fmt::Display) {
        PipelineStats::incr(&self.stats.replay_discarded);
        tracing::error!(input = %self.name, source = key, "Discarding buffered entry: {}", e);
    }

    /// Stop the pool, then close storage. Each step waits at most `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!(input = %self.name, grace = ?grace, "Shutting down ingest pipeline");
        if let Some(pool) = &self.pool {
            pool.shutdown(grace).await;
        }
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.close(grace).await {
                tracing::error!(input = %self.name, "Failed to close storage: {}", e);
            }
        }
    }
}
