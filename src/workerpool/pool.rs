use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use super::stats::PoolStats;
use super::{JobError, PoolError, WorkerPoolConfig};

/// Lifecycle of a worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

/// A unit of work submitted to the pool
pub struct Job {
    name: String,
    submitted_at: Instant,
    task: BoxFuture<'static, Result<(), JobError>>,
}

impl Job {
    pub fn new<F>(name: impl Into<String>, task: F) -> Self
    where
        F: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            submitted_at: Instant::now(),
            task: task.boxed(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("submitted_at", &self.submitted_at)
            .finish_non_exhaustive()
    }
}

/// Completion handle for a submitted job. Dropping it detaches the job.
#[derive(Debug)]
pub struct JobHandle {
    rx: oneshot::Receiver<Result<(), JobError>>,
}

impl JobHandle {
    /// Wait for the job to finish
    pub async fn wait(self) -> Result<(), JobError> {
        self.rx.await.unwrap_or(Err(JobError::Abandoned))
    }
}

struct Envelope {
    job: Job,
    reply: oneshot::Sender<Result<(), JobError>>,
    _permit: OwnedSemaphorePermit,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>;

/// Fixed-size pool of tokio worker tasks fed by an admission-controlled queue
pub struct WorkerPool {
    config: WorkerPoolConfig,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    sender: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        if config.threads == 0 {
            return Err(PoolError::InvalidConfig("threads must be > 0".to_string()));
        }
        if config.buffer == 0 {
            return Err(PoolError::InvalidConfig("buffer must be > 0".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.buffer)),
            config,
            state: Mutex::new(PoolState::Created),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            workers: Mutex::new(Vec::new()),
            stats: Arc::new(PoolStats::new()),
        })
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Spawn the worker tasks
    pub fn start(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        if *state != PoolState::Created {
            return Err(PoolError::AlreadyStarted);
        }

        let rx = self.receiver.lock().take().ok_or(PoolError::AlreadyStarted)?;
        let rx: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = self.workers.lock();
        for id in 0..self.config.threads {
            let rx = Arc::clone(&rx);
            let stats = Arc::clone(&self.stats);
            workers.push(tokio::spawn(worker_loop(id, rx, stats)));
        }

        *state = PoolState::Running;
        tracing::info!(
            threads = self.config.threads,
            buffer = self.config.buffer,
            "Worker pool started"
        );
        Ok(())
    }

    /// Submit a job, waiting up to the configured timeout for a free slot
    pub async fn submit(&self, job: Job) -> Result<JobHandle, PoolError> {
        if self.state() != PoolState::Running {
            return Err(PoolError::NotRunning);
        }

        let permit = match tokio::time::timeout(
            self.config.timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // semaphore closed by shutdown
            Ok(Err(_)) => return Err(PoolError::NotRunning),
            Err(_) => {
                self.stats.job_rejected(&job.name);
                tracing::warn!(job = %job.name, timeout = ?self.config.timeout, "Worker pool saturated, rejecting job");
                return Err(PoolError::AdmissionRejected(self.config.timeout));
            }
        };

        let (reply, rx) = oneshot::channel();
        let sender = self.sender.lock().clone().ok_or(PoolError::NotRunning)?;
        sender
            .send(Envelope {
                job,
                reply,
                _permit: permit,
            })
            .map_err(|_| PoolError::NotRunning)?;

        Ok(JobHandle { rx })
    }

    /// Stop accepting jobs and wait, at most `grace`, for queued and running
    /// jobs to finish. Jobs still running afterwards are left detached.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut state = self.state.lock();
            match *state {
                PoolState::Running => *state = PoolState::ShuttingDown,
                PoolState::Created => {
                    *state = PoolState::Stopped;
                    return;
                }
                PoolState::ShuttingDown | PoolState::Stopped => return,
            }
        }

        self.permits.close();
        self.sender.lock().take();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if tokio::time::timeout(grace, futures::future::join_all(workers))
            .await
            .is_err()
        {
            tracing::warn!(grace = ?grace, "Worker pool drain timed out, abandoning in-flight jobs");
        }

        *self.state.lock() = PoolState::Stopped;
        tracing::info!("Worker pool stopped");
    }
}

async fn worker_loop(id: usize, rx: SharedReceiver, stats: Arc<PoolStats>) {
    tracing::debug!(worker = id, "Worker started");

    loop {
        let envelope = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(envelope) = envelope else { break };
        run_job(envelope, &stats).await;
    }

    tracing::debug!(worker = id, "Worker stopped");
}

async fn run_job(envelope: Envelope, stats: &PoolStats) {
    let Envelope {
        job,
        reply,
        _permit,
    } = envelope;
    let Job {
        name,
        submitted_at,
        task,
    } = job;

    stats.job_started(&name);
    let queued = submitted_at.elapsed();
    let started = Instant::now();

    let result = match AssertUnwindSafe(task).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(job = %name, "Job panicked: {}", message);
            Err(JobError::Crashed(message))
        }
    };

    let elapsed = started.elapsed();
    stats.job_finished(&name, elapsed, &result);
    tracing::trace!(job = %name, queued = ?queued, elapsed = ?elapsed, "Job finished");

    drop(_permit);
    let _ = reply.send(result);
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
