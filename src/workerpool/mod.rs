//! Bounded worker pool used as admission control in front of decode and
//! filter work.
//!
//! Jobs are admitted against a fixed number of permits (`buffer`). A permit is
//! held from the moment a job is accepted until it finishes, so the amount of
//! queued plus running work never exceeds `buffer`, and at most `threads` jobs
//! execute at once. When every permit is taken, `submit` waits up to the
//! configured timeout and then rejects the job.

mod pool;
mod stats;

pub(crate) use pool::panic_message;
pub use pool::{Job, JobHandle, PoolState, WorkerPool};
pub use stats::{JobStatsSnapshot, PoolStats};

use std::time::Duration;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum number of admitted-but-unfinished jobs
    pub buffer: usize,
    /// Number of worker tasks
    pub threads: usize,
    /// How long `submit` may wait for a free slot
    pub timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            buffer: 100,
            threads: num_cpus::get() * 2,
            timeout: Duration::from_secs(1),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(buffer: usize, threads: usize, timeout: Duration) -> Self {
        Self {
            buffer,
            threads,
            timeout,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Invalid worker pool config: {0}")]
    InvalidConfig(String),

    #[error("Worker pool already started")]
    AlreadyStarted,

    #[error("Worker pool is not running")]
    NotRunning,

    #[error("Job rejected: worker pool saturated for {0:?}")]
    AdmissionRejected(Duration),
}

/// Result of a single job
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("Job failed: {0}")]
    Failed(String),

    #[error("Job crashed: {0}")]
    Crashed(String),

    #[error("Job abandoned before completion")]
    Abandoned,
}
