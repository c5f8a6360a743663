//! Disk-backed durable buffer.
//!
//! When the downstream feed fails, the raw inbound request is persisted here
//! and replayed later through a consumer registered for its key. Entries are
//! kept per key in write order and removed only after their consumer succeeds.

mod capacity;
mod disk;
mod request;

pub use capacity::CapacityTracker;
pub use disk::Storage;
pub use request::BufferedRequest;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Key for buffered HTTP requests
pub const HTTP_KEY: &str = "http";
/// Key for buffered UDP datagrams
pub const UDP_KEY: &str = "udp";

/// Floor for the replay back-off, so a failing consumer is never retried in
/// a tight loop
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// What `put` does when a new entry would exceed capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// Fail the write and keep everything already stored
    #[default]
    Reject,
    /// Delete the oldest entries (across all keys) until the new one fits
    EvictOldest,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding the buffer
    pub path: PathBuf,
    /// Maximum bytes stored on disk
    pub capacity: u64,
    pub policy: CapacityPolicy,
    /// Back-off for a key whose consumer failed, and idle poll period.
    /// Values below [`MIN_RETRY_INTERVAL`] are raised to it.
    pub retry_interval: Duration,
    /// LZ4-compress entry payloads
    pub compress: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./spanline_storage"),
            capacity: 5120 * 1024 * 1024, // 5GB
            policy: CapacityPolicy::Reject,
            retry_interval: Duration::from_secs(1),
            compress: true,
        }
    }
}

impl StorageConfig {
    pub fn new<P: AsRef<Path>>(path: P, capacity: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            capacity,
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy: CapacityPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compress = enabled;
        self
    }
}

/// Error returned by a replay consumer; the entry stays for a later retry
pub type ConsumerError = Box<dyn std::error::Error + Send + Sync>;

/// Replay function bound to a key
pub type Consumer = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<(), ConsumerError>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage is disabled")]
    Disabled,

    #[error("Invalid storage config: {0}")]
    InvalidConfig(String),

    #[error("Invalid key {0:?}: only [A-Za-z0-9_-] allowed")]
    InvalidKey(String),

    #[error("Consumer already registered for key {0:?}")]
    ConsumerExists(String),

    #[error("Consume worker already running")]
    AlreadyRunning,

    #[error("Capacity exceeded: {requested} bytes requested, {used}/{capacity} used")]
    CapacityExceeded {
        requested: u64,
        used: u64,
        capacity: u64,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),
}
