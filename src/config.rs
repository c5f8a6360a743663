//! Agent configuration
//!
//! Loaded from an optional JSON file named by `SPANLINE_CONFIG`, then
//! overridden from the environment:
//! - SPANLINE_HOST: Bind address (default: 0.0.0.0)
//! - SPANLINE_PORT: Port number (default: 9529)
//! - SPANLINE_COLLECTOR_URL: Downstream collector endpoint
//! - SPANLINE_UDP_ADDRESS: UDP listen address (disabled when unset)

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::api::ServerConfig;
use crate::feed::Feeder;
use crate::filter::{
    AfterGather, CloseResource, ErrorPenetration, FilterError, RareResourceKeeper, RetryPolicy,
    Sampler, DEFAULT_RARE_WINDOW,
};
use crate::storage::{CapacityPolicy, StorageConfig};
use crate::workerpool::WorkerPoolConfig;

pub const CONFIG_PATH_ENV: &str = "SPANLINE_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value {value:?} for {var}")]
    Env { var: String, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Filter(#[from] FilterError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Keep probability in [0, 1]
    pub sampling_rate: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self { sampling_rate: 1.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThreadsConfig {
    pub buffer: usize,
    pub threads: usize,
    pub timeout_ms: u64,
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        let pool = WorkerPoolConfig::default();
        Self {
            buffer: pool.buffer,
            threads: pool.threads,
            timeout_ms: pool.timeout.as_millis() as u64,
        }
    }
}

impl From<&ThreadsConfig> for WorkerPoolConfig {
    fn from(c: &ThreadsConfig) -> Self {
        WorkerPoolConfig::new(c.buffer, c.threads, Duration::from_millis(c.timeout_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub path: PathBuf,
    pub capacity_mb: u64,
    pub policy: CapacityPolicy,
    pub compress: bool,
    pub retry_interval_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let defaults = StorageConfig::default();
        Self {
            path: defaults.path,
            capacity_mb: defaults.capacity / (1024 * 1024),
            policy: defaults.policy,
            compress: defaults.compress,
            retry_interval_ms: defaults.retry_interval.as_millis() as u64,
        }
    }
}

impl From<&StorageSettings> for StorageConfig {
    fn from(s: &StorageSettings) -> Self {
        StorageConfig::new(&s.path, s.capacity_mb.saturating_mul(1024 * 1024))
            .with_policy(s.policy)
            .with_compression(s.compress)
            .with_retry_interval(Duration::from_millis(s.retry_interval_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub interval_ms: u64,
    pub attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            interval_ms: policy.interval.as_millis() as u64,
            attempts: policy.attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    /// HTTP path accepting OTLP/JSON exports
    pub endpoint: String,
    pub udp_address: Option<String>,
    pub collector_url: String,
    /// Added to every span that does not already carry the key
    pub tags: HashMap<String, String>,
    /// Regexes; matching tag keys are stripped before feeding
    pub ignore_tags: Vec<String>,
    pub delete_message: bool,
    /// service (or "*") -> resource regexes to drop
    pub close_resource: HashMap<String, Vec<String>>,
    pub keep_rare_resource: bool,
    /// Seconds a (service, resource) pair counts as seen
    pub rare_resource_window: u64,
    pub sampler: Option<SamplerConfig>,
    pub retry: Option<RetryConfig>,
    /// Run requests on a bounded worker pool
    pub threads: Option<ThreadsConfig>,
    /// Buffer requests to disk when the collector is unreachable
    pub storage: Option<StorageSettings>,
    pub shutdown_grace_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            host: server.host,
            port: server.port,
            endpoint: server.endpoint,
            udp_address: None,
            collector_url: "http://127.0.0.1:9528/v1/write/tracing".to_string(),
            tags: HashMap::new(),
            ignore_tags: Vec::new(),
            delete_message: false,
            close_resource: HashMap::new(),
            keep_rare_resource: false,
            rare_resource_window: DEFAULT_RARE_WINDOW.as_secs(),
            sampler: None,
            retry: None,
            threads: None,
            storage: None,
            shutdown_grace_ms: 5000,
        }
    }
}

impl AgentConfig {
    /// File (if `SPANLINE_CONFIG` is set), then environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Apply `SPANLINE_*` overrides using `lookup` to read variables
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("SPANLINE_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("SPANLINE_PORT") {
            self.port = port.parse().map_err(|_| ConfigError::Env {
                var: "SPANLINE_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(url) = lookup("SPANLINE_COLLECTOR_URL") {
            self.collector_url = url;
        }
        if let Some(addr) = lookup("SPANLINE_UDP_ADDRESS") {
            self.udp_address = Some(addr).filter(|a| !a.is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.endpoint.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "endpoint must start with '/': {:?}",
                self.endpoint
            )));
        }
        if self.collector_url.is_empty() {
            return Err(ConfigError::Invalid("collector_url is empty".to_string()));
        }
        if let Some(sampler) = &self.sampler {
            if !(0.0..=1.0).contains(&sampler.sampling_rate) {
                return Err(FilterError::InvalidSamplingRate(sampler.sampling_rate).into());
            }
        }
        if let Some(threads) = &self.threads {
            if threads.buffer == 0 || threads.threads == 0 {
                return Err(ConfigError::Invalid(
                    "threads.buffer and threads.threads must be > 0".to_string(),
                ));
            }
        }
        if self.storage.as_ref().is_some_and(|s| s.capacity_mb == 0) {
            return Err(ConfigError::Invalid("storage.capacity_mb must be > 0".to_string()));
        }
        if self.storage.as_ref().is_some_and(|s| s.retry_interval_ms == 0) {
            return Err(ConfigError::Invalid(
                "storage.retry_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            endpoint: self.endpoint.clone(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Filter chain in its fixed order: close resource, error penetration,
    /// rare resource keeper, sampler. Disabled stages are left out.
    pub fn build_chain(&self, feeder: Arc<dyn Feeder>) -> Result<AfterGather, ConfigError> {
        let mut builder = AfterGather::builder(feeder)
            .input("otlp")
            .extra_tags(self.tags.clone())
            .ignore_tags(self.ignore_tags.iter().cloned())
            .delete_message(self.delete_message);
        if let Some(retry) = &self.retry {
            builder = builder.retry(RetryPolicy::new(
                Duration::from_millis(retry.interval_ms),
                retry.attempts,
            ));
        }
        let mut chain = builder.build();

        let close = CloseResource::from_rules(&self.close_resource);
        if !close.is_empty() {
            chain.append_filter(close);
        }
        chain.append_filter(ErrorPenetration);
        if self.keep_rare_resource {
            chain.append_filter(RareResourceKeeper::new(Duration::from_secs(
                self.rare_resource_window,
            )));
        }
        if let Some(sampler) = &self.sampler {
            chain.append_filter(Sampler::new(sampler.sampling_rate)?);
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeeder;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.port, 9529);
        assert_eq!(config.endpoint, "/v1/traces");
        assert!(config.storage.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spanline.json");
        std::fs::write(
            &path,
            r#"{
                "port": 9600,
                "close_resource": {"*": ["^/health$"]},
                "keep_rare_resource": true,
                "sampler": {"sampling_rate": 0.25},
                "threads": {"buffer": 10, "threads": 2, "timeout_ms": 500},
                "storage": {"path": "/var/lib/spanline", "capacity_mb": 64, "policy": "evict_oldest"}
            }"#,
        )
        .unwrap();

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.port, 9600);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.sampler.as_ref().unwrap().sampling_rate, 0.25);

        let pool: WorkerPoolConfig = config.threads.as_ref().unwrap().into();
        assert_eq!(pool.timeout, Duration::from_millis(500));

        let storage: StorageConfig = config.storage.as_ref().unwrap().into();
        assert_eq!(storage.capacity, 64 * 1024 * 1024);
        assert_eq!(storage.policy, CapacityPolicy::EvictOldest);
        assert!(storage.compress);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AgentConfig::from_file("/nonexistent/spanline.json"),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SPANLINE_HOST", "127.0.0.1"),
            ("SPANLINE_PORT", "9000"),
            ("SPANLINE_UDP_ADDRESS", "0.0.0.0:9530"),
        ]
        .into_iter()
        .collect();

        let mut config = AgentConfig::default();
        config
            .apply_env(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.udp_address.as_deref(), Some("0.0.0.0:9530"));

        let result = config.apply_env(|var| (var == "SPANLINE_PORT").then(|| "http".to_string()));
        assert!(matches!(result, Err(ConfigError::Env { .. })));
    }

    #[test]
    fn test_validate_rejects_bad_rate() {
        let config = AgentConfig {
            sampler: Some(SamplerConfig { sampling_rate: 1.5 }),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Filter(_))));
    }

    #[test]
    fn test_validate_rejects_zero_retry_interval() {
        let mut config = AgentConfig {
            storage: Some(StorageSettings::default()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        if let Some(storage) = config.storage.as_mut() {
            storage.retry_interval_ms = 0;
        }
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("retry_interval_ms")));
    }

    #[test]
    fn test_chain_order() {
        let config = AgentConfig {
            close_resource: HashMap::from([("*".to_string(), vec!["^/health$".to_string()])]),
            keep_rare_resource: true,
            sampler: Some(SamplerConfig { sampling_rate: 0.5 }),
            ..Default::default()
        };
        let chain = config.build_chain(Arc::new(MemoryFeeder::new())).unwrap();
        assert_eq!(
            chain.filter_names(),
            vec!["close_resource", "error_penetration", "rare_resource", "sampler"]
        );
    }
}
