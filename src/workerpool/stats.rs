use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::JobError;

/// Counters for one job name
#[derive(Debug, Default)]
struct JobCounters {
    alive: AtomicU64,
    total: AtomicU64,
    failed: AtomicU64,
    crashed: AtomicU64,
    rejected: AtomicU64,
    latency_us_total: AtomicU64,
    latency_us_max: AtomicU64,
}

/// Per-name liveness, latency and crash counters
#[derive(Debug, Default)]
pub struct PoolStats {
    jobs: DashMap<String, Arc<JobCounters>>,
}

/// Point-in-time view of one job name's counters
#[derive(Debug, Clone, Serialize)]
pub struct JobStatsSnapshot {
    pub name: String,
    pub alive: u64,
    pub total: u64,
    pub failed: u64,
    pub crashed: u64,
    pub rejected: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
}

impl PoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, name: &str) -> Arc<JobCounters> {
        if let Some(c) = self.jobs.get(name) {
            return Arc::clone(&c);
        }
        Arc::clone(&self.jobs.entry(name.to_string()).or_default())
    }

    pub(crate) fn job_started(&self, name: &str) {
        self.counters(name).alive.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_finished(&self, name: &str, latency: Duration, result: &Result<(), JobError>) {
        let c = self.counters(name);
        c.alive.fetch_sub(1, Ordering::Relaxed);
        c.total.fetch_add(1, Ordering::Relaxed);

        let us = latency.as_micros() as u64;
        c.latency_us_total.fetch_add(us, Ordering::Relaxed);
        c.latency_us_max.fetch_max(us, Ordering::Relaxed);

        match result {
            Ok(()) => {}
            Err(JobError::Crashed(_)) => {
                c.crashed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                c.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn job_rejected(&self, name: &str) {
        self.counters(name).rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Jobs of this name currently executing
    pub fn alive(&self, name: &str) -> u64 {
        self.jobs
            .get(name)
            .map(|c| c.alive.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn crashed(&self, name: &str) -> u64 {
        self.jobs
            .get(name)
            .map(|c| c.crashed.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<JobStatsSnapshot> {
        let mut out: Vec<JobStatsSnapshot> = self
            .jobs
            .iter()
            .map(|entry| {
                let c = entry.value();
                let total = c.total.load(Ordering::Relaxed);
                let latency_total = c.latency_us_total.load(Ordering::Relaxed);
                JobStatsSnapshot {
                    name: entry.key().clone(),
                    alive: c.alive.load(Ordering::Relaxed),
                    total,
                    failed: c.failed.load(Ordering::Relaxed),
                    crashed: c.crashed.load(Ordering::Relaxed),
                    rejected: c.rejected.load(Ordering::Relaxed),
                    avg_latency_ms: if total == 0 {
                        0.0
                    } else {
                        latency_total as f64 / total as f64 / 1000.0
                    },
                    max_latency_ms: c.latency_us_max.load(Ordering::Relaxed) as f64 / 1000.0,
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
