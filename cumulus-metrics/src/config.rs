use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::MetricInterval;

/// Database file and connection pool.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path of the SQLite database file, created if missing.
    pub path: PathBuf,
    /// Maximum number of pooled connections.
    pub max_connections: u32,
    /// Number of connections kept open while idle.
    pub min_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cumulus.db"),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

const fn default_max_connections() -> u32 {
    20
}

const fn default_min_connections() -> u32 {
    2
}

/// Capacities of the in-memory caches.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of subjects whose read results are kept.
    pub subjects: usize,
    /// Number of dimension values kept.
    pub dimensions: usize,
    /// Number of counter names kept.
    pub symbols: usize,
}

impl CacheConfig {
    pub(crate) fn capacity(value: usize) -> NonZeroUsize {
        NonZeroUsize::new(value).unwrap_or(NonZeroUsize::MIN)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            subjects: 10_000,
            dimensions: 1000,
            symbols: 1000,
        }
    }
}

/// Sizing of counter-wide resummarization runs.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the channel between the producer and the workers.
    pub queue_size: usize,
    /// Number of keys loaded per page.
    pub page_size: usize,
    /// Default number of workers.
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_size: 200,
            page_size: 200,
            workers: 4,
        }
    }
}

/// Expiry of database backed locks.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    /// Seconds after which a lock is considered abandoned by a crashed owner.
    ///
    /// Running jobs refresh their lock every third of this time. Every process sharing a
    /// database should use the same value, as each one expires locks with its own.
    pub ttl: u64,
}

impl LockConfig {
    /// Returns the lock expiry.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl: 6 * 3600 }
    }
}

/// Flushing of merged increments.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct IncrementQueueConfig {
    /// Milliseconds within which a pushed increment is written.
    pub within: u64,
}

impl IncrementQueueConfig {
    /// Returns the flush window.
    pub fn within(&self) -> Duration {
        Duration::from_millis(self.within)
    }
}

impl Default for IncrementQueueConfig {
    fn default() -> Self {
        Self { within: 10_000 }
    }
}

/// A periodic resummarization job.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PeriodicJobConfig {
    /// Counter names or `prefix*` patterns.
    pub counters: Vec<String>,
    /// Number of most recent days left at full resolution.
    pub before_days: u32,
    /// Target granularity.
    pub interval: MetricInterval,
    /// Host running the job. Absent or `localhost` runs it on every host.
    pub hostname: Option<String>,
    /// Number of workers per counter.
    pub workers: usize,
}

impl Default for PeriodicJobConfig {
    fn default() -> Self {
        Self {
            counters: Vec::new(),
            before_days: 7,
            interval: MetricInterval::Daily,
            hostname: None,
            workers: 4,
        }
    }
}
