//! Storage of cumulative counters attached to records.
//!
//! Every counter row stores the running total next to the amount added in its time bucket, so
//! totals as of any point in time and sums over any range are answered from at most two rows.
//! Rows live in a single SQLite table keyed by subject, type, counter and dimension, with a fixed
//! 20 byte payload whose byte order equals time order (see [`codec`]).
//!
//! # Writing and reading
//!
//! A [`Metrics`] instance bundles the database, the read cache and the dimension and counter name
//! resolvers. Handles on a single counter are obtained through [`Metrics::access`]:
//!
//! ```no_run
//! # async fn example() -> Result<(), cumulus_metrics::MetricError> {
//! use std::sync::Arc;
//!
//! use cumulus_metrics::{CacheConfig, MetricInterval, Metrics, StorageConfig};
//!
//! let metrics = Metrics::prepare(&StorageConfig::default(), &CacheConfig::default()).await?;
//! let views = metrics
//!     .access(uuid::Uuid::nil(), "page.views", Arc::new(MetricInterval::Hourly))
//!     .await?;
//!
//! let page = uuid::Uuid::new_v4();
//! views.increment(page, None, Some("en-US"), 1.0).await?;
//! let total = views.point_value(page, None, None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Maintenance
//!
//! Rows can be merged into coarser buckets with [`Metrics::resummarize`], or for every key of a
//! counter with a [`Pipeline`]. Drifted cumulative amounts are healed from the deltas with
//! [`Metrics::reconstruct`]. [`PeriodicResummarization`] runs configured pipelines once a day.
//!
//! Counters and constants are combined arithmetically with a [`CompoundMetric`].

#![warn(missing_docs)]

mod access;
mod cache;
pub mod codec;
mod compound;
mod config;
mod dimension;
mod error;
mod increment_queue;
mod interval;
mod lock;
mod periodic;
mod pipeline;
mod read;
mod reconstruct;
mod resummarize;
mod sql;
mod statsd;
mod store;
mod symbol;
mod vendor;
mod write;

#[cfg(test)]
mod testutils;

pub use self::access::{MetricAccess, Metrics};
pub use self::cache::{CacheKey, CachedData, Extremum, MemoryCache, NoopCache, SubjectCache};
pub use self::codec::{AmountPosition, MetricData};
pub use self::compound::{CompoundMetric, Operand, Operator};
pub use self::config::*;
pub use self::dimension::DimensionResolver;
pub use self::error::MetricError;
pub use self::increment_queue::IncrementQueue;
pub use self::interval::{Interval, MetricInterval, ParseIntervalError};
pub use self::lock::{DistributedLock, LocalLock, SqliteLock};
pub use self::periodic::{LastResummarization, PERIODIC_EXECUTOR, PeriodicResummarization};
pub use self::pipeline::{JobHandle, JobState, JobStatus, Pipeline, ResummarizeAllJob};
pub use self::sql::{CounterKey, MetricKey, MetricSql, SqlValue, Statement, UpperBound};
pub use self::store::MetricStore;
pub use self::symbol::SymbolResolver;
pub use self::vendor::{SqlVendor, SqliteVendor};
