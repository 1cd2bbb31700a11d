use std::sync::Arc;

use uuid::Uuid;

use crate::config::{CacheConfig, StorageConfig};
use crate::{
    CounterKey, DimensionResolver, Interval, MemoryCache, MetricError, MetricStore, SubjectCache,
    SymbolResolver,
};

/// Entry point to the metric store.
///
/// Bundles the database with the read cache and the dimension and symbol resolvers, all of which
/// are shared between clones.
#[derive(Clone, Debug)]
pub struct Metrics {
    store: MetricStore,
    cache: Arc<dyn SubjectCache>,
    dimensions: DimensionResolver,
    symbols: SymbolResolver,
}

impl Metrics {
    /// Creates the entry point on an existing store.
    pub fn new(store: MetricStore, cache: Arc<dyn SubjectCache>, config: &CacheConfig) -> Self {
        Self {
            dimensions: DimensionResolver::new(
                store.clone(),
                CacheConfig::capacity(config.dimensions),
            ),
            symbols: SymbolResolver::new(store.clone(), CacheConfig::capacity(config.symbols)),
            store,
            cache,
        }
    }

    /// Opens the database and sets up an in-memory read cache.
    pub async fn prepare(storage: &StorageConfig, cache: &CacheConfig) -> Result<Self, MetricError> {
        let store = MetricStore::prepare(storage).await?;
        let subjects = Arc::new(MemoryCache::new(CacheConfig::capacity(cache.subjects)));
        Ok(Self::new(store, subjects, cache))
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &MetricStore {
        &self.store
    }

    /// Returns the read cache.
    pub fn cache(&self) -> &dyn SubjectCache {
        self.cache.as_ref()
    }

    /// Returns the dimension resolver.
    pub fn dimensions(&self) -> &DimensionResolver {
        &self.dimensions
    }

    /// Returns the counter name resolver.
    pub fn symbols(&self) -> &SymbolResolver {
        &self.symbols
    }

    /// Returns a handle on one counter of all subjects of one type.
    ///
    /// The counter name is interned on first use.
    pub async fn access(
        &self,
        type_id: Uuid,
        counter: &str,
        interval: Arc<dyn Interval>,
    ) -> Result<MetricAccess, MetricError> {
        let symbol_id = self.symbols.resolve(counter).await?;
        Ok(MetricAccess {
            metrics: self.clone(),
            type_id,
            counter: counter.to_owned(),
            symbol_id,
            interval,
        })
    }
}

/// A handle on one counter of all subjects of one declared type.
///
/// Writes are bucketed by the handle's interval. An interval mapping everything to `0` makes the
/// counter non-temporal, which is required for [`MetricAccess::set_absolute`].
#[derive(Clone, Debug)]
pub struct MetricAccess {
    pub(crate) metrics: Metrics,
    type_id: Uuid,
    counter: String,
    symbol_id: i64,
    pub(crate) interval: Arc<dyn Interval>,
}

impl MetricAccess {
    /// Returns the declared type of the subjects.
    pub fn type_id(&self) -> Uuid {
        self.type_id
    }

    /// Returns the counter name.
    pub fn counter(&self) -> &str {
        &self.counter
    }

    /// Returns the interned counter name.
    pub fn symbol_id(&self) -> i64 {
        self.symbol_id
    }

    /// Returns the bucket granularity of writes.
    pub fn interval(&self) -> &dyn Interval {
        self.interval.as_ref()
    }

    /// Returns the key of this counter on a subject.
    pub fn key(&self, subject_id: Uuid) -> CounterKey {
        CounterKey {
            subject_id,
            type_id: self.type_id,
            symbol_id: self.symbol_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetricInterval;
    use crate::testutils::setup_metrics;

    #[tokio::test]
    async fn test_access_interns_counter() {
        let metrics = setup_metrics().await;
        let type_id = Uuid::new_v4();

        let views = metrics
            .access(type_id, "page.views", Arc::new(MetricInterval::Hourly))
            .await
            .unwrap();
        let again = metrics
            .access(type_id, "page.views", Arc::new(MetricInterval::Daily))
            .await
            .unwrap();

        assert_eq!(views.symbol_id(), again.symbol_id());
        assert_eq!(views.counter(), "page.views");
        assert_eq!(views.key(Uuid::nil()).type_id, type_id);
    }
}
