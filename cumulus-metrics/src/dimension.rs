use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use cumulus_statsd::metric;
use lru::LruCache;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::statsd::MetricCounters;
use crate::store::decode_uuid;
use crate::{MetricError, MetricStore};

/// Maps dimension values to stable identifiers.
///
/// Empty and absent values map to the nil UUID, which is the aggregate across all dimensions.
/// Identifiers are created on first use and never change afterwards. Cloning shares the cache.
#[derive(Clone)]
pub struct DimensionResolver {
    store: MetricStore,
    cache: Arc<Mutex<LruCache<String, Uuid>>>,
}

impl fmt::Debug for DimensionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DimensionResolver")
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl DimensionResolver {
    /// Creates a resolver keeping at most `capacity` values in memory.
    pub fn new(store: MetricStore, capacity: NonZeroUsize) -> Self {
        Self {
            store,
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Returns the identifier of a value, creating it if it does not exist yet.
    pub async fn resolve(&self, value: Option<&str>) -> Result<Uuid, MetricError> {
        let Some(value) = value.filter(|value| !value.is_empty()) else {
            return Ok(Uuid::nil());
        };

        if let Some(dimension_id) = self.lookup(Some(value)).await? {
            return Ok(dimension_id);
        }

        let dimension_id = Uuid::now_v7();
        let insert = self.store.sql().insert_dimension(dimension_id, value);
        let mut conn = self.store.acquire().await?;

        let dimension_id = match insert.query().execute(&mut *conn).await {
            Ok(_) => {
                metric!(counter(MetricCounters::DimensionCreated) += 1);
                cumulus_log::trace!(dimension = value, "created dimension");
                dimension_id
            }
            // Another writer created the value in the meantime, its identifier wins.
            Err(error) if self.store.sql().vendor().is_duplicate_key(&error) => {
                self.select(&mut conn, value)
                    .await?
                    .ok_or(MetricError::Database(error))?
            }
            Err(error) => return Err(error.into()),
        };

        self.cache.lock().put(value.to_owned(), dimension_id);
        Ok(dimension_id)
    }

    /// Returns the identifier of an existing value without creating it.
    pub async fn lookup(&self, value: Option<&str>) -> Result<Option<Uuid>, MetricError> {
        let Some(value) = value.filter(|value| !value.is_empty()) else {
            return Ok(Some(Uuid::nil()));
        };

        let key = value.to_owned();
        if let Some(dimension_id) = self.cache.lock().get(&key) {
            return Ok(Some(*dimension_id));
        }

        let mut conn = self.store.acquire().await?;
        let dimension_id = self.select(&mut conn, value).await?;
        if let Some(dimension_id) = dimension_id {
            self.cache.lock().put(key, dimension_id);
        }

        Ok(dimension_id)
    }

    async fn select(
        &self,
        conn: &mut sqlx::SqliteConnection,
        value: &str,
    ) -> Result<Option<Uuid>, MetricError> {
        let select = self.store.sql().select_dimension(value);
        let row = select.query().fetch_optional(&mut *conn).await?;
        row.map(|row| decode_uuid(&row, 0)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::setup_db;

    fn resolver(store: &MetricStore) -> DimensionResolver {
        DimensionResolver::new(store.clone(), NonZeroUsize::new(1000).unwrap())
    }

    #[tokio::test]
    async fn test_empty_is_aggregate() {
        let store = MetricStore::new(setup_db().await);
        let dimensions = resolver(&store);

        assert_eq!(dimensions.resolve(None).await.unwrap(), Uuid::nil());
        assert_eq!(dimensions.resolve(Some("")).await.unwrap(), Uuid::nil());
        assert_eq!(dimensions.lookup(Some("")).await.unwrap(), Some(Uuid::nil()));
    }

    #[tokio::test]
    async fn test_resolve_is_stable_across_caches() {
        let store = MetricStore::new(setup_db().await);

        let first = resolver(&store).resolve(Some("en-US")).await.unwrap();
        assert!(!first.is_nil());

        let dimensions = resolver(&store);
        assert_eq!(dimensions.resolve(Some("en-US")).await.unwrap(), first);
        assert_eq!(dimensions.resolve(Some("en-US")).await.unwrap(), first);
        assert_ne!(dimensions.resolve(Some("de-DE")).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_lookup_does_not_create() {
        let store = MetricStore::new(setup_db().await);
        let dimensions = resolver(&store);

        assert_eq!(dimensions.lookup(Some("missing")).await.unwrap(), None);
        let created = dimensions.resolve(Some("missing")).await.unwrap();
        assert_eq!(dimensions.lookup(Some("missing")).await.unwrap(), Some(created));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolve_agrees() {
        let store = MetricStore::new(setup_db().await);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let dimensions = resolver(&store);
                tokio::spawn(async move { dimensions.resolve(Some("shared")).await.unwrap() })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }
}
