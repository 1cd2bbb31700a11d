use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use cumulus_statsd::metric;
use lru::LruCache;
use parking_lot::Mutex;
use sqlx::{Row, SqliteConnection};

use crate::statsd::MetricCounters;
use crate::{MetricError, MetricStore};

/// Interns counter names as integer symbols stored on every row.
#[derive(Clone)]
pub struct SymbolResolver {
    store: MetricStore,
    cache: Arc<Mutex<LruCache<String, i64>>>,
}

impl fmt::Debug for SymbolResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolResolver")
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl SymbolResolver {
    /// Creates a resolver keeping at most `capacity` names in memory.
    pub fn new(store: MetricStore, capacity: NonZeroUsize) -> Self {
        Self {
            store,
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Returns the symbol of a counter name, interning the name if needed.
    pub async fn resolve(&self, name: &str) -> Result<i64, MetricError> {
        if let Some(symbol_id) = self.lookup(name).await? {
            return Ok(symbol_id);
        }

        let mut conn = self.store.acquire().await?;
        let insert = self.store.sql().insert_symbol(name);
        match insert.query().execute(&mut *conn).await {
            Ok(_) => {
                metric!(counter(MetricCounters::SymbolCreated) += 1);
                cumulus_log::debug!(counter = name, "interned counter name");
            }
            Err(error) if self.store.sql().vendor().is_duplicate_key(&error) => {}
            Err(error) => return Err(error.into()),
        }

        let symbol_id = self
            .select(&mut conn, name)
            .await?
            .ok_or(MetricError::Database(sqlx::Error::RowNotFound))?;
        self.cache.lock().put(name.to_owned(), symbol_id);

        Ok(symbol_id)
    }

    /// Returns the symbol of an interned counter name.
    pub async fn lookup(&self, name: &str) -> Result<Option<i64>, MetricError> {
        let key = name.to_owned();
        if let Some(symbol_id) = self.cache.lock().get(&key) {
            return Ok(Some(*symbol_id));
        }

        let mut conn = self.store.acquire().await?;
        let symbol_id = self.select(&mut conn, name).await?;
        if let Some(symbol_id) = symbol_id {
            self.cache.lock().put(key, symbol_id);
        }

        Ok(symbol_id)
    }

    /// Returns all interned counter names in lexical order.
    pub async fn names(&self) -> Result<Vec<String>, MetricError> {
        let select = self.store.sql().select_symbols();
        let rows = select.query().fetch_all(self.store.pool()).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(MetricError::from))
            .collect()
    }

    /// Returns the interned counter names matching any of the patterns.
    ///
    /// A pattern ending in `*` matches every name with the preceding prefix, any other pattern
    /// matches exactly.
    pub async fn matching(&self, patterns: &[String]) -> Result<Vec<String>, MetricError> {
        let names = self.names().await?;
        Ok(names
            .into_iter()
            .filter(|name| patterns.iter().any(|pattern| matches_pattern(pattern, name)))
            .collect())
    }

    async fn select(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> Result<Option<i64>, MetricError> {
        let select = self.store.sql().select_symbol(name);
        let row = select.query().fetch_optional(&mut *conn).await?;
        Ok(row.map(|row| row.try_get(0)).transpose()?)
    }
}

fn matches_pattern(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}
