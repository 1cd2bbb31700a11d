//! Named locks guarding counter-wide maintenance runs.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hashbrown::HashSet;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::{MetricError, MetricStore};

/// A lock shared by every process working on the same database.
#[async_trait]
pub trait DistributedLock: fmt::Debug + Send + Sync {
    /// Acquires the lock without waiting. Returns `false` if another owner holds it.
    async fn try_acquire(&self, name: &str) -> Result<bool, MetricError>;

    /// Renews a lock held by this owner. Returns `false` if the lock is no longer held.
    async fn refresh(&self, name: &str) -> Result<bool, MetricError>;

    /// Releases a lock held by this owner.
    async fn release(&self, name: &str) -> Result<(), MetricError>;

    /// How often a held lock must be refreshed, `None` if it never expires.
    fn refresh_interval(&self) -> Option<Duration> {
        None
    }
}

/// An in-process lock for a single node.
#[derive(Debug, Default)]
pub struct LocalLock {
    held: Mutex<HashSet<String>>,
}

impl LocalLock {
    /// Creates a lock without any held names.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn try_acquire(&self, name: &str) -> Result<bool, MetricError> {
        Ok(self.held.lock().insert(name.to_owned()))
    }

    async fn refresh(&self, name: &str) -> Result<bool, MetricError> {
        Ok(self.held.lock().contains(name))
    }

    async fn release(&self, name: &str) -> Result<(), MetricError> {
        self.held.lock().remove(name);
        Ok(())
    }
}

/// A lock stored as a row of the metric database.
///
/// Rows of owners that crashed while holding a lock expire after the configured time to live.
/// Live owners refresh their rows three times per time to live.
#[derive(Debug)]
pub struct SqliteLock {
    store: MetricStore,
    owner: String,
    ttl: Duration,
}

impl SqliteLock {
    /// Creates a lock owner unique to this process.
    pub fn new(store: MetricStore, config: &LockConfig) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|host| host.into_string().ok())
            .unwrap_or_else(|| "localhost".to_owned());

        Self {
            store,
            owner: format!("{host}:{}", Uuid::new_v4()),
            ttl: config.ttl(),
        }
    }

    /// Returns the identity written into held lock rows.
    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[async_trait]
impl DistributedLock for SqliteLock {
    async fn try_acquire(&self, name: &str) -> Result<bool, MetricError> {
        let now = Utc::now().timestamp_millis();
        let ttl = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);

        let mut conn = self.store.acquire().await?;
        let expire = self.store.sql().delete_stale_locks(now.saturating_sub(ttl));
        let expired = expire.query().execute(&mut *conn).await?.rows_affected();
        if expired > 0 {
            cumulus_log::warn!(expired, "expired abandoned locks");
        }

        let insert = self.store.sql().insert_lock(name, &self.owner, now);
        match insert.query().execute(&mut *conn).await {
            Ok(_) => {
                cumulus_log::debug!(lock = name, owner = %self.owner, "acquired lock");
                Ok(true)
            }
            Err(error) if self.store.sql().vendor().is_duplicate_key(&error) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn refresh(&self, name: &str) -> Result<bool, MetricError> {
        let now = Utc::now().timestamp_millis();
        let update = self.store.sql().refresh_lock(name, &self.owner, now);
        let updated = update.query().execute(self.store.pool()).await?.rows_affected();
        Ok(updated > 0)
    }

    async fn release(&self, name: &str) -> Result<(), MetricError> {
        let delete = self.store.sql().delete_lock(name, &self.owner);
        delete.query().execute(self.store.pool()).await?;
        cumulus_log::debug!(lock = name, owner = %self.owner, "released lock");
        Ok(())
    }

    fn refresh_interval(&self) -> Option<Duration> {
        Some(self.ttl / 3).filter(|interval| !interval.is_zero())
    }
}
