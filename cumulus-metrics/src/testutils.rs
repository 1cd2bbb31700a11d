use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use uuid::Uuid;

use crate::codec::DATE_DECIMAL_SHIFT;
use crate::config::CacheConfig;
use crate::{CounterKey, Interval, MemoryCache, MetricStore, Metrics};

/// Sets up a temporary, migrated SQLite database.
pub async fn setup_db() -> Pool<Sqlite> {
    let path = std::env::temp_dir().join(format!("cumulus-{}.db", Uuid::new_v4()));

    let options = SqliteConnectOptions::new()
        .filename(&path)
        .journal_mode(SqliteJournalMode::Wal)
        .create_if_missing(true);

    let db = SqlitePoolOptions::new()
        .connect_with(options)
        .await
        .unwrap();

    sqlx::migrate!("../migrations").run(&db).await.unwrap();

    db
}

/// Sets up the entry point on a temporary database with an in-memory cache.
pub async fn setup_metrics() -> Metrics {
    let config = CacheConfig::default();
    let store = MetricStore::new(setup_db().await);
    let cache = Arc::new(MemoryCache::new(CacheConfig::capacity(config.subjects)));
    Metrics::new(store, cache, &config)
}

pub fn datetime(value: &str) -> DateTime<Utc> {
    value.parse().unwrap()
}

pub fn counter_key(subject: u128) -> CounterKey {
    CounterKey {
        subject_id: Uuid::from_u128(subject),
        type_id: Uuid::from_u128(0xfeed),
        symbol_id: 1,
    }
}

/// Keeps every minute as its own bucket.
#[derive(Debug)]
pub struct Minutely;

impl Interval for Minutely {
    fn process(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(DATE_DECIMAL_SHIFT) * DATE_DECIMAL_SHIFT
    }
}
