use std::path::Path;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use tokio::fs::DirBuilder;
use uuid::Uuid;

use crate::codec::MetricData;
use crate::config::StorageConfig;
use crate::sql::{CounterKey, MetricKey, MetricSql, UpperBound};
use crate::MetricError;

/// Access to the SQLite database holding all metric tables.
///
/// Cloning is cheap and shares the connection pool.
#[derive(Debug, Clone)]
pub struct MetricStore {
    db: Pool<Sqlite>,
    sql: MetricSql,
}

impl MetricStore {
    /// Creates a store on an already migrated pool.
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self {
            db,
            sql: MetricSql::default(),
        }
    }

    /// Opens the database file, runs all migrations and creates the connection pool.
    pub async fn prepare(config: &StorageConfig) -> Result<Self, MetricError> {
        cumulus_log::info!("metric database {}", config.path.display());

        Self::create_directory(&config.path).await?;

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            // Readers do not block the writer and vice versa, which keeps reads available during
            // resummarization runs.
            .journal_mode(SqliteJournalMode::Wal)
            // WAL mode is safe from corruption with synchronous=NORMAL.
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let db = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_with(options)
            .await
            .map_err(MetricError::SetupFailed)?;

        sqlx::migrate!("../migrations").run(&db).await?;

        Ok(Self::new(db))
    }

    /// Creates the directory of the database file.
    async fn create_directory(path: &Path) -> Result<(), MetricError> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };

        if !parent.as_os_str().is_empty() && !parent.exists() {
            cumulus_log::debug!("creating directory for database file: {}", parent.display());
            DirBuilder::new()
                .recursive(true)
                .create(&parent)
                .await
                .map_err(MetricError::FileSetupError)?;
        }

        Ok(())
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.db
    }

    /// Returns the statement generator.
    pub fn sql(&self) -> &MetricSql {
        &self.sql
    }

    /// Acquires a pooled connection for one unit of work.
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>, MetricError> {
        Ok(self.db.acquire().await?)
    }

    /// Returns the newest payload of a key, optionally bounded.
    pub(crate) async fn max_data(
        &self,
        conn: &mut SqliteConnection,
        key: &MetricKey,
        to: Option<UpperBound>,
    ) -> Result<Option<MetricData>, MetricError> {
        let statement = self.sql.select_max(key, to);
        let row = statement.query().fetch_one(&mut *conn).await?;
        decode_optional_data(&row, 0)
    }

    /// Returns the oldest payload of a key at or after `from`.
    pub(crate) async fn min_data(
        &self,
        conn: &mut SqliteConnection,
        key: &MetricKey,
        from: Option<i64>,
    ) -> Result<Option<MetricData>, MetricError> {
        let statement = self.sql.select_min(key, from);
        let row = statement.query().fetch_one(&mut *conn).await?;
        decode_optional_data(&row, 0)
    }

    /// Returns all `(dimension, payload)` rows of a counter ordered by dimension and time.
    pub(crate) async fn rows(
        &self,
        conn: &mut SqliteConnection,
        key: &CounterKey,
        dimension_id: Option<Uuid>,
        from: Option<i64>,
        to: Option<UpperBound>,
    ) -> Result<Vec<(Uuid, MetricData)>, MetricError> {
        let statement = self.sql.select_rows(key, dimension_id, from, to);
        statement
            .query()
            .fetch_all(&mut *conn)
            .await?
            .iter()
            .map(|row| -> Result<_, MetricError> {
                Ok((decode_uuid(row, 0)?, decode_data(row, 1)?))
            })
            .collect()
    }
}

/// Decodes a UUID stored as a 16 byte blob.
pub(crate) fn decode_uuid(row: &SqliteRow, index: usize) -> Result<Uuid, MetricError> {
    let bytes: Vec<u8> = row.try_get(index)?;
    Ok(Uuid::from_slice(&bytes)?)
}

/// Decodes a payload column.
pub(crate) fn decode_data(row: &SqliteRow, index: usize) -> Result<MetricData, MetricError> {
    let bytes: Vec<u8> = row.try_get(index)?;
    MetricData::from_slice(&bytes)
}

/// Decodes a nullable payload column, such as the result of an aggregate over no rows.
pub(crate) fn decode_optional_data(
    row: &SqliteRow,
    index: usize,
) -> Result<Option<MetricData>, MetricError> {
    let bytes: Option<Vec<u8>> = row.try_get(index)?;
    bytes.as_deref().map(MetricData::from_slice).transpose()
}
