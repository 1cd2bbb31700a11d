use chrono::{DateTime, Utc};
use sqlx::migrate::MigrateError;
use uuid::Uuid;

/// An error returned by the metric store and its maintenance passes.
#[derive(Debug, thiserror::Error)]
pub enum MetricError {
    /// The connection pool could not be created.
    #[error("failed to set up the database: {0}")]
    SetupFailed(sqlx::Error),

    /// The directory of the database file could not be created.
    #[error("failed to create the database directory: {0}")]
    FileSetupError(std::io::Error),

    /// The bundled migrations could not be applied.
    #[error("failed to migrate the database: {0}")]
    MigrationError(#[from] MigrateError),

    /// A statement failed in the database.
    #[error("failed to execute a metric statement: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored payload does not have the fixed payload width.
    #[error("failed to decode a metric payload of {0} bytes")]
    MalformedData(usize),

    /// A stored identifier is not a valid UUID.
    #[error("failed to decode a stored identifier: {0}")]
    MalformedId(#[from] uuid::Error),

    /// An increment was requested with an event time after the current time.
    #[error("event time {0} lies in the future")]
    FutureEventTime(DateTime<Utc>),

    /// An absolute amount was set on a counter with a temporal interval.
    #[error("absolute amounts can only be set on non-temporal counters")]
    NonTemporalOnly,

    /// A corrupted row could not be healed by a single repair.
    #[error("failed to repair a corrupted metric row of subject {0}")]
    RepairFailed(Uuid),
}
