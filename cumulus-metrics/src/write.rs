//! Insert, update and repair of counter rows.
//!
//! Every write is keyed on the newest row of the metric key:
//!
//!  - without a row, or with a row older than the written bucket, a new row is appended carrying
//!    the previous cumulative amount plus the delta,
//!  - with a row at the written bucket, both amounts of that row are increased in place,
//!  - with a row newer than the written bucket (late write), the bucket row is created if needed
//!    and the delta is propagated into the cumulative amount of every later row.
//!
//! Conditional writes that affect no row indicate a row stored with a different type. Such a row
//! is repaired once by rewriting its type, after which the write is retried.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use cumulus_statsd::metric;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::codec::{self, AmountPosition, MetricData};
use crate::sql::UpperBound;
use crate::statsd::{MetricCounters, MetricTimers};
use crate::store::decode_data;
use crate::{MetricAccess, MetricError, MetricKey, MetricStore};

/// Number of write attempts: the initial one and one after a repair.
const MAX_ATTEMPTS: usize = 2;

/// The outcome of a single write attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    /// The write was applied.
    Applied,
    /// A conditional write found no matching row.
    Corrupted,
}

/// A write to the rows of one metric key.
#[derive(Clone, Copy, Debug)]
enum WriteOp {
    /// Adds a fixed-point `delta` at the bucket `timestamp`.
    Increment {
        timestamp: i64,
        delta: i64,
        implicit: bool,
    },
    /// Sets both amounts of the single bucket of a non-temporal counter.
    Absolute { value: i64 },
}

impl WriteOp {
    fn timestamp(&self) -> i64 {
        match self {
            Self::Increment { timestamp, .. } => *timestamp,
            Self::Absolute { .. } => 0,
        }
    }
}

impl MetricStore {
    /// Applies a write, repairing a corrupted bucket row at most once.
    async fn write(
        &self,
        conn: &mut SqliteConnection,
        key: &MetricKey,
        op: WriteOp,
    ) -> Result<(), MetricError> {
        for attempt in 1..=MAX_ATTEMPTS {
            if self.try_write(conn, key, op).await? == Attempt::Applied {
                return Ok(());
            }

            if attempt < MAX_ATTEMPTS {
                cumulus_log::warn!(
                    subject = %key.subject_id,
                    dimension = %key.dimension_id,
                    "repairing corrupted metric row",
                );
                metric!(counter(MetricCounters::Corrupted) += 1, outcome = "repaired");
                let repair = self.sql().repair(key, op.timestamp());
                repair.query().execute(&mut *conn).await?;
            }
        }

        metric!(counter(MetricCounters::Corrupted) += 1, outcome = "failed");
        Err(MetricError::RepairFailed(key.subject_id))
    }

    async fn try_write(
        &self,
        conn: &mut SqliteConnection,
        key: &MetricKey,
        op: WriteOp,
    ) -> Result<Attempt, MetricError> {
        match op {
            WriteOp::Increment {
                timestamp,
                delta,
                implicit,
            } => self.try_increment(conn, key, timestamp, delta, implicit).await,
            WriteOp::Absolute { value } => self.try_set(conn, key, value).await,
        }
    }

    async fn try_increment(
        &self,
        conn: &mut SqliteConnection,
        key: &MetricKey,
        timestamp: i64,
        delta: i64,
        implicit: bool,
    ) -> Result<Attempt, MetricError> {
        // Writes at the current time almost always hit an existing bucket.
        if implicit && self.update_bucket(conn, key, timestamp, delta).await? {
            metric!(counter(MetricCounters::Write) += 1, path = "fast");
            return Ok(Attempt::Applied);
        }

        let bucket = codec::truncate_timestamp(timestamp);
        let max = self.max_data(conn, key, None).await?;

        match max.map(|data| data.timestamp().cmp(&bucket)) {
            None | Some(Ordering::Less) => {
                let previous =
                    max.map_or(0, |data| data.fixed_amount(AmountPosition::Cumulative));
                let data = MetricData::from_fixed(timestamp, previous + delta, delta);
                metric!(counter(MetricCounters::Write) += 1, path = "append");
                self.insert_or_update(conn, key, data, delta).await
            }
            Some(Ordering::Equal) => {
                metric!(counter(MetricCounters::Write) += 1, path = "update");
                Ok(self.update_bucket(conn, key, timestamp, delta).await?.into())
            }
            Some(Ordering::Greater) => {
                metric!(counter(MetricCounters::Write) += 1, path = "late");
                self.late_write(conn, key, timestamp, delta).await
            }
        }
    }

    /// Appends a row, falling back to an in-place update if a concurrent writer created it.
    async fn insert_or_update(
        &self,
        conn: &mut SqliteConnection,
        key: &MetricKey,
        data: MetricData,
        delta: i64,
    ) -> Result<Attempt, MetricError> {
        let insert = self.sql().insert(key, data);
        match insert.query().execute(&mut *conn).await {
            Ok(_) => Ok(Attempt::Applied),
            Err(error) if self.sql().vendor().is_duplicate_key(&error) => {
                metric!(counter(MetricCounters::InsertRace) += 1);
                let updated = self.update_bucket(conn, key, data.timestamp(), delta).await?;
                Ok(updated.into())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Writes a delta before the newest row of a key.
    async fn late_write(
        &self,
        conn: &mut SqliteConnection,
        key: &MetricKey,
        timestamp: i64,
        delta: i64,
    ) -> Result<Attempt, MetricError> {
        let previous = self
            .max_data(conn, key, Some(UpperBound::Before(timestamp)))
            .await?
            .map_or(0, |data| data.fixed_amount(AmountPosition::Cumulative));

        // The bucket row starts out without a delta, the propagating update credits it.
        let insert = self
            .sql()
            .insert(key, MetricData::from_fixed(timestamp, previous, 0));
        match insert.query().execute(&mut *conn).await {
            Ok(_) => {}
            Err(error) if self.sql().vendor().is_duplicate_key(&error) => {}
            Err(error) => return Err(error.into()),
        }

        let update = self.sql().update_from(key, timestamp, delta);
        let result = update.query().execute(&mut *conn).await?;
        Ok((result.rows_affected() > 0).into())
    }

    /// Adds a delta to both amounts of the row at the bucket. Returns `true` if a row matched.
    async fn update_bucket(
        &self,
        conn: &mut SqliteConnection,
        key: &MetricKey,
        timestamp: i64,
        delta: i64,
    ) -> Result<bool, MetricError> {
        let update = self.sql().update_bucket(key, timestamp, delta);
        let result = update.query().execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }

    /// Sets both amounts of the single non-temporal bucket.
    async fn try_set(
        &self,
        conn: &mut SqliteConnection,
        key: &MetricKey,
        value: i64,
    ) -> Result<Attempt, MetricError> {
        let data = MetricData::from_fixed(0, value, value);
        metric!(counter(MetricCounters::Write) += 1, path = "absolute");

        let replace = self.sql().replace(key, data);
        if replace.query().execute(&mut *conn).await?.rows_affected() > 0 {
            return Ok(Attempt::Applied);
        }

        let insert = self.sql().insert(key, data);
        match insert.query().execute(&mut *conn).await {
            Ok(_) => Ok(Attempt::Applied),
            Err(error) if self.sql().vendor().is_duplicate_key(&error) => {
                let result = replace.query().execute(&mut *conn).await?;
                Ok((result.rows_affected() > 0).into())
            }
            Err(error) => Err(error.into()),
        }
    }
}

impl From<bool> for Attempt {
    fn from(applied: bool) -> Self {
        if applied {
            Self::Applied
        } else {
            Self::Corrupted
        }
    }
}

impl MetricAccess {
    /// Adds `amount` to the counter of a subject.
    ///
    /// Without an event time the increment is recorded at the current time. Increments on a
    /// dimension are also added to the aggregate across all dimensions. Event times in the future
    /// are rejected, a zero amount is ignored.
    pub async fn increment(
        &self,
        subject_id: Uuid,
        event_time: Option<DateTime<Utc>>,
        dimension: Option<&str>,
        amount: f64,
    ) -> Result<(), MetricError> {
        let delta = codec::to_fixed_point(amount);
        if delta == 0 {
            return Ok(());
        }

        let now = Utc::now();
        if let Some(event_time) = event_time
            && event_time > now
        {
            return Err(MetricError::FutureEventTime(event_time));
        }

        metric!(timer(MetricTimers::Increment), {
            let timestamp = self
                .interval
                .process(event_time.unwrap_or(now).timestamp_millis());
            let op = WriteOp::Increment {
                timestamp,
                delta,
                implicit: event_time.is_none(),
            };

            let store = self.metrics.store();
            let key = self
                .key(subject_id)
                .dimension(self.metrics.dimensions().resolve(dimension).await?);

            let mut conn = store.acquire().await?;
            let result = self.write_with_aggregate(&mut conn, &key, op).await;
            self.metrics.cache().invalidate(subject_id);
            result
        })
    }

    async fn write_with_aggregate(
        &self,
        conn: &mut SqliteConnection,
        key: &MetricKey,
        op: WriteOp,
    ) -> Result<(), MetricError> {
        let store = self.metrics.store();
        store.write(conn, key, op).await?;
        if !key.dimension_id.is_nil() {
            store.write(conn, &key.aggregate(), op).await?;
        }
        Ok(())
    }

    /// Sets the counter of a subject to an absolute amount.
    ///
    /// Only non-temporal counters hold a single amount that can be set. Setting a dimension
    /// recomputes the aggregate as the sum over all dimensions.
    pub async fn set_absolute(
        &self,
        subject_id: Uuid,
        dimension: Option<&str>,
        amount: f64,
    ) -> Result<(), MetricError> {
        if self.interval.process(Utc::now().timestamp_millis()) != 0 {
            return Err(MetricError::NonTemporalOnly);
        }

        let store = self.metrics.store();
        let key = self
            .key(subject_id)
            .dimension(self.metrics.dimensions().resolve(dimension).await?);

        let mut conn = store.acquire().await?;
        let result = self.set_with_aggregate(&mut conn, &key, amount).await;
        self.metrics.cache().invalidate(subject_id);
        result
    }

    async fn set_with_aggregate(
        &self,
        conn: &mut SqliteConnection,
        key: &MetricKey,
        amount: f64,
    ) -> Result<(), MetricError> {
        let store = self.metrics.store();
        let value = codec::to_fixed_point(amount);
        store.write(conn, key, WriteOp::Absolute { value }).await?;

        if !key.dimension_id.is_nil() {
            let select = store.sql().select_dimension_rows(&key.counter());
            let rows = select.query().fetch_all(&mut *conn).await?;
            let mut total = 0;
            for row in &rows {
                total += decode_data(row, 0)?.fixed_amount(AmountPosition::Cumulative);
            }
            let op = WriteOp::Absolute { value: total };
            store.write(conn, &key.aggregate(), op).await?;
        }

        Ok(())
    }

    /// Deletes all rows of the counter of a subject. Returns the number of deleted rows.
    pub async fn delete(&self, subject_id: Uuid) -> Result<u64, MetricError> {
        let store = self.metrics.store();
        let delete = store.sql().delete_counter(&self.key(subject_id));
        let result = delete.query().execute(store.pool()).await;
        self.metrics.cache().invalidate(subject_id);
        Ok(result?.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::MetricInterval;
    use crate::testutils::{datetime, setup_metrics};

    async fn access(interval: MetricInterval) -> MetricAccess {
        setup_metrics()
            .await
            .access(Uuid::new_v4(), "page.views", Arc::new(interval))
            .await
            .unwrap()
    }

    async fn rows(access: &MetricAccess, subject_id: Uuid, dimension: Uuid) -> Vec<MetricData> {
        let store = access.metrics.store();
        let mut conn = store.acquire().await.unwrap();
        store
            .rows(&mut conn, &access.key(subject_id), Some(dimension), None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, data)| data)
            .collect()
    }

    #[tokio::test]
    async fn test_same_bucket_merges() {
        let access = access(MetricInterval::Hourly).await;
        let subject = Uuid::new_v4();

        access
            .increment(subject, Some(datetime("2024-05-02T10:00:00Z")), None, 5.0)
            .await
            .unwrap();
        access
            .increment(subject, Some(datetime("2024-05-02T10:05:00Z")), None, 3.0)
            .await
            .unwrap();

        let rows = rows(&access, subject, Uuid::nil()).await;
        assert_eq!(
            rows,
            [MetricData::encode(
                datetime("2024-05-02T10:00:00Z").timestamp_millis(),
                8.0,
                8.0
            )]
        );
        let total = access.range_sum(subject, None, None, None).await.unwrap();
        assert_eq!(total, Some(8.0));
    }

    #[tokio::test]
    async fn test_append_carries_cumulative() {
        let access = access(MetricInterval::Hourly).await;
        let subject = Uuid::new_v4();

        for (time, amount) in [
            ("2024-05-02T10:00:00Z", 1.0),
            ("2024-05-02T11:30:00Z", 2.0),
            ("2024-05-02T13:00:00Z", 4.0),
        ] {
            access
                .increment(subject, Some(datetime(time)), None, amount)
                .await
                .unwrap();
        }

        let rows = rows(&access, subject, Uuid::nil()).await;
        let amounts: Vec<_> = rows.iter().map(|d| (d.cumulative(), d.delta())).collect();
        assert_eq!(amounts, [(1.0, 1.0), (3.0, 2.0), (7.0, 4.0)]);
        assert_eq!(
            rows[1].timestamp(),
            datetime("2024-05-02T11:00:00Z").timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_late_write_propagates() {
        let access = access(MetricInterval::Hourly).await;
        let subject = Uuid::new_v4();

        for time in ["2024-05-02T10:00:00Z", "2024-05-02T12:00:00Z", "2024-05-02T13:00:00Z"] {
            access
                .increment(subject, Some(datetime(time)), None, 1.0)
                .await
                .unwrap();
        }

        // Backfill into an existing bucket and into a new bucket between existing ones.
        access
            .increment(subject, Some(datetime("2024-05-02T12:10:00Z")), None, 10.0)
            .await
            .unwrap();
        access
            .increment(subject, Some(datetime("2024-05-02T11:00:00Z")), None, 100.0)
            .await
            .unwrap();

        let rows = rows(&access, subject, Uuid::nil()).await;
        let amounts: Vec<_> = rows.iter().map(|d| (d.cumulative(), d.delta())).collect();
        assert_eq!(
            amounts,
            [
                (1.0, 1.0),
                (101.0, 100.0),
                (112.0, 11.0),
                (113.0, 1.0)
            ]
        );
    }

    #[tokio::test]
    async fn test_dimension_updates_aggregate() {
        let access = access(MetricInterval::Daily).await;
        let subject = Uuid::new_v4();
        let time = Some(datetime("2024-05-02T10:00:00Z"));

        access.increment(subject, time, Some("en"), 2.0).await.unwrap();
        access.increment(subject, time, Some("de"), 3.0).await.unwrap();
        access.increment(subject, time, None, 4.0).await.unwrap();

        let total = access.point_value(subject, None, None).await.unwrap();
        let en = access.point_value(subject, Some("en"), None).await.unwrap();
        let de = access.point_value(subject, Some("de"), None).await.unwrap();
        assert_eq!(total, Some(9.0));
        assert_eq!(en, Some(2.0));
        assert_eq!(de, Some(3.0));
    }

    #[tokio::test]
    async fn test_implicit_time_uses_now() {
        let access = access(MetricInterval::Hourly).await;
        let subject = Uuid::new_v4();

        access.increment(subject, None, None, 1.5).await.unwrap();
        access.increment(subject, None, None, 1.5).await.unwrap();

        let total = access.point_value(subject, None, None).await.unwrap();
        assert_eq!(total, Some(3.0));
    }

    #[tokio::test]
    async fn test_rejects_future_and_ignores_zero() {
        let access = access(MetricInterval::Hourly).await;
        let subject = Uuid::new_v4();

        let future = Utc::now() + Duration::hours(1);
        let result = access.increment(subject, Some(future), None, 1.0).await;
        assert!(matches!(result, Err(MetricError::FutureEventTime(_))));

        access.increment(subject, None, None, 0.0).await.unwrap();
        assert!(rows(&access, subject, Uuid::nil()).await.is_empty());
    }

    #[tokio::test]
    async fn test_repairs_row_with_wrong_type() {
        cumulus_log::init_test!();

        let access = access(MetricInterval::Hourly).await;
        let subject = Uuid::new_v4();
        let time = datetime("2024-05-02T10:00:00Z");

        // A row stored under another type blocks the bucket through the unique index.
        let store = access.metrics.store();
        let foreign = MetricKey {
            type_id: Uuid::new_v4(),
            ..access.key(subject).dimension(Uuid::nil())
        };
        let insert = store
            .sql()
            .insert(&foreign, MetricData::encode(time.timestamp_millis(), 5.0, 5.0));
        insert.query().execute(store.pool()).await.unwrap();

        access.increment(subject, Some(time), None, 1.0).await.unwrap();

        let rows = rows(&access, subject, Uuid::nil()).await;
        let amounts: Vec<_> = rows.iter().map(|d| (d.cumulative(), d.delta())).collect();
        assert_eq!(amounts, [(6.0, 6.0)]);
    }

    #[test]
    fn test_write_path_metrics() {
        let captures = cumulus_statsd::with_capturing_test_client(|| {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let access = access(MetricInterval::Hourly).await;
                let subject = Uuid::new_v4();
                for time in [
                    "2024-05-02T10:00:00Z",
                    "2024-05-02T10:05:00Z",
                    "2024-05-02T12:00:00Z",
                    "2024-05-02T11:00:00Z",
                ] {
                    access
                        .increment(subject, Some(datetime(time)), None, 1.0)
                        .await
                        .unwrap();
                }

                let other = Uuid::new_v4();
                let time = datetime("2024-05-02T10:00:00Z");
                let store = access.metrics.store();
                let foreign = MetricKey {
                    type_id: Uuid::new_v4(),
                    ..access.key(other).dimension(Uuid::nil())
                };
                let insert = store
                    .sql()
                    .insert(&foreign, MetricData::encode(time.timestamp_millis(), 5.0, 5.0));
                insert.query().execute(store.pool()).await.unwrap();
                access.increment(other, Some(time), None, 1.0).await.unwrap();
            });
        });

        let writes: Vec<_> = captures
            .iter()
            .filter(|line| line.starts_with("metrics.write"))
            .map(String::as_str)
            .collect();
        similar_asserts::assert_eq!(
            writes,
            [
                "metrics.write:1|c|#path:append",
                "metrics.write:1|c|#path:update",
                "metrics.write:1|c|#path:append",
                "metrics.write:1|c|#path:late",
                "metrics.write:1|c|#path:append",
                "metrics.write.insert_race:1|c",
                "metrics.write.corrupted:1|c|#outcome:repaired",
                "metrics.write:1|c|#path:update",
            ]
        );
    }

    #[tokio::test]
    async fn test_set_absolute() {
        let access = access(MetricInterval::None).await;
        let subject = Uuid::new_v4();

        access.set_absolute(subject, Some("en"), 4.0).await.unwrap();
        access.set_absolute(subject, Some("de"), 6.0).await.unwrap();
        access.set_absolute(subject, Some("en"), 1.0).await.unwrap();

        assert_eq!(access.point_value(subject, None, None).await.unwrap(), Some(7.0));
        assert_eq!(access.point_value(subject, Some("en"), None).await.unwrap(), Some(1.0));

        let rows = rows(&access, subject, Uuid::nil()).await;
        assert_eq!(rows, [MetricData::encode(0, 7.0, 7.0)]);
    }

    #[tokio::test]
    async fn test_set_absolute_requires_non_temporal() {
        let access = access(MetricInterval::Daily).await;
        let subject = Uuid::new_v4();

        let result = access.set_absolute(subject, None, 1.0).await;
        assert!(matches!(result, Err(MetricError::NonTemporalOnly)));
        assert!(rows(&access, subject, Uuid::nil()).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let access = access(MetricInterval::Hourly).await;
        let subject = Uuid::new_v4();
        let other = Uuid::new_v4();
        let time = Some(datetime("2024-05-02T10:00:00Z"));

        access.increment(subject, time, Some("en"), 1.0).await.unwrap();
        access.increment(other, time, None, 1.0).await.unwrap();

        assert_eq!(access.point_value(subject, None, None).await.unwrap(), Some(1.0));
        assert_eq!(access.delete(subject).await.unwrap(), 2);
        assert_eq!(access.point_value(subject, None, None).await.unwrap(), None);
        assert_eq!(access.point_value(other, None, None).await.unwrap(), Some(1.0));
    }
}
