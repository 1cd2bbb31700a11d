use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cumulus_statsd::metric;
use hashbrown::HashMap;
use itertools::Itertools;
use sqlx::Row;
use uuid::Uuid;

use crate::cache::{CacheKey, Extremum};
use crate::codec::{self, MetricData};
use crate::interval::to_datetime;
use crate::sql::UpperBound;
use crate::statsd::{MetricCounters, MetricTimers};
use crate::store::{decode_data, decode_optional_data};
use crate::{Interval, MetricAccess, MetricError, MetricKey, Metrics};

impl Metrics {
    /// Returns the oldest or newest payload of a key, answering from the subject cache if possible.
    ///
    /// Boundaries are truncated to the minute so that reads within the same minute share an entry.
    pub(crate) async fn extremum(
        &self,
        key: &MetricKey,
        extremum: Extremum,
        boundary: Option<i64>,
    ) -> Result<Option<MetricData>, MetricError> {
        let boundary = boundary.map(codec::truncate_timestamp);
        let cache_key = CacheKey {
            symbol_id: key.symbol_id,
            dimension_id: key.dimension_id,
            boundary,
            extremum,
        };

        if let Some(cached) = self.cache().get(key.subject_id, &cache_key) {
            metric!(counter(MetricCounters::CacheHit) += 1);
            return Ok(cached.data());
        }
        metric!(counter(MetricCounters::CacheMiss) += 1);

        let store = self.store();
        let mut conn = store.acquire().await?;
        let data = match extremum {
            Extremum::Max => {
                store
                    .max_data(&mut conn, key, boundary.map(UpperBound::Through))
                    .await?
            }
            Extremum::Min => store.min_data(&mut conn, key, boundary).await?,
        };

        self.cache().put(key.subject_id, cache_key, data.into());
        Ok(data)
    }

    /// Loads the extrema of several counters of one subject into the subject cache.
    ///
    /// A later [`MetricAccess::range_sum`] or [`MetricAccess::point_value`] with the same range
    /// and dimension is then answered without a query. Unknown counters and dimensions are
    /// skipped, counters without rows are cached as empty.
    pub async fn prefetch(
        &self,
        type_id: Uuid,
        subject_id: Uuid,
        dimension: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        counters: &[&str],
    ) -> Result<(), MetricError> {
        let Some(dimension_id) = self.dimensions().lookup(dimension).await? else {
            return Ok(());
        };

        let mut symbol_ids = Vec::with_capacity(counters.len());
        for counter in counters {
            if let Some(symbol_id) = self.symbols().lookup(counter).await? {
                symbol_ids.push(symbol_id);
            }
        }
        if symbol_ids.is_empty() {
            return Ok(());
        }

        let from = from.map(|from| codec::truncate_timestamp(from.timestamp_millis()));
        let to = to.map(|to| codec::truncate_timestamp(to.timestamp_millis()));

        let select =
            self.store()
                .sql()
                .select_prefetch(subject_id, type_id, &symbol_ids, dimension_id, from, to);
        let rows = metric!(timer(MetricTimers::Read), operation = "prefetch", {
            select.query().fetch_all(self.store().pool()).await?
        });

        let mut found = HashMap::with_capacity(rows.len());
        for row in &rows {
            let symbol_id: i64 = row.try_get(0)?;
            let min = decode_optional_data(row, 1)?;
            let max = decode_optional_data(row, 2)?;
            found.insert(symbol_id, (min, max));
        }

        for symbol_id in symbol_ids {
            let (min, max) = found.remove(&symbol_id).unwrap_or_default();
            let key = |boundary, extremum| CacheKey {
                symbol_id,
                dimension_id,
                boundary,
                extremum,
            };
            self.cache()
                .put(subject_id, key(to, Extremum::Max), max.into());
            if from.is_some() {
                self.cache()
                    .put(subject_id, key(from, Extremum::Min), min.into());
            }
        }

        cumulus_log::trace!(
            subject = %subject_id,
            counters = counters.len(),
            "prefetched counters"
        );
        Ok(())
    }
}

impl MetricAccess {
    /// Resolves the key of a dimension without creating it.
    async fn existing_key(
        &self,
        subject_id: Uuid,
        dimension: Option<&str>,
    ) -> Result<Option<MetricKey>, MetricError> {
        let dimension_id = self.metrics.dimensions().lookup(dimension).await?;
        Ok(dimension_id.map(|dimension_id| self.key(subject_id).dimension(dimension_id)))
    }

    /// Returns the cumulative total of a counter as of a point in time.
    ///
    /// Without `as_of` the latest total is returned. Returns `None` if the counter has no rows
    /// up to that time or the dimension was never written.
    pub async fn point_value(
        &self,
        subject_id: Uuid,
        dimension: Option<&str>,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<f64>, MetricError> {
        metric!(timer(MetricTimers::Read), operation = "point_value", {
            let Some(key) = self.existing_key(subject_id, dimension).await? else {
                return Ok(None);
            };
            let max = self
                .metrics
                .extremum(&key, Extremum::Max, as_of.map(|t| t.timestamp_millis()))
                .await?;
            Ok(max.map(|data| data.cumulative()))
        })
    }

    /// Returns the sum of all increments between `from` and `to`, both inclusive to the minute.
    ///
    /// Without `from` this is the cumulative total as of `to`.
    pub async fn range_sum(
        &self,
        subject_id: Uuid,
        dimension: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Option<f64>, MetricError> {
        let Some(from) = from else {
            return self.point_value(subject_id, dimension, to).await;
        };

        metric!(timer(MetricTimers::Read), operation = "range_sum", {
            let Some(key) = self.existing_key(subject_id, dimension).await? else {
                return Ok(None);
            };

            let max = self
                .metrics
                .extremum(&key, Extremum::Max, to.map(|t| t.timestamp_millis()))
                .await?;
            let Some(max) = max else {
                return Ok(None);
            };

            let min = self
                .metrics
                .extremum(&key, Extremum::Min, Some(from.timestamp_millis()))
                .await?;
            let Some(min) = min else {
                return Ok(None);
            };

            // Nothing was written inside the range.
            if max < min {
                return Ok(None);
            }

            Ok(Some(codec::range_amount(&max, &min)))
        })
    }

    /// Returns the amount of every dimension value of a counter, excluding the aggregate.
    ///
    /// With `from` the amounts are the sums within the range, otherwise the totals as of `to`.
    pub async fn breakdown(
        &self,
        subject_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<String, f64>, MetricError> {
        let select = self.metrics.store().sql().select_breakdown(
            &self.key(subject_id),
            from.map(|t| t.timestamp_millis()),
            to.map(|t| UpperBound::Through(t.timestamp_millis())),
        );

        let rows = metric!(timer(MetricTimers::Read), operation = "breakdown", {
            select.query().fetch_all(self.metrics.store().pool()).await?
        });

        let mut breakdown = BTreeMap::new();
        for row in &rows {
            let value: String = row.try_get(0)?;
            let min = decode_data(row, 1)?;
            let max = decode_data(row, 2)?;
            let amount = match from {
                Some(_) => codec::range_amount(&max, &min),
                None => max.cumulative(),
            };
            breakdown.insert(value, amount);
        }

        Ok(breakdown)
    }

    /// Returns the sums of a counter per bucket of `interval`, keyed by bucket start.
    ///
    /// Buckets without rows are absent.
    pub async fn timeline(
        &self,
        subject_id: Uuid,
        dimension: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        interval: &dyn Interval,
    ) -> Result<BTreeMap<DateTime<Utc>, f64>, MetricError> {
        metric!(timer(MetricTimers::Read), operation = "timeline", {
            let Some(key) = self.existing_key(subject_id, dimension).await? else {
                return Ok(BTreeMap::new());
            };

            let store = self.metrics.store();
            let mut conn = store.acquire().await?;
            let rows = store
                .rows(
                    &mut conn,
                    &key.counter(),
                    Some(key.dimension_id),
                    from.map(|t| t.timestamp_millis()),
                    to.map(|t| UpperBound::Through(t.timestamp_millis())),
                )
                .await?;

            Ok(bucket_sums(rows.into_iter().map(|(_, data)| data), interval))
        })
    }

    /// Returns the time of the oldest row of a counter.
    pub async fn first_update(
        &self,
        subject_id: Uuid,
        dimension: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>, MetricError> {
        self.update_time(subject_id, dimension, Extremum::Min).await
    }

    /// Returns the time of the newest row of a counter.
    pub async fn last_update(
        &self,
        subject_id: Uuid,
        dimension: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>, MetricError> {
        self.update_time(subject_id, dimension, Extremum::Max).await
    }

    async fn update_time(
        &self,
        subject_id: Uuid,
        dimension: Option<&str>,
        extremum: Extremum,
    ) -> Result<Option<DateTime<Utc>>, MetricError> {
        let Some(key) = self.existing_key(subject_id, dimension).await? else {
            return Ok(None);
        };
        let data = self.metrics.extremum(&key, extremum, None).await?;
        Ok(data.map(|data| to_datetime(data.timestamp())))
    }
}

/// Sums time ordered rows of one key per bucket.
fn bucket_sums(
    rows: impl IntoIterator<Item = MetricData>,
    interval: &dyn Interval,
) -> BTreeMap<DateTime<Utc>, f64> {
    let mut sums = BTreeMap::new();
    let buckets = rows
        .into_iter()
        .chunk_by(|data| interval.process(data.timestamp()));

    for (bucket, mut run) in &buckets {
        let Some(first) = run.next() else {
            continue;
        };
        let last = run.last().unwrap_or(first);
        sums.insert(to_datetime(bucket), codec::range_amount(&last, &first));
    }

    sums
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::MetricInterval;
    use crate::testutils::{datetime, setup_metrics};

    async fn seeded() -> (MetricAccess, Uuid) {
        let metrics = setup_metrics().await;
        let access = metrics
            .access(Uuid::new_v4(), "page.views", Arc::new(MetricInterval::Hourly))
            .await
            .unwrap();
        let subject = Uuid::new_v4();

        for (time, dimension, amount) in [
            ("2024-05-01T08:15:00Z", Some("en"), 1.0),
            ("2024-05-01T09:30:00Z", Some("de"), 2.0),
            ("2024-05-02T10:00:00Z", Some("en"), 4.0),
            ("2024-05-03T12:45:00Z", None, 8.0),
        ] {
            access
                .increment(subject, Some(datetime(time)), dimension, amount)
                .await
                .unwrap();
        }

        (access, subject)
    }

    #[test]
    fn test_bucket_sums() {
        let hour = 3_600_000;
        let rows = [
            MetricData::from_fixed(0, 1_000_000, 1_000_000),
            MetricData::from_fixed(60_000, 3_000_000, 2_000_000),
            MetricData::from_fixed(hour, 7_000_000, 4_000_000),
        ];

        let sums = bucket_sums(rows, &MetricInterval::Hourly);
        similar_asserts::assert_eq!(
            sums,
            BTreeMap::from([(to_datetime(0), 3.0), (to_datetime(hour), 4.0)])
        );
    }

    #[tokio::test]
    async fn test_point_value() {
        let (access, subject) = seeded().await;

        let total = access.point_value(subject, None, None).await.unwrap();
        assert_eq!(total, Some(15.0));

        let as_of = Some(datetime("2024-05-01T23:59:00Z"));
        let total = access.point_value(subject, None, as_of).await.unwrap();
        assert_eq!(total, Some(3.0));

        let en = access.point_value(subject, Some("en"), None).await.unwrap();
        assert_eq!(en, Some(5.0));

        let before = Some(datetime("2024-04-30T00:00:00Z"));
        assert_eq!(access.point_value(subject, None, before).await.unwrap(), None);
        assert_eq!(
            access.point_value(subject, Some("fr"), None).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_range_sum() {
        let (access, subject) = seeded().await;

        let from = Some(datetime("2024-05-01T09:00:00Z"));
        let to = Some(datetime("2024-05-02T10:00:00Z"));
        let sum = access.range_sum(subject, None, from, to).await.unwrap();
        assert_eq!(sum, Some(6.0));

        let sum = access.range_sum(subject, None, None, to).await.unwrap();
        assert_eq!(sum, Some(7.0));

        let sum = access
            .range_sum(subject, Some("en"), from, None)
            .await
            .unwrap();
        assert_eq!(sum, Some(4.0));
    }

    #[tokio::test]
    async fn test_range_sum_without_rows_in_range() {
        let (access, subject) = seeded().await;

        let from = Some(datetime("2024-05-02T11:00:00Z"));
        let to = Some(datetime("2024-05-03T11:59:00Z"));
        assert_eq!(access.range_sum(subject, None, from, to).await.unwrap(), None);

        let from = Some(datetime("2024-06-01T00:00:00Z"));
        assert_eq!(access.range_sum(subject, None, from, None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_breakdown() {
        let (access, subject) = seeded().await;

        let totals = access.breakdown(subject, None, None).await.unwrap();
        similar_asserts::assert_eq!(
            totals,
            BTreeMap::from([("de".to_owned(), 2.0), ("en".to_owned(), 5.0)])
        );

        let from = Some(datetime("2024-05-02T00:00:00Z"));
        let recent = access.breakdown(subject, from, None).await.unwrap();
        similar_asserts::assert_eq!(recent, BTreeMap::from([("en".to_owned(), 4.0)]));
    }

    #[tokio::test]
    async fn test_timeline() {
        let (access, subject) = seeded().await;

        let daily = access
            .timeline(subject, None, None, None, &MetricInterval::Daily)
            .await
            .unwrap();
        similar_asserts::assert_eq!(
            daily,
            BTreeMap::from([
                (datetime("2024-05-01T00:00:00Z"), 3.0),
                (datetime("2024-05-02T00:00:00Z"), 4.0),
                (datetime("2024-05-03T00:00:00Z"), 8.0),
            ])
        );

        let missing = access
            .timeline(subject, Some("fr"), None, None, &MetricInterval::Daily)
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_first_and_last_update() {
        let (access, subject) = seeded().await;

        let first = access.first_update(subject, None).await.unwrap();
        let last = access.last_update(subject, None).await.unwrap();
        assert_eq!(first, Some(datetime("2024-05-01T08:00:00Z")));
        assert_eq!(last, Some(datetime("2024-05-03T12:00:00Z")));

        let never = access.first_update(Uuid::new_v4(), None).await.unwrap();
        assert_eq!(never, None);
    }

    #[tokio::test]
    async fn test_reads_see_writes_through_cache() {
        let (access, subject) = seeded().await;
        assert_eq!(
            access.point_value(subject, None, None).await.unwrap(),
            Some(15.0)
        );

        access
            .increment(subject, Some(datetime("2024-05-03T12:50:00Z")), None, 1.0)
            .await
            .unwrap();
        assert_eq!(
            access.point_value(subject, None, None).await.unwrap(),
            Some(16.0)
        );
    }

    #[tokio::test]
    async fn test_prefetch_fills_cache() {
        let (access, subject) = seeded().await;
        let metrics = access.metrics.clone();
        let from = Some(datetime("2024-05-01T09:00:00Z"));
        let to = Some(datetime("2024-05-02T10:00:00Z"));

        metrics
            .prefetch(
                access.type_id(),
                subject,
                None,
                from,
                to,
                &["page.views", "unknown"],
            )
            .await
            .unwrap();

        let cached = metrics.cache().get(
            subject,
            &CacheKey {
                symbol_id: access.symbol_id(),
                dimension_id: Uuid::nil(),
                boundary: to.map(|t| t.timestamp_millis()),
                extremum: Extremum::Max,
            },
        );
        assert!(cached.and_then(|cached| cached.data()).is_some());

        let sum = access.range_sum(subject, None, from, to).await.unwrap();
        assert_eq!(sum, Some(6.0));
    }
}
