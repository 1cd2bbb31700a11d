//! Merges the rows of a counter into coarser buckets.
//!
//! Rows are first written at the granularity of the counter's interval. Resummarizing with a
//! coarser interval folds every run of rows in the same coarse bucket into a single row at the
//! bucket start, carrying the sum of the deltas and the cumulative amount of the last row. Range
//! sums across whole buckets are unaffected.

use chrono::{DateTime, Utc};
use cumulus_statsd::metric;
use sqlx::Connection;
use uuid::Uuid;

use crate::codec::{AmountPosition, MetricData};
use crate::sql::UpperBound;
use crate::statsd::{MetricCounters, MetricTimers};
use crate::{CounterKey, Interval, MetricError, MetricKey, MetricStore, Metrics};

/// Consecutive rows of one dimension that fall into the same bucket.
#[derive(Debug, PartialEq, Eq)]
struct Run {
    dimension_id: Uuid,
    bucket: i64,
    first: i64,
    last: i64,
    rows: usize,
    cumulative: i64,
    delta: i64,
}

impl Run {
    fn start(dimension_id: Uuid, bucket: i64, data: &MetricData) -> Self {
        Self {
            dimension_id,
            bucket,
            first: data.timestamp(),
            last: data.timestamp(),
            rows: 1,
            cumulative: data.fixed_amount(AmountPosition::Cumulative),
            delta: data.fixed_amount(AmountPosition::Delta),
        }
    }

    fn push(&mut self, data: &MetricData) {
        self.last = data.timestamp();
        self.rows += 1;
        self.cumulative = data.fixed_amount(AmountPosition::Cumulative);
        self.delta += data.fixed_amount(AmountPosition::Delta);
    }

    /// A single row already at its bucket start needs no rewrite.
    fn is_summarized(&self) -> bool {
        self.rows == 1 && self.first == self.bucket
    }
}

/// Splits rows ordered by dimension and time into runs sharing dimension and bucket.
fn runs(rows: &[(Uuid, MetricData)], interval: &dyn Interval) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();

    for (dimension_id, data) in rows {
        let bucket = interval.process(data.timestamp());
        match runs.last_mut() {
            Some(run) if run.dimension_id == *dimension_id && run.bucket == bucket => {
                run.push(data);
            }
            _ => runs.push(Run::start(*dimension_id, bucket, data)),
        }
    }

    runs
}

impl MetricStore {
    /// Merges the rows of a counter into buckets of `interval`.
    ///
    /// Only rows strictly before `to` and at or after the start of the bucket containing `from`
    /// are considered, so a row already summarized at that bucket start is merged with the rest
    /// of its bucket. Each bucket is rewritten in its own transaction. Returns the number of
    /// rewritten buckets.
    pub async fn resummarize(
        &self,
        key: &CounterKey,
        dimension_id: Option<Uuid>,
        interval: &dyn Interval,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<usize, MetricError> {
        metric!(timer(MetricTimers::Resummarize), {
            let from = from.map(|from| interval.process(from));
            let mut conn = self.acquire().await?;
            let rows = self
                .rows(&mut conn, key, dimension_id, from, to.map(UpperBound::Before))
                .await?;

            let mut rewritten = 0;
            for run in runs(&rows, interval) {
                if run.is_summarized() {
                    continue;
                }

                let metric_key = key.dimension(run.dimension_id);
                let data = MetricData::from_fixed(run.bucket, run.cumulative, run.delta);
                let delete = self.sql().delete_range(&metric_key, run.first, run.last);
                let insert = self.sql().insert(&metric_key, data);

                let mut tx = conn.begin().await?;
                delete.query().execute(&mut *tx).await?;
                insert.query().execute(&mut *tx).await?;
                tx.commit().await?;

                metric!(counter(MetricCounters::RowsCollapsed) += (run.rows - 1) as i64);
                rewritten += 1;
            }

            if rewritten > 0 {
                cumulus_log::debug!(
                    subject = %key.subject_id,
                    symbol = key.symbol_id,
                    buckets = rewritten,
                    "resummarized counter"
                );
            }

            Ok(rewritten)
        })
    }
}

impl Metrics {
    /// Merges the rows of a counter of one subject into buckets of `interval`.
    ///
    /// Without a dimension all dimensions including the aggregate are resummarized. Unknown
    /// counters and dimensions have nothing to merge.
    #[allow(clippy::too_many_arguments)]
    pub async fn resummarize(
        &self,
        type_id: Uuid,
        subject_id: Uuid,
        counter: &str,
        dimension: Option<&str>,
        interval: &dyn Interval,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<usize, MetricError> {
        let Some(symbol_id) = self.symbols().lookup(counter).await? else {
            return Ok(0);
        };
        let dimension_id = match dimension {
            Some(value) => match self.dimensions().lookup(Some(value)).await? {
                Some(dimension_id) => Some(dimension_id),
                None => return Ok(0),
            },
            None => None,
        };

        let key = CounterKey {
            subject_id,
            type_id,
            symbol_id,
        };
        let result = self
            .store()
            .resummarize(
                &key,
                dimension_id,
                interval,
                from.map(|t| t.timestamp_millis()),
                to.map(|t| t.timestamp_millis()),
            )
            .await;

        self.cache().invalidate(subject_id);
        result
    }

    /// Resummarizes a single metric key over its whole history.
    pub(crate) async fn resummarize_key(
        &self,
        key: &MetricKey,
        interval: &dyn Interval,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<usize, MetricError> {
        let result = self
            .store()
            .resummarize(&key.counter(), Some(key.dimension_id), interval, from, to)
            .await;
        self.cache().invalidate(key.subject_id);
        result
    }
}
