use cumulus_statsd::metric;
use sqlx::Connection;
use uuid::Uuid;

use crate::codec::{AmountPosition, MetricData};
use crate::statsd::{MetricCounters, MetricTimers};
use crate::{CounterKey, MetricError, MetricStore, Metrics};

/// Recomputes cumulative amounts from the deltas of rows ordered by dimension and time.
///
/// Deltas are authoritative. Returns the rows whose stored cumulative amount drifted, with the
/// corrected payload.
fn drifted(rows: &[(Uuid, MetricData)]) -> Vec<(Uuid, MetricData)> {
    let mut fixes = Vec::new();
    let mut dimension = None;
    let mut running = 0;

    for (dimension_id, data) in rows {
        if dimension != Some(*dimension_id) {
            dimension = Some(*dimension_id);
            running = 0;
        }

        let cumulative = data.fixed_amount(AmountPosition::Cumulative);
        let delta = data.fixed_amount(AmountPosition::Delta);
        let expected = running + delta;
        if cumulative != expected {
            fixes.push((*dimension_id, data.with_amounts(expected, delta)));
        }
        running = expected;
    }

    fixes
}

impl MetricStore {
    /// Rewrites the cumulative amounts of a counter that no longer match its deltas.
    ///
    /// All fixes are applied in one transaction. Returns the number of rewritten rows.
    pub async fn reconstruct(&self, key: &CounterKey) -> Result<usize, MetricError> {
        metric!(timer(MetricTimers::Reconstruct), {
            let mut conn = self.acquire().await?;
            let rows = self.rows(&mut conn, key, None, None, None).await?;
            let fixes = drifted(&rows);
            if fixes.is_empty() {
                return Ok(0);
            }

            let mut tx = conn.begin().await?;
            for (dimension_id, data) in &fixes {
                let replace = self.sql().replace(&key.dimension(*dimension_id), *data);
                replace.query().execute(&mut *tx).await?;
            }
            tx.commit().await?;

            metric!(counter(MetricCounters::RowsFixed) += fixes.len() as i64);
            cumulus_log::info!(
                subject = %key.subject_id,
                symbol = key.symbol_id,
                rows = fixes.len(),
                "reconstructed cumulative amounts"
            );

            Ok(fixes.len())
        })
    }
}

impl Metrics {
    /// Heals drifted cumulative amounts of a counter on one subject across all dimensions.
    pub async fn reconstruct(
        &self,
        type_id: Uuid,
        subject_id: Uuid,
        counter: &str,
    ) -> Result<usize, MetricError> {
        let Some(symbol_id) = self.symbols().lookup(counter).await? else {
            return Ok(0);
        };

        let key = CounterKey {
            subject_id,
            type_id,
            symbol_id,
        };
        let result = self.store().reconstruct(&key).await;
        self.cache().invalidate(subject_id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::setup_metrics;

    #[test]
    fn test_drifted() {
        let en = Uuid::from_u128(9);
        let rows = [
            (Uuid::nil(), MetricData::from_fixed(0, 1, 1)),
            (Uuid::nil(), MetricData::from_fixed(60_000, 5, 2)),
            (Uuid::nil(), MetricData::from_fixed(120_000, 9, 4)),
            (en, MetricData::from_fixed(0, 2, 2)),
            (en, MetricData::from_fixed(60_000, 3, 1)),
        ];

        similar_asserts::assert_eq!(
            drifted(&rows),
            vec![
                (Uuid::nil(), MetricData::from_fixed(60_000, 3, 2)),
                (Uuid::nil(), MetricData::from_fixed(120_000, 7, 4)),
            ]
        );
    }

    #[test]
    fn test_drifted_heals_single_row() {
        let rows = [(Uuid::nil(), MetricData::from_fixed(0, 10, 4))];
        assert_eq!(
            drifted(&rows),
            [(Uuid::nil(), MetricData::from_fixed(0, 4, 4))]
        );
    }

    #[test]
    fn test_drifted_touches_only_corrupted_row() {
        let rows = [
            (Uuid::nil(), MetricData::from_fixed(0, 1, 1)),
            (Uuid::nil(), MetricData::from_fixed(60_000, 5, 2)),
            (Uuid::nil(), MetricData::from_fixed(120_000, 7, 4)),
        ];

        // The row after the corrupted one already carries the right amount.
        similar_asserts::assert_eq!(
            drifted(&rows),
            vec![(Uuid::nil(), MetricData::from_fixed(60_000, 3, 2))]
        );
    }

    #[tokio::test]
    async fn test_reconstruct_reaches_fixpoint() {
        let metrics = setup_metrics().await;
        let type_id = Uuid::new_v4();
        let subject_id = Uuid::new_v4();
        let symbol_id = metrics.symbols().resolve("downloads").await.unwrap();
        let key = CounterKey {
            subject_id,
            type_id,
            symbol_id,
        };

        let store = metrics.store();
        for data in [
            MetricData::encode(0, 1.0, 1.0),
            MetricData::encode(60_000, 5.0, 2.0),
            MetricData::encode(120_000, 9.0, 4.0),
        ] {
            let insert = store.sql().insert(&key.dimension(Uuid::nil()), data);
            insert.query().execute(store.pool()).await.unwrap();
        }

        let fixed = metrics
            .reconstruct(type_id, subject_id, "downloads")
            .await
            .unwrap();
        assert_eq!(fixed, 2);

        let fixed = metrics
            .reconstruct(type_id, subject_id, "downloads")
            .await
            .unwrap();
        assert_eq!(fixed, 0);

        let mut conn = store.acquire().await.unwrap();
        let rows = store.rows(&mut conn, &key, None, None, None).await.unwrap();
        let cumulative: Vec<_> = rows.iter().map(|(_, data)| data.cumulative()).collect();
        assert_eq!(cumulative, [1.0, 3.0, 7.0]);
    }
}
