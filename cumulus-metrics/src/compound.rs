//! Arithmetic over counters.
//!
//! A [`CompoundMetric`] combines two operands with an [`Operator`] and answers the same range
//! queries as a single counter. Operands are counters of the same subjects or constants, for
//! example the ratio of downloads to views or views scaled by a fixed factor.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use uuid::Uuid;

use crate::{Interval, MetricAccess, MetricError};

/// Combines the amounts of two operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    /// `left + right`
    Add,
    /// `left - right`
    Subtract,
    /// `left * right`
    Multiply,
    /// `left / right`, zero when dividing by zero.
    Divide,
}

impl Operator {
    /// Returns the arithmetic symbol of the operator.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
        }
    }

    /// Applies the operator.
    pub fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            Self::Add => left + right,
            Self::Subtract => left - right,
            Self::Multiply => left * right,
            Self::Divide if right == 0.0 => 0.0,
            Self::Divide => left / right,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One side of a [`CompoundMetric`].
#[derive(Clone, Debug)]
pub enum Operand {
    /// The amounts of a counter.
    Counter(MetricAccess),
    /// The same amount for every subject, dimension and time.
    Constant(f64),
}

impl From<MetricAccess> for Operand {
    fn from(access: MetricAccess) -> Self {
        Self::Counter(access)
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Self::Constant(value)
    }
}

/// Keyed amounts of one operand.
enum Amounts<K> {
    Each(BTreeMap<K, f64>),
    Constant(f64),
}

impl<K: Ord> Amounts<K> {
    fn keys(&self) -> impl Iterator<Item = &K> {
        let map = match self {
            Self::Each(map) => Some(map),
            Self::Constant(_) => None,
        };
        map.into_iter().flat_map(BTreeMap::keys)
    }

    fn get(&self, key: &K) -> f64 {
        match self {
            Self::Each(map) => map.get(key).copied().unwrap_or_default(),
            Self::Constant(value) => *value,
        }
    }
}

impl Operand {
    async fn range_sum(
        &self,
        subject_id: Uuid,
        dimension: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Option<f64>, MetricError> {
        match self {
            Self::Counter(access) => access.range_sum(subject_id, dimension, from, to).await,
            Self::Constant(value) => Ok(Some(*value)),
        }
    }

    async fn breakdown(
        &self,
        subject_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Amounts<String>, MetricError> {
        Ok(match self {
            Self::Counter(access) => Amounts::Each(access.breakdown(subject_id, from, to).await?),
            Self::Constant(value) => Amounts::Constant(*value),
        })
    }

    async fn timeline(
        &self,
        subject_id: Uuid,
        dimension: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        interval: &dyn Interval,
    ) -> Result<Amounts<DateTime<Utc>>, MetricError> {
        Ok(match self {
            Self::Counter(access) => Amounts::Each(
                access
                    .timeline(subject_id, dimension, from, to, interval)
                    .await?,
            ),
            Self::Constant(value) => Amounts::Constant(*value),
        })
    }
}

/// Two operands combined by an operator.
///
/// Reads mirror those of [`MetricAccess`]. An amount missing on one side counts as zero, so the
/// keys of a breakdown or timeline are the union of both sides. Constants contribute no keys of
/// their own.
#[derive(Clone, Debug)]
pub struct CompoundMetric {
    operator: Operator,
    left: Operand,
    right: Operand,
}

impl CompoundMetric {
    /// Creates `left <operator> right`.
    pub fn new(operator: Operator, left: impl Into<Operand>, right: impl Into<Operand>) -> Self {
        Self {
            operator,
            left: left.into(),
            right: right.into(),
        }
    }

    /// Returns the operator.
    pub fn operator(&self) -> Operator {
        self.operator
    }

    /// Combines the range sums of both operands.
    ///
    /// Returns `None` only if no operand has an amount in the range.
    pub async fn range_sum(
        &self,
        subject_id: Uuid,
        dimension: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Option<f64>, MetricError> {
        let (left, right) = tokio::try_join!(
            self.left.range_sum(subject_id, dimension, from, to),
            self.right.range_sum(subject_id, dimension, from, to),
        )?;

        if left.is_none() && right.is_none() {
            return Ok(None);
        }
        Ok(Some(self.operator.apply(
            left.unwrap_or_default(),
            right.unwrap_or_default(),
        )))
    }

    /// Combines the amounts of every dimension value written to either counter.
    pub async fn breakdown(
        &self,
        subject_id: Uuid,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<BTreeMap<String, f64>, MetricError> {
        let (left, right) = tokio::try_join!(
            self.left.breakdown(subject_id, from, to),
            self.right.breakdown(subject_id, from, to),
        )?;
        Ok(self.combine(&left, &right))
    }

    /// Combines the bucket sums of both operands, keyed by bucket start.
    pub async fn timeline(
        &self,
        subject_id: Uuid,
        dimension: Option<&str>,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        interval: &dyn Interval,
    ) -> Result<BTreeMap<DateTime<Utc>, f64>, MetricError> {
        let (left, right) = tokio::try_join!(
            self.left.timeline(subject_id, dimension, from, to, interval),
            self.right.timeline(subject_id, dimension, from, to, interval),
        )?;
        Ok(self.combine(&left, &right))
    }

    fn combine<K: Ord + Clone>(&self, left: &Amounts<K>, right: &Amounts<K>) -> BTreeMap<K, f64> {
        left.keys()
            .merge(right.keys())
            .dedup()
            .map(|key| {
                let amount = self.operator.apply(left.get(key), right.get(key));
                (key.clone(), amount)
            })
            .collect()
    }
}

impl fmt::Display for CompoundMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operand = |operand: &Operand| match operand {
            Operand::Counter(access) => access.counter().to_owned(),
            Operand::Constant(value) => value.to_string(),
        };
        write!(
            f,
            "{} {} {}",
            operand(&self.left),
            self.operator,
            operand(&self.right)
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::MetricInterval;
    use crate::testutils::{Minutely, datetime, setup_metrics};

    /// Returns downloads and views of one subject.
    async fn seeded() -> (MetricAccess, MetricAccess, Uuid) {
        let metrics = setup_metrics().await;
        let type_id = Uuid::new_v4();
        let downloads = metrics
            .access(type_id, "downloads", Arc::new(Minutely))
            .await
            .unwrap();
        let views = metrics
            .access(type_id, "views", Arc::new(Minutely))
            .await
            .unwrap();
        let subject = Uuid::new_v4();

        for (access, time, dimension, amount) in [
            (&downloads, "2024-05-02T10:01:00Z", Some("en"), 1.0),
            (&downloads, "2024-05-02T11:01:00Z", Some("en"), 2.0),
            (&views, "2024-05-02T10:02:00Z", Some("en"), 4.0),
            (&views, "2024-05-02T10:03:00Z", Some("de"), 6.0),
            (&views, "2024-05-02T12:00:00Z", Some("en"), 10.0),
        ] {
            access
                .increment(subject, Some(datetime(time)), dimension, amount)
                .await
                .unwrap();
        }

        (downloads, views, subject)
    }

    #[test]
    fn test_operators() {
        assert_eq!(Operator::Add.apply(6.0, 3.0), 9.0);
        assert_eq!(Operator::Subtract.apply(6.0, 3.0), 3.0);
        assert_eq!(Operator::Multiply.apply(6.0, 3.0), 18.0);
        assert_eq!(Operator::Divide.apply(6.0, 3.0), 2.0);
        assert_eq!(Operator::Divide.apply(6.0, 0.0), 0.0);
    }

    #[tokio::test]
    async fn test_range_sum() {
        let (downloads, views, subject) = seeded().await;
        let ratio = CompoundMetric::new(Operator::Divide, downloads.clone(), views.clone());
        assert_eq!(ratio.to_string(), "downloads / views");

        let total = ratio.range_sum(subject, None, None, None).await.unwrap();
        assert_eq!(total, Some(0.15));

        let from = Some(datetime("2024-05-02T11:00:00Z"));
        let to = Some(datetime("2024-05-02T11:59:00Z"));
        let late = ratio.range_sum(subject, None, from, to).await.unwrap();
        assert_eq!(late, Some(0.0));

        let scaled = CompoundMetric::new(Operator::Multiply, views, 0.5);
        let total = scaled.range_sum(subject, Some("de"), None, None).await.unwrap();
        assert_eq!(total, Some(3.0));

        let nobody = Uuid::new_v4();
        let sum = CompoundMetric::new(Operator::Add, downloads.clone(), downloads);
        assert_eq!(sum.range_sum(nobody, None, None, None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_breakdown() {
        let (downloads, views, subject) = seeded().await;

        let difference = CompoundMetric::new(Operator::Subtract, views.clone(), downloads);
        let breakdown = difference.breakdown(subject, None, None).await.unwrap();
        similar_asserts::assert_eq!(
            breakdown,
            BTreeMap::from([("de".to_owned(), 6.0), ("en".to_owned(), 11.0)])
        );

        let offset = CompoundMetric::new(Operator::Add, 1.0, views);
        let breakdown = offset.breakdown(subject, None, None).await.unwrap();
        similar_asserts::assert_eq!(
            breakdown,
            BTreeMap::from([("de".to_owned(), 7.0), ("en".to_owned(), 15.0)])
        );

        let constants = CompoundMetric::new(Operator::Add, 1.0, 2.0);
        assert!(constants.breakdown(subject, None, None).await.unwrap().is_empty());
        assert_eq!(
            constants.range_sum(subject, None, None, None).await.unwrap(),
            Some(3.0)
        );
    }

    #[tokio::test]
    async fn test_timeline() {
        let (downloads, views, subject) = seeded().await;
        let sum = CompoundMetric::new(Operator::Add, downloads, views);

        let timeline = sum
            .timeline(subject, Some("en"), None, None, &MetricInterval::Hourly)
            .await
            .unwrap();
        similar_asserts::assert_eq!(
            timeline,
            BTreeMap::from([
                (datetime("2024-05-02T10:00:00Z"), 5.0),
                (datetime("2024-05-02T11:00:00Z"), 2.0),
                (datetime("2024-05-02T12:00:00Z"), 10.0),
            ])
        );
    }
}
