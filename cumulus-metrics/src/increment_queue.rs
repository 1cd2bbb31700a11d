//! Merging and deferred writing of increments.
//!
//! Increments pushed to the queue are summed per subject, counter, event time and dimension. A
//! background task writes the merged increments within a configured window: it collects for the
//! first three quarters of the window and spreads the writes of the drained batch over the last
//! quarter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cumulus_statsd::metric;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::MetricAccess;
use crate::config::IncrementQueueConfig;
use crate::statsd::{MetricCounters, MetricGauges};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct QueueKey {
    subject_id: Uuid,
    type_id: Uuid,
    symbol_id: i64,
    event_time: Option<i64>,
    dimension: Option<String>,
}

struct QueuedIncrement {
    access: MetricAccess,
    subject_id: Uuid,
    event_time: Option<DateTime<Utc>>,
    dimension: Option<String>,
    amount: f64,
}

impl QueuedIncrement {
    async fn write(self) {
        let result = self
            .access
            .increment(
                self.subject_id,
                self.event_time,
                self.dimension.as_deref(),
                self.amount,
            )
            .await;

        match result {
            Ok(()) => metric!(counter(MetricCounters::IncrementsFlushed) += 1, outcome = "success"),
            Err(error) => {
                metric!(counter(MetricCounters::IncrementsFlushed) += 1, outcome = "failure");
                cumulus_log::error!(
                    error = &error as &dyn std::error::Error,
                    subject = %self.subject_id,
                    counter = self.access.counter(),
                    amount = self.amount,
                    "failed to write queued increment"
                );
            }
        }
    }
}

#[derive(Default)]
struct Pending(Mutex<HashMap<QueueKey, QueuedIncrement>>);

impl Pending {
    fn drain(&self) -> Vec<QueuedIncrement> {
        let batch: Vec<_> = self.0.lock().drain().map(|(_, queued)| queued).collect();
        metric!(gauge(MetricGauges::IncrementQueueSize) = 0u64);
        batch
    }
}

/// Collects increments and writes them merged in the background.
///
/// Must be started within a tokio runtime. Increments still queued when the queue is shut down
/// are written before [`IncrementQueue::shutdown`] returns.
pub struct IncrementQueue {
    pending: Arc<Pending>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl fmt::Debug for IncrementQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncrementQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl IncrementQueue {
    /// Starts the background writer.
    pub fn start(config: &IncrementQueueConfig) -> Self {
        let pending = Arc::new(Pending::default());
        let token = CancellationToken::new();
        let task = tokio::spawn(flush_loop(pending.clone(), config.within(), token.clone()));

        Self {
            pending,
            token,
            task,
        }
    }

    /// Queues an increment, adding it to a queued increment of the same key.
    pub fn push(
        &self,
        access: &MetricAccess,
        subject_id: Uuid,
        dimension: Option<&str>,
        event_time: Option<DateTime<Utc>>,
        amount: f64,
    ) {
        let dimension = dimension.filter(|value| !value.is_empty()).map(str::to_owned);
        let key = QueueKey {
            subject_id,
            type_id: access.type_id(),
            symbol_id: access.symbol_id(),
            event_time: event_time.map(|t| t.timestamp_millis()),
            dimension: dimension.clone(),
        };

        let mut pending = self.pending.0.lock();
        pending
            .entry(key)
            .or_insert_with(|| QueuedIncrement {
                access: access.clone(),
                subject_id,
                event_time,
                dimension,
                amount: 0.0,
            })
            .amount += amount;

        metric!(gauge(MetricGauges::IncrementQueueSize) = pending.len() as u64);
    }

    /// Returns the number of merged increments waiting to be written.
    pub fn len(&self) -> usize {
        self.pending.0.lock().len()
    }

    /// Returns `true` if no increment is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes every queued increment immediately. Returns the number of writes.
    pub async fn flush(&self) -> usize {
        let batch = self.pending.drain();
        let count = batch.len();
        for queued in batch {
            queued.write().await;
        }
        count
    }

    /// Stops the background writer after writing what remains.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(error) = self.task.await {
            cumulus_log::error!(
                error = &error as &dyn std::error::Error,
                "increment queue writer panicked"
            );
        }
    }
}

async fn flush_loop(pending: Arc<Pending>, within: Duration, token: CancellationToken) {
    let wait = within.mul_f64(0.75);
    let execute = within.saturating_sub(wait);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let batch = pending.drain();
        if batch.is_empty() {
            continue;
        }

        let pause = execute / u32::try_from(batch.len()).unwrap_or(u32::MAX);
        cumulus_log::trace!(increments = batch.len(), "writing queued increments");
        for queued in batch {
            queued.write().await;
            // Once stopping, the rest of the batch is written without pausing.
            if !token.is_cancelled() {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    }

    let batch = pending.drain();
    if !batch.is_empty() {
        cumulus_log::debug!(increments = batch.len(), "writing remaining queued increments");
    }
    for queued in batch {
        queued.write().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetricInterval;
    use crate::testutils::{datetime, setup_metrics};

    fn config(within: u64) -> IncrementQueueConfig {
        IncrementQueueConfig { within }
    }

    #[tokio::test]
    async fn test_push_merges_same_key() {
        let metrics = setup_metrics().await;
        let access = metrics
            .access(Uuid::new_v4(), "downloads", Arc::new(MetricInterval::Hourly))
            .await
            .unwrap();
        let subject = Uuid::new_v4();
        let time = Some(datetime("2024-05-02T10:00:00Z"));

        let queue = IncrementQueue::start(&config(60_000));
        queue.push(&access, subject, None, time, 1.0);
        queue.push(&access, subject, None, time, 2.5);
        queue.push(&access, subject, Some(""), time, 0.5);
        queue.push(&access, subject, Some("en"), time, 1.0);
        queue.push(&access, subject, None, None, 1.0);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.flush().await, 3);
        assert!(queue.is_empty());

        let en = access.point_value(subject, Some("en"), None).await.unwrap();
        assert_eq!(en, Some(1.0));
        let total = access.range_sum(subject, None, time, time).await.unwrap();
        assert_eq!(total, Some(5.0));

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_background_flush() {
        let metrics = setup_metrics().await;
        let access = metrics
            .access(Uuid::new_v4(), "downloads", Arc::new(MetricInterval::Hourly))
            .await
            .unwrap();
        let subject = Uuid::new_v4();

        let queue = IncrementQueue::start(&config(40));
        queue.push(&access, subject, None, None, 2.0);

        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        queue.shutdown().await;

        let total = access.point_value(subject, None, None).await.unwrap();
        assert_eq!(total, Some(2.0));
    }

    #[tokio::test]
    async fn test_shutdown_writes_remaining() {
        let metrics = setup_metrics().await;
        let access = metrics
            .access(Uuid::new_v4(), "downloads", Arc::new(MetricInterval::Hourly))
            .await
            .unwrap();
        let subject = Uuid::new_v4();

        let queue = IncrementQueue::start(&config(3_600_000));
        queue.push(&access, subject, None, None, 4.0);
        queue.shutdown().await;

        let total = access.point_value(subject, None, None).await.unwrap();
        assert_eq!(total, Some(4.0));
    }
}
