//! Counter-wide resummarization with a pool of workers.
//!
//! A producer pages through every key of a counter and feeds a bounded channel. Workers take keys
//! from the channel and resummarize them one at a time. The run is guarded by a named
//! [`DistributedLock`] so that only one process works on a counter at a time.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use cumulus_statsd::metric;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::sql::UpperBound;
use crate::statsd::{MetricCounters, MetricTimers};
use crate::store::decode_uuid;
use crate::{DistributedLock, Interval, MetricError, MetricKey, Metrics};

/// Resummarization of every key of one counter.
#[derive(Clone, Debug)]
pub struct ResummarizeAllJob {
    /// The counter name.
    pub counter: String,
    /// Target granularity.
    pub interval: Arc<dyn Interval>,
    /// Start of the range, inclusive and widened to the start of its bucket.
    pub from: Option<DateTime<Utc>>,
    /// End of the range, exclusive.
    pub to: Option<DateTime<Utc>>,
    /// Number of concurrent workers.
    pub workers: usize,
    /// The kind of process running the job, the first part of the lock name.
    pub executor: String,
    /// The name of the job, the second part of the lock name.
    pub name: String,
}

impl ResummarizeAllJob {
    /// Returns the name of the lock guarding the job.
    pub fn lock_name(&self) -> String {
        format!("{}:{}", self.executor, self.name)
    }
}

/// The lifecycle of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// The job was created but has not acquired its lock yet.
    Pending,
    /// Keys are being produced or processed.
    Running,
    /// Every key was resummarized.
    Completed,
    /// At least one worker failed, some keys were not resummarized.
    Partial,
    /// The job was cancelled before all keys were processed.
    Cancelled,
    /// Another owner held the lock.
    Skipped,
    /// The job could not list keys or acquire its lock.
    Failed,
}

impl JobState {
    /// Returns the name used in logs and metric tags.
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Progress of a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobStatus {
    /// Current state.
    pub state: JobState,
    /// Number of keys processed by workers.
    pub index: usize,
    /// Number of keys listed so far.
    pub total: usize,
    /// Number of failed workers.
    pub failures: usize,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            state: JobState::Pending,
            index: 0,
            total: 0,
            failures: 0,
        }
    }
}

type SharedStatus = Arc<Mutex<JobStatus>>;

/// A handle on a spawned job.
#[derive(Debug)]
pub struct JobHandle {
    status: SharedStatus,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl JobHandle {
    /// Returns `true` while the job has not finished.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Returns a snapshot of the progress.
    pub fn status(&self) -> JobStatus {
        self.status.lock().clone()
    }

    /// Requests cancellation. Keys in progress are completed.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for the job to finish and returns its final status.
    pub async fn wait(self) -> JobStatus {
        if let Err(error) = self.task.await {
            cumulus_log::error!(
                error = &error as &dyn std::error::Error,
                "resummarization job panicked"
            );
            self.status.lock().state = JobState::Failed;
        }
        self.status.lock().clone()
    }
}

/// Runs counter-wide resummarization jobs.
#[derive(Clone, Debug)]
pub struct Pipeline {
    metrics: Metrics,
    lock: Arc<dyn DistributedLock>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Creates a pipeline on the given store and lock.
    pub fn new(metrics: Metrics, lock: Arc<dyn DistributedLock>, config: PipelineConfig) -> Self {
        Self {
            metrics,
            lock,
            config,
        }
    }

    /// Starts a job in the background.
    pub fn spawn(&self, job: ResummarizeAllJob) -> JobHandle {
        self.spawn_with(job, CancellationToken::new())
    }

    /// Starts a job in the background that stops when `token` is cancelled.
    pub fn spawn_with(&self, job: ResummarizeAllJob, token: CancellationToken) -> JobHandle {
        let status = SharedStatus::default();

        let runner = Runner {
            pipeline: self.clone(),
            job,
            status: status.clone(),
            token: token.clone(),
        };
        let task = tokio::spawn(runner.run());

        JobHandle {
            status,
            token,
            task,
        }
    }

    /// Runs a job to completion.
    pub async fn run(&self, job: ResummarizeAllJob) -> JobStatus {
        self.spawn(job).wait().await
    }
}

/// The state of one running job.
struct Runner {
    pipeline: Pipeline,
    job: ResummarizeAllJob,
    status: SharedStatus,
    token: CancellationToken,
}

impl Runner {
    async fn run(self) {
        let start = Instant::now();
        let lock_name = self.job.lock_name();
        let lock = self.pipeline.lock.clone();

        let state = match lock.try_acquire(&lock_name).await {
            Ok(true) => {
                self.status.lock().state = JobState::Running;
                let work = self.resummarize_all();
                let keep_alive = self.keep_alive(&lock_name);
                tokio::pin!(work, keep_alive);
                let state = tokio::select! {
                    state = &mut work => state,
                    () = &mut keep_alive => work.await,
                };
                if let Err(error) = lock.release(&lock_name).await {
                    cumulus_log::error!(
                        error = &error as &dyn std::error::Error,
                        lock = %lock_name,
                        "failed to release resummarization lock"
                    );
                }
                state
            }
            Ok(false) => {
                cumulus_log::info!(lock = %lock_name, "resummarization already running elsewhere");
                JobState::Skipped
            }
            Err(error) => {
                cumulus_log::error!(
                    error = &error as &dyn std::error::Error,
                    lock = %lock_name,
                    "failed to acquire resummarization lock"
                );
                JobState::Failed
            }
        };

        let status = {
            let mut status = self.status.lock();
            status.state = state;
            status.clone()
        };

        metric!(timer(MetricTimers::Pipeline) = start.elapsed(), state = state.name());
        cumulus_log::info!(
            job = %self.job.name,
            counter = %self.job.counter,
            state = %state,
            keys = status.index,
            total = status.total,
            failures = status.failures,
            "resummarization finished"
        );
    }

    /// Refreshes the held lock until it is lost, then cancels the job.
    ///
    /// Never resolves for locks that do not expire.
    async fn keep_alive(&self, lock_name: &str) {
        let lock = &self.pipeline.lock;
        let Some(period) = lock.refresh_interval() else {
            return std::future::pending().await;
        };

        let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticks.tick().await;
            match lock.refresh(lock_name).await {
                Ok(true) => cumulus_log::trace!(lock = %lock_name, "refreshed resummarization lock"),
                Ok(false) => {
                    cumulus_log::warn!(lock = %lock_name, "lost resummarization lock, cancelling");
                    self.token.cancel();
                    return;
                }
                Err(error) => cumulus_log::error!(
                    error = &error as &dyn std::error::Error,
                    lock = %lock_name,
                    "failed to refresh resummarization lock"
                ),
            }
        }
    }

    async fn resummarize_all(&self) -> JobState {
        let metrics = &self.pipeline.metrics;
        let symbol_id = match metrics.symbols().lookup(&self.job.counter).await {
            Ok(Some(symbol_id)) => symbol_id,
            Ok(None) => return JobState::Completed,
            Err(error) => {
                cumulus_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to look up counter"
                );
                return JobState::Failed;
            }
        };

        let from = self.job.from.map(|t| t.timestamp_millis());
        let to = self.job.to.map(|t| t.timestamp_millis());

        let (tx, rx) = mpsc::channel(self.pipeline.config.queue_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = JoinSet::new();
        for _ in 0..self.job.workers.max(1) {
            let worker = Worker {
                metrics: metrics.clone(),
                keys: rx.clone(),
                interval: self.job.interval.clone(),
                from,
                to,
                status: self.status.clone(),
                token: self.token.clone(),
            };
            workers.spawn(worker.run());
        }
        // Without workers the channel closes and the producer stops.
        drop(rx);

        let produced = self.produce(symbol_id, from, to, tx).await;
        if let Err(error) = &produced {
            cumulus_log::error!(
                error = error as &dyn std::error::Error,
                counter = %self.job.counter,
                "failed to list keys for resummarization"
            );
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(error) = joined {
                cumulus_log::error!(
                    error = &error as &dyn std::error::Error,
                    "resummarization worker panicked"
                );
                self.status.lock().failures += 1;
            }
        }

        if self.token.is_cancelled() {
            JobState::Cancelled
        } else if produced.is_err() {
            JobState::Failed
        } else if self.status.lock().failures > 0 {
            JobState::Partial
        } else {
            JobState::Completed
        }
    }

    /// Feeds every key of the counter into the channel, page by page.
    async fn produce(
        &self,
        symbol_id: i64,
        from: Option<i64>,
        to: Option<i64>,
        tx: mpsc::Sender<MetricKey>,
    ) -> Result<(), MetricError> {
        let store = self.pipeline.metrics.store();
        let page_size = self.pipeline.config.page_size.max(1);
        let mut after = None;

        loop {
            if self.token.is_cancelled() {
                return Ok(());
            }

            let select = store.sql().select_keys_page(
                symbol_id,
                from,
                to.map(UpperBound::Before),
                after.as_ref(),
                page_size,
            );
            let keys = select
                .query()
                .fetch_all(store.pool())
                .await?
                .iter()
                .map(|row| -> Result<_, MetricError> {
                    Ok(MetricKey {
                        type_id: decode_uuid(row, 0)?,
                        subject_id: decode_uuid(row, 1)?,
                        symbol_id,
                        dimension_id: decode_uuid(row, 2)?,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            self.status.lock().total += keys.len();
            metric!(counter(MetricCounters::PipelineKeys) += keys.len() as i64);

            for key in &keys {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return Ok(()),
                    sent = tx.send(*key) => {
                        // Every worker has stopped.
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }

            if keys.len() < page_size {
                return Ok(());
            }
            after = keys.last().copied();
        }
    }
}

/// A consumer of the key channel.
struct Worker {
    metrics: Metrics,
    keys: Arc<tokio::sync::Mutex<mpsc::Receiver<MetricKey>>>,
    interval: Arc<dyn Interval>,
    from: Option<i64>,
    to: Option<i64>,
    status: SharedStatus,
    token: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            if self.token.is_cancelled() {
                return;
            }

            let Some(key) = self.keys.lock().await.recv().await else {
                return;
            };

            let result = self
                .metrics
                .resummarize_key(&key, self.interval.as_ref(), self.from, self.to)
                .await;

            let mut status = self.status.lock();
            match result {
                Ok(_) => status.index += 1,
                Err(error) => {
                    cumulus_log::error!(
                        error = &error as &dyn std::error::Error,
                        subject = %key.subject_id,
                        dimension = %key.dimension_id,
                        "failed to resummarize key"
                    );
                    status.failures += 1;
                    return;
                }
            }
        }
    }
}
