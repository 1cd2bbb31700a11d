//! Daily resummarization of configured counters.
//!
//! Every job covers the range from the end of its previous run up to a number of days before the
//! current day. The covered range is recorded before the pipeline starts, so a crashed run is not
//! repeated.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Days, Utc};
use sqlx::Row;
use tokio_util::sync::CancellationToken;

use crate::config::PeriodicJobConfig;
use crate::interval::to_datetime;
use crate::{
    Interval, JobStatus, MetricError, MetricInterval, Metrics, Pipeline, ResummarizeAllJob,
};

/// The lock executor of periodic runs.
pub const PERIODIC_EXECUTOR: &str = "periodic-resummarization";

/// The range covered by the previous run of a periodic job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastResummarization {
    /// The job name.
    pub key: String,
    /// Start of the covered range, absent for the first run.
    pub start_date: Option<DateTime<Utc>>,
    /// End of the covered range, exclusive.
    pub end_date: DateTime<Utc>,
    /// When the run started.
    pub run_date: DateTime<Utc>,
}

/// Runs the configured periodic jobs.
#[derive(Debug)]
pub struct PeriodicResummarization {
    metrics: Metrics,
    pipeline: Pipeline,
    jobs: BTreeMap<String, PeriodicJobConfig>,
    hostname: String,
}

impl PeriodicResummarization {
    /// Creates the runner for the jobs keyed by name.
    pub fn new(
        metrics: Metrics,
        pipeline: Pipeline,
        jobs: BTreeMap<String, PeriodicJobConfig>,
    ) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|host| host.into_string().ok())
            .unwrap_or_else(|| "localhost".to_owned());

        Self {
            metrics,
            pipeline,
            jobs,
            hostname,
        }
    }

    /// Overrides the name of the host this process runs on.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Returns the previous run of a job.
    pub async fn last(&self, key: &str) -> Result<Option<LastResummarization>, MetricError> {
        let store = self.metrics.store();
        let select = store.sql().select_resummarization(key);
        let Some(row) = select.query().fetch_optional(store.pool()).await? else {
            return Ok(None);
        };

        let start_date: Option<i64> = row.try_get(0)?;
        Ok(Some(LastResummarization {
            key: key.to_owned(),
            start_date: start_date.map(to_datetime),
            end_date: to_datetime(row.try_get(1)?),
            run_date: to_datetime(row.try_get(2)?),
        }))
    }

    async fn save(&self, last: &LastResummarization) -> Result<(), MetricError> {
        let store = self.metrics.store();
        let upsert = store.sql().upsert_resummarization(
            &last.key,
            last.start_date.map(|t| t.timestamp_millis()),
            last.end_date.timestamp_millis(),
            last.run_date.timestamp_millis(),
        );
        upsert.query().execute(store.pool()).await?;
        Ok(())
    }

    fn runs_here(&self, job: &PeriodicJobConfig) -> bool {
        match job.hostname.as_deref() {
            None | Some("localhost") => true,
            Some(hostname) => hostname == self.hostname,
        }
    }

    /// Runs every job that is due at `now`. Returns the status of every started pipeline run.
    pub async fn run_once(
        &self,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Result<Vec<JobStatus>, MetricError> {
        let mut statuses = Vec::new();

        for (key, job) in &self.jobs {
            if token.is_cancelled() {
                break;
            }
            if !self.runs_here(job) {
                cumulus_log::trace!(job = %key, "periodic resummarization runs on another host");
                continue;
            }

            let last = self.last(key).await?;
            if let Some(last) = &last
                && last.run_date > now - Days::new(1)
            {
                continue;
            }

            let today = to_datetime(MetricInterval::Daily.process(now.timestamp_millis()));
            let Some(end_date) = today.checked_sub_days(Days::new(job.before_days.into())) else {
                continue;
            };
            let start_date = last.map(|last| last.end_date);
            if start_date.is_some_and(|start_date| start_date >= end_date) {
                continue;
            }

            let counters = self.metrics.symbols().matching(&job.counters).await?;
            if counters.is_empty() {
                cumulus_log::warn!(job = %key, "periodic resummarization matches no counters");
                continue;
            }

            self.save(&LastResummarization {
                key: key.clone(),
                start_date,
                end_date,
                run_date: now,
            })
            .await?;

            cumulus_log::info!(
                job = %key,
                from = ?start_date,
                to = %end_date,
                counters = counters.len(),
                "starting periodic resummarization"
            );

            let interval: Arc<dyn Interval> = Arc::new(job.interval);
            for counter in counters {
                let job = ResummarizeAllJob {
                    name: format!("{key} ({counter})"),
                    counter,
                    interval: interval.clone(),
                    from: start_date,
                    to: Some(end_date),
                    workers: job.workers,
                    executor: PERIODIC_EXECUTOR.to_owned(),
                };
                let handle = self.pipeline.spawn_with(job, token.child_token());
                statuses.push(handle.wait().await);
            }
        }

        Ok(statuses)
    }

    /// Runs due jobs at startup and after every day boundary until cancelled.
    pub async fn run(&self, token: CancellationToken) {
        loop {
            let now = Utc::now();
            if let Err(error) = self.run_once(now, &token).await {
                cumulus_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to run periodic resummarization"
                );
            }

            let tomorrow = to_datetime(MetricInterval::Daily.process(now.timestamp_millis()))
                + Days::new(1);
            let wait = (tomorrow - Utc::now()).to_std().unwrap_or_default();

            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::config::PipelineConfig;
    use crate::testutils::{Minutely, datetime, setup_metrics};
    use crate::{JobState, LocalLock, MetricAccess};

    fn job(hostname: Option<&str>) -> PeriodicJobConfig {
        PeriodicJobConfig {
            counters: vec!["down*".to_owned()],
            before_days: 1,
            interval: MetricInterval::Hourly,
            hostname: hostname.map(str::to_owned),
            workers: 1,
        }
    }

    async fn setup(hostname: Option<&str>) -> (PeriodicResummarization, MetricAccess, Uuid) {
        let metrics = setup_metrics().await;
        let access = metrics
            .access(Uuid::new_v4(), "downloads", Arc::new(Minutely))
            .await
            .unwrap();
        let subject = Uuid::new_v4();
        for time in [
            "2024-05-01T10:01:00Z",
            "2024-05-01T10:30:00Z",
            "2024-05-02T10:01:00Z",
            "2024-05-02T10:30:00Z",
        ] {
            access
                .increment(subject, Some(datetime(time)), None, 1.0)
                .await
                .unwrap();
        }

        let pipeline = Pipeline::new(
            metrics.clone(),
            Arc::new(LocalLock::new()),
            PipelineConfig::default(),
        );
        let jobs = BTreeMap::from([("daily".to_owned(), job(hostname))]);
        let periodic = PeriodicResummarization::new(metrics, pipeline, jobs).with_hostname("web-1");

        (periodic, access, subject)
    }

    #[tokio::test]
    async fn test_runs_once_per_day() {
        cumulus_log::init_test!();

        let (periodic, access, subject) = setup(None).await;
        let token = CancellationToken::new();
        let now = datetime("2024-05-03T12:00:00Z");

        let statuses = periodic.run_once(now, &token).await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, JobState::Completed);

        similar_asserts::assert_eq!(
            periodic.last("daily").await.unwrap(),
            Some(LastResummarization {
                key: "daily".to_owned(),
                start_date: None,
                end_date: datetime("2024-05-02T00:00:00Z"),
                run_date: now,
            })
        );

        // Only rows before the end date are merged.
        let first = access.first_update(subject, None).await.unwrap();
        assert_eq!(first, Some(datetime("2024-05-01T10:00:00Z")));
        let newer = access
            .range_sum(subject, None, Some(datetime("2024-05-02T10:01:00Z")), None)
            .await
            .unwrap();
        assert_eq!(newer, Some(2.0));

        let again = periodic.run_once(now, &token).await.unwrap();
        assert!(again.is_empty());

        let tomorrow = datetime("2024-05-04T12:00:00Z");
        let statuses = periodic.run_once(tomorrow, &token).await.unwrap();
        assert_eq!(statuses.len(), 1);
        let last = periodic.last("daily").await.unwrap().unwrap();
        assert_eq!(last.start_date, Some(datetime("2024-05-02T00:00:00Z")));
        assert_eq!(last.end_date, datetime("2024-05-03T00:00:00Z"));

        let total = access.point_value(subject, None, None).await.unwrap();
        assert_eq!(total, Some(4.0));
        let merged = access
            .range_sum(subject, None, Some(datetime("2024-05-02T10:01:00Z")), None)
            .await
            .unwrap();
        assert_eq!(merged, None);
    }

    #[tokio::test]
    async fn test_runs_only_on_configured_host() {
        let now = datetime("2024-05-03T12:00:00Z");
        let token = CancellationToken::new();

        let (periodic, _, _) = setup(Some("web-2")).await;
        assert!(periodic.run_once(now, &token).await.unwrap().is_empty());
        assert_eq!(periodic.last("daily").await.unwrap(), None);

        let (periodic, _, _) = setup(Some("web-1")).await;
        assert_eq!(periodic.run_once(now, &token).await.unwrap().len(), 1);

        let (periodic, _, _) = setup(Some("localhost")).await;
        assert_eq!(periodic.run_once(now, &token).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_weekly_job_on_consecutive_days() {
        let metrics = setup_metrics().await;
        let access = metrics
            .access(Uuid::new_v4(), "downloads", Arc::new(Minutely))
            .await
            .unwrap();
        let subject = Uuid::new_v4();
        for time in [
            "2024-04-29T10:01:00Z",
            "2024-04-30T10:01:00Z",
            "2024-05-01T10:01:00Z",
        ] {
            access
                .increment(subject, Some(datetime(time)), None, 1.0)
                .await
                .unwrap();
        }

        let pipeline = Pipeline::new(
            metrics.clone(),
            Arc::new(LocalLock::new()),
            PipelineConfig::default(),
        );
        let weekly = PeriodicJobConfig {
            before_days: 0,
            interval: MetricInterval::Weekly,
            ..job(None)
        };
        let jobs = BTreeMap::from([("weekly".to_owned(), weekly)]);
        let periodic = PeriodicResummarization::new(metrics, pipeline, jobs);
        let token = CancellationToken::new();

        // The second run starts inside the week summarized by the first one.
        for now in ["2024-05-01T01:00:00Z", "2024-05-02T01:00:00Z"] {
            let statuses = periodic.run_once(datetime(now), &token).await.unwrap();
            assert_eq!(statuses.len(), 1);
            assert_eq!(statuses[0].state, JobState::Completed);
            assert_eq!(statuses[0].failures, 0);
        }

        let week = datetime("2024-04-29T00:00:00Z");
        assert_eq!(access.first_update(subject, None).await.unwrap(), Some(week));
        assert_eq!(access.last_update(subject, None).await.unwrap(), Some(week));
        assert_eq!(
            access.point_value(subject, None, None).await.unwrap(),
            Some(3.0)
        );
    }
}
