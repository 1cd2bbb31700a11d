use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::ArgMatches;
use cumulus_metrics::{
    JobState, MetricInterval, Metrics, PeriodicResummarization, Pipeline, ResummarizeAllJob,
    SqliteLock,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cliapp::make_app;
use crate::config::Config;
use crate::setup;

/// The executor under which manual runs take their lock.
const CLI_EXECUTOR: &str = "cli";

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = make_app();
    let matches = app.get_matches();

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(".cumulus"));
    let config = Config::from_path(&config_path)?;

    cumulus_log::init(&config.logging);
    setup::check_config(&config)?;
    setup::init_metrics(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("cumulus")
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;

    match matches.subcommand() {
        Some(("run", _)) => runtime.block_on(run(config)),
        Some(("resummarize", matches)) => runtime.block_on(resummarize(config, matches)),
        Some(("reconstruct", matches)) => runtime.block_on(reconstruct(config, matches)),
        _ => unreachable!(),
    }
}

async fn open(config: &Config) -> Result<(Metrics, Pipeline)> {
    let metrics = Metrics::prepare(&config.storage, &config.cache)
        .await
        .with_context(|| {
            format!(
                "failed to open the database at {}",
                config.storage.path.display()
            )
        })?;

    let lock = Arc::new(SqliteLock::new(metrics.store().clone(), &config.lock));
    let pipeline = Pipeline::new(metrics.clone(), lock, config.pipeline.clone());

    Ok((metrics, pipeline))
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        cumulus_log::error!(
            error = &error as &dyn std::error::Error,
            "failed to listen for the shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}

pub async fn run(config: Config) -> Result<()> {
    setup::dump_spawn_infos(&config);

    let (metrics, pipeline) = open(&config).await?;
    let periodic = PeriodicResummarization::new(metrics, pipeline, config.periodic.clone());

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        cumulus_log::info!("shutting down, waiting for running jobs to stop");
        shutdown.cancel();
    });

    periodic.run(token).await;
    cumulus_log::info!("periodic resummarization stopped");

    Ok(())
}

pub async fn resummarize(config: Config, matches: &ArgMatches) -> Result<()> {
    let counter = matches
        .get_one::<String>("counter")
        .cloned()
        .context("missing counter")?;
    let interval = matches
        .get_one::<MetricInterval>("interval")
        .copied()
        .unwrap_or(MetricInterval::Daily);
    let workers = matches
        .get_one::<usize>("workers")
        .copied()
        .unwrap_or(config.pipeline.workers);
    if workers == 0 {
        anyhow::bail!("at least one worker is required");
    }

    let (_, pipeline) = open(&config).await?;
    let job = ResummarizeAllJob {
        name: counter.clone(),
        counter,
        interval: Arc::new(interval),
        from: matches.get_one::<DateTime<Utc>>("from").copied(),
        to: matches.get_one::<DateTime<Utc>>("to").copied(),
        workers,
        executor: CLI_EXECUTOR.to_owned(),
    };

    let token = CancellationToken::new();
    let wait = pipeline.spawn_with(job, token.clone()).wait();
    tokio::pin!(wait);
    let status = tokio::select! {
        status = &mut wait => status,
        _ = shutdown_signal() => {
            cumulus_log::info!("cancelling resummarization");
            token.cancel();
            wait.await
        }
    };

    cumulus_log::info!(
        state = %status.state,
        keys = status.index,
        total = status.total,
        failures = status.failures,
        "resummarization finished"
    );

    match status.state {
        JobState::Completed => Ok(()),
        state => anyhow::bail!("resummarization ended as {state}"),
    }
}

pub async fn reconstruct(config: Config, matches: &ArgMatches) -> Result<()> {
    let counter = matches
        .get_one::<String>("counter")
        .context("missing counter")?;
    let type_id = *matches.get_one::<Uuid>("type").context("missing type")?;
    let subject_id = *matches
        .get_one::<Uuid>("subject")
        .context("missing subject")?;

    let (metrics, _) = open(&config).await?;
    let fixed = metrics
        .reconstruct(type_id, subject_id, counter)
        .await
        .with_context(|| format!("failed to reconstruct {counter} of subject {subject_id}"))?;

    cumulus_log::info!(
        subject = %subject_id,
        counter = %counter,
        rows = fixed,
        "reconstruction finished"
    );

    Ok(())
}
