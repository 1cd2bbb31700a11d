use anyhow::Result;
use cumulus_statsd::MetricsConfig;

use crate::config::Config;

/// Validates settings that cannot be expressed by their types.
pub fn check_config(config: &Config) -> Result<()> {
    let pipeline = &config.pipeline;
    if pipeline.workers == 0 || pipeline.page_size == 0 || pipeline.queue_size == 0 {
        anyhow::bail!("`pipeline.workers`, `page_size` and `queue_size` must be greater than zero");
    }

    if config.storage.max_connections < config.storage.min_connections {
        anyhow::bail!(
            "`storage.max_connections` is {} but must be at least `min_connections` ({})",
            config.storage.max_connections,
            config.storage.min_connections
        );
    }

    for (key, job) in &config.periodic {
        if job.counters.is_empty() {
            anyhow::bail!("periodic job '{key}' does not name any counters");
        }
        if job.workers == 0 {
            anyhow::bail!("periodic job '{key}' must have at least one worker");
        }
    }

    Ok(())
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        cumulus_log::info!("launching cumulus without config folder");
    } else {
        cumulus_log::info!(
            "launching cumulus from config folder {}",
            config.path().display()
        );
    }
    cumulus_log::info!("  database: {}", config.storage.path.display());
    cumulus_log::info!("  periodic jobs: {}", config.periodic.len());
    cumulus_log::info!("  log level: {}", config.logging.level);
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let Some(host) = config.metrics.statsd.as_deref() else {
        return Ok(());
    };

    let mut default_tags = config.metrics.default_tags.clone();
    if let Some(hostname_tag) = config.metrics.hostname_tag.as_deref()
        && let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok())
    {
        default_tags.insert(hostname_tag.to_owned(), hostname);
    }
    cumulus_statsd::init(MetricsConfig {
        prefix: config.metrics.prefix.clone(),
        host: host.to_owned(),
        buffer_size: config.metrics.buffer_size,
        default_tags,
    })?;

    Ok(())
}
