use std::env;

use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Crates of this workspace, logged with maximum verbosity by default.
const CRATE_NAMES: &[&str] = &["cumulus", "cumulus_log", "cumulus_metrics", "cumulus_statsd"];

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO cumulus_metrics::pipeline: resummarize job started
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2024-05-02T12:10:32.000000Z  INFO cumulus_metrics::pipeline: resummarize job started
    /// ```
    Simplified,

    /// Dump out JSON lines.
    ///
    /// ```text
    /// {"timestamp":"2024-05-02T12:11:08.729716Z","level":"INFO","fields":{"message":"resummarize job started"},"target":"cumulus_metrics::pipeline"}
    /// ```
    Json,
}

/// The logging level parsed from a string.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// The "error" level.
    Error,
    /// The "warn" level.
    Warn,
    /// The "info" level.
    Info,
    /// The "debug" level.
    Debug,
    /// The "trace" level.
    Trace,
    /// No logging at all.
    Off,
}

impl Level {
    /// Returns the tracing [`LevelFilter`].
    pub const fn level_filter(&self) -> LevelFilter {
        match self {
            Level::Error => LevelFilter::ERROR,
            Level::Warn => LevelFilter::WARN,
            Level::Info => LevelFilter::INFO,
            Level::Debug => LevelFilter::DEBUG,
            Level::Trace => LevelFilter::TRACE,
            Level::Off => LevelFilter::OFF,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format!("{self:?}").to_lowercase())
    }
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// The log level for the metric store.
    pub level: Level,

    /// Controls the log output format.
    ///
    /// Defaults to [`LogFormat::Auto`], which detects the best format based on the TTY.
    pub format: LogFormat,

    /// When set to `true`, backtraces are forced on.
    ///
    /// Otherwise, backtraces can be enabled by setting the `RUST_BACKTRACE` variable to `full`.
    pub enable_backtraces: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: LogFormat::Auto,
            enable_backtraces: false,
        }
    }
}

/// Returns the default filter directives for all of the workspace crates.
fn default_filter() -> EnvFilter {
    let mut directives = vec![
        // Configure INFO as default for all third-party crates.
        "info".to_owned(),
        // Every statement is logged by sqlx on INFO, which is far too verbose for the hot path.
        "sqlx=warn".to_owned(),
    ];

    // Add all internal modules with maximum log-level.
    directives.extend(CRATE_NAMES.iter().map(|name| format!("{name}=trace")));

    EnvFilter::new(directives.join(","))
}

/// Initialize the logging system.
///
/// The `RUST_LOG` environment variable takes precedence over the default filters, the configured
/// level is applied on top of both.
///
/// # Example
///
/// ```
/// let log_config = cumulus_log::LogConfig {
///     enable_backtraces: true,
///     ..Default::default()
/// };
///
/// cumulus_log::init(&log_config);
/// ```
pub fn init(config: &LogConfig) {
    if config.enable_backtraces {
        // SAFETY: called once during startup, before any other thread is spawned.
        unsafe { env::set_var("RUST_BACKTRACE", "full") };
    }

    let subscriber = fmt::layer().with_writer(std::io::stderr).with_target(true);

    let format = match (config.format, console::user_attended()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => {
            subscriber.compact().without_time().boxed()
        }
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            subscriber.with_ansi(false).boxed()
        }
        (LogFormat::Json, _) => subscriber
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter());

    tracing_subscriber::registry()
        .with(format.with_filter(config.level.level_filter()))
        .with(filter)
        .try_init()
        .ok();
}
