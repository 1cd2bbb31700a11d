use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use cumulus_log::LogConfig;
use cumulus_metrics::{
    CacheConfig, IncrementQueueConfig, LockConfig, PeriodicJobConfig, PipelineConfig,
    StorageConfig,
};
use serde::{Deserialize, Serialize};

/// The file name of the configuration within the config folder.
const CONFIG_FILE: &str = "config.yml";

/// Indicates config related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to open the file.
    #[error("failed to open config file {}", .path.display())]
    CouldNotOpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Parsing YAML failed.
    #[error("failed to parse yaml config file {}", .path.display())]
    BadYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Controls internal reporting to statsd.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Metrics are not reported if this is not set.
    pub statsd: Option<String>,
    /// Common prefix that is added to all metrics.
    pub prefix: String,
    /// Default tags to apply to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Tag name to report the hostname to for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// Size of the statsd UDP buffer, the client default if not set.
    pub buffer_size: Option<usize>,
}

/// The full configuration of the binary.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub logging: LogConfig,
    pub metrics: Metrics,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub lock: LockConfig,
    pub increment_queue: IncrementQueueConfig,
    /// Periodic resummarization jobs keyed by name.
    pub periodic: BTreeMap<String, PeriodicJobConfig>,
    #[serde(skip)]
    path: PathBuf,
}

impl Config {
    /// Loads the configuration from `config.yml` within the given folder.
    ///
    /// A folder without configuration file yields the defaults. A relative storage path is
    /// resolved against the folder.
    pub fn from_path(base: &Path) -> Result<Self, ConfigError> {
        let path = base.join(CONFIG_FILE);

        let mut config = if path.exists() {
            let file = fs::File::open(&path).map_err(|source| ConfigError::CouldNotOpenFile {
                path: path.clone(),
                source,
            })?;
            serde_yaml::from_reader::<_, Self>(io::BufReader::new(file))
                .map_err(|source| ConfigError::BadYaml { path, source })?
        } else {
            Self::default()
        };

        if config.storage.path.is_relative() {
            config.storage.path = base.join(&config.storage.path);
        }
        config.path = base.to_path_buf();

        Ok(config)
    }

    /// Returns the folder the configuration was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
