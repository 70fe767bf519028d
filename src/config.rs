//! Configuration for the maestro runtime.
//!
//! Supports YAML files and environment variable overrides.

use serde::Deserialize;

use crate::domain::{Asset, Link};
use crate::error::{Error, Result};
use crate::execution::ExecutionConfig;
use crate::manager::StageSpec;
use crate::pubsub::PubSubConfig;

/// Environment variable naming an extra configuration file.
pub const CONFIG_ENV_VAR: &str = "MAESTRO_CONFIG";

/// Prefix of environment variable overrides, e.g.
/// `MAESTRO__EXECUTION__QUEUE_CAPACITY=32`.
pub const CONFIG_ENV_PREFIX: &str = "MAESTRO";

/// Configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "maestro";

/// Runtime configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker and queue settings.
    pub execution: ExecutionConfig,
    /// Event stream settings.
    pub pubsub: PubSubConfig,
    /// Pipeline to create and run at startup (binary only).
    pub pipeline: Option<PipelineConfig>,
}

/// Declarative orchestration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Orchestration name. Stages and links default to it.
    pub orchestration: String,
    pub assets: Vec<Asset>,
    pub stages: Vec<StageSpec>,
    pub links: Vec<Link>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `maestro.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `MAESTRO_CONFIG` environment variable (if set)
    /// 4. Environment variables with `MAESTRO__` prefix
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::invalid_argument(format!("configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document, without consulting files or the environment.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| Error::invalid_argument(format!("configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.execution.queue_capacity == 0 {
            return Err(Error::invalid_argument(
                "execution.queue_capacity must be at least 1",
            ));
        }
        if self.pubsub.buffer_size == 0 {
            return Err(Error::invalid_argument(
                "pubsub.buffer_size must be at least 1",
            ));
        }
        Ok(())
    }
}
