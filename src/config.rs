//! Configuration loading.
//!
//! Settings come from a TOML file, overridden by `POOLWATCH__*` environment
//! variables (`POOLWATCH__SERVER__LISTEN=127.0.0.1:9000`).
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:9783"
//!
//! [health_check]
//! max_working_interval_times = 3
//! min_usage_rate = 0.5
//!
//! [credentials.local]
//!
//! [credentials.prod]
//! path = "certs/ca.pem"
//!
//! [cores.crawler]
//! host = "10.0.0.12"
//! port = 7070
//! interval = "1s"
//! credential = "prod"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use poolwatch_types::HealthCheckConfig;
use serde::Deserialize;

use crate::credentials::{Credential, CredentialStore};
use crate::manager::CoreSpec;

/// Default address of the subscriber server.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:9783";

/// Default file looked up when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "poolwatch.toml";

const ENV_PREFIX: &str = "POOLWATCH";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the subscriber server listens on.
    pub listen: String,
    /// Messages buffered per subscriber before it is dropped.
    pub subscriber_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            subscriber_buffer: 256,
        }
    }
}

/// Complete configuration of a poolwatch instance.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub server: ServerConfig,
    /// Thresholds for cores without their own `health_check` table.
    pub health_check: HealthCheckConfig,
    pub credentials: BTreeMap<String, Credential>,
    pub cores: BTreeMap<String, CoreSpec>,
}

impl WatchConfig {
    /// Load from `path`, or from `poolwatch.toml` in the working directory if
    /// it exists. Environment overrides apply either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false),
        };

        let config = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Parse configuration from a TOML string, without environment overrides.
    pub fn from_toml(content: &str) -> Result<Self> {
        Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    pub fn credential_store(&self) -> CredentialStore {
        CredentialStore::from_named(self.credentials.clone())
    }

    /// Configured cores, named after their table keys.
    pub fn core_specs(&self) -> Vec<CoreSpec> {
        self.cores
            .iter()
            .map(|(name, spec)| CoreSpec {
                name: name.clone(),
                ..spec.clone()
            })
            .collect()
    }
}
