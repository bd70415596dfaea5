//! Registry of monitored cores.
//!
//! [`CoreManager`] owns one [`CoreSupervisor`] per registered core. Each
//! supervisor runs under a child of the manager's master cancellation token
//! and publishes into the shared [`Broadcaster`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use poolwatch_client::CoreConnector;
use poolwatch_types::HealthCheckConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{Broadcaster, Subscription};
use crate::config::WatchConfig;
use crate::credentials::CredentialStore;
use crate::duration::{format_duration, parse_duration};
use crate::supervisor::{CoreState, CoreSupervisor, CoreTarget};

/// How long [`CoreManager::shutdown`] waits for each supervisor.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors returned when registering or removing cores.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    #[error("core name must not be empty")]
    InvalidName,

    #[error("core with name {0} already exists")]
    DuplicateName(String),

    #[error("credential with name {0} does not exist")]
    UnknownCredential(String),

    #[error("invalid interval {interval:?}: {reason}")]
    InvalidInterval { interval: String, reason: String },

    #[error("invalid health check: {0}")]
    InvalidHealthCheck(String),

    #[error("core with name {0} does not exist")]
    NotFound(String),
}

/// Request to monitor a core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreSpec {
    /// Unique name. Filled from the table key when read from a config file.
    #[serde(default)]
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Poll interval, e.g. `"1s"` or `"500ms"`.
    pub interval: String,
    /// Name of the credential used to connect.
    pub credential: String,
    /// Overrides the manager-wide thresholds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
}

impl CoreSpec {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        interval: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            interval: interval.into(),
            credential: credential.into(),
            health_check: None,
        }
    }

    pub fn with_health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = Some(health_check);
        self
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Public view of a registered core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreInfo {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub interval: String,
    pub credential: String,
    pub state: CoreState,
}

struct ManagedCore {
    spec: CoreSpec,
    state: watch::Receiver<CoreState>,
    /// Child of the manager's master token.
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ManagedCore {
    fn info(&self) -> CoreInfo {
        CoreInfo {
            name: self.spec.name.clone(),
            host: self.spec.host.clone(),
            port: self.spec.port,
            interval: self.spec.interval.clone(),
            credential: self.spec.credential.clone(),
            state: *self.state.borrow(),
        }
    }
}

/// Owns the set of monitored cores.
pub struct CoreManager {
    cores: Mutex<BTreeMap<String, ManagedCore>>,
    credentials: CredentialStore,
    connector: Arc<dyn CoreConnector>,
    broadcaster: Arc<Broadcaster>,
    health_check: HealthCheckConfig,
    cancel: CancellationToken,
}

impl CoreManager {
    pub fn new(credentials: CredentialStore, connector: Arc<dyn CoreConnector>) -> Self {
        Self {
            cores: Mutex::new(BTreeMap::new()),
            credentials,
            connector,
            broadcaster: Arc::new(Broadcaster::new()),
            health_check: HealthCheckConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Thresholds for cores that do not set their own.
    pub fn with_health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = health_check;
        self
    }

    /// Publish into an existing broadcaster instead of a private one.
    pub fn with_broadcaster(mut self, broadcaster: Arc<Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    /// Build a manager from a loaded configuration and start every core it
    /// lists. The first core that fails validation aborts start-up.
    pub fn from_config(
        config: &WatchConfig,
        connector: Arc<dyn CoreConnector>,
    ) -> Result<Self, ManagerError> {
        let manager = Self::new(config.credential_store(), connector)
            .with_health_check(config.health_check);
        // Dropping the manager on error cancels whatever already started.
        manager.apply_config(config)?;
        Ok(manager)
    }

    /// Add every core listed in `config`.
    pub fn apply_config(&self, config: &WatchConfig) -> Result<(), ManagerError> {
        let specs = config.core_specs();
        tracing::info!(count = specs.len(), "Loading configured cores");
        for spec in specs {
            self.add_core(spec)?;
        }
        Ok(())
    }

    /// Register a core and start supervising it.
    ///
    /// Every check happens before anything is spawned, so a rejected spec
    /// leaves no trace.
    pub fn add_core(&self, spec: CoreSpec) -> Result<(), ManagerError> {
        if spec.name.trim().is_empty() {
            return Err(ManagerError::InvalidName);
        }

        let mut cores = self.cores.lock();

        if cores.contains_key(&spec.name) {
            return Err(ManagerError::DuplicateName(spec.name));
        }

        let credentials = self
            .credentials
            .resolve(&spec.credential)
            .ok_or_else(|| ManagerError::UnknownCredential(spec.credential.clone()))?;

        let interval = parse_interval(&spec.interval)?;

        let health_check = spec.health_check.unwrap_or(self.health_check);
        validate_health_check(&health_check)?;

        let cancel = self.cancel.child_token();
        let supervisor = CoreSupervisor::new(
            CoreTarget {
                name: spec.name.clone(),
                address: spec.address(),
                credentials,
                interval,
                health_check,
            },
            Arc::clone(&self.connector),
            Arc::clone(&self.broadcaster),
            cancel.clone(),
        );
        let state = supervisor.state();
        let task = supervisor.spawn();

        tracing::info!(
            core = %spec.name,
            address = %spec.address(),
            interval = %format_duration(interval),
            credential = %spec.credential,
            "Core added"
        );

        cores.insert(
            spec.name.clone(),
            ManagedCore {
                spec,
                state,
                cancel,
                task,
            },
        );
        Ok(())
    }

    /// Stop monitoring a core. The name is free again as soon as this
    /// returns; the connection winds down in the background.
    pub fn remove_core(&self, name: &str) -> Result<(), ManagerError> {
        let removed = self
            .cores
            .lock()
            .remove(name)
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;

        removed.cancel.cancel();
        tracing::info!(core = %name, "Core removed");
        Ok(())
    }

    /// All registered cores, ordered by name.
    pub fn list_cores(&self) -> Vec<CoreInfo> {
        self.cores.lock().values().map(ManagedCore::info).collect()
    }

    pub fn core(&self, name: &str) -> Option<CoreInfo> {
        self.cores.lock().get(name).map(ManagedCore::info)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cores.lock().contains_key(name)
    }

    pub fn credential_names(&self) -> Vec<String> {
        self.credentials.names()
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Receive every message published from now on.
    pub fn subscribe(&self, buffer: usize) -> Subscription {
        self.broadcaster.subscribe(buffer)
    }

    /// Watch the lifecycle state of one core.
    pub fn watch_state(&self, name: &str) -> Option<watch::Receiver<CoreState>> {
        self.cores.lock().get(name).map(|core| core.state.clone())
    }

    /// Cancel every supervisor and wait for each to stop, up to 5 seconds
    /// apiece.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down core manager");
        self.cancel.cancel();

        let drained: Vec<(String, ManagedCore)> =
            std::mem::take(&mut *self.cores.lock()).into_iter().collect();

        for (name, core) in drained {
            core.cancel.cancel();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, core.task).await.is_err() {
                tracing::warn!(core = %name, "Supervisor did not stop in time");
            }
        }
        tracing::info!("Core manager shut down");
    }
}

impl std::fmt::Debug for CoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreManager")
            .field("cores", &self.cores.lock().keys().collect::<Vec<_>>())
            .field("broadcaster", &self.broadcaster)
            .finish_non_exhaustive()
    }
}

impl Drop for CoreManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn parse_interval(interval: &str) -> Result<Duration, ManagerError> {
    let parsed = parse_duration(interval).map_err(|e| ManagerError::InvalidInterval {
        interval: interval.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.is_zero() {
        return Err(ManagerError::InvalidInterval {
            interval: interval.to_string(),
            reason: "interval must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

fn validate_health_check(cfg: &HealthCheckConfig) -> Result<(), ManagerError> {
    if cfg.max_working_interval_times == 0 {
        return Err(ManagerError::InvalidHealthCheck(
            "max_working_interval_times must be at least 1".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&cfg.min_usage_rate) {
        return Err(ManagerError::InvalidHealthCheck(format!(
            "min_usage_rate must be between 0 and 1, got {}",
            cfg.min_usage_rate
        )));
    }
    Ok(())
}
