//! Configuration management for simcon.
//!
//! Configuration is read from TOML files in layers, each overriding the one
//! before it:
//!
//! 1. built-in defaults
//! 2. the user file, `$XDG_CONFIG_HOME/simcon/simcon.toml` (or `~/.config/...`)
//! 3. `./simcon.toml` in the working directory
//! 4. a file given explicitly, e.g. with `--config`
//!
//! Tables are merged key by key; scalars and arrays replace what was there.
//!
//! ```toml
//! [simulation]
//! root = "/data/simulations"
//! max_concurrent = 8
//! timeout_secs = 600
//!
//! [remote]
//! host = "cluster.example.org"
//! user = "alice"
//! simulation_path = "scratch/simulations"
//!
//! [remote.batch]
//! submit_command = "qsub -q short"
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use crate::backend::batch::{BatchCommands, RemoteBatchBackend};
use crate::backend::local::LocalBackend;
use crate::backend::remote::RemoteInteractiveBackend;
use crate::backend::session::RemoteSession;
use crate::backend::transport::{SshSettings, SshTransport};
use crate::backend::BackendSet;
use crate::controller::JobController;
use crate::error::{Result, SimconError};
use crate::store::ResultStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Name of the configuration file in every layer.
pub const CONFIG_FILE_NAME: &str = "simcon.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local simulation settings
    pub simulation: SimulationConfig,

    /// Remote host, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Local simulation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Root of the result store
    pub root: PathBuf,

    /// Maximum number of jobs running at once
    pub max_concurrent: usize,

    /// Per-job timeout in seconds
    pub timeout_secs: u64,

    /// Sleep between controller cycles in milliseconds
    pub poll_interval_ms: u64,

    /// Parallel cache lookups
    pub cache_workers: usize,

    /// Exit codes treated as process-level success
    pub accepted_exit_codes: Vec<i32>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("simulations"),
            max_concurrent: num_cpus::get(),
            timeout_secs: 30,
            poll_interval_ms: 100,
            cache_workers: num_cpus::get(),
            accepted_exit_codes: vec![0],
        }
    }
}

/// Remote host configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Host name or address
    pub host: String,

    /// Login user (optional)
    pub user: Option<String>,

    /// SSH port (optional)
    pub port: Option<u16>,

    /// Private key file (optional)
    pub identity_file: Option<PathBuf>,

    /// Simulation root on the remote host
    pub simulation_path: String,

    /// Upper bound for each remote command in seconds
    pub command_timeout_secs: u64,

    /// Query remote jobs only every n-th controller cycle
    pub poll_every: u32,

    /// OpenSSH control socket (optional)
    pub control_path: Option<PathBuf>,

    /// Batch scheduler, if jobs may be queued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchConfig>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: None,
            port: None,
            identity_file: None,
            simulation_path: "simulations".to_string(),
            command_timeout_secs: 60,
            poll_every: 5,
            control_path: None,
            batch: None,
        }
    }
}

impl RemoteConfig {
    /// Builds the ssh settings for this host.
    #[must_use]
    pub fn ssh_settings(&self) -> SshSettings {
        let mut settings = SshSettings::new(self.host.clone());
        settings.user.clone_from(&self.user);
        settings.port = self.port;
        settings.identity_file.clone_from(&self.identity_file);
        if let Some(path) = &self.control_path {
            settings.control_path.clone_from(path);
        }
        settings.command_timeout = Duration::from_secs(self.command_timeout_secs);
        settings
    }
}

/// Batch scheduler commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Submit command, called with the job script
    pub submit_command: String,

    /// Status command, called with the job id
    pub status_command: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        let commands = BatchCommands::default();
        Self {
            submit_command: commands.submit,
            status_command: commands.status,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Loads the layered configuration.
    ///
    /// Missing user and working-directory files are skipped; a missing
    /// `explicit` file is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or parsed, or the merged
    /// configuration is invalid.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut layers: Vec<PathBuf> = Vec::new();
        if let Some(user) = user_config_path() {
            if user.is_file() {
                layers.push(user);
            }
        }
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            layers.push(local);
        }
        if let Some(path) = explicit {
            layers.push(path.to_path_buf());
        }
        Self::from_layers(&layers)
    }

    /// Merges the given files over the defaults, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or parsed, or the merged
    /// configuration is invalid.
    pub fn from_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Value::try_from(Self::default())
            .map_err(|e| SimconError::Config(format!("failed to encode defaults: {e}")))?;

        for path in paths {
            debug!("Loading configuration layer {}", path.display());
            merge(&mut merged, read_toml(path)?);
        }

        let config: Self = merged
            .try_into()
            .map_err(|e| SimconError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a single configuration file over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_layers(&[path.to_path_buf()])
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        let sim = &self.simulation;
        if sim.max_concurrent == 0 {
            return Err(SimconError::Config(
                "max_concurrent must be greater than 0".to_string(),
            ));
        }
        if sim.cache_workers == 0 {
            return Err(SimconError::Config(
                "cache_workers must be greater than 0".to_string(),
            ));
        }
        if sim.timeout_secs == 0 {
            return Err(SimconError::Config(
                "timeout_secs must be greater than 0".to_string(),
            ));
        }
        if sim.poll_interval_ms == 0 {
            return Err(SimconError::Config(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if sim.accepted_exit_codes.is_empty() {
            return Err(SimconError::Config(
                "accepted_exit_codes must not be empty".to_string(),
            ));
        }

        if let Some(remote) = &self.remote {
            if remote.host.trim().is_empty() {
                let what = if remote.batch.is_some() {
                    "[remote.batch]"
                } else {
                    "[remote]"
                };
                return Err(SimconError::Config(format!("{what} requires remote.host")));
            }
            if remote.command_timeout_secs == 0 {
                return Err(SimconError::Config(
                    "command_timeout_secs must be greater than 0".to_string(),
                ));
            }
            if remote.poll_every == 0 {
                return Err(SimconError::Config(
                    "poll_every must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Get the per-job timeout as Duration
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.simulation.timeout_secs)
    }

    /// Get the controller cycle interval as Duration
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.simulation.poll_interval_ms)
    }

    /// Builds the backends this configuration enables.
    ///
    /// The local backend is always present. The remote backends share one
    /// session, which only connects once a remote job is dispatched.
    #[must_use]
    pub fn backends(&self) -> BackendSet {
        let codes = self.simulation.accepted_exit_codes.clone();
        let mut backends = BackendSet::new();
        backends.insert(Arc::new(LocalBackend::with_accepted_exit_codes(
            codes.clone(),
        )));

        if let Some(remote) = &self.remote {
            let transport = Arc::new(SshTransport::new(remote.ssh_settings()));
            let session = Arc::new(RemoteSession::new(
                transport,
                remote.simulation_path.clone(),
            ));
            backends.insert(Arc::new(
                RemoteInteractiveBackend::new(Arc::clone(&session))
                    .with_accepted_exit_codes(codes)
                    .with_poll_every(remote.poll_every),
            ));
            if let Some(batch) = &remote.batch {
                backends.insert(Arc::new(
                    RemoteBatchBackend::new(session)
                        .with_commands(BatchCommands {
                            submit: batch.submit_command.clone(),
                            status: batch.status_command.clone(),
                        })
                        .with_poll_every(remote.poll_every),
                ));
            }
        }
        backends
    }

    /// Builds a controller with this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the simulation root cannot be created.
    pub fn controller(&self) -> Result<JobController> {
        JobController::builder()
            .store(ResultStore::new(self.simulation.root.clone())?)
            .backends(self.backends())
            .max_concurrent(self.simulation.max_concurrent)
            .cache_workers(self.simulation.cache_workers)
            .timeout(self.timeout())
            .poll_interval(self.poll_interval())
            .build()
    }

    /// Renders the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| SimconError::Serialization(e.to_string()))
    }
}

/// Returns the user configuration file path.
#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("simcon").join(CONFIG_FILE_NAME))
}

fn read_toml(path: &Path) -> Result<toml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SimconError::Config(format!("failed to read config file {}: {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        SimconError::Config(format!(
            "failed to parse TOML config file {}: {e}",
            path.display()
        ))
    })
}

/// Merges `overlay` into `base`: tables recursively, everything else replaced.
fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
