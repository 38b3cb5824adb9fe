//! Daemon configuration.
//!
//! Defaults cover the reference behaviour (2s budget, one worker). A JSON
//! document can be supplied via `--config <file>` or inline through the
//! `KIDSLEARN_SANDBOX_CONFIG` environment variable; a few individual
//! environment variables override single fields on top of that.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

/// Environment variable holding an inline JSON configuration document.
pub const CONFIG_ENV_VAR: &str = "KIDSLEARN_SANDBOX_CONFIG";

/// Top-level configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Wall-clock budget for a single execution, in milliseconds.
    #[serde(default = "default_time_budget_ms")]
    pub time_budget_ms: u64,

    /// Number of worker processes kept in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// What to do when every worker is busy.
    #[serde(default)]
    pub busy_policy: BusyPolicy,

    /// How long a queued request may wait for a free worker, in milliseconds.
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// How long to wait for a freshly spawned worker's Ready message.
    #[serde(default = "default_worker_ready_timeout_ms")]
    pub worker_ready_timeout_ms: u64,

    /// Cap on captured stdout+stderr per execution.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Retire a worker after this many executions (0 disables recycling).
    #[serde(default = "default_max_executions_per_worker")]
    pub max_executions_per_worker: u64,

    /// Interval between health sweeps over idle workers (0 disables the sweeper).
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// How worker processes are launched.
    #[serde(default)]
    pub isolation: IsolationConfig,
}

/// Policy applied when a request arrives and no worker is free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait in arrival order, up to `queue_timeout_ms`.
    #[default]
    Queue,
    /// Fail immediately with a busy error. The background health sweeper
    /// is not run under this policy, since a sweep briefly occupies every
    /// worker.
    Reject,
}

/// Worker launch configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IsolationConfig {
    /// Which backend wraps the worker process.
    #[serde(default)]
    pub backend: BackendType,

    /// Explicit path to the worker binary. Resolved next to the daemon
    /// executable when absent.
    #[serde(default)]
    pub worker_path: Option<PathBuf>,

    /// bubblewrap executable used by the jail backend.
    #[serde(default = "default_bwrap_path")]
    pub bwrap_path: PathBuf,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            worker_path: None,
            bwrap_path: default_bwrap_path(),
        }
    }
}

/// Available isolation backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Plain child process with a cleared environment.
    #[default]
    Process,
    /// Child process inside a bubblewrap jail (no network, private /tmp).
    Jail,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            time_budget_ms: default_time_budget_ms(),
            pool_size: default_pool_size(),
            busy_policy: BusyPolicy::default(),
            queue_timeout_ms: default_queue_timeout_ms(),
            worker_ready_timeout_ms: default_worker_ready_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
            max_executions_per_worker: default_max_executions_per_worker(),
            health_check_interval_secs: default_health_check_interval_secs(),
            isolation: IsolationConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the optional file or inline JSON,
    /// then single-field environment overrides.
    ///
    /// Priority: env overrides > `--config` file > `KIDSLEARN_SANDBOX_CONFIG` > defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var(CONFIG_ENV_VAR) {
                Ok(json) => Self::from_json(&json)
                    .with_context(|| format!("Failed to parse {CONFIG_ENV_VAR}"))?,
                Err(_) => {
                    debug!("No configuration supplied, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_env_overrides();
        config.validate()?;

        info!(
            time_budget_ms = config.time_budget_ms,
            pool_size = config.pool_size,
            busy_policy = ?config.busy_policy,
            backend = ?config.isolation.backend,
            "Loaded configuration"
        );

        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid configuration JSON")?;
        Ok(config)
    }

    /// Apply `SANDBOX_TIME_BUDGET_MS`, `SANDBOX_POOL_SIZE` and
    /// `SANDBOX_WORKER_PATH`. Unparseable values are ignored.
    fn apply_env_overrides(&mut self) {
        if let Some(ms) = std::env::var("SANDBOX_TIME_BUDGET_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.time_budget_ms = ms;
        }
        if let Some(size) = std::env::var("SANDBOX_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.pool_size = size;
        }
        if let Ok(path) = std::env::var("SANDBOX_WORKER_PATH") {
            self.isolation.worker_path = Some(PathBuf::from(path));
        }
    }

    /// Reject values that would make the pool unusable.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.pool_size > 0, "pool_size must be at least 1");
        anyhow::ensure!(self.time_budget_ms > 0, "time_budget_ms must be positive");
        anyhow::ensure!(
            self.worker_ready_timeout_ms > 0,
            "worker_ready_timeout_ms must be positive"
        );
        anyhow::ensure!(self.max_output_bytes > 0, "max_output_bytes must be positive");
        Ok(())
    }

    pub const fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }

    pub const fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub const fn worker_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_ready_timeout_ms)
    }

    /// `None` when the health sweeper is disabled.
    pub const fn health_check_interval(&self) -> Option<Duration> {
        if self.health_check_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.health_check_interval_secs))
        }
    }
}

const fn default_time_budget_ms() -> u64 {
    2_000
}

const fn default_pool_size() -> usize {
    1
}

const fn default_queue_timeout_ms() -> u64 {
    10_000
}

const fn default_worker_ready_timeout_ms() -> u64 {
    5_000
}

const fn default_max_output_bytes() -> usize {
    64 * 1024
}

const fn default_max_executions_per_worker() -> u64 {
    200
}

const fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_bwrap_path() -> PathBuf {
    "bwrap".into()
}
