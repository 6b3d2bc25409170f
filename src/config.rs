//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::enforcement::{GuardMode, WatchdogConfig};
use crate::error::ConfigError;
use crate::executor::ExecutorOptions;
use crate::orchestrator::{OrchestratorConfig, RateLimitTier};
use crate::runtime::RuntimeConfig;

/// Prefix for every environment variable read by [`CoreConfig::from_env`].
pub const ENV_PREFIX: &str = "TASKCORE_";

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker threads. Zero disables heavy-work offload.
    pub pool_size: usize,
    /// Budget for a single worker call.
    pub call_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// Everything the engine needs to start.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Directory holding the task snapshot.
    pub snapshot_dir: PathBuf,
    pub watchdog: WatchdogConfig,
    pub worker: WorkerConfig,
    /// Safety settings for the built-in browser tool.
    pub executor: ExecutorOptions,
    pub orchestrator: OrchestratorConfig,
    pub runtime: RuntimeConfig,
    pub guard_mode: GuardMode,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("./data"),
            watchdog: WatchdogConfig::default(),
            worker: WorkerConfig::default(),
            executor: ExecutorOptions::default(),
            orchestrator: OrchestratorConfig::default(),
            runtime: RuntimeConfig::default(),
            guard_mode: GuardMode::default(),
        }
    }
}

impl CoreConfig {
    /// Defaults overlaid with `TASKCORE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    /// `lookup` receives the full variable name, prefix included.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let mut config = Self::default();

        if let Some(dir) = vars.raw("SNAPSHOT_PATH") {
            config.snapshot_dir = PathBuf::from(dir);
        }

        if let Some(secs) = vars.parse::<u64>("WATCHDOG_INTERVAL_SECS")? {
            config.watchdog.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = vars.parse::<u64>("FROZEN_THRESHOLD_SECS")? {
            config.watchdog.frozen_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = vars.parse::<u64>("BACKUP_INTERVAL_SECS")? {
            config.watchdog.backup_interval = Duration::from_secs(secs);
        }

        if let Some(size) = vars.parse("WORKER_POOL_SIZE")? {
            config.worker.pool_size = size;
        }
        if let Some(secs) = vars.parse::<u64>("WORKER_TIMEOUT_SECS")? {
            config.worker.call_timeout = Duration::from_secs(secs);
        }

        if let Some(max) = vars.parse("MAX_CONCURRENT_JOBS")? {
            config.orchestrator.max_concurrent_jobs = max;
        }
        if let Some(max) = vars.parse("RATE_LIMIT_MAX")? {
            config.orchestrator.rate_limit.max_requests = max;
        }
        if let Some(secs) = vars.parse::<u64>("RATE_LIMIT_WINDOW_SECS")? {
            config.orchestrator.rate_limit.window = Duration::from_secs(secs);
        }
        for (key, window) in [("RATE_LIMIT_HOURLY_MAX", 3600), ("RATE_LIMIT_DAILY_MAX", 86_400)] {
            if let Some(max_requests) = vars.parse(key)? {
                config.orchestrator.rate_limit.tiers.push(RateLimitTier {
                    max_requests,
                    window: Duration::from_secs(window),
                });
            }
        }
        if let Some(retries) = vars.parse("MAX_RETRIES")? {
            config.orchestrator.max_retries = retries;
        }

        if let Some(mode) = vars.parse("GUARD_MODE")? {
            config.guard_mode = mode;
        }
        if let Some(require) = vars.parse_bool("REQUIRE_CONSENT")? {
            config.executor.require_consent = require;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("WATCHDOG_INTERVAL_SECS", self.watchdog.interval.is_zero()),
            ("FROZEN_THRESHOLD_SECS", self.watchdog.frozen_threshold.is_zero()),
            ("BACKUP_INTERVAL_SECS", self.watchdog.backup_interval.is_zero()),
            ("MAX_CONCURRENT_JOBS", self.orchestrator.max_concurrent_jobs == 0),
            ("RATE_LIMIT_MAX", self.orchestrator.rate_limit.max_requests == 0),
            ("RATE_LIMIT_WINDOW_SECS", self.orchestrator.rate_limit.window.is_zero()),
            (
                "RATE_LIMIT_TIERS",
                self.orchestrator
                    .rate_limit
                    .tiers
                    .iter()
                    .any(|t| t.max_requests == 0 || t.window.is_zero()),
            ),
        ];
        match positive.into_iter().find(|(_, zero)| *zero) {
            Some((key, _)) => Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{key}"),
                message: "must be greater than zero".to_string(),
            }),
            None => Ok(()),
        }
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{key}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.raw(key)
            .map(|v| {
                v.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}{key}"),
                    message: format!("'{v}': {e}"),
                })
            })
            .transpose()
    }

    fn parse_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.raw(key)
            .map(|v| match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}{key}"),
                    message: format!("'{v}' is not a boolean"),
                }),
            })
            .transpose()
    }
}
