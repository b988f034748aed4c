//! Configuration loading and management.
//!
//! Loads orchestrator configuration from `./armitage.toml` (or
//! `$ARMITAGE_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level orchestrator configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker pool sizing and budget (`[pool]`).
    pub pool: PoolConfig,
    /// Claim lease and heartbeat cadence (`[claims]`).
    pub claims: ClaimConfig,
    /// Circuit breaker thresholds (`[circuits]`).
    pub circuits: CircuitsConfig,
    /// Stage execution limits (`[stages]`).
    pub stages: StagesConfig,
    /// LLM collaborator selection (`[llm]`).
    pub llm: LlmConfig,
    /// Filesystem locations (`[paths]`).
    pub paths: PathsConfig,
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$ARMITAGE_CONFIG_PATH` or `./armitage.toml`.
    /// A missing file falls back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: Config =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("ARMITAGE_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("armitage.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(n) = env("ARMITAGE_MAX_WORKERS").and_then(|v| v.parse().ok()) {
            self.pool.max_workers = n;
        }
        if let Some(n) = env("ARMITAGE_MAX_INVOCATIONS").and_then(|v| v.parse().ok()) {
            self.pool.max_invocations_per_session = n;
        }
        if let Some(p) = env("ARMITAGE_DB_PATH") {
            self.paths.db_path = Some(PathBuf::from(p));
        }
        if let Some(p) = env("ARMITAGE_LLM_PROVIDER") {
            self.llm.provider = p;
        }
    }

    /// Resolved database path: explicit `paths.db_path` or
    /// `{state_dir}/state.db`.
    pub fn db_path(&self) -> PathBuf {
        match &self.paths.db_path {
            Some(p) => p.clone(),
            None => self.paths.state_dir.join("state.db"),
        }
    }

    /// Resolved log directory: `{state_dir}/logs`.
    pub fn logs_dir(&self) -> PathBuf {
        self.paths.state_dir.join("logs")
    }
}

/// Worker pool configuration (`[pool]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of concurrent workers.
    pub max_workers: u32,
    /// Invocation budget for one run.
    pub max_invocations_per_session: u32,
    /// Percentage of budget at which a warning is logged (0–100).
    pub budget_warning_threshold_pct: u8,
    /// Minutes without a heartbeat before a worker is considered stale.
    pub stale_worker_threshold_minutes: u64,
    /// Seconds in-flight stages are given during graceful shutdown.
    pub shutdown_grace_seconds: u64,
    /// Seconds an idle worker sleeps between claim attempts.
    pub poll_interval_seconds: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            max_invocations_per_session: 100,
            budget_warning_threshold_pct: 80,
            stale_worker_threshold_minutes: 10,
            shutdown_grace_seconds: 30,
            poll_interval_seconds: 1,
        }
    }
}

/// Claim lease configuration (`[claims]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    /// Seconds before a claim lease expires.
    pub claim_timeout_seconds: u64,
    /// Seconds between worker heartbeats.
    pub heartbeat_interval_seconds: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            claim_timeout_seconds: 300,
            heartbeat_interval_seconds: 30,
        }
    }
}

/// Per-level circuit breaker thresholds (`[circuits]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitsConfig {
    /// Consecutive failures tripping a stage breaker.
    pub stage_failure_threshold: u32,
    /// Seconds a tripped stage breaker stays open before probing.
    pub stage_cooldown_seconds: u64,
    /// Half-open successes needed to close a stage breaker.
    pub stage_recovery_successes: u32,
    /// Consecutive failures tripping a worker breaker.
    pub worker_failure_threshold: u32,
    /// Seconds a tripped worker breaker stays open before probing.
    pub worker_cooldown_seconds: u64,
    /// Half-open successes needed to close a worker breaker.
    pub worker_recovery_successes: u32,
    /// Failure-rate percentage tripping the system breaker.
    pub system_failure_rate_percent: u8,
    /// Sliding-window size (attempts) for the system failure rate.
    pub system_failure_window: u32,
    /// Minimum attempts in the window before the rate is evaluated.
    pub system_min_samples: u32,
    /// Seconds the system breaker stays open before probing.
    pub system_cooldown_seconds: u64,
    /// Half-open successes needed to close the system breaker.
    pub system_recovery_successes: u32,
    /// Half-open → open cycles allowed before manual reset is required.
    pub max_extensions: u32,
    /// State changes within the flap window that signal flapping.
    pub flap_threshold: u32,
    /// Seconds of history scanned for flapping detection.
    pub flap_window_seconds: u64,
}

impl Default for CircuitsConfig {
    fn default() -> Self {
        Self {
            stage_failure_threshold: 5,
            stage_cooldown_seconds: 60,
            stage_recovery_successes: 1,
            worker_failure_threshold: 5,
            worker_cooldown_seconds: 120,
            worker_recovery_successes: 1,
            system_failure_rate_percent: 20,
            system_failure_window: 30,
            system_min_samples: 10,
            system_cooldown_seconds: 300,
            system_recovery_successes: 3,
            max_extensions: 3,
            flap_threshold: 5,
            flap_window_seconds: 300,
        }
    }
}

/// Stage execution limits (`[stages]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    /// Attempts allowed per stage before the task is given up.
    pub max_stage_attempts: u32,
    /// FIX → RE_VERIFY rounds allowed after a failed VERIFY.
    pub max_fix_rounds: u32,
    /// Seconds an LLM invocation may run.
    pub llm_timeout_seconds: u64,
    /// Seconds the verify subprocess may run.
    pub verify_timeout_seconds: u64,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            max_stage_attempts: 3,
            max_fix_rounds: 2,
            llm_timeout_seconds: 300,
            verify_timeout_seconds: 120,
        }
    }
}

/// LLM collaborator configuration (`[llm]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name: `"noop"` (dry runs) or `"anthropic"`.
    pub provider: String,
    /// Model identifier passed to the provider.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "noop".to_owned(),
            model: "claude-sonnet-4-5".to_owned(),
            api_key_env: "ANTHROPIC_API_KEY".to_owned(),
        }
    }
}

/// Filesystem locations (`[paths]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the state database and logs.
    pub state_dir: PathBuf,
    /// Explicit database path override.
    pub db_path: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".armitage"),
            db_path: None,
        }
    }
}
