use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::checkpoint::RetentionPolicy;

/// Main configuration structure for kgflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Stage retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Workflow lease timing
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Checkpoint cadence and retention
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".kgflow/kgflow.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    /// sqlx connection URL for the configured path.
    pub fn url(&self) -> String {
        if self.path.starts_with("sqlite:") {
            self.path.clone()
        } else {
            format!("sqlite:{}", self.path)
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
        }
    }
}

/// Fixed-delay retry policy for stage handlers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Total handler invocations per stage, first attempt included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Constant pause between attempts in milliseconds
    #[serde(default = "default_fixed_delay_ms")]
    pub fixed_delay_ms: u64,

    /// Per-attempt deadline in milliseconds; 0 disables it
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_fixed_delay_ms() -> u64 {
    1000
}

const fn default_attempt_timeout_ms() -> u64 {
    300_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            fixed_delay_ms: default_fixed_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

/// Lease timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LeaseConfig {
    /// Lease lifetime in milliseconds
    #[serde(default = "default_lease_duration_ms")]
    pub duration_ms: u64,

    /// How often a running workflow renews its lease, in milliseconds
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,
}

const fn default_lease_duration_ms() -> u64 {
    30_000
}

const fn default_renew_interval_ms() -> u64 {
    10_000
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_lease_duration_ms(),
            renew_interval_ms: default_renew_interval_ms(),
        }
    }
}

/// Checkpoint cadence and retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointConfig {
    /// Interval between periodic checkpoints of a running workflow, in milliseconds
    #[serde(default = "default_periodic_interval_ms")]
    pub periodic_interval_ms: u64,

    /// Checkpoints kept per workflow
    #[serde(default = "default_max_per_workflow")]
    pub max_per_workflow: usize,

    /// Age after which checkpoints may be pruned, in hours; 0 keeps them forever
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,

    /// Run a background prune after every checkpoint write
    #[serde(default = "default_prune_on_save")]
    pub prune_on_save: bool,
}

const fn default_periodic_interval_ms() -> u64 {
    60_000
}

const fn default_max_per_workflow() -> usize {
    10
}

const fn default_max_age_hours() -> u64 {
    24
}

const fn default_prune_on_save() -> bool {
    true
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            periodic_interval_ms: default_periodic_interval_ms(),
            max_per_workflow: default_max_per_workflow(),
            max_age_hours: default_max_age_hours(),
            prune_on_save: default_prune_on_save(),
        }
    }
}

impl CheckpointConfig {
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: (self.max_age_hours > 0)
                .then(|| Duration::from_secs(self.max_age_hours * 60 * 60)),
            max_per_workflow: self.max_per_workflow,
        }
    }
}
