use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Environment variable prefix; nested keys use `__`, e.g. `KGFLOW_RETRY__MAX_ATTEMPTS`.
pub const ENV_PREFIX: &str = "KGFLOW_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid max_attempts: {0}. Must be at least 1")]
    InvalidMaxAttempts(u32),

    #[error("Invalid fixed_delay_ms: {0}. Must be positive")]
    InvalidFixedDelay(u64),

    #[error("Invalid lease duration_ms: {0}. Must be positive")]
    InvalidLeaseDuration(u64),

    #[error("Invalid lease timing: renew_interval_ms ({0}) must be less than duration_ms ({1})")]
    InvalidRenewInterval(u64, u64),

    #[error("Invalid periodic_interval_ms: {0}. Must be positive")]
    InvalidPeriodicInterval(u64),

    #[error("Invalid max_per_workflow: {0}. Must be at least 1")]
    InvalidMaxPerWorkflow(usize),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .kgflow/config.yaml
    /// 3. .kgflow/local.yaml (optional overrides)
    /// 4. Environment variables (KGFLOW_* prefix)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".kgflow/config.yaml"))
            .merge(Yaml::file(".kgflow/local.yaml"))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file. Environment variables still win.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.trim().is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(config.retry.max_attempts));
        }
        if config.retry.fixed_delay_ms == 0 {
            return Err(ConfigError::InvalidFixedDelay(config.retry.fixed_delay_ms));
        }

        if config.lease.duration_ms == 0 {
            return Err(ConfigError::InvalidLeaseDuration(config.lease.duration_ms));
        }
        if config.lease.renew_interval_ms == 0 || config.lease.renew_interval_ms >= config.lease.duration_ms {
            return Err(ConfigError::InvalidRenewInterval(
                config.lease.renew_interval_ms,
                config.lease.duration_ms,
            ));
        }

        if config.checkpoint.periodic_interval_ms == 0 {
            return Err(ConfigError::InvalidPeriodicInterval(config.checkpoint.periodic_interval_ms));
        }
        if config.checkpoint.max_per_workflow == 0 {
            return Err(ConfigError::InvalidMaxPerWorkflow(config.checkpoint.max_per_workflow));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.database.path, ".kgflow/kgflow.db");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.fixed_delay_ms, 1000);
        assert_eq!(config.lease.duration_ms, 30_000);
        assert_eq!(config.checkpoint.max_per_workflow, 10);
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
database:
  path: /custom/path.db
  max_connections: 2
retry:
  max_attempts: 5
  fixed_delay_ms: 250
lease:
  duration_ms: 10000
  renew_interval_ms: 2500
";
        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.database.path, "/custom/path.db");
        assert_eq!(config.database.max_connections, 2);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.fixed_delay_ms, 250);
        assert_eq!(config.retry.attempt_timeout_ms, 300_000);
        assert_eq!(config.lease.renew_interval_ms, 2500);
        assert_eq!(config.checkpoint.periodic_interval_ms, 60_000);
        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_empty_database_path() {
        let mut config = Config::default();
        config.database.path = String::new();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::EmptyDatabasePath)
        ));
    }

    #[test]
    fn test_validate_zero_max_connections() {
        let mut config = Config::default();
        config.database.max_connections = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxConnections(0))
        ));
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        match ConfigLoader::validate(&config) {
            Err(ConfigError::InvalidLogLevel(level)) => assert_eq!(level, "verbose"),
            other => panic!("Expected InvalidLogLevel error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogFormat(_))
        ));
    }

    #[test]
    fn test_validate_retry_settings() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxAttempts(0))
        ));

        let mut config = Config::default();
        config.retry.fixed_delay_ms = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidFixedDelay(0))
        ));

        // a zero attempt timeout disables the deadline
        let mut config = Config::default();
        config.retry.attempt_timeout_ms = 0;
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_validate_lease_timing() {
        let mut config = Config::default();
        config.lease.duration_ms = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLeaseDuration(0))
        ));

        let mut config = Config::default();
        config.lease.renew_interval_ms = config.lease.duration_ms;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidRenewInterval(30_000, 30_000))
        ));
    }

    #[test]
    fn test_validate_checkpoint_settings() {
        let mut config = Config::default();
        config.checkpoint.periodic_interval_ms = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidPeriodicInterval(0))
        ));

        let mut config = Config::default();
        config.checkpoint.max_per_workflow = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxPerWorkflow(0))
        ));
    }

    #[test]
    fn test_load_from_file_merges_defaults() {
        let file = yaml_file("retry:\n  max_attempts: 7\nlogging:\n  format: pretty\n");
        let config = temp_env::with_vars_unset(
            ["KGFLOW_RETRY__MAX_ATTEMPTS", "KGFLOW_LOGGING__FORMAT"],
            || ConfigLoader::load_from_file(file.path()),
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.retry.fixed_delay_ms, 1000);
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_overrides_file() {
        let file = yaml_file("retry:\n  max_attempts: 7\n");
        let config = temp_env::with_vars(
            [
                ("KGFLOW_RETRY__MAX_ATTEMPTS", Some("4")),
                ("KGFLOW_LOGGING__LEVEL", Some("debug")),
            ],
            || ConfigLoader::load_from_file(file.path()),
        )
        .unwrap();

        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_file_values_rejected() {
        let file = yaml_file("lease:\n  duration_ms: 1000\n  renew_interval_ms: 5000\n");
        let err = ConfigLoader::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("renew_interval_ms"));
    }

    #[test]
    fn test_missing_file_rejected() {
        let err = ConfigLoader::load_from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_hierarchical_merging() {
        let base = yaml_file("database:\n  max_connections: 3\nlogging:\n  level: info\n  format: json\n");
        let local = yaml_file("logging:\n  level: debug\n");

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base.path()))
            .merge(Yaml::file(local.path()))
            .extract()
            .unwrap();

        assert_eq!(config.logging.level, "debug", "Override should win for nested fields");
        assert_eq!(config.logging.format, "json", "Base value should persist when not overridden");
        assert_eq!(config.database.max_connections, 3);
    }
}
