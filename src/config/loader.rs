//! Configuration Loader
//!
//! Environment-aware configuration loading. Handles file discovery, environment
//! detection, and layered merging through the `config` crate.
//!
//! Layers, lowest precedence first:
//!
//! 1. [`OrchestratorConfig::default`]
//! 2. `<config_dir>/orchestrator.toml` (optional)
//! 3. `<config_dir>/orchestrator.<environment>.toml` (optional)
//! 4. `REVIEW_ORCHESTRATOR__<SECTION>__<FIELD>` environment variables

use super::error::{ConfigResult, ConfigurationError};
use super::OrchestratorConfig;
use config::{Config, Environment, File, Map};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "REVIEW_ORCHESTRATOR";
const ENV_SEPARATOR: &str = "__";
const BASE_FILE_NAME: &str = "orchestrator";

/// Loaded configuration together with where it came from
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: OrchestratorConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    /// This is useful for testing without modifying global environment variables
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_overrides(config_dir, environment, None)
    }

    /// Load configuration using `env_overrides` in place of the process environment
    ///
    /// Keys use the same `REVIEW_ORCHESTRATOR__SECTION__FIELD` form as real
    /// environment variables. Passing `None` reads the process environment.
    pub fn load_with_overrides(
        config_dir: Option<PathBuf>,
        environment: &str,
        env_overrides: Option<Map<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let config = Self::load_and_merge_config(&config_directory, environment, env_overrides)?;
        config.validate()?;

        info!(
            environment = %environment,
            worker_count = config.worker_pool.worker_count,
            retention_hours = config.monitoring.retention_hours,
            classifier_rules = config.classifier.rules.len(),
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already built configuration, validating it first
    pub fn from_config(config: OrchestratorConfig, environment: &str) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        })
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Detect the current environment from environment variables
    pub fn detect_environment() -> String {
        env::var("REVIEW_ORCHESTRATOR_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("REVIEW_ORCHESTRATOR_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
        env_overrides: Option<Map<String, String>>,
    ) -> ConfigResult<OrchestratorConfig> {
        let defaults = Config::try_from(&OrchestratorConfig::default())
            .map_err(|e| ConfigurationError::load_error("built-in defaults", e))?;

        let base_file = config_directory.join(format!("{BASE_FILE_NAME}.toml"));
        let env_file = config_directory.join(format!("{BASE_FILE_NAME}.{environment}.toml"));
        debug!(
            base_file = %base_file.display(),
            base_present = base_file.is_file(),
            env_file = %env_file.display(),
            env_present = env_file.is_file(),
            "Resolved configuration files"
        );

        let environment_source = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(env_overrides);

        let merged = Config::builder()
            .add_source(defaults)
            .add_source(File::from(base_file.as_path()).required(false))
            .add_source(File::from(env_file.as_path()).required(false))
            .add_source(environment_source)
            .build()?;

        merged
            .try_deserialize::<OrchestratorConfig>()
            .map_err(|e| ConfigurationError::load_error(config_directory.display().to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn no_env() -> Option<Map<String, String>> {
        Some(Map::new())
    }

    #[test]
    fn test_missing_directory_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let manager =
            ConfigManager::load_with_overrides(Some(dir.path().join("absent")), "test", no_env())
                .unwrap();
        assert_eq!(manager.config(), &OrchestratorConfig::default());
        assert_eq!(manager.environment(), "test");
    }

    #[test]
    fn test_environment_file_overrides_base_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("orchestrator.toml"),
            "[worker_pool]\nworker_count = 3\nidle_poll_interval_ms = 50\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("orchestrator.production.toml"),
            "[worker_pool]\nworker_count = 12\n",
        )
        .unwrap();

        let manager = ConfigManager::load_with_overrides(
            Some(dir.path().to_path_buf()),
            "production",
            no_env(),
        )
        .unwrap();
        assert_eq!(manager.config().worker_pool.worker_count, 12);
        assert_eq!(manager.config().worker_pool.idle_poll_interval_ms, 50);
    }

    #[test]
    fn test_env_overrides_win() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("orchestrator.toml"),
            "[monitoring]\nretention_hours = 48\n",
        )
        .unwrap();
        let mut vars = Map::new();
        vars.insert(
            "REVIEW_ORCHESTRATOR__MONITORING__RETENTION_HOURS".to_string(),
            "6".to_string(),
        );

        let manager =
            ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", Some(vars))
                .unwrap();
        assert_eq!(manager.config().monitoring.retention_hours, 6);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("orchestrator.toml"),
            "[worker_pool]\nworker_count = 0\n",
        )
        .unwrap();
        let err =
            ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", no_env())
                .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }

    #[test]
    fn test_classifier_rules_from_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("orchestrator.toml"),
            "[classifier.rules.connection]\naction = \"retry\"\ndelay_ms = 2000\nmax_attempts = 5\nbackoff_multiplier = 2.0\n",
        )
        .unwrap();
        let manager =
            ConfigManager::load_with_overrides(Some(dir.path().to_path_buf()), "test", no_env())
                .unwrap();
        let rule = &manager.config().classifier.rules["connection"];
        assert_eq!(rule.max_attempts, Some(5));
        assert_eq!(rule.delay, Some(std::time::Duration::from_secs(2)));
    }
}
