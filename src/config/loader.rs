//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered in order,
//! later sources overriding earlier ones:
//!
//! 1. `scatter.toml` in the configuration directory
//! 2. `scatter.{environment}.toml` in the same directory
//! 3. `SCATTER__SECTION__FIELD` environment variables
//!
//! Missing files are skipped; the merged result is validated before use.

use super::error::{ConfigResult, ConfigurationError};
use super::ScatterConfig;
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE_STEM: &str = "scatter";
const ENV_PREFIX: &str = "SCATTER";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: ScatterConfig,
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
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_env_source(config_dir, environment, None)
    }

    /// Load configuration with an explicit environment-variable map in place
    /// of the process environment, so tests never touch global state
    pub fn load_with_env_source(
        config_dir: Option<PathBuf>,
        environment: &str,
        env_source: Option<config::Map<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let config = Self::load_and_merge_config(&config_directory, environment, env_source)?;
        config.validate()?;

        info!(
            environment = %environment,
            max_parallel = config.orchestration.max_parallel,
            max_attempts = config.retry.max_attempts,
            breakers_enabled = config.circuit_breakers.enabled,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an already-built configuration, validating it first
    pub fn from_config(config: ScatterConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &ScatterConfig {
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
        env::var("SCATTER_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("SCATTER_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
        env_source: Option<config::Map<String, String>>,
    ) -> ConfigResult<ScatterConfig> {
        let base_path = config_directory.join(format!("{BASE_FILE_STEM}.toml"));
        let env_path = config_directory.join(format!("{BASE_FILE_STEM}.{environment}.toml"));

        let environment_source = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .source(env_source);

        let settings = Config::builder()
            .add_source(File::from(base_path.as_path()).required(false))
            .add_source(File::from(env_path.as_path()).required(false))
            .add_source(environment_source)
            .build()
            .map_err(|e| {
                ConfigurationError::load_error(config_directory.display().to_string(), e)
            })?;

        Ok(settings.try_deserialize::<ScatterConfig>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) {
        fs::write(dir.path().join(name), contents).unwrap();
    }

    #[test]
    fn test_missing_files_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let manager = ConfigManager::load_with_env_source(
            Some(dir.path().to_path_buf()),
            "test",
            Some(config::Map::new()),
        )
        .unwrap();
        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config().retry.max_attempts, 3);
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "scatter.toml",
            "[orchestration]\nmax_parallel = 4\n\n[retry]\nmax_attempts = 5\n",
        );
        write(&dir, "scatter.test.toml", "[orchestration]\nmax_parallel = 2\n");

        let manager = ConfigManager::load_with_env_source(
            Some(dir.path().to_path_buf()),
            "test",
            Some(config::Map::new()),
        )
        .unwrap();
        assert_eq!(manager.config().orchestration.max_parallel, 2);
        assert_eq!(manager.config().retry.max_attempts, 5);
    }

    #[test]
    fn test_env_variables_override_files() {
        let dir = TempDir::new().unwrap();
        write(&dir, "scatter.toml", "[replication]\nk = 5\n");

        let mut env_source = config::Map::new();
        env_source.insert("SCATTER__REPLICATION__K".to_string(), "7".to_string());

        let manager = ConfigManager::load_with_env_source(
            Some(dir.path().to_path_buf()),
            "test",
            Some(env_source),
        )
        .unwrap();
        assert_eq!(manager.config().replication.k, 7);
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = TempDir::new().unwrap();
        write(&dir, "scatter.toml", "[orchestration]\nmax_parallel = 0\n");

        let result = ConfigManager::load_with_env_source(
            Some(dir.path().to_path_buf()),
            "test",
            Some(config::Map::new()),
        );
        assert!(matches!(
            result,
            Err(ConfigurationError::InvalidValue { .. })
        ));
    }
}
