//! Configuration loader with layered sources.

use crate::{BullionConfig, ConfigError, ConfigValidator};
use config::{Config, Environment, File};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Environment variable selecting the environment-specific config file.
pub const ENVIRONMENT_VAR: &str = "BULLION_ENVIRONMENT";

/// Configuration loader with reload support.
#[derive(Clone)]
pub struct ConfigLoader {
    config: Arc<RwLock<BullionConfig>>,
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a new configuration loader.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `BULLION__` prefix, e.g.
    ///    `BULLION__WORKER__CONCURRENCY=4`
    pub fn new(config_dir: impl Into<String>) -> Result<Self, ConfigError> {
        let config_dir = config_dir.into();
        let config = Self::load_config(&config_dir)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_dir,
        })
    }

    /// Loads configuration from the default location (`./config`).
    pub fn from_default_location() -> Result<Self, ConfigError> {
        Self::new("./config")
    }

    /// Returns the current configuration.
    pub async fn get(&self) -> BullionConfig {
        self.config.read().await.clone()
    }

    /// Reloads the configuration from disk. The current configuration is
    /// kept if the new one fails to load or validate.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let new_config = Self::load_config(&self.config_dir)?;
        let mut config = self.config.write().await;
        *config = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    fn load_config(config_dir: &str) -> Result<BullionConfig, ConfigError> {
        // Load .env file if present
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var(ENVIRONMENT_VAR).unwrap_or_else(|_| "development".to_string());

        load_layered(config_dir, &environment)
    }
}

/// Load and validate configuration for `environment` from `config_dir`.
pub fn load_layered(config_dir: &str, environment: &str) -> Result<BullionConfig, ConfigError> {
    info!(config_dir, environment, "Loading configuration");

    let mut builder = Config::builder();

    for layer in ["default", environment, "local"] {
        let path = format!("{}/{}.toml", config_dir, layer);
        if Path::new(&path).exists() {
            debug!("Loading config from: {}", path);
            builder = builder.add_source(File::with_name(&path).required(false));
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("BULLION")
            .separator("__")
            .try_parsing(true),
    );

    let config: BullionConfig = builder.build()?.try_deserialize()?;

    ConfigValidator::validate(&config).map_err(ConfigError::Invalid)?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) {
        fs::write(dir.path().join(name), contents).unwrap();
    }

    fn dir_str(dir: &TempDir) -> &str {
        dir.path().to_str().unwrap()
    }

    #[test]
    fn test_layers_override_in_order() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "default.toml",
            r#"
            [queue]
            name = "emails"

            [worker]
            concurrency = 2
            lock_ttl_ms = 10000
            "#,
        );
        write(&dir, "staging.toml", "[worker]\nconcurrency = 8\n");
        write(&dir, "local.toml", "[redis]\nurl = \"redis://cache:6379\"\n");

        let config = load_layered(dir_str(&dir), "staging").unwrap();
        assert_eq!(config.queue.name, "emails");
        assert_eq!(config.queue.prefix, "bull");
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.lock_ttl_ms, 10_000);
        assert_eq!(config.redis.url, "redis://cache:6379");
    }

    #[test]
    fn test_other_environment_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        write(&dir, "default.toml", "[queue]\nname = \"emails\"\n");
        write(&dir, "production.toml", "[worker]\nconcurrency = 32\n");

        let config = load_layered(dir_str(&dir), "development").unwrap();
        assert_eq!(config.worker.concurrency, 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "default.toml",
            "[queue]\nname = \"a:b\"\n\n[worker]\nconcurrency = 0\n",
        );

        match load_layered(dir_str(&dir), "development") {
            Err(ConfigError::Invalid(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("Expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_file_is_load_error() {
        let dir = TempDir::new().unwrap();
        write(&dir, "default.toml", "[worker]\nconcurrency = \"many\"\n");

        assert!(matches!(
            load_layered(dir_str(&dir), "development"),
            Err(ConfigError::Load(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_picks_up_changes() {
        let dir = TempDir::new().unwrap();
        write(&dir, "default.toml", "[queue]\nname = \"emails\"\n");

        let loader = ConfigLoader::new(dir_str(&dir)).unwrap();
        assert_eq!(loader.get().await.queue.name, "emails");

        write(&dir, "default.toml", "[queue]\nname = \"reports\"\n");
        loader.reload().await.unwrap();
        assert_eq!(loader.get().await.queue.name, "reports");
    }
}
