//! Service configuration
//!
//! Layered with figment: built-in defaults, then the configuration file
//! (format chosen by extension), then `LINKSRV_`-prefixed environment
//! variables with `__` as the nesting separator:
//!
//! ```text
//! LINKSRV_POLLING__INTERVAL_MS=1000
//! LINKSRV_CONNECTOR__CONNECT_MODE=concurrent
//! LINKSRV_SERVICE__PRINCIPAL=plant-a
//! ```

use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::block::ReadBlock;
use crate::connector::ConnectorOptions;
use crate::error::{LinkError, Result};
use crate::polling::PollingConfig;
use crate::protocols::sim::MAX_JITTER;
use crate::protocols::SimulationSettings;
use crate::registry::RegistrySource;
use crate::storage::StorageConfig;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "LINKSRV_";
pub const DEFAULT_CONFIG_PATH: &str = "config/linksrv.yaml";

/// Service identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Principal whose devices are polled
    #[serde(default = "default_principal")]
    pub principal: String,
}

fn default_service_name() -> String {
    "linksrv".to_string()
}

fn default_principal() -> String {
    "default".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            principal: default_principal(),
        }
    }
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Directory for the daily rolling log file
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: None,
            json: false,
        }
    }
}

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub registry: RegistrySource,
    #[serde(default)]
    pub connector: ConnectorOptions,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Blocks read on every poll cycle
    #[serde(default)]
    pub blocks: Vec<ReadBlock>,
}

impl AppConfig {
    /// Load from `path` (when given) and the `LINKSRV_` environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, ENV_PREFIX)
    }

    pub fn load_with_env(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(AppConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(LinkError::config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Yaml::file(path)),
            };
        }

        let config: AppConfig = figment
            .merge(Env::prefixed(env_prefix).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.service.principal.trim().is_empty() {
            return Err(LinkError::config("service.principal must not be empty"));
        }
        if self.polling.interval_ms == 0 {
            return Err(LinkError::config("polling.interval_ms must be positive"));
        }
        if self.connector.connect_timeout_ms == 0 || self.connector.read_timeout_ms == 0 {
            return Err(LinkError::config("connector timeouts must be positive"));
        }
        let jitter = self.simulation.jitter;
        if !jitter.is_finite() || jitter.abs() > MAX_JITTER {
            return Err(LinkError::config(format!(
                "simulation.jitter must be a finite value within ±{}, got {}",
                MAX_JITTER, jitter
            )));
        }
        if let Some(block) = self.blocks.iter().find(|b| b.quantity == 0) {
            return Err(LinkError::config(format!(
                "block {} has quantity 0",
                block.key()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::connector::ConnectMode;
    use std::io::Write;

    const SAMPLE: &str = r#"
service:
  principal: plant-a
registry:
  kind: inline
  devices:
    - id: press-01
      protocol: modbus
      address: 10.0.0.1:502
connector:
  read_timeout_ms: 500
polling:
  interval_ms: 2000
storage:
  kind: jsonl
  path: data/telemetry.jsonl
blocks:
  - deviceId: press-01
    address: 0
    type: holding
"#;

    fn sample_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::load_with_env(None, "LINKSRV_TEST_NONE_").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.polling.interval_ms, 5000);
        assert_eq!(config.connector.connect_mode, ConnectMode::Sequential);
    }

    #[test]
    fn test_yaml_file() {
        let file = sample_file();
        let config = AppConfig::load_with_env(Some(file.path()), "LINKSRV_TEST_YAML_").unwrap();

        assert_eq!(config.service.principal, "plant-a");
        assert_eq!(config.service.name, "linksrv");
        assert_eq!(config.connector.read_timeout_ms, 500);
        assert_eq!(config.connector.connect_timeout_ms, 5000);
        assert_eq!(config.polling.interval_ms, 2000);
        assert_eq!(config.blocks.len(), 1);
        assert!(matches!(
            config.registry,
            RegistrySource::Inline { ref devices } if devices.len() == 1
        ));
        assert!(matches!(config.storage, StorageConfig::Jsonl { .. }));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = sample_file();
        std::env::set_var("LINKSRV_TEST_ENV_POLLING__INTERVAL_MS", "750");
        std::env::set_var("LINKSRV_TEST_ENV_CONNECTOR__CONNECT_MODE", "concurrent");

        let config = AppConfig::load_with_env(Some(file.path()), "LINKSRV_TEST_ENV_").unwrap();
        assert_eq!(config.polling.interval_ms, 750);
        assert_eq!(config.connector.connect_mode, ConnectMode::Concurrent);
        assert_eq!(config.service.principal, "plant-a");
    }

    #[test]
    fn test_missing_file_and_invalid_values() {
        assert!(matches!(
            AppConfig::load_with_env(Some(Path::new("/nonexistent/linksrv.yaml")), "X_"),
            Err(LinkError::ConfigError(_))
        ));

        let mut config = AppConfig::default();
        config.polling.interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unusable_jitter() {
        for raw in [".inf", "-.inf", ".nan", "1000.0"] {
            let config: AppConfig =
                serde_yaml::from_str(&format!("simulation:\n  jitter: {}\n", raw)).unwrap();
            assert!(
                matches!(config.validate(), Err(LinkError::ConfigError(ref m)) if m.contains("jitter")),
                "jitter {} accepted",
                raw
            );
        }

        let config: AppConfig = serde_yaml::from_str("simulation:\n  jitter: 2.5\n").unwrap();
        assert!(config.validate().is_ok());
    }
}
