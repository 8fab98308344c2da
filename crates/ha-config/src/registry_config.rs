//! Typed configuration for the device registry service
//!
//! Parses the `logger:` and `device_registry:` sections of
//! `configuration.yaml`. Every other top-level section is ignored.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_yaml;

/// Name of the main configuration file inside the config directory
pub const CONFIG_FILE: &str = "configuration.yaml";

/// Debounce window for registry writes, in seconds
pub const DEFAULT_SAVE_DELAY_SECS: f64 = 10.0;

/// How long a deleted device without config entries is remembered
pub const DEFAULT_ORPHANED_DEVICE_KEEP_DAYS: u32 = 30;

/// Buffered registry events per subscriber
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// `logger:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerConfig {
    /// Default tracing filter directive (e.g. "info", "ha_registries=debug")
    #[serde(default = "default_log_level")]
    pub default: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `device_registry:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistryConfig {
    /// Seconds to wait for further changes before writing the registry
    #[serde(default = "default_save_delay")]
    pub save_delay: f64,

    /// Days a deleted, orphaned device keeps its id for restoration
    #[serde(default = "default_orphaned_device_keep_days")]
    pub orphaned_device_keep_days: u32,

    /// Capacity of the `device_registry_updated` broadcast channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_save_delay() -> f64 {
    DEFAULT_SAVE_DELAY_SECS
}

fn default_orphaned_device_keep_days() -> u32 {
    DEFAULT_ORPHANED_DEVICE_KEEP_DAYS
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

impl Default for DeviceRegistryConfig {
    fn default() -> Self {
        Self {
            save_delay: default_save_delay(),
            orphaned_device_keep_days: default_orphaned_device_keep_days(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl DeviceRegistryConfig {
    /// Debounce window as a `Duration`; out-of-range values clamp to zero
    pub fn save_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.save_delay).unwrap_or(Duration::ZERO)
    }

    /// Builder-style override of the debounce window
    pub fn with_save_delay(mut self, delay: Duration) -> Self {
        self.save_delay = delay.as_secs_f64();
        self
    }

    /// Check value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        if !self.save_delay.is_finite() || self.save_delay < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "device_registry.save_delay".to_string(),
                reason: format!("must be a non-negative number, got {}", self.save_delay),
            });
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "device_registry.event_channel_capacity".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Complete service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `configuration.yaml` and `.storage/`
    pub config_dir: PathBuf,
    pub logger: LoggerConfig,
    pub device_registry: DeviceRegistryConfig,
}

impl Config {
    /// Default configuration rooted at `config_dir`
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            logger: LoggerConfig::default(),
            device_registry: DeviceRegistryConfig::default(),
        }
    }

    /// Load configuration from `<config_dir>/configuration.yaml`
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        let yaml = load_yaml(config_dir, CONFIG_FILE)?;
        Self::from_yaml(config_dir, &yaml)
    }

    /// Build configuration from an already-parsed YAML document
    pub fn from_yaml(config_dir: impl Into<PathBuf>, yaml: &Value) -> ConfigResult<Self> {
        let mut config = Self::new(config_dir);

        let mapping = match yaml {
            Value::Null => return Ok(config),
            Value::Mapping(mapping) => mapping,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "root".to_string(),
                    reason: "configuration must be a mapping".to_string(),
                })
            }
        };

        if let Some(section) = section(mapping, "logger") {
            config.logger = parse_section("logger", section)?;
        }
        if let Some(section) = section(mapping, "device_registry") {
            config.device_registry = parse_section("device_registry", section)?;
        }

        config.device_registry.validate()?;
        Ok(config)
    }
}

fn section<'a>(mapping: &'a serde_yaml::Mapping, key: &str) -> Option<&'a Value> {
    mapping.get(key).filter(|value| !value.is_null())
}

fn parse_section<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> ConfigResult<T> {
    serde_yaml::from_value(value.clone()).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Load configuration from a config directory
pub fn load_config(config_dir: impl AsRef<Path>) -> ConfigResult<Config> {
    Config::load(config_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = load_config(dir.path()).unwrap();

        assert_eq!(config.config_dir, dir.path());
        assert_eq!(config.logger.default, "info");
        assert_eq!(config.device_registry, DeviceRegistryConfig::default());
        assert_eq!(config.device_registry.save_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_sections_are_parsed() {
        let yaml: Value = serde_yaml::from_str(
            r#"
homeassistant:
  name: Home
logger:
  default: debug
device_registry:
  save_delay: 0.5
  orphaned_device_keep_days: 7
"#,
        )
        .unwrap();

        let config = Config::from_yaml("/config", &yaml).unwrap();
        assert_eq!(config.logger.default, "debug");
        assert_eq!(config.device_registry.save_delay(), Duration::from_millis(500));
        assert_eq!(config.device_registry.orphaned_device_keep_days, 7);
        assert_eq!(
            config.device_registry.event_channel_capacity,
            DEFAULT_EVENT_CHANNEL_CAPACITY
        );
    }

    #[test]
    fn test_empty_section_uses_defaults() {
        let yaml: Value = serde_yaml::from_str("device_registry:\n").unwrap();
        let config = Config::from_yaml("/config", &yaml).unwrap();
        assert_eq!(config.device_registry, DeviceRegistryConfig::default());
    }

    #[test]
    fn test_negative_save_delay_rejected() {
        let yaml: Value = serde_yaml::from_str("device_registry:\n  save_delay: -1\n").unwrap();
        let err = Config::from_yaml("/config", &yaml).unwrap_err();
        assert!(err.to_string().contains("device_registry.save_delay"));
    }

    #[test]
    fn test_zero_channel_capacity_rejected() {
        let yaml: Value =
            serde_yaml::from_str("device_registry:\n  event_channel_capacity: 0\n").unwrap();
        assert!(Config::from_yaml("/config", &yaml).is_err());
    }

    #[test]
    fn test_non_mapping_root_rejected() {
        let yaml: Value = serde_yaml::from_str("- a\n- b\n").unwrap();
        assert!(matches!(
            Config::from_yaml("/config", &yaml),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_wrong_type_in_section() {
        let yaml: Value =
            serde_yaml::from_str("device_registry:\n  save_delay: soon\n").unwrap();
        match Config::from_yaml("/config", &yaml) {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "device_registry"),
            other => panic!("expected invalid value, got {:?}", other),
        }
    }
}
