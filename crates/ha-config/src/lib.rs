//! Configuration loading for the device registry service
//!
//! Reads `configuration.yaml` from the config directory and extracts the
//! sections this service understands:
//!
//! - `logger:` - default tracing filter
//! - `device_registry:` - debounce window, orphan retention, event buffering
//!
//! Values may use `!env_var NAME [default]`.
//!
//! # Example
//!
//! ```ignore
//! use ha_config::load_config;
//!
//! let config = load_config("/config")?;
//! let delay = config.device_registry.save_delay();
//! ```

mod error;
mod loader;
mod registry_config;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, YamlLoader};
pub use registry_config::{
    load_config, Config, DeviceRegistryConfig, LoggerConfig, CONFIG_FILE,
    DEFAULT_EVENT_CHANNEL_CAPACITY, DEFAULT_ORPHANED_DEVICE_KEEP_DAYS, DEFAULT_SAVE_DELAY_SECS,
};
