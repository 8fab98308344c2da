//! Home Assistant Device Registry
//!
//! This crate provides the persistent device registry:
//! - Device model (`DeviceEntry`, `DeviceInfo`, identity pairs)
//! - `DeviceRegistry` with identity lookup, create, update and removal
//! - `Registries`, the application context that loads the registry once
//!
//! The registry is persisted as JSON in the `.storage/` directory with
//! versioning, through a debounced `Store`.

pub mod storage;
pub mod store;

pub mod device_entry;
pub mod device_registry;
pub mod events;

// Re-export main types
pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};
pub use store::Store;

pub use device_entry::{
    format_mac, normalize_connections, DeletedDeviceEntry, DeviceConnection, DeviceEntry,
    DeviceEntryDisabler, DeviceEntryType, DeviceIdentifier, DeviceInfo, CONNECTION_BLUETOOTH,
    CONNECTION_NETWORK_MAC, CONNECTION_UPNP, CONNECTION_ZIGBEE,
};

pub use device_registry::{
    validate_configuration_url, DeviceRegistry, DeviceRegistryData, DeviceRegistryError,
    DeviceRegistryResult, DeviceUpdate, RegistryState, STORAGE_KEY, STORAGE_MINOR_VERSION,
    STORAGE_VERSION,
};

pub use events::{DeviceRegistryEvent, EVENT_DEVICE_REGISTRY_UPDATED};

use std::path::Path;
use std::sync::Arc;

use ha_config::{Config, DeviceRegistryConfig};
use tokio::sync::OnceCell;
use tracing::info;

/// Registries bound to one application instance
///
/// Collaborators receive a `&Registries` instead of reaching for a global.
/// The device registry is built and loaded on first use.
pub struct Registries {
    storage: Arc<Storage>,
    config: DeviceRegistryConfig,
    device_registry: OnceCell<Arc<DeviceRegistry>>,
}

impl Registries {
    /// Create registries with the given config directory
    pub fn new(config_dir: impl AsRef<Path>, config: DeviceRegistryConfig) -> Self {
        Self {
            storage: Arc::new(Storage::new(config_dir)),
            config,
            device_registry: OnceCell::new(),
        }
    }

    /// Create registries from loaded configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.config_dir, config.device_registry.clone())
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// The device registry, loading it on first call
    ///
    /// Concurrent first callers share one load. If loading fails nothing
    /// is cached and the next call tries again.
    pub async fn device_registry(&self) -> StorageResult<Arc<DeviceRegistry>> {
        self.device_registry
            .get_or_try_init(|| async {
                let registry =
                    DeviceRegistry::new(Arc::clone(&self.storage), self.config.clone());
                registry.load().await?;
                info!("Device registry ready with {} devices", registry.len());
                Ok::<_, StorageError>(Arc::new(registry))
            })
            .await
            .map(Arc::clone)
    }

    /// The device registry if it has been loaded
    pub fn loaded_device_registry(&self) -> Option<Arc<DeviceRegistry>> {
        self.device_registry.get().cloned()
    }

    /// Write pending changes before exit
    pub async fn shutdown(&self) -> StorageResult<()> {
        if let Some(registry) = self.device_registry.get() {
            if registry.flush().await? {
                info!("Flushed pending device registry changes");
            }
        }
        Ok(())
    }
}

/// Get the device registry of an application instance
pub async fn get_registry(registries: &Registries) -> StorageResult<Arc<DeviceRegistry>> {
    registries.device_registry().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn registries(dir: &TempDir) -> Registries {
        Registries::new(
            dir.path(),
            DeviceRegistryConfig::default().with_save_delay(Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn test_registry_is_loaded_once() {
        let temp_dir = TempDir::new().unwrap();
        let registries = registries(&temp_dir);
        assert!(registries.loaded_device_registry().is_none());

        let (a, b, c) = tokio::join!(
            get_registry(&registries),
            get_registry(&registries),
            registries.device_registry(),
        );
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(a.state(), RegistryState::Ready);
        assert!(Arc::ptr_eq(&a, &registries.loaded_device_registry().unwrap()));
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let temp_dir = TempDir::new().unwrap();
        let registries = registries(&temp_dir);
        let storage = registries.storage();
        storage.ensure_dir().await.unwrap();
        std::fs::write(storage.file_path(STORAGE_KEY), "not json").unwrap();

        assert!(get_registry(&registries).await.is_err());
        assert!(registries.loaded_device_registry().is_none());

        std::fs::remove_file(storage.file_path(STORAGE_KEY)).unwrap();
        let registry = get_registry(&registries).await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_changes() {
        let temp_dir = TempDir::new().unwrap();
        let registries = Registries::new(
            temp_dir.path(),
            DeviceRegistryConfig::default().with_save_delay(Duration::from_secs(3600)),
        );

        let registry = get_registry(&registries).await.unwrap();
        registry
            .get_or_create(DeviceInfo::new("Hue", "Bridge").with_identifier("hue", "bridge1"))
            .unwrap();
        assert!(registry.has_pending_save());

        registries.shutdown().await.unwrap();
        assert!(!registry.has_pending_save());

        let reloaded = Registries::new(temp_dir.path(), DeviceRegistryConfig::default());
        let registry = get_registry(&reloaded).await.unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_registry() {
        let temp_dir = TempDir::new().unwrap();
        registries(&temp_dir).shutdown().await.unwrap();
        assert!(!temp_dir.path().join(".storage").exists());
    }
}
