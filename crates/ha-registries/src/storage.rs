//! Storage abstraction for JSON persistence
//!
//! Implements the Home Assistant `.storage/` directory pattern with versioning.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch for {key}: expected {expected}, found {found}")]
    VersionMismatch {
        key: String,
        expected: u32,
        found: u32,
    },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage file wrapper with version tracking
///
/// JSON format:
/// ```json
/// {
///   "version": 1,
///   "minor_version": 2,
///   "key": "core.device_registry",
///   "data": { ... }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageFile<T> {
    /// Major version - breaking changes
    pub version: u32,
    /// Minor version - additive changes within a major version
    #[serde(default = "default_minor_version")]
    pub minor_version: u32,
    /// Storage key (file identifier)
    pub key: String,
    /// The actual data
    pub data: T,
}

fn default_minor_version() -> u32 {
    1
}

impl<T> StorageFile<T> {
    /// Create a new storage file
    pub fn new(key: impl Into<String>, data: T, version: u32, minor_version: u32) -> Self {
        Self {
            version,
            minor_version,
            key: key.into(),
            data,
        }
    }
}

/// Helper trait for types that can be stored
pub trait Storable: Serialize + DeserializeOwned {
    /// Storage key for this type
    const KEY: &'static str;
    /// Current major version
    const VERSION: u32;
    /// Current minor version
    const MINOR_VERSION: u32;

    /// Wrap the data in a storage file with the current versions
    fn into_storage_file(self) -> StorageFile<Self>
    where
        Self: Sized,
    {
        StorageFile::new(Self::KEY, self, Self::VERSION, Self::MINOR_VERSION)
    }
}

/// Storage manager for handling `.storage/` directory
#[derive(Debug, Clone)]
pub struct Storage {
    /// Path to the `.storage/` directory
    storage_dir: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    ///
    /// # Arguments
    /// * `config_dir` - Path to the Home Assistant config directory
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: config_dir.as_ref().join(".storage"),
        }
    }

    /// Ensure the storage directory exists
    pub async fn ensure_dir(&self) -> StorageResult<()> {
        if !self.storage_dir.exists() {
            fs::create_dir_all(&self.storage_dir).await?;
            debug!("Created storage directory: {:?}", self.storage_dir);
        }
        Ok(())
    }

    /// Get the file path for a storage key
    pub fn file_path(&self, key: &str) -> PathBuf {
        self.storage_dir.join(key)
    }

    /// Check if a storage key exists
    pub fn exists(&self, key: &str) -> bool {
        self.file_path(key).exists()
    }

    /// Load data from storage
    ///
    /// Returns None if the file doesn't exist.
    pub async fn load<T>(&self, key: &str) -> StorageResult<Option<StorageFile<T>>>
    where
        T: DeserializeOwned,
    {
        let path = self.file_path(key);

        if !path.exists() {
            debug!("Storage file not found: {}", key);
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        let storage_file: StorageFile<T> = serde_json::from_str(&content)?;

        debug!(
            "Loaded storage file: {} (v{}.{})",
            key, storage_file.version, storage_file.minor_version
        );

        Ok(Some(storage_file))
    }

    /// Load a `Storable` type, checking its major version
    ///
    /// Older minor versions are accepted: fields added since then are
    /// filled in by serde defaults.
    pub async fn load_storable<T>(&self) -> StorageResult<Option<StorageFile<T>>>
    where
        T: Storable,
    {
        let path = self.file_path(T::KEY);

        if !path.exists() {
            debug!("Storage file not found: {}", T::KEY);
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;

        // Check the version before committing to the data layout
        #[derive(Deserialize)]
        struct VersionInfo {
            version: u32,
            #[serde(default = "default_minor_version")]
            minor_version: u32,
        }

        let version_info: VersionInfo = serde_json::from_str(&content)?;

        if version_info.version != T::VERSION {
            return Err(StorageError::VersionMismatch {
                key: T::KEY.to_string(),
                expected: T::VERSION,
                found: version_info.version,
            });
        }

        if version_info.minor_version < T::MINOR_VERSION {
            warn!(
                "Storage {} has older minor version ({} < {}), missing fields use defaults",
                T::KEY,
                version_info.minor_version,
                T::MINOR_VERSION
            );
        }

        let storage_file: StorageFile<T> = serde_json::from_str(&content)?;
        debug!(
            "Loaded storage file: {} (v{}.{})",
            T::KEY,
            storage_file.version,
            storage_file.minor_version
        );

        Ok(Some(storage_file))
    }

    /// Save data to storage
    ///
    /// Writes atomically by first writing to a temp file, then renaming.
    pub async fn save<T>(&self, storage_file: &StorageFile<T>) -> StorageResult<()>
    where
        T: Serialize,
    {
        self.ensure_dir().await?;

        let path = self.file_path(&storage_file.key);
        let temp_path = self.file_path(&format!("{}.tmp", storage_file.key));

        // Serialize with pretty printing for readability
        let content = serde_json::to_string_pretty(storage_file)?;

        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(
            "Saved storage file: {} (v{}.{})",
            storage_file.key, storage_file.version, storage_file.minor_version
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestData {
        name: String,
        #[serde(default)]
        value: i32,
    }

    impl Storable for TestData {
        const KEY: &'static str = "test.data";
        const VERSION: u32 = 1;
        const MINOR_VERSION: u32 = 2;
    }

    #[tokio::test]
    async fn test_storage_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());

        let data = TestData {
            name: "test".to_string(),
            value: 42,
        };

        storage.save(&data.clone().into_storage_file()).await.unwrap();
        assert!(storage.exists("test.data"));
        assert!(!storage.exists("test.data.tmp"));

        let loaded: StorageFile<TestData> = storage.load("test.data").await.unwrap().unwrap();
        assert_eq!(loaded.data, data);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.minor_version, 2);
    }

    #[tokio::test]
    async fn test_storage_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());

        let result: Option<StorageFile<TestData>> = storage.load("nonexistent").await.unwrap();
        assert!(result.is_none());

        let result = storage.load_storable::<TestData>().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_load_storable_older_minor_version() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        storage.ensure_dir().await.unwrap();

        std::fs::write(
            storage.file_path("test.data"),
            r#"{"version": 1, "minor_version": 1, "key": "test.data", "data": {"name": "old"}}"#,
        )
        .unwrap();

        let loaded = storage.load_storable::<TestData>().await.unwrap().unwrap();
        assert_eq!(loaded.minor_version, 1);
        assert_eq!(
            loaded.data,
            TestData {
                name: "old".to_string(),
                value: 0
            }
        );
    }

    #[tokio::test]
    async fn test_load_storable_major_version_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());

        storage
            .save(&StorageFile::new(
                "test.data",
                TestData {
                    name: "future".to_string(),
                    value: 1,
                },
                2,
                1,
            ))
            .await
            .unwrap();

        let result = storage.load_storable::<TestData>().await;
        assert!(matches!(
            result,
            Err(StorageError::VersionMismatch {
                expected: 1,
                found: 2,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_json_error() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path());
        storage.ensure_dir().await.unwrap();
        std::fs::write(storage.file_path("test.data"), "{not json").unwrap();

        let result = storage.load_storable::<TestData>().await;
        assert!(matches!(result, Err(StorageError::Json(_))));
    }
}
