//! Device Registry
//!
//! Tracks all registered devices with identifiers and connections.
//! Devices are kept in registration order; identity indexes map every
//! identifier and connection to the device owning it. Changes are
//! persisted through a debounced [`Store`] and announced on a broadcast
//! channel.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use ha_config::DeviceRegistryConfig;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::device_entry::{
    normalize_connections, DeletedDeviceEntry, DeviceConnection, DeviceEntry,
    DeviceEntryDisabler, DeviceEntryType, DeviceIdentifier, DeviceInfo,
};
use crate::events::DeviceRegistryEvent;
use crate::storage::{Storable, Storage, StorageResult};
use crate::store::Store;

/// Storage key for device registry
pub const STORAGE_KEY: &str = "core.device_registry";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
///
/// Minor version 1 stored only the core descriptive fields, with the
/// connection set under `connection`.
pub const STORAGE_MINOR_VERSION: u32 = 2;

/// Schemes accepted for `configuration_url`
pub const CONFIGURATION_URL_SCHEMES: &[&str] = &["http", "https", "homeassistant"];

/// Device registry errors
#[derive(Debug, Error)]
pub enum DeviceRegistryError {
    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("A device needs at least one identifier or connection")]
    MissingIdentity,

    #[error("Identifier {identifier:?} is already registered with device {existing_device_id}")]
    IdentifierCollision {
        identifier: DeviceIdentifier,
        existing_device_id: String,
    },

    #[error("Connection {connection:?} is already registered with device {existing_device_id}")]
    ConnectionCollision {
        connection: DeviceConnection,
        existing_device_id: String,
    },

    #[error("Cannot define both merge_{field} and new_{field}")]
    ConflictingUpdate { field: &'static str },

    #[error("Invalid configuration_url: {url}")]
    InvalidConfigurationUrl { url: String },
}

/// Result type for device registry operations
pub type DeviceRegistryResult<T> = Result<T, DeviceRegistryError>;

/// Check a `configuration_url` value
pub fn validate_configuration_url(value: &str) -> DeviceRegistryResult<()> {
    let invalid = || DeviceRegistryError::InvalidConfigurationUrl {
        url: value.to_string(),
    };

    let url = url::Url::parse(value).map_err(|_| invalid())?;
    let has_host = url.host_str().is_some_and(|host| !host.is_empty());
    if !CONFIGURATION_URL_SCHEMES.contains(&url.scheme()) || !has_host {
        return Err(invalid());
    }
    Ok(())
}

/// Device registry data for storage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistryData {
    /// All registered devices
    pub devices: Vec<DeviceEntry>,
    /// Removed devices remembered for restoration
    #[serde(default)]
    pub deleted_devices: Vec<DeletedDeviceEntry>,
}

impl Storable for DeviceRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Load state of the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistryState {
    Uninitialized = 0,
    Loading = 1,
    Ready = 2,
}

impl RegistryState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Loading,
            2 => Self::Ready,
            _ => Self::Uninitialized,
        }
    }
}

/// Partial update of a device
///
/// Fields left as `None` are untouched. For optional device fields the
/// inner `Option` is the new value, so `Some(None)` clears the field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub add_config_entry_id: Option<String>,
    pub remove_config_entry_id: Option<String>,
    /// Identifiers added to the device's set
    pub merge_identifiers: Option<BTreeSet<DeviceIdentifier>>,
    /// Connections added to the device's set
    pub merge_connections: Option<BTreeSet<DeviceConnection>>,
    /// Replacement identifier set
    pub new_identifiers: Option<BTreeSet<DeviceIdentifier>>,
    /// Replacement connection set
    pub new_connections: Option<BTreeSet<DeviceConnection>>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub model_id: Option<Option<String>>,
    pub name: Option<Option<String>>,
    pub name_by_user: Option<Option<String>>,
    pub sw_version: Option<Option<String>>,
    pub hw_version: Option<Option<String>>,
    pub serial_number: Option<Option<String>>,
    pub area_id: Option<Option<String>>,
    pub labels: Option<BTreeSet<String>>,
    pub via_device_id: Option<Option<String>>,
    pub entry_type: Option<Option<DeviceEntryType>>,
    pub disabled_by: Option<Option<DeviceEntryDisabler>>,
    pub configuration_url: Option<Option<String>>,
}

impl DeviceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_config_entry(mut self, config_entry_id: impl Into<String>) -> Self {
        self.add_config_entry_id = Some(config_entry_id.into());
        self
    }

    /// Unlink a config entry; removing the last one removes the device
    pub fn remove_config_entry(mut self, config_entry_id: impl Into<String>) -> Self {
        self.remove_config_entry_id = Some(config_entry_id.into());
        self
    }

    pub fn merge_identifiers(mut self, identifiers: BTreeSet<DeviceIdentifier>) -> Self {
        self.merge_identifiers = Some(identifiers);
        self
    }

    pub fn merge_connections(mut self, connections: BTreeSet<DeviceConnection>) -> Self {
        self.merge_connections = Some(connections);
        self
    }

    pub fn new_identifiers(mut self, identifiers: BTreeSet<DeviceIdentifier>) -> Self {
        self.new_identifiers = Some(identifiers);
        self
    }

    pub fn new_connections(mut self, connections: BTreeSet<DeviceConnection>) -> Self {
        self.new_connections = Some(connections);
        self
    }

    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn model_id(mut self, model_id: Option<&str>) -> Self {
        self.model_id = Some(model_id.map(str::to_string));
        self
    }

    pub fn name(mut self, name: Option<&str>) -> Self {
        self.name = Some(name.map(str::to_string));
        self
    }

    pub fn name_by_user(mut self, name_by_user: Option<&str>) -> Self {
        self.name_by_user = Some(name_by_user.map(str::to_string));
        self
    }

    pub fn sw_version(mut self, sw_version: Option<&str>) -> Self {
        self.sw_version = Some(sw_version.map(str::to_string));
        self
    }

    pub fn hw_version(mut self, hw_version: Option<&str>) -> Self {
        self.hw_version = Some(hw_version.map(str::to_string));
        self
    }

    pub fn serial_number(mut self, serial_number: Option<&str>) -> Self {
        self.serial_number = Some(serial_number.map(str::to_string));
        self
    }

    pub fn area_id(mut self, area_id: Option<&str>) -> Self {
        self.area_id = Some(area_id.map(str::to_string));
        self
    }

    pub fn labels(mut self, labels: BTreeSet<String>) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn via_device_id(mut self, via_device_id: Option<&str>) -> Self {
        self.via_device_id = Some(via_device_id.map(str::to_string));
        self
    }

    pub fn entry_type(mut self, entry_type: Option<DeviceEntryType>) -> Self {
        self.entry_type = Some(entry_type);
        self
    }

    pub fn disabled_by(mut self, disabled_by: Option<DeviceEntryDisabler>) -> Self {
        self.disabled_by = Some(disabled_by);
        self
    }

    pub fn configuration_url(mut self, url: Option<&str>) -> Self {
        self.configuration_url = Some(url.map(str::to_string));
        self
    }

    fn validate(&self) -> DeviceRegistryResult<()> {
        if self.merge_identifiers.is_some() && self.new_identifiers.is_some() {
            return Err(DeviceRegistryError::ConflictingUpdate {
                field: "identifiers",
            });
        }
        if self.merge_connections.is_some() && self.new_connections.is_some() {
            return Err(DeviceRegistryError::ConflictingUpdate {
                field: "connections",
            });
        }
        if let Some(Some(url)) = &self.configuration_url {
            validate_configuration_url(url)?;
        }
        Ok(())
    }
}

/// A device taken out of the registry, plus the follow-up events
struct Removal {
    entry: Arc<DeviceEntry>,
    /// Children that lost their `via_device_id`
    child_events: Vec<DeviceRegistryEvent>,
}

enum UpdateOutcome {
    Unchanged(Arc<DeviceEntry>),
    Updated(Arc<DeviceEntry>, DeviceRegistryEvent),
    Removed(Option<Removal>),
}

/// In-memory registry contents
#[derive(Default)]
struct DeviceRegistryItems {
    /// device_id -> entry, in registration order
    devices: IndexMap<String, Arc<DeviceEntry>>,
    deleted_devices: IndexMap<String, Arc<DeletedDeviceEntry>>,
    by_identifier: HashMap<DeviceIdentifier, String>,
    by_connection: HashMap<DeviceConnection, String>,
}

impl DeviceRegistryItems {
    fn from_data(data: DeviceRegistryData) -> Self {
        let mut items = Self::default();

        for mut entry in data.devices {
            if items.devices.contains_key(&entry.id) {
                warn!("Skipping duplicate device id in storage: {}", entry.id);
                continue;
            }
            entry.connections = normalize_connections(&entry.connections);
            items.insert(Arc::new(entry));
        }

        for entry in data.deleted_devices {
            items
                .deleted_devices
                .insert(entry.id.clone(), Arc::new(entry));
        }

        items
    }

    fn to_data(&self) -> DeviceRegistryData {
        DeviceRegistryData {
            devices: self.devices.values().map(|e| (**e).clone()).collect(),
            deleted_devices: self
                .deleted_devices
                .values()
                .map(|e| (**e).clone())
                .collect(),
        }
    }

    fn index(&mut self, entry: &DeviceEntry) {
        for identifier in &entry.identifiers {
            claim_key(&mut self.by_identifier, &self.devices, identifier, &entry.id);
        }
        for connection in &entry.connections {
            claim_key(&mut self.by_connection, &self.devices, connection, &entry.id);
        }
    }

    /// Drop the entry's keys from the indexes, passing shared keys on to
    /// the next device holding them
    fn unindex(&mut self, entry: &DeviceEntry) {
        for identifier in &entry.identifiers {
            release_key(&mut self.by_identifier, &self.devices, identifier, &entry.id, |d| {
                d.identifiers.contains(identifier)
            });
        }
        for connection in &entry.connections {
            release_key(&mut self.by_connection, &self.devices, connection, &entry.id, |d| {
                d.connections.contains(connection)
            });
        }
    }

    /// Insert or replace an entry, keeping its position when replacing
    fn insert(&mut self, entry: Arc<DeviceEntry>) {
        if let Some(old) = self.devices.get(&entry.id).cloned() {
            self.unindex(&old);
        }
        self.index(&entry);
        self.devices.insert(entry.id.clone(), entry);
    }

    fn remove(&mut self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let entry = self.devices.shift_remove(device_id)?;
        self.unindex(&entry);
        Some(entry)
    }

    /// First device in registration order owning any of the given keys
    fn find(
        &self,
        identifiers: &BTreeSet<DeviceIdentifier>,
        connections: &BTreeSet<DeviceConnection>,
    ) -> Option<Arc<DeviceEntry>> {
        identifiers
            .iter()
            .filter_map(|identifier| self.by_identifier.get(identifier))
            .chain(
                connections
                    .iter()
                    .filter_map(|connection| self.by_connection.get(connection)),
            )
            .filter_map(|device_id| self.devices.get_full(device_id))
            .min_by_key(|(position, _, _)| *position)
            .map(|(_, _, entry)| Arc::clone(entry))
    }

    fn find_deleted(
        &self,
        identifiers: &BTreeSet<DeviceIdentifier>,
        connections: &BTreeSet<DeviceConnection>,
    ) -> Option<Arc<DeletedDeviceEntry>> {
        self.deleted_devices
            .values()
            .find(|deleted| deleted.matches(identifiers, connections))
            .cloned()
    }

    fn check_identifiers(
        &self,
        device_id: &str,
        identifiers: &BTreeSet<DeviceIdentifier>,
    ) -> DeviceRegistryResult<()> {
        for identifier in identifiers {
            if let Some(owner) = self.by_identifier.get(identifier) {
                if owner != device_id {
                    return Err(DeviceRegistryError::IdentifierCollision {
                        identifier: identifier.clone(),
                        existing_device_id: owner.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn check_connections(
        &self,
        device_id: &str,
        connections: &BTreeSet<DeviceConnection>,
    ) -> DeviceRegistryResult<()> {
        for connection in connections {
            if let Some(owner) = self.by_connection.get(connection) {
                if owner != device_id {
                    return Err(DeviceRegistryError::ConnectionCollision {
                        connection: connection.clone(),
                        existing_device_id: owner.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Apply `update` to a copy of `old`
    ///
    /// `Ok(None)` means the update removed the device's last config entry.
    fn apply_update(
        &self,
        old: &DeviceEntry,
        update: DeviceUpdate,
    ) -> DeviceRegistryResult<Option<DeviceEntry>> {
        let mut new = old.clone();

        if let Some(config_entry_id) = update.add_config_entry_id {
            if new.primary_config_entry.is_none() {
                new.primary_config_entry = Some(config_entry_id.clone());
            }
            new.config_entries.insert(config_entry_id);
        }

        if let Some(config_entry_id) = update.remove_config_entry_id {
            if new.config_entries.remove(&config_entry_id) {
                if new.config_entries.is_empty() {
                    return Ok(None);
                }
                if new.primary_config_entry.as_ref() == Some(&config_entry_id) {
                    new.primary_config_entry = new.config_entries.iter().next().cloned();
                }
            }
        }

        if let Some(identifiers) = update.merge_identifiers {
            self.check_identifiers(&old.id, &identifiers)?;
            new.identifiers.extend(identifiers);
        }
        if let Some(identifiers) = update.new_identifiers {
            self.check_identifiers(&old.id, &identifiers)?;
            new.identifiers = identifiers;
        }
        if let Some(connections) = update.merge_connections {
            let connections = normalize_connections(&connections);
            self.check_connections(&old.id, &connections)?;
            new.connections.extend(connections);
        }
        if let Some(connections) = update.new_connections {
            let connections = normalize_connections(&connections);
            self.check_connections(&old.id, &connections)?;
            new.connections = connections;
        }
        if new.identifiers.is_empty() && new.connections.is_empty() {
            return Err(DeviceRegistryError::MissingIdentity);
        }

        macro_rules! apply {
            ($($field:ident),* $(,)?) => {
                $(
                    if let Some(value) = update.$field {
                        new.$field = value;
                    }
                )*
            };
        }
        apply!(
            manufacturer,
            model,
            model_id,
            name,
            name_by_user,
            sw_version,
            hw_version,
            serial_number,
            area_id,
            labels,
            via_device_id,
            entry_type,
            disabled_by,
            configuration_url,
        );

        Ok(Some(new))
    }

    /// Move a device to the deleted list and detach its children
    fn remove_device(&mut self, device_id: &str) -> Option<Removal> {
        let entry = self.remove(device_id)?;
        self.deleted_devices.insert(
            entry.id.clone(),
            Arc::new(DeletedDeviceEntry::from(&*entry)),
        );

        let children: Vec<Arc<DeviceEntry>> = self
            .devices
            .values()
            .filter(|d| d.via_device_id.as_deref() == Some(device_id))
            .cloned()
            .collect();

        let mut child_events = Vec::with_capacity(children.len());
        for child in children {
            let mut detached = (*child).clone();
            detached.via_device_id = None;
            detached.modified_at = Utc::now();
            if let Some(event) = DeviceRegistryEvent::update(&child, &detached) {
                child_events.push(event);
            }
            self.insert(Arc::new(detached));
        }

        Some(Removal {
            entry,
            child_events,
        })
    }
}

/// Register `device_id` as owner of `key`
///
/// A key held by several devices belongs to the earliest registered one.
fn claim_key<K>(
    index: &mut HashMap<K, String>,
    devices: &IndexMap<String, Arc<DeviceEntry>>,
    key: &K,
    device_id: &str,
) where
    K: Hash + Eq + Clone + Debug,
{
    let position = |id: &str| devices.get_index_of(id).unwrap_or(devices.len());

    match index.get_mut(key) {
        Some(owner) if owner.as_str() == device_id => {}
        Some(owner) => {
            warn!(
                "{:?} of device {} is already registered with device {}",
                key, device_id, owner
            );
            if position(device_id) < position(owner.as_str()) {
                *owner = device_id.to_string();
            }
        }
        None => {
            index.insert(key.clone(), device_id.to_string());
        }
    }
}

/// Withdraw `device_id`'s claim on `key`
fn release_key<K>(
    index: &mut HashMap<K, String>,
    devices: &IndexMap<String, Arc<DeviceEntry>>,
    key: &K,
    device_id: &str,
    holds: impl Fn(&DeviceEntry) -> bool,
) where
    K: Hash + Eq + Debug,
{
    if index.get(key).map(String::as_str) != Some(device_id) {
        return;
    }
    let successor = devices
        .values()
        .find(|entry| entry.id != device_id && holds(entry));
    match successor {
        Some(entry) => {
            debug!("{:?} passes from device {} to device {}", key, device_id, entry.id);
            if let Some(owner) = index.get_mut(key) {
                *owner = entry.id.clone();
            }
        }
        None => {
            index.remove(key);
        }
    }
}

fn read_items(items: &RwLock<DeviceRegistryItems>) -> RwLockReadGuard<'_, DeviceRegistryItems> {
    items.read().unwrap_or_else(PoisonError::into_inner)
}

/// Device Registry
///
/// Lookups and mutations are synchronous and take a single lock, so a
/// get-then-create in [`DeviceRegistry::get_or_create`] cannot interleave
/// with another caller. Entries are handed out as `Arc<DeviceEntry>`
/// snapshots.
pub struct DeviceRegistry {
    items: Arc<RwLock<DeviceRegistryItems>>,
    store: Store<DeviceRegistryData>,
    config: DeviceRegistryConfig,
    events: broadcast::Sender<DeviceRegistryEvent>,
    state: AtomicU8,
}

impl DeviceRegistry {
    /// Create an empty, unloaded registry
    pub fn new(storage: Arc<Storage>, config: DeviceRegistryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            items: Arc::new(RwLock::new(DeviceRegistryItems::default())),
            store: Store::new(storage),
            config,
            events,
            state: AtomicU8::new(RegistryState::Uninitialized as u8),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, DeviceRegistryItems> {
        read_items(&self.items)
    }

    fn write(&self) -> RwLockWriteGuard<'_, DeviceRegistryItems> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: RegistryState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn state(&self) -> RegistryState {
        RegistryState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Load from storage
    ///
    /// A missing file yields an empty registry. On error the registry is
    /// left untouched and reported as uninitialized.
    pub async fn load(&self) -> StorageResult<()> {
        self.set_state(RegistryState::Loading);

        let stored = match self.store.load().await {
            Ok(stored) => stored,
            Err(e) => {
                self.set_state(RegistryState::Uninitialized);
                return Err(e);
            }
        };

        let items = match stored {
            Some(storage_file) => {
                info!(
                    "Loading {} devices from storage (v{}.{})",
                    storage_file.data.devices.len(),
                    storage_file.version,
                    storage_file.minor_version
                );
                DeviceRegistryItems::from_data(storage_file.data)
            }
            None => {
                info!("No stored device registry, starting empty");
                DeviceRegistryItems::default()
            }
        };

        *self.write() = items;
        self.set_state(RegistryState::Ready);
        Ok(())
    }

    /// Snapshot of the data that is written to storage
    pub fn data_to_save(&self) -> DeviceRegistryData {
        self.read().to_data()
    }

    /// Schedule a debounced save of the registry
    pub fn schedule_save(&self) {
        let items = Arc::clone(&self.items);
        self.store.delay_save(
            move || read_items(&items).to_data(),
            self.config.save_delay(),
        );
    }

    /// Write a pending save now
    ///
    /// Returns `Ok(false)` when there was nothing to write.
    pub async fn flush(&self) -> StorageResult<bool> {
        self.store.flush().await
    }

    pub fn has_pending_save(&self) -> bool {
        self.store.has_pending()
    }

    /// Subscribe to `device_registry_updated` events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceRegistryEvent> {
        self.events.subscribe()
    }

    fn fire(&self, event: DeviceRegistryEvent) {
        debug!("{}: {:?}", event.event_type(), event);
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    /// Get a device by id
    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.read().devices.get(device_id).cloned()
    }

    /// Find the device owning any of the given identifiers or connections
    ///
    /// When several devices match, the earliest registered one wins.
    pub fn get_device(
        &self,
        identifiers: &BTreeSet<DeviceIdentifier>,
        connections: &BTreeSet<DeviceConnection>,
    ) -> Option<Arc<DeviceEntry>> {
        let connections = normalize_connections(connections);
        self.read().find(identifiers, &connections)
    }

    /// Get the device matching `info`, or register a new one
    ///
    /// An existing match is returned as is, even when the descriptive
    /// fields in `info` differ. Use [`DeviceRegistry::update_device`] to
    /// change it.
    pub fn get_or_create(&self, info: DeviceInfo) -> DeviceRegistryResult<Arc<DeviceEntry>> {
        if info.identifiers.is_empty() && info.connections.is_empty() {
            return Err(DeviceRegistryError::MissingIdentity);
        }
        if let Some(url) = &info.configuration_url {
            validate_configuration_url(url)?;
        }
        let connections = normalize_connections(&info.connections);

        let (entry, restored) = {
            let mut items = self.write();

            if let Some(existing) = items.find(&info.identifiers, &connections) {
                debug!("Found existing device: {}", existing.id);
                return Ok(existing);
            }

            let via_device_id = info
                .via_device
                .as_ref()
                .and_then(|via| items.by_identifier.get(via).cloned());

            let (mut entry, restored) = match items.find_deleted(&info.identifiers, &connections)
            {
                Some(deleted) => {
                    items.deleted_devices.shift_remove(&deleted.id);
                    (deleted.to_device_entry(info.manufacturer, info.model), true)
                }
                None => (DeviceEntry::new(info.manufacturer, info.model), false),
            };

            entry.identifiers = info.identifiers;
            entry.connections = connections;
            entry.name = info.name;
            entry.sw_version = info.sw_version;
            entry.hw_version = info.hw_version;
            entry.serial_number = info.serial_number;
            entry.model_id = info.model_id;
            entry.entry_type = info.entry_type;
            entry.disabled_by = info.disabled_by;
            entry.configuration_url = info.configuration_url;
            entry.via_device_id = via_device_id;
            if let Some(config_entry_id) = info.config_entry_id {
                entry.config_entries.insert(config_entry_id.clone());
                entry.primary_config_entry = Some(config_entry_id);
            }

            let entry = Arc::new(entry);
            items.insert(Arc::clone(&entry));
            (entry, restored)
        };

        if restored {
            info!("Restored deleted device: {} ({})", entry.id, entry.model);
        } else {
            info!(
                "Registered new device: {} ({} {})",
                entry.id, entry.manufacturer, entry.model
            );
        }

        self.schedule_save();
        self.fire(DeviceRegistryEvent::Create {
            device_id: entry.id.clone(),
        });
        Ok(entry)
    }

    /// Update a device
    ///
    /// Returns `Ok(None)` when the update removed the device's last config
    /// entry, which removes the device. Nothing changes on error.
    pub fn update_device(
        &self,
        device_id: &str,
        update: DeviceUpdate,
    ) -> DeviceRegistryResult<Option<Arc<DeviceEntry>>> {
        update.validate()?;

        let outcome = {
            let mut items = self.write();
            let old = items.devices.get(device_id).cloned().ok_or_else(|| {
                DeviceRegistryError::DeviceNotFound {
                    device_id: device_id.to_string(),
                }
            })?;

            match items.apply_update(&old, update)? {
                None => UpdateOutcome::Removed(items.remove_device(device_id)),
                Some(mut new) => match DeviceRegistryEvent::update(&old, &new) {
                    None => UpdateOutcome::Unchanged(old),
                    Some(event) => {
                        new.modified_at = Utc::now();
                        let new = Arc::new(new);
                        items.insert(Arc::clone(&new));
                        UpdateOutcome::Updated(new, event)
                    }
                },
            }
        };

        match outcome {
            UpdateOutcome::Unchanged(entry) => Ok(Some(entry)),
            UpdateOutcome::Updated(entry, event) => {
                debug!("Updated device: {}", entry.id);
                self.schedule_save();
                self.fire(event);
                Ok(Some(entry))
            }
            UpdateOutcome::Removed(removal) => {
                if let Some(removal) = removal {
                    self.finish_removal(removal);
                }
                Ok(None)
            }
        }
    }

    /// Remove a device
    ///
    /// The device is remembered as deleted so registering it again gives
    /// back the same id. Children reached through it lose their
    /// `via_device_id`.
    pub fn remove_device(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let removal = self.write().remove_device(device_id)?;
        let entry = Arc::clone(&removal.entry);
        self.finish_removal(removal);
        Some(entry)
    }

    fn finish_removal(&self, removal: Removal) {
        info!("Removed device: {}", removal.entry.id);
        for event in removal.child_events {
            self.fire(event);
        }
        self.schedule_save();
        self.fire(DeviceRegistryEvent::Remove {
            device_id: removal.entry.id.clone(),
        });
    }

    /// Unlink a config entry from all devices
    ///
    /// Devices left without config entries are removed. Deleted devices
    /// that lose their last config entry are marked orphaned.
    pub fn clear_config_entry(&self, config_entry_id: &str) {
        for device in self.devices_for_config_entry(config_entry_id) {
            let update = DeviceUpdate::new().remove_config_entry(config_entry_id);
            if let Err(e) = self.update_device(&device.id, update) {
                warn!(
                    "Failed to unlink config entry {} from device {}: {}",
                    config_entry_id, device.id, e
                );
            }
        }

        let now = Utc::now();
        let orphaned_changed = {
            let mut items = self.write();
            let mut changed = false;
            for deleted in items.deleted_devices.values_mut() {
                if !deleted.config_entries.contains(config_entry_id) {
                    continue;
                }
                let deleted = Arc::make_mut(deleted);
                deleted.config_entries.remove(config_entry_id);
                if deleted.config_entries.is_empty() {
                    deleted.orphaned_timestamp = Some(now);
                }
                deleted.modified_at = now;
                changed = true;
            }
            changed
        };

        if orphaned_changed {
            self.schedule_save();
        }
    }

    /// Clear an area from all devices
    ///
    /// Returns the ids of the devices that were changed.
    pub fn clear_area_id(&self, area_id: &str) -> Vec<String> {
        self.devices_for_area(area_id)
            .into_iter()
            .filter_map(|device| {
                self.update_device(&device.id, DeviceUpdate::new().area_id(None))
                    .ok()
                    .flatten()
                    .map(|updated| updated.id.clone())
            })
            .collect()
    }

    /// Remove a label from all devices
    ///
    /// Returns the ids of the devices that were changed.
    pub fn clear_label_id(&self, label_id: &str) -> Vec<String> {
        self.devices_for_label(label_id)
            .into_iter()
            .filter_map(|device| {
                let mut labels = device.labels.clone();
                labels.remove(label_id);
                self.update_device(&device.id, DeviceUpdate::new().labels(labels))
                    .ok()
                    .flatten()
                    .map(|updated| updated.id.clone())
            })
            .collect()
    }

    /// Forget deleted devices that have been orphaned for too long
    ///
    /// Returns the number of purged devices.
    pub fn purge_expired_orphaned_devices(&self) -> usize {
        let keep = chrono::Duration::days(i64::from(self.config.orphaned_device_keep_days));
        let cutoff = Utc::now() - keep;

        let purged = {
            let mut items = self.write();
            let before = items.deleted_devices.len();
            items.deleted_devices.retain(|_, deleted| {
                deleted
                    .orphaned_timestamp
                    .map_or(true, |orphaned| orphaned >= cutoff)
            });
            before - items.deleted_devices.len()
        };

        if purged > 0 {
            info!("Purged {} expired orphaned devices", purged);
            self.schedule_save();
        }
        purged
    }

    fn filter_devices(&self, predicate: impl Fn(&DeviceEntry) -> bool) -> Vec<Arc<DeviceEntry>> {
        self.read()
            .devices
            .values()
            .filter(|entry| predicate(entry))
            .cloned()
            .collect()
    }

    /// Get all devices linked to a config entry
    pub fn devices_for_config_entry(&self, config_entry_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.filter_devices(|entry| entry.config_entries.contains(config_entry_id))
    }

    /// Get all devices in an area
    pub fn devices_for_area(&self, area_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.filter_devices(|entry| entry.area_id.as_deref() == Some(area_id))
    }

    /// Get all devices carrying a label
    pub fn devices_for_label(&self, label_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.filter_devices(|entry| entry.labels.contains(label_id))
    }

    /// Get devices connected through `device_id`
    pub fn children_of(&self, device_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.filter_devices(|entry| entry.via_device_id.as_deref() == Some(device_id))
    }

    /// All devices in registration order
    pub fn devices(&self) -> Vec<Arc<DeviceEntry>> {
        self.read().devices.values().cloned().collect()
    }

    pub fn deleted_devices(&self) -> Vec<Arc<DeletedDeviceEntry>> {
        self.read().deleted_devices.values().cloned().collect()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.read().devices.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> DeviceRegistry {
        DeviceRegistry::new(
            Arc::new(Storage::new(dir.path())),
            DeviceRegistryConfig::default(),
        )
    }

    fn entry(id: &str) -> DeviceEntry {
        let mut entry = DeviceEntry::new("Acme", "Widget");
        entry.id = id.to_string();
        entry
    }

    #[test]
    fn test_configuration_url_validation() {
        for valid in [
            "http://192.168.1.2",
            "https://example.com/setup",
            "homeassistant://config/integrations",
        ] {
            assert!(validate_configuration_url(valid).is_ok(), "{}", valid);
        }
        for invalid in ["ftp://example.com", "not a url", "http://", "mailto:me@example.com"] {
            assert!(
                matches!(
                    validate_configuration_url(invalid),
                    Err(DeviceRegistryError::InvalidConfigurationUrl { .. })
                ),
                "{}",
                invalid
            );
        }
    }

    #[test]
    fn test_find_prefers_registration_order() {
        let mut first = entry("first");
        first.connections.insert(DeviceConnection::new("mac", "aa:bb:cc:dd:ee:ff"));
        let mut second = entry("second");
        second.identifiers.insert(DeviceIdentifier::new("acme", "x"));

        let items = DeviceRegistryItems::from_data(DeviceRegistryData {
            devices: vec![first, second],
            deleted_devices: vec![],
        });

        // Both devices match; the earlier one wins regardless of key kind
        let found = items
            .find(
                &BTreeSet::from([DeviceIdentifier::new("acme", "x")]),
                &BTreeSet::from([DeviceConnection::new("mac", "aa:bb:cc:dd:ee:ff")]),
            )
            .unwrap();
        assert_eq!(found.id, "first");
    }

    #[test]
    fn test_duplicate_identity_in_storage_keeps_first_owner() {
        let mut first = entry("first");
        first.identifiers.insert(DeviceIdentifier::new("acme", "x"));
        let mut second = entry("second");
        second.identifiers.insert(DeviceIdentifier::new("acme", "x"));
        let duplicate_id = entry("first");

        let items = DeviceRegistryItems::from_data(DeviceRegistryData {
            devices: vec![first, second, duplicate_id],
            deleted_devices: vec![],
        });

        assert_eq!(items.devices.len(), 2);
        let found = items
            .find(
                &BTreeSet::from([DeviceIdentifier::new("acme", "x")]),
                &BTreeSet::new(),
            )
            .unwrap();
        assert_eq!(found.id, "first");
    }

    fn shared_identity_items() -> DeviceRegistryItems {
        let mut first = entry("first");
        first.identifiers.insert(DeviceIdentifier::new("acme", "x"));
        first
            .connections
            .insert(DeviceConnection::new("mac", "aa:bb:cc:dd:ee:ff"));
        let mut second = entry("second");
        second.identifiers.insert(DeviceIdentifier::new("acme", "x"));
        second
            .connections
            .insert(DeviceConnection::new("mac", "aa:bb:cc:dd:ee:ff"));

        DeviceRegistryItems::from_data(DeviceRegistryData {
            devices: vec![first, second],
            deleted_devices: vec![],
        })
    }

    fn owner_of(items: &DeviceRegistryItems, id: &str) -> Option<String> {
        items
            .find(
                &BTreeSet::from([DeviceIdentifier::new("acme", id)]),
                &BTreeSet::new(),
            )
            .map(|entry| entry.id.clone())
    }

    #[test]
    fn test_removing_owner_hands_shared_identity_to_next_device() {
        let mut items = shared_identity_items();

        assert!(items.remove_device("first").is_some());

        assert_eq!(owner_of(&items, "x").as_deref(), Some("second"));
        let by_mac = items
            .find(
                &BTreeSet::new(),
                &BTreeSet::from([DeviceConnection::new("mac", "aa:bb:cc:dd:ee:ff")]),
            )
            .unwrap();
        assert_eq!(by_mac.id, "second");

        assert!(items.remove_device("second").is_some());
        assert!(owner_of(&items, "x").is_none());
        assert!(items.by_identifier.is_empty());
        assert!(items.by_connection.is_empty());
    }

    #[test]
    fn test_replacing_identifiers_hands_over_and_reclaims() {
        let mut items = shared_identity_items();

        let mut first = (*items.devices["first"]).clone();
        first.identifiers = BTreeSet::from([DeviceIdentifier::new("acme", "y")]);
        items.insert(Arc::new(first.clone()));

        assert_eq!(owner_of(&items, "x").as_deref(), Some("second"));
        assert_eq!(owner_of(&items, "y").as_deref(), Some("first"));

        // Earlier registration wins the key back
        first.identifiers.insert(DeviceIdentifier::new("acme", "x"));
        items.insert(Arc::new(first));
        assert_eq!(owner_of(&items, "x").as_deref(), Some("first"));
        assert_eq!(
            items.devices.keys().collect::<Vec<_>>(),
            vec!["first", "second"]
        );
    }

    #[test]
    fn test_stored_mac_connections_are_normalized_on_load() {
        let mut stored = entry("dev");
        stored
            .connections
            .insert(DeviceConnection::new("mac", "AA-BB-CC-DD-EE-FF"));

        let items = DeviceRegistryItems::from_data(DeviceRegistryData {
            devices: vec![stored],
            deleted_devices: vec![],
        });
        assert!(items
            .by_connection
            .contains_key(&DeviceConnection::new("mac", "aa:bb:cc:dd:ee:ff")));
    }

    #[test]
    fn test_conflicting_update_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let device = registry
            .get_or_create(DeviceInfo::new("Acme", "Widget").with_identifier("acme", "1"))
            .unwrap();

        let update = DeviceUpdate::new()
            .merge_identifiers(BTreeSet::from([DeviceIdentifier::new("acme", "2")]))
            .new_identifiers(BTreeSet::from([DeviceIdentifier::new("acme", "3")]));
        assert!(matches!(
            registry.update_device(&device.id, update),
            Err(DeviceRegistryError::ConflictingUpdate {
                field: "identifiers"
            })
        ));
    }

    #[test]
    fn test_update_unknown_device() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        assert!(matches!(
            registry.update_device("missing", DeviceUpdate::new().name(Some("x"))),
            Err(DeviceRegistryError::DeviceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        assert_eq!(registry.state(), RegistryState::Uninitialized);

        registry.load().await.unwrap();
        assert_eq!(registry.state(), RegistryState::Ready);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_load_leaves_registry_uninitialized() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        storage.ensure_dir().await.unwrap();
        std::fs::write(storage.file_path(STORAGE_KEY), "{broken").unwrap();

        let registry = registry(&dir);
        assert!(registry.load().await.is_err());
        assert_eq!(registry.state(), RegistryState::Uninitialized);
    }
}
