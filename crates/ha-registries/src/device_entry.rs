//! Device registry data model
//!
//! Value types shared by the registry and its callers: identity pairs,
//! the stored `DeviceEntry`, tombstones for removed devices and the
//! `DeviceInfo` request used to create devices.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CONNECTION_BLUETOOTH: &str = "bluetooth";
pub const CONNECTION_NETWORK_MAC: &str = "mac";
pub const CONNECTION_UPNP: &str = "upnp";
pub const CONNECTION_ZIGBEE: &str = "zigbee";

/// Device entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEntryType {
    /// Service device (virtual)
    Service,
}

/// What disabled a device entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEntryDisabler {
    ConfigEntry,
    Integration,
    User,
}

/// A device identifier (domain, id) pair
/// The id can be either a string or an integer in the JSON, but is stored as String
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DeviceIdentifier(pub String, pub String);

impl<'de> Deserialize<'de> for DeviceIdentifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, SeqAccess, Visitor};

        struct DeviceIdentifierVisitor;

        impl<'de> Visitor<'de> for DeviceIdentifierVisitor {
            type Value = DeviceIdentifier;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a tuple of [domain, id, ...] where id parts are joined")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let domain: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;

                // Some integrations store 3+ element tuples like ["homekit", "id", "bridge"]
                let mut id_parts: Vec<String> = Vec::new();
                while let Some(value) = seq.next_element::<serde_json::Value>()? {
                    let part = match value {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Number(n) => n.to_string(),
                        _ => return Err(de::Error::custom("id parts must be string or number")),
                    };
                    id_parts.push(part);
                }

                if id_parts.is_empty() {
                    return Err(de::Error::invalid_length(1, &self));
                }

                Ok(DeviceIdentifier(domain, id_parts.join(":")))
            }
        }

        deserializer.deserialize_seq(DeviceIdentifierVisitor)
    }
}

impl DeviceIdentifier {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self(domain.into(), id.into())
    }

    pub fn domain(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }
}

/// A device connection (type, value) pair, e.g. `("mac", "aa:bb:cc:dd:ee:ff")`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceConnection(pub String, pub String);

impl DeviceConnection {
    pub fn new(conn_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self(conn_type.into(), value.into())
    }

    pub fn connection_type(&self) -> &str {
        &self.0
    }

    pub fn value(&self) -> &str {
        &self.1
    }

    /// Same connection with a MAC address value brought into canonical form
    pub fn normalized(&self) -> Self {
        if self.0 == CONNECTION_NETWORK_MAC {
            Self(self.0.clone(), format_mac(&self.1))
        } else {
            self.clone()
        }
    }
}

/// Format a MAC address for the registry: lowercase, colon separated.
///
/// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF`, `AABB.CCDD.EEFF` and
/// `AABBCCDDEEFF`; anything else is returned unchanged.
pub fn format_mac(mac: &str) -> String {
    if !mac.is_ascii() {
        return mac.to_string();
    }

    let count = |sep: char| mac.chars().filter(|c| *c == sep).count();

    if mac.len() == 17 && count(':') == 5 {
        return mac.to_lowercase();
    }

    let stripped = if mac.len() == 17 && count('-') == 5 {
        mac.replace('-', "")
    } else if mac.len() == 14 && count('.') == 2 {
        mac.replace('.', "")
    } else {
        mac.to_string()
    };

    if stripped.len() != 12 {
        return mac.to_string();
    }

    stripped
        .to_lowercase()
        .as_bytes()
        .chunks(2)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Normalize a set of connections (MAC addresses formatted to lowercase)
pub fn normalize_connections<'a, I>(connections: I) -> BTreeSet<DeviceConnection>
where
    I: IntoIterator<Item = &'a DeviceConnection>,
{
    connections
        .into_iter()
        .map(DeviceConnection::normalized)
        .collect()
}

/// A registered device entry
///
/// Entries handed out by the registry are shared snapshots; changes go
/// through `DeviceRegistry::update_device`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Internal id (random UUID, hex)
    pub id: String,

    /// Connection info (e.g., [["mac", "aa:bb:cc:dd:ee:ff"]])
    #[serde(default, alias = "connection")]
    pub connections: BTreeSet<DeviceConnection>,

    /// Unique identifiers by domain (e.g., [["hue", "bridge123"]])
    #[serde(default)]
    pub identifiers: BTreeSet<DeviceIdentifier>,

    #[serde(default)]
    pub manufacturer: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Software/firmware version
    #[serde(default)]
    pub sw_version: Option<String>,

    #[serde(default)]
    pub hw_version: Option<String>,

    #[serde(default)]
    pub serial_number: Option<String>,

    /// Manufacturer model ID
    #[serde(default)]
    pub model_id: Option<String>,

    /// Associated config entries
    #[serde(default)]
    pub config_entries: BTreeSet<String>,

    #[serde(default)]
    pub primary_config_entry: Option<String>,

    /// User-set name
    #[serde(default)]
    pub name_by_user: Option<String>,

    #[serde(default)]
    pub area_id: Option<String>,

    #[serde(default)]
    pub labels: BTreeSet<String>,

    /// Parent device (for devices reached through a hub or bridge)
    #[serde(default)]
    pub via_device_id: Option<String>,

    #[serde(default)]
    pub entry_type: Option<DeviceEntryType>,

    #[serde(default)]
    pub disabled_by: Option<DeviceEntryDisabler>,

    /// URL for device configuration
    #[serde(default)]
    pub configuration_url: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl DeviceEntry {
    /// Create a new device entry with a fresh id and the current time
    pub fn new(manufacturer: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_id(new_device_id(), Utc::now(), manufacturer, model)
    }

    fn with_id(
        id: String,
        created_at: DateTime<Utc>,
        manufacturer: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id,
            connections: BTreeSet::new(),
            identifiers: BTreeSet::new(),
            manufacturer: manufacturer.into(),
            model: model.into(),
            name: None,
            sw_version: None,
            hw_version: None,
            serial_number: None,
            model_id: None,
            config_entries: BTreeSet::new(),
            primary_config_entry: None,
            name_by_user: None,
            area_id: None,
            labels: BTreeSet::new(),
            via_device_id: None,
            entry_type: None,
            disabled_by: None,
            configuration_url: None,
            created_at,
            modified_at: Utc::now(),
        }
    }

    /// Get display name (user name or device name)
    pub fn display_name(&self) -> &str {
        self.name_by_user
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("")
    }

    /// Check if device is disabled
    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    /// Names of stored fields that differ between `self` and `new`
    ///
    /// `modified_at` is not compared.
    pub fn changed_fields(&self, new: &DeviceEntry) -> Vec<&'static str> {
        let mut changed = Vec::new();
        macro_rules! compare {
            ($($field:ident),* $(,)?) => {
                $(
                    if self.$field != new.$field {
                        changed.push(stringify!($field));
                    }
                )*
            };
        }
        compare!(
            area_id,
            config_entries,
            configuration_url,
            connections,
            disabled_by,
            entry_type,
            hw_version,
            identifiers,
            labels,
            manufacturer,
            model,
            model_id,
            name,
            name_by_user,
            primary_config_entry,
            serial_number,
            sw_version,
            via_device_id,
        );
        changed
    }
}

fn new_device_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Tombstone kept for a removed device so it can get its id back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedDeviceEntry {
    pub id: String,

    #[serde(default)]
    pub connections: BTreeSet<DeviceConnection>,

    #[serde(default)]
    pub identifiers: BTreeSet<DeviceIdentifier>,

    #[serde(default)]
    pub config_entries: BTreeSet<String>,

    /// Set when the last config entry referencing this device went away
    #[serde(default)]
    pub orphaned_timestamp: Option<DateTime<Utc>>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl DeletedDeviceEntry {
    /// Whether any of the given identifiers or connections belonged to this device
    pub fn matches(
        &self,
        identifiers: &BTreeSet<DeviceIdentifier>,
        connections: &BTreeSet<DeviceConnection>,
    ) -> bool {
        !self.identifiers.is_disjoint(identifiers) || !self.connections.is_disjoint(connections)
    }

    /// Bring the device back with its original id and creation time
    pub fn to_device_entry(
        &self,
        manufacturer: impl Into<String>,
        model: impl Into<String>,
    ) -> DeviceEntry {
        DeviceEntry::with_id(self.id.clone(), self.created_at, manufacturer, model)
    }
}

impl From<&DeviceEntry> for DeletedDeviceEntry {
    fn from(entry: &DeviceEntry) -> Self {
        Self {
            id: entry.id.clone(),
            connections: entry.connections.clone(),
            identifiers: entry.identifiers.clone(),
            config_entries: entry.config_entries.clone(),
            orphaned_timestamp: None,
            created_at: entry.created_at,
            modified_at: Utc::now(),
        }
    }
}

/// Description of a device, as supplied by an integration
///
/// `manufacturer` and `model` are required; at least one identifier or
/// connection must be present for the registry to accept it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub identifiers: BTreeSet<DeviceIdentifier>,
    pub connections: BTreeSet<DeviceConnection>,
    pub manufacturer: String,
    pub model: String,
    pub name: Option<String>,
    pub sw_version: Option<String>,
    pub hw_version: Option<String>,
    pub serial_number: Option<String>,
    pub model_id: Option<String>,
    /// Config entry that becomes the device's first and primary entry
    pub config_entry_id: Option<String>,
    /// Identifier of the hub/bridge this device is reached through
    pub via_device: Option<DeviceIdentifier>,
    pub entry_type: Option<DeviceEntryType>,
    pub disabled_by: Option<DeviceEntryDisabler>,
    pub configuration_url: Option<String>,
}

impl DeviceInfo {
    pub fn new(manufacturer: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Add an identifier
    pub fn with_identifier(mut self, domain: impl Into<String>, id: impl Into<String>) -> Self {
        self.identifiers.insert(DeviceIdentifier::new(domain, id));
        self
    }

    /// Add a connection
    pub fn with_connection(
        mut self,
        conn_type: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.connections.insert(DeviceConnection::new(conn_type, value));
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_sw_version(mut self, sw_version: impl Into<String>) -> Self {
        self.sw_version = Some(sw_version.into());
        self
    }

    pub fn with_hw_version(mut self, hw_version: impl Into<String>) -> Self {
        self.hw_version = Some(hw_version.into());
        self
    }

    pub fn with_serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Link the device to a config entry
    pub fn with_config_entry(mut self, config_entry_id: impl Into<String>) -> Self {
        self.config_entry_id = Some(config_entry_id.into());
        self
    }

    /// Reach this device through the device owning `(domain, id)`
    pub fn with_via_device(mut self, domain: impl Into<String>, id: impl Into<String>) -> Self {
        self.via_device = Some(DeviceIdentifier::new(domain, id));
        self
    }

    pub fn with_entry_type(mut self, entry_type: DeviceEntryType) -> Self {
        self.entry_type = Some(entry_type);
        self
    }

    pub fn with_disabled_by(mut self, disabled_by: DeviceEntryDisabler) -> Self {
        self.disabled_by = Some(disabled_by);
        self
    }

    pub fn with_configuration_url(mut self, url: impl Into<String>) -> Self {
        self.configuration_url = Some(url.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mac_accepted_forms() {
        for mac in [
            "12:34:56:AB:CD:EF",
            "12-34-56-AB-CD-EF",
            "1234.56ab.cdef",
            "123456ABCDEF",
            "123456abcdef",
        ] {
            assert_eq!(format_mac(mac), "12:34:56:ab:cd:ef", "{}", mac);
        }
    }

    #[test]
    fn test_format_mac_leaves_unknown_forms() {
        for invalid in [
            "invalid_mac",
            "123456ABCDEFG",
            "12:34:56:ab:cdef",
            "12:34:56:ab:cd:e:f",
            "1234.56abcdef",
            "123.456.abc.def",
            "none",
        ] {
            assert_eq!(format_mac(invalid), invalid);
        }
    }

    #[test]
    fn test_only_mac_connections_are_normalized() {
        let connections = BTreeSet::from([
            DeviceConnection::new(CONNECTION_NETWORK_MAC, "AA-BB-CC-DD-EE-FF"),
            DeviceConnection::new(CONNECTION_ZIGBEE, "00:0D:6F:00:0A:90:69:E7"),
        ]);

        let normalized = normalize_connections(&connections);
        assert!(normalized.contains(&DeviceConnection::new(
            CONNECTION_NETWORK_MAC,
            "aa:bb:cc:dd:ee:ff"
        )));
        assert!(normalized.contains(&DeviceConnection::new(
            CONNECTION_ZIGBEE,
            "00:0D:6F:00:0A:90:69:E7"
        )));
    }

    #[test]
    fn test_identifier_deserialize_variants() {
        let ident: DeviceIdentifier = serde_json::from_str(r#"["hue", "bridge1"]"#).unwrap();
        assert_eq!(ident, DeviceIdentifier::new("hue", "bridge1"));

        let ident: DeviceIdentifier = serde_json::from_str(r#"["zwave", 42]"#).unwrap();
        assert_eq!(ident.id(), "42");

        let ident: DeviceIdentifier =
            serde_json::from_str(r#"["homekit", "abc", "bridge"]"#).unwrap();
        assert_eq!(ident.domain(), "homekit");
        assert_eq!(ident.id(), "abc:bridge");

        assert!(serde_json::from_str::<DeviceIdentifier>(r#"["lonely"]"#).is_err());
    }

    #[test]
    fn test_entry_accepts_legacy_connection_key() {
        let entry: DeviceEntry = serde_json::from_str(
            r#"{
                "id": "abc123",
                "connection": [["mac", "aa:bb:cc:dd:ee:ff"]],
                "identifiers": [["acme", "dev-1"]],
                "manufacturer": "Acme",
                "model": "Widget",
                "name": null,
                "sw_version": "1.0"
            }"#,
        )
        .unwrap();

        assert_eq!(entry.id, "abc123");
        assert!(entry
            .connections
            .contains(&DeviceConnection::new("mac", "aa:bb:cc:dd:ee:ff")));
        assert_eq!(entry.sw_version.as_deref(), Some("1.0"));
        assert!(entry.config_entries.is_empty());
        assert_eq!(entry.disabled_by, None);
    }

    #[test]
    fn test_new_entries_get_distinct_hex_ids() {
        let a = DeviceEntry::new("Acme", "Widget");
        let b = DeviceEntry::new("Acme", "Widget");
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 32);
        assert!(a.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_changed_fields() {
        let old = DeviceEntry::new("Acme", "Widget");
        let mut new = old.clone();
        assert!(old.changed_fields(&new).is_empty());

        new.name = Some("Kitchen".to_string());
        new.labels.insert("critical".to_string());
        new.modified_at = Utc::now();
        assert_eq!(old.changed_fields(&new), vec!["labels", "name"]);
    }

    #[test]
    fn test_display_name_prefers_user_name() {
        let mut entry = DeviceEntry::new("Acme", "Widget");
        assert_eq!(entry.display_name(), "");
        entry.name = Some("Widget 1".to_string());
        assert_eq!(entry.display_name(), "Widget 1");
        entry.name_by_user = Some("Desk lamp".to_string());
        assert_eq!(entry.display_name(), "Desk lamp");
    }

    #[test]
    fn test_deleted_entry_restores_id_and_created_at() {
        let entry = DeviceEntry::new("Acme", "Widget");
        let deleted = DeletedDeviceEntry::from(&entry);
        let restored = deleted.to_device_entry("Acme Corp", "Widget 2");

        assert_eq!(restored.id, entry.id);
        assert_eq!(restored.created_at, entry.created_at);
        assert_eq!(restored.manufacturer, "Acme Corp");
        assert!(restored.identifiers.is_empty());
    }
}
