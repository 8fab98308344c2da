//! Device registry change notifications

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device_entry::DeviceEntry;

/// Event type name of registry change notifications
pub const EVENT_DEVICE_REGISTRY_UPDATED: &str = "device_registry_updated";

/// Payload of a `device_registry_updated` event
///
/// Serialized as `{"action": "...", "device_id": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeviceRegistryEvent {
    Create {
        device_id: String,
    },
    /// `changes` maps each changed field to its value before the update
    Update {
        device_id: String,
        changes: Map<String, Value>,
    },
    Remove {
        device_id: String,
    },
}

impl DeviceRegistryEvent {
    /// Build an update event from two versions of a device
    ///
    /// Returns `None` when no stored field differs.
    pub fn update(old: &DeviceEntry, new: &DeviceEntry) -> Option<Self> {
        let fields = old.changed_fields(new);
        if fields.is_empty() {
            return None;
        }

        let old_values = match serde_json::to_value(old) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let changes = fields
            .into_iter()
            .map(|field| {
                let value = old_values.get(field).cloned().unwrap_or(Value::Null);
                (field.to_string(), value)
            })
            .collect();

        Some(Self::Update {
            device_id: new.id.clone(),
            changes,
        })
    }

    pub fn event_type(&self) -> &'static str {
        EVENT_DEVICE_REGISTRY_UPDATED
    }

    pub fn device_id(&self) -> &str {
        match self {
            Self::Create { device_id }
            | Self::Update { device_id, .. }
            | Self::Remove { device_id } => device_id,
        }
    }
}
