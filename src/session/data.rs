//! In-memory data containers
//!
//! The application data itself is opaque here: every container is a keyed
//! store of wire values with `get`/`set`/`extend`.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use rmpv::Value;
use serde::{Deserialize, Serialize};

use crate::protocol::wire::{from_payload, map_get};

/// Keyed store of wire values
#[derive(Debug, Default)]
pub struct Container {
    items: RwLock<BTreeMap<String, Value>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.items.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Value>> {
        self.items.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value) {
        self.write().insert(key.to_string(), value);
    }

    /// Append to the list stored under `key`, creating it if needed.
    /// A non-list value under `key` is replaced.
    pub fn extend(&self, key: &str, values: Vec<Value>) {
        let mut items = self.write();
        match items.get_mut(key) {
            Some(Value::Array(existing)) => existing.extend(values),
            _ => {
                items.insert(key.to_string(), Value::Array(values));
            }
        }
    }

    /// Like [`Container::extend`], keeping only the newest `max` entries
    pub fn extend_capped(&self, key: &str, values: Vec<Value>, max: usize) {
        let mut items = self.write();
        let list = items
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !matches!(list, Value::Array(_)) {
            *list = Value::Array(Vec::new());
        }
        if let Value::Array(entries) = list {
            entries.extend(values);
            let excess = entries.len().saturating_sub(max);
            entries.drain(..excess);
        }
    }

    /// Replace the list entry whose `id` matches, or append it
    pub fn upsert_in(&self, key: &str, value: Value) {
        let id = map_get(&value, "id").cloned();
        let mut items = self.write();
        let list = items
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(entries) = list {
            let position = id
                .as_ref()
                .and_then(|id| entries.iter().position(|e| map_get(e, "id") == Some(id)));
            match position {
                Some(index) => entries[index] = value,
                None => entries.push(value),
            }
        }
    }

    /// Remove the list entry with the given `id`
    pub fn remove_from(&self, key: &str, id: &Value) -> bool {
        let mut items = self.write();
        if let Some(Value::Array(entries)) = items.get_mut(key) {
            let before = entries.len();
            entries.retain(|e| map_get(e, "id") != Some(id));
            return entries.len() != before;
        }
        false
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.write().remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }
}

/// Key of a receiver: `<type>:<id>`
pub fn receiver_key(receiver_type: &str, id: &str) -> String {
    format!("{receiver_type}:{id}")
}

/// Everything mirrored from the device
#[derive(Debug, Default)]
pub struct AppData {
    /// Single entries under [`CLIENT_INFO_KEY`], [`PROFILE_KEY`], [`BATTERY_KEY`]
    pub device: Container,
    /// Contacts, groups and distribution lists by receiver key
    pub receivers: Container,
    /// Conversations by receiver key
    pub conversations: Container,
    /// Message lists by receiver key
    pub messages: Container,
    /// Typing flags by contact identity
    pub typing: Container,
    /// Avatars by receiver key
    pub avatars: Container,
    /// Alerts raised by the device, under [`ALERTS_KEY`]
    pub alerts: Container,
}

pub const CLIENT_INFO_KEY: &str = "clientInfo";
pub const PROFILE_KEY: &str = "profile";
pub const BATTERY_KEY: &str = "batteryStatus";
pub const ALERTS_KEY: &str = "alerts";

/// Unconsumed alerts kept before the oldest are dropped
pub const MAX_ALERTS: usize = 32;

/// Battery state as reported by the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryStatus {
    /// Charge level, absent when the device cannot tell
    pub percent: Option<u8>,
    pub is_charging: bool,
}

impl AppData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last battery status, if one was received
    pub fn battery(&self) -> Option<BatteryStatus> {
        self.device
            .get(BATTERY_KEY)
            .and_then(|value| from_payload(value).ok())
    }

    /// Hand out the pending alerts, oldest first, and forget them
    pub fn take_alerts(&self) -> Vec<Value> {
        match self.alerts.remove(ALERTS_KEY) {
            Some(Value::Array(alerts)) => alerts,
            _ => Vec::new(),
        }
    }

    /// Indicators cannot be trusted across a connection gap
    pub fn clear_typing(&self) {
        self.typing.clear();
    }

    pub fn clear(&self) {
        self.device.clear();
        self.receivers.clear();
        self.conversations.clear();
        self.messages.clear();
        self.typing.clear();
        self.avatars.clear();
        self.alerts.clear();
    }
}
