//! Incoming message handlers
//!
//! Routes each `(type, subType)` pair to the data containers and completes
//! the initialization steps the startup sequence waits for.

use std::sync::{Arc, OnceLock};

use rmpv::Value;
use tracing::{debug, error, info, warn};

use crate::protocol::wire::{from_payload, map_get, to_payload};
use crate::protocol::{
    DisconnectReason, HandleOutcome, MessageType, SubType, WireHandler, WireMessage,
};
use crate::state::StateService;

use super::data::{
    receiver_key, AppData, BatteryStatus, ALERTS_KEY, BATTERY_KEY, CLIENT_INFO_KEY, MAX_ALERTS,
    PROFILE_KEY,
};
use super::init_steps::{InitializationStep, InitializationSteps};

/// Receiver collections in a `receivers` response
const RECEIVER_TYPES: [&str; 3] = ["contact", "group", "distributionList"];

type DisconnectHook = Box<dyn Fn(DisconnectReason) + Send + Sync>;

pub struct MessageHandlers {
    data: Arc<AppData>,
    steps: Arc<InitializationSteps>,
    state: Arc<StateService>,
    disconnect_hook: OnceLock<DisconnectHook>,
}

impl MessageHandlers {
    pub fn new(
        data: Arc<AppData>,
        steps: Arc<InitializationSteps>,
        state: Arc<StateService>,
    ) -> Self {
        Self {
            data,
            steps,
            state,
            disconnect_hook: OnceLock::new(),
        }
    }

    /// Called when the device ends the session. Only the first hook sticks.
    pub fn on_disconnect(&self, hook: impl Fn(DisconnectReason) + Send + Sync + 'static) {
        if self.disconnect_hook.set(Box::new(hook)).is_err() {
            warn!("Disconnect hook already installed");
        }
    }

    fn on_connection_disconnect(&self, message: &WireMessage) {
        let Some(raw) = message.data.as_ref().and_then(|d| map_get(d, "reason")) else {
            warn!("connectionDisconnect without a reason, ignoring");
            return;
        };
        let reason = match raw.as_str().and_then(DisconnectReason::parse) {
            Some(reason) => reason,
            None => {
                error!(reason = %raw, "Unknown disconnect reason");
                DisconnectReason::SessionError
            }
        };
        info!(%reason, "Device requested disconnect");
        match self.disconnect_hook.get() {
            Some(hook) => hook(reason),
            None => debug!("No disconnect hook installed"),
        }
    }

    // =========================================================================
    // Responses
    // =========================================================================

    fn on_response(&self, message: &WireMessage) -> HandleOutcome {
        match &message.sub_type {
            SubType::ClientInfo => {
                match &message.data {
                    Some(info) => self.data.device.set(CLIENT_INFO_KEY, info.clone()),
                    None => warn!("clientInfo response without data"),
                }
                self.steps.register(InitializationStep::ClientInfo);
                HandleOutcome::Handled
            }
            SubType::Profile => {
                if let Some(profile) = &message.data {
                    self.data.device.set(PROFILE_KEY, profile.clone());
                }
                HandleOutcome::Handled
            }
            SubType::Receivers => {
                if let Some(data) = &message.data {
                    self.store_receivers(data);
                }
                self.steps.register(InitializationStep::Receivers);
                HandleOutcome::Handled
            }
            SubType::Conversations => {
                let conversations = match &message.data {
                    Some(Value::Array(list)) => list.clone(),
                    _ => {
                        warn!("conversations response without a list");
                        Vec::new()
                    }
                };
                // Conversations reference receivers, so they wait for them
                let data = self.data.clone();
                let steps = self.steps.clone();
                let state = self.state.clone();
                self.steps
                    .run_after(&[InitializationStep::Receivers], move || {
                        let unread = store_conversations(&data, conversations);
                        state.set_unread_count(unread);
                        steps.register(InitializationStep::Conversations);
                    });
                HandleOutcome::Handled
            }
            SubType::Messages => {
                let key = match self.receiver_key_from_args(message) {
                    Some(key) => key,
                    None => return HandleOutcome::Reply(Err("invalidReceiver".into())),
                };
                if let Some(Value::Array(list)) = &message.data {
                    self.data.messages.extend(&key, list.clone());
                }
                HandleOutcome::Handled
            }
            SubType::Avatar => {
                if let (Some(key), Some(avatar)) =
                    (self.receiver_key_from_args(message), &message.data)
                {
                    self.data.avatars.set(&key, avatar.clone());
                }
                HandleOutcome::Reply(Ok(message.data.clone().unwrap_or(Value::Nil)))
            }
            SubType::Thumbnail | SubType::Blob | SubType::ContactDetail => {
                if message.arg_bool("success") == Some(false) {
                    HandleOutcome::Handled
                } else {
                    HandleOutcome::Reply(Ok(message.data.clone().unwrap_or(Value::Nil)))
                }
            }
            SubType::BatteryStatus => {
                self.set_battery(message);
                HandleOutcome::Handled
            }
            // Plain acknowledgements of promise-style sends
            SubType::Read | SubType::KeyPersisted | SubType::Ack | SubType::GroupSync => {
                HandleOutcome::Handled
            }
            _ => HandleOutcome::Unhandled,
        }
    }

    // =========================================================================
    // Updates
    // =========================================================================

    fn on_update(&self, message: &WireMessage) -> HandleOutcome {
        match &message.sub_type {
            SubType::Receiver | SubType::Contact | SubType::Group | SubType::DistributionList => {
                self.apply_receiver_update(message);
                HandleOutcome::Handled
            }
            SubType::Conversation => {
                let key = match self.receiver_key_from_args(message) {
                    Some(key) => key,
                    None => return HandleOutcome::Handled,
                };
                match (message.arg_str("mode"), &message.data) {
                    (Some("removed"), _) => {
                        self.data.conversations.remove(&key);
                    }
                    (_, Some(conversation)) => self.data.conversations.set(&key, conversation.clone()),
                    _ => warn!(%key, "conversation update without data"),
                }
                HandleOutcome::Handled
            }
            SubType::Message => {
                let key = match self.receiver_key_from_args(message) {
                    Some(key) => key,
                    None => return HandleOutcome::Handled,
                };
                let mode = message.arg_str("mode").unwrap_or("new");
                match &message.data {
                    Some(Value::Array(list)) => {
                        for entry in list {
                            self.apply_message(&key, mode, entry);
                        }
                    }
                    Some(entry) => self.apply_message(&key, mode, entry),
                    None => warn!(%key, "message update without data"),
                }
                HandleOutcome::Handled
            }
            SubType::Typing => {
                let identity = message.arg_str("id");
                let typing = message
                    .data
                    .as_ref()
                    .and_then(|d| map_get(d, "isTyping"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                match identity {
                    Some(id) if typing => self.data.typing.set(id, Value::from(true)),
                    Some(id) => {
                        self.data.typing.remove(id);
                    }
                    None => warn!("typing update without identity"),
                }
                HandleOutcome::Handled
            }
            SubType::Avatar => {
                if let Some(key) = self.receiver_key_from_args(message) {
                    match &message.data {
                        Some(avatar) => self.data.avatars.set(&key, avatar.clone()),
                        None => {
                            self.data.avatars.remove(&key);
                        }
                    }
                }
                HandleOutcome::Handled
            }
            SubType::Profile => {
                if let Some(profile) = &message.data {
                    self.data.device.set(PROFILE_KEY, profile.clone());
                }
                HandleOutcome::Handled
            }
            SubType::BatteryStatus => {
                self.set_battery(message);
                HandleOutcome::Handled
            }
            SubType::ConnectionDisconnect => {
                self.on_connection_disconnect(message);
                HandleOutcome::Handled
            }
            SubType::Alert => {
                let alert = message.data.clone().unwrap_or(Value::Nil);
                info!(alert = %alert, "Alert from device");
                self.data.alerts.extend_capped(ALERTS_KEY, vec![alert], MAX_ALERTS);
                HandleOutcome::Handled
            }
            SubType::Read | SubType::KeyPersisted | SubType::GroupSync | SubType::Ack => {
                HandleOutcome::Handled
            }
            _ => HandleOutcome::Unhandled,
        }
    }

    // =========================================================================
    // Create / Delete replies
    // =========================================================================

    fn on_create(&self, message: &WireMessage) -> HandleOutcome {
        match &message.sub_type {
            SubType::TextMessage | SubType::FileMessage => HandleOutcome::Handled,
            SubType::Contact | SubType::Group | SubType::DistributionList => {
                if message.arg_bool("success").unwrap_or(true) {
                    self.apply_receiver_update(message);
                }
                HandleOutcome::Handled
            }
            _ => HandleOutcome::Unhandled,
        }
    }

    fn on_delete(&self, message: &WireMessage) -> HandleOutcome {
        let succeeded = message.arg_bool("success").unwrap_or(true);
        match &message.sub_type {
            SubType::Message => {
                if let (true, Some(key), Some(id)) =
                    (succeeded, self.receiver_key_from_args(message), message.arg("messageId"))
                {
                    self.data.messages.remove_from(&key, id);
                }
                HandleOutcome::Handled
            }
            SubType::Group | SubType::DistributionList | SubType::Contact => {
                if let (true, Some(key)) = (succeeded, self.receiver_key_from_args(message)) {
                    self.data.receivers.remove(&key);
                    self.data.conversations.remove(&key);
                    self.data.messages.remove(&key);
                }
                HandleOutcome::Handled
            }
            SubType::CleanReceiver => {
                if let (true, Some(key)) = (succeeded, self.receiver_key_from_args(message)) {
                    self.data.messages.remove(&key);
                }
                HandleOutcome::Handled
            }
            _ => HandleOutcome::Unhandled,
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn receiver_key_from_args(&self, message: &WireMessage) -> Option<String> {
        let receiver_type = message
            .arg_str("type")
            .or_else(|| implied_receiver_type(&message.sub_type))?;
        let id = message.arg_str("id")?;
        Some(receiver_key(receiver_type, id))
    }

    fn store_receivers(&self, data: &Value) {
        for receiver_type in RECEIVER_TYPES {
            if let Some(Value::Array(list)) = map_get(data, receiver_type) {
                for receiver in list {
                    match map_get(receiver, "id").and_then(Value::as_str) {
                        Some(id) => self
                            .data
                            .receivers
                            .set(&receiver_key(receiver_type, id), receiver.clone()),
                        None => warn!(receiver_type, "receiver without id"),
                    }
                }
            }
        }
        debug!(count = self.data.receivers.len(), "Stored receivers");
    }

    fn apply_receiver_update(&self, message: &WireMessage) {
        let key = match self.receiver_key_from_args(message) {
            Some(key) => key,
            None => {
                warn!(sub_type = %message.sub_type, "receiver update without type/id");
                return;
            }
        };
        match (message.arg_str("mode"), &message.data) {
            (Some("removed"), _) => {
                self.data.receivers.remove(&key);
            }
            (_, Some(receiver)) => self.data.receivers.set(&key, receiver.clone()),
            _ => {}
        }
    }

    fn apply_message(&self, key: &str, mode: &str, entry: &Value) {
        match mode {
            "removed" => {
                if let Some(id) = map_get(entry, "id") {
                    self.data.messages.remove_from(key, id);
                }
            }
            _ => self.data.messages.upsert_in(key, entry.clone()),
        }
    }

    fn set_battery(&self, message: &WireMessage) {
        let Some(raw) = message.data.clone() else {
            return;
        };
        let status = match from_payload::<BatteryStatus>(raw) {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed battery status");
                return;
            }
        };
        match to_payload(&status) {
            Ok(value) => self.data.device.set(BATTERY_KEY, value),
            Err(e) => warn!(error = %e, "Could not store battery status"),
        }
    }
}

fn implied_receiver_type(sub_type: &SubType) -> Option<&'static str> {
    match sub_type {
        SubType::Contact => Some("contact"),
        SubType::Group => Some("group"),
        SubType::DistributionList => Some("distributionList"),
        _ => None,
    }
}

fn store_conversations(data: &AppData, conversations: Vec<Value>) -> u32 {
    let mut unread = 0u32;
    for conversation in conversations {
        let receiver_type = map_get(&conversation, "type").and_then(Value::as_str);
        let id = map_get(&conversation, "id").and_then(Value::as_str);
        let (Some(receiver_type), Some(id)) = (receiver_type, id) else {
            warn!("conversation without type/id");
            continue;
        };
        let key = receiver_key(receiver_type, id);
        let count = map_get(&conversation, "unreadCount")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        unread = unread.saturating_add(u32::try_from(count).unwrap_or(u32::MAX));
        data.conversations.set(&key, conversation);
    }
    unread
}

impl WireHandler for MessageHandlers {
    fn handle(&self, message: &WireMessage) -> HandleOutcome {
        match message.message_type {
            MessageType::Response => self.on_response(message),
            MessageType::Update => self.on_update(message),
            MessageType::Create => self.on_create(message),
            MessageType::Delete => self.on_delete(message),
            MessageType::Request => {
                debug!(sub_type = %message.sub_type, "Peer sent a request, not supported");
                HandleOutcome::Unhandled
            }
        }
    }
}
