//! Wire message envelope
//!
//! Every application message is a MessagePack map:
//!
//! ```text
//! { "type": "request"|"response"|"create"|"update"|"delete",
//!   "subType": <entity>, "args": {..}?, "data": <payload>? }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use rmpv::Value;

use crate::types::{RelayError, Result};

/// Reserved `args` key carrying the correlation id
pub const TEMPORARY_ID_KEY: &str = "temporaryId";

/// Message arguments, a flat map of primitives
pub type Args = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request,
    Response,
    Create,
    Update,
    Delete,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity a message is about
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubType {
    Receiver,
    Receivers,
    Conversation,
    Conversations,
    Message,
    Messages,
    Avatar,
    Thumbnail,
    Blob,
    Typing,
    Read,
    ClientInfo,
    Profile,
    Contact,
    ContactDetail,
    Group,
    GroupSync,
    DistributionList,
    Alert,
    BatteryStatus,
    CleanReceiver,
    KeyPersisted,
    Ack,
    TextMessage,
    FileMessage,
    ConnectionDisconnect,
    /// Sent by newer peers; handled as a soft failure
    Unknown(String),
}

impl SubType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Receiver => "receiver",
            Self::Receivers => "receivers",
            Self::Conversation => "conversation",
            Self::Conversations => "conversations",
            Self::Message => "message",
            Self::Messages => "messages",
            Self::Avatar => "avatar",
            Self::Thumbnail => "thumbnail",
            Self::Blob => "blob",
            Self::Typing => "typing",
            Self::Read => "read",
            Self::ClientInfo => "clientInfo",
            Self::Profile => "profile",
            Self::Contact => "contact",
            Self::ContactDetail => "contactDetail",
            Self::Group => "group",
            Self::GroupSync => "groupSync",
            Self::DistributionList => "distributionList",
            Self::Alert => "alert",
            Self::BatteryStatus => "batteryStatus",
            Self::CleanReceiver => "cleanReceiverConversation",
            Self::KeyPersisted => "keyPersisted",
            Self::Ack => "ack",
            Self::TextMessage => "textMessage",
            Self::FileMessage => "fileMessage",
            Self::ConnectionDisconnect => "connectionDisconnect",
            Self::Unknown(other) => other.as_str(),
        }
    }
}

impl From<&str> for SubType {
    fn from(value: &str) -> Self {
        match value {
            "receiver" => Self::Receiver,
            "receivers" => Self::Receivers,
            "conversation" => Self::Conversation,
            "conversations" => Self::Conversations,
            "message" => Self::Message,
            "messages" => Self::Messages,
            "avatar" => Self::Avatar,
            "thumbnail" => Self::Thumbnail,
            "blob" => Self::Blob,
            "typing" => Self::Typing,
            "read" => Self::Read,
            "clientInfo" => Self::ClientInfo,
            "profile" => Self::Profile,
            "contact" => Self::Contact,
            "contactDetail" => Self::ContactDetail,
            "group" => Self::Group,
            "groupSync" => Self::GroupSync,
            "distributionList" => Self::DistributionList,
            "alert" => Self::Alert,
            "batteryStatus" => Self::BatteryStatus,
            "cleanReceiverConversation" | "cleanReceiver" => Self::CleanReceiver,
            "keyPersisted" => Self::KeyPersisted,
            "ack" => Self::Ack,
            "textMessage" => Self::TextMessage,
            "fileMessage" => Self::FileMessage,
            "connectionDisconnect" => Self::ConnectionDisconnect,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for SubType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason carried by a `connectionDisconnect` update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Session ended, may be resumed with the trusted key
    SessionStopped,
    /// Session and its trusted key are gone for good
    SessionDeleted,
    /// Web access was turned off on the device
    WebclientDisabled,
    /// Another browser took the session over
    SessionReplaced,
    SessionError,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStopped => "stop",
            Self::SessionDeleted => "delete",
            Self::WebclientDisabled => "disable",
            Self::SessionReplaced => "replace",
            Self::SessionError => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stop" => Some(Self::SessionStopped),
            "delete" => Some(Self::SessionDeleted),
            "disable" => Some(Self::WebclientDisabled),
            "replace" => Some(Self::SessionReplaced),
            "error" => Some(Self::SessionError),
            _ => None,
        }
    }

    /// Whether the session cannot be resumed afterwards
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            Self::SessionDeleted | Self::SessionReplaced | Self::SessionError
        )
    }

    /// Payload of the `connectionDisconnect` update
    pub fn to_data(&self) -> Value {
        Value::Map(vec![(Value::from("reason"), Value::from(self.as_str()))])
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an incoming frame was not turned into a message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("not a MessagePack map: {0}")]
    Malformed(String),

    #[error("missing type")]
    MissingType,

    #[error("missing subType")]
    MissingSubType,

    #[error("unknown type {0:?}")]
    UnknownType(String),
}

/// One application protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub message_type: MessageType,
    pub sub_type: SubType,
    pub args: Option<Args>,
    pub data: Option<Value>,
}

impl WireMessage {
    pub fn new(message_type: MessageType, sub_type: SubType) -> Self {
        Self {
            message_type,
            sub_type,
            args: None,
            data: None,
        }
    }

    pub fn with_args(mut self, args: Args) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn arg(&self, key: &str) -> Option<&Value> {
        self.args.as_ref().and_then(|args| args.get(key))
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.arg(key).and_then(Value::as_str)
    }

    pub fn arg_bool(&self, key: &str) -> Option<bool> {
        self.arg(key).and_then(Value::as_bool)
    }

    /// Correlation id, if the message carries one
    pub fn temporary_id(&self) -> Option<&str> {
        self.arg_str(TEMPORARY_ID_KEY)
    }

    pub fn to_value(&self) -> Value {
        let mut entries = vec![
            (Value::from("type"), Value::from(self.message_type.as_str())),
            (Value::from("subType"), Value::from(self.sub_type.as_str())),
        ];
        if let Some(args) = &self.args {
            let map = args
                .iter()
                .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
                .collect();
            entries.push((Value::from("args"), Value::Map(map)));
        }
        if let Some(data) = &self.data {
            entries.push((Value::from("data"), data.clone()));
        }
        Value::Map(entries)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &self.to_value())?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, DecodeError> {
        let mut reader = bytes;
        let value = rmpv::decode::read_value(&mut reader)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> std::result::Result<Self, DecodeError> {
        let entries = match value {
            Value::Map(entries) => entries,
            other => return Err(DecodeError::Malformed(format!("found {other}"))),
        };

        let mut message_type = None;
        let mut sub_type = None;
        let mut args = None;
        let mut data = None;

        for (key, value) in entries {
            match key.as_str() {
                Some("type") => message_type = value.as_str().map(str::to_string),
                Some("subType") => sub_type = value.as_str().map(SubType::from),
                Some("args") => args = args_from_value(value),
                Some("data") => data = Some(value),
                _ => {}
            }
        }

        let message_type = message_type.ok_or(DecodeError::MissingType)?;
        let sub_type = sub_type.ok_or(DecodeError::MissingSubType)?;
        let message_type =
            MessageType::parse(&message_type).ok_or(DecodeError::UnknownType(message_type))?;

        Ok(Self {
            message_type,
            sub_type,
            args,
            data,
        })
    }
}

fn args_from_value(value: Value) -> Option<Args> {
    match value {
        Value::Map(entries) => Some(
            entries
                .into_iter()
                .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v)))
                .collect(),
        ),
        Value::Nil => None,
        _ => None,
    }
}

/// Look up a string key in a MessagePack map value
pub fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value
        .as_map()?
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

/// Build `args` from string/value pairs
pub fn args<I, K>(pairs: I) -> Args
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Turn a typed payload into a wire value, structs as maps
pub fn to_payload<T: serde::Serialize>(payload: &T) -> Result<Value> {
    let bytes = rmp_serde::to_vec_named(payload)?;
    rmpv::decode::read_value(&mut bytes.as_slice()).map_err(RelayError::from)
}

/// Read a typed payload from a wire value
pub fn from_payload<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, &value)?;
    rmp_serde::from_slice(&bytes).map_err(RelayError::from)
}
