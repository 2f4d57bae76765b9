//! Application calls on top of the dispatcher
//!
//! Thin wrappers that shape `args`/`data` for the device. Promise-style
//! calls return a [`PendingReply`]; the rest are fire-and-forget.

use rmpv::Value;

use crate::protocol::{args, Args, MessageType, PendingReply, SubType};
use crate::types::Result;

use super::orchestrator::Session;

/// Kind of conversation partner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverType {
    Contact,
    Group,
    DistributionList,
}

impl ReceiverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Group => "group",
            Self::DistributionList => "distributionList",
        }
    }
}

/// A conversation partner
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receiver {
    pub kind: ReceiverType,
    pub id: String,
}

impl Receiver {
    pub fn new(kind: ReceiverType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn contact(identity: impl Into<String>) -> Self {
        Self::new(ReceiverType::Contact, identity)
    }

    fn args(&self) -> Args {
        args([
            ("type", Value::from(self.kind.as_str())),
            ("id", Value::from(self.id.as_str())),
        ])
    }

    fn args_with<const N: usize>(&self, extra: [(&str, Value); N]) -> Args {
        let mut all = self.args();
        all.extend(extra.into_iter().map(|(k, v)| (k.to_string(), v)));
        all
    }
}

fn map(pairs: Vec<(&str, Value)>) -> Value {
    Value::Map(pairs.into_iter().map(|(k, v)| (Value::from(k), v)).collect())
}

impl Session {
    // =========================================================================
    // Messages
    // =========================================================================

    pub fn send_text_message(&self, receiver: &Receiver, text: &str) -> Result<PendingReply> {
        self.inner.dispatcher.send_with_reply(
            MessageType::Create,
            SubType::TextMessage,
            Some(receiver.args()),
            Some(map(vec![("text", Value::from(text))])),
        )
    }

    pub fn send_file_message(
        &self,
        receiver: &Receiver,
        name: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<PendingReply> {
        let size = bytes.len() as u64;
        self.inner.dispatcher.send_with_reply(
            MessageType::Create,
            SubType::FileMessage,
            Some(receiver.args()),
            Some(map(vec![
                ("name", Value::from(name)),
                ("fileType", Value::from(mime_type)),
                ("size", Value::from(size)),
                ("data", Value::Binary(bytes)),
            ])),
        )
    }

    /// Load messages, older than `ref_msg_id` when given
    pub fn request_messages(&self, receiver: &Receiver, ref_msg_id: Option<&str>) -> Result<()> {
        let mut request_args = receiver.args();
        if let Some(reference) = ref_msg_id {
            request_args.insert("refMsgId".into(), Value::from(reference));
        }
        self.inner
            .dispatcher
            .request(SubType::Messages, Some(request_args))
    }

    pub fn delete_message(&self, receiver: &Receiver, message_id: &str) -> Result<PendingReply> {
        self.inner.dispatcher.send_with_reply(
            MessageType::Delete,
            SubType::Message,
            Some(receiver.args_with([("messageId", Value::from(message_id))])),
            None,
        )
    }

    pub fn mark_read(&self, receiver: &Receiver, message_id: &str) -> Result<()> {
        self.inner.dispatcher.request(
            SubType::Read,
            Some(receiver.args_with([("messageId", Value::from(message_id))])),
        )
    }

    /// Agree (`true`) or disagree with a message
    pub fn ack_message(&self, receiver: &Receiver, message_id: &str, acknowledged: bool) -> Result<()> {
        self.inner.dispatcher.request(
            SubType::Ack,
            Some(receiver.args_with([
                ("messageId", Value::from(message_id)),
                ("acknowledged", Value::from(acknowledged)),
            ])),
        )
    }

    pub fn send_typing(&self, receiver: &Receiver, is_typing: bool) -> Result<()> {
        self.inner.dispatcher.post(
            MessageType::Update,
            SubType::Typing,
            Some(receiver.args()),
            Some(map(vec![("isTyping", Value::from(is_typing))])),
        )
    }

    // =========================================================================
    // Media
    // =========================================================================

    pub fn request_avatar(&self, receiver: &Receiver, high_resolution: bool) -> Result<PendingReply> {
        self.inner.dispatcher.send_with_reply(
            MessageType::Request,
            SubType::Avatar,
            Some(receiver.args_with([("highResolution", Value::from(high_resolution))])),
            None,
        )
    }

    pub fn request_thumbnail(&self, receiver: &Receiver, message_id: &str) -> Result<PendingReply> {
        self.inner.dispatcher.send_with_reply(
            MessageType::Request,
            SubType::Thumbnail,
            Some(receiver.args_with([("messageId", Value::from(message_id))])),
            None,
        )
    }

    pub fn request_blob(&self, receiver: &Receiver, message_id: &str) -> Result<PendingReply> {
        self.inner.dispatcher.send_with_reply(
            MessageType::Request,
            SubType::Blob,
            Some(receiver.args_with([("messageId", Value::from(message_id))])),
            None,
        )
    }

    // =========================================================================
    // Contacts, groups, distribution lists
    // =========================================================================

    pub fn add_contact(&self, identity: &str) -> Result<PendingReply> {
        self.inner.dispatcher.send_with_reply(
            MessageType::Create,
            SubType::Contact,
            Some(args([("identity", Value::from(identity))])),
            None,
        )
    }

    pub fn request_contact_detail(&self, identity: &str) -> Result<PendingReply> {
        self.inner.dispatcher.send_with_reply(
            MessageType::Request,
            SubType::ContactDetail,
            Some(args([("identity", Value::from(identity))])),
            None,
        )
    }

    pub fn create_group(&self, name: Option<&str>, members: &[String]) -> Result<PendingReply> {
        let mut data = vec![(
            "members",
            Value::Array(members.iter().map(|m| Value::from(m.as_str())).collect()),
        )];
        if let Some(name) = name {
            data.push(("name", Value::from(name)));
        }
        self.inner.dispatcher.send_with_reply(
            MessageType::Create,
            SubType::Group,
            None,
            Some(map(data)),
        )
    }

    /// Leave a group but keep its history
    pub fn leave_group(&self, group_id: &str) -> Result<PendingReply> {
        self.delete_group_with(group_id, "leave")
    }

    pub fn delete_group(&self, group_id: &str) -> Result<PendingReply> {
        self.delete_group_with(group_id, "delete")
    }

    fn delete_group_with(&self, group_id: &str, delete_type: &str) -> Result<PendingReply> {
        self.inner.dispatcher.send_with_reply(
            MessageType::Delete,
            SubType::Group,
            Some(args([
                ("id", Value::from(group_id)),
                ("deleteType", Value::from(delete_type)),
            ])),
            None,
        )
    }

    pub fn sync_group(&self, group_id: &str) -> Result<PendingReply> {
        self.inner.dispatcher.send_with_reply(
            MessageType::Request,
            SubType::GroupSync,
            Some(args([("id", Value::from(group_id))])),
            None,
        )
    }

    pub fn create_distribution_list(&self, name: &str, members: &[String]) -> Result<PendingReply> {
        self.inner.dispatcher.send_with_reply(
            MessageType::Create,
            SubType::DistributionList,
            None,
            Some(map(vec![
                ("name", Value::from(name)),
                (
                    "members",
                    Value::Array(members.iter().map(|m| Value::from(m.as_str())).collect()),
                ),
            ])),
        )
    }

    pub fn delete_distribution_list(&self, list_id: &str) -> Result<PendingReply> {
        self.inner.dispatcher.send_with_reply(
            MessageType::Delete,
            SubType::DistributionList,
            Some(args([("id", Value::from(list_id))])),
            None,
        )
    }

    /// Drop every message of a conversation on the device
    pub fn clean_receiver_conversation(&self, receiver: &Receiver) -> Result<PendingReply> {
        self.inner.dispatcher.send_with_reply(
            MessageType::Delete,
            SubType::CleanReceiver,
            Some(receiver.args()),
            None,
        )
    }

    // =========================================================================
    // Device
    // =========================================================================

    /// Tell the device the trusted key was saved here
    pub fn send_key_persisted(&self) -> Result<()> {
        self.inner.dispatcher.request(SubType::KeyPersisted, None)
    }

    pub fn request_battery_status(&self) -> Result<()> {
        self.inner.dispatcher.request(SubType::BatteryStatus, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receiver_args_carry_type_and_id() {
        let receiver = Receiver::new(ReceiverType::DistributionList, "42");
        let built = receiver.args_with([("messageId", Value::from("m1"))]);
        assert_eq!(built.get("type").and_then(Value::as_str), Some("distributionList"));
        assert_eq!(built.get("id").and_then(Value::as_str), Some("42"));
        assert_eq!(built.get("messageId").and_then(Value::as_str), Some("m1"));
    }
}
