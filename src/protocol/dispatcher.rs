//! Wire protocol dispatcher
//!
//! Sends application messages over the attached secure channel and routes
//! incoming ones to the [`WireHandler`]. Promise-style sends carry a
//! correlation id under `args.temporaryId`; the reply carrying the same id
//! resolves the waiting [`PendingReply`].

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use rmpv::Value;
use tracing::{debug, trace, warn};

use crate::transport::SecureChannel;
use crate::types::{RelayError, Result};

use super::pending::{PendingReply, PendingRequests, Reply};
use super::wire::{Args, MessageType, SubType, WireMessage, TEMPORARY_ID_KEY};

/// Length of generated correlation ids
pub const CORRELATION_ID_LEN: usize = 8;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// What a handler made of an incoming message
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// Processed; a correlated waiter is answered from `args.success`/`args.error`
    Handled,
    /// Processed, with an explicit answer for a correlated waiter
    Reply(Reply),
    /// No route for this `(type, subType)`; dropped
    Unhandled,
}

/// Receives every well-formed incoming message
pub trait WireHandler: Send + Sync {
    fn handle(&self, message: &WireMessage) -> HandleOutcome;
}

#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// Reject correlated requests that get no reply in time
    pub request_timeout: Option<Duration>,
    /// Log every envelope sent and received
    pub msg_debugging: bool,
}

pub struct WireDispatcher {
    config: DispatcherConfig,
    channel: RwLock<Option<Arc<dyn SecureChannel>>>,
    pending: Arc<PendingRequests>,
    handler: Arc<dyn WireHandler>,
}

/// Short random base36 string
pub fn random_id() -> String {
    let mut rng = rand::thread_rng();
    (0..CORRELATION_ID_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

impl WireDispatcher {
    pub fn new(handler: Arc<dyn WireHandler>, config: DispatcherConfig) -> Self {
        Self {
            config,
            channel: RwLock::new(None),
            pending: Arc::new(PendingRequests::new()),
            handler,
        }
    }

    // =========================================================================
    // Channel
    // =========================================================================

    pub fn attach_channel(&self, channel: Arc<dyn SecureChannel>) {
        debug!(label = channel.label(), "Attaching secure channel");
        if let Ok(mut slot) = self.channel.write() {
            *slot = Some(channel);
        }
    }

    pub fn detach_channel(&self) -> Option<Arc<dyn SecureChannel>> {
        self.channel.write().ok().and_then(|mut slot| slot.take())
    }

    pub fn is_attached(&self) -> bool {
        self.channel.read().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Reject every in-flight request with [`RelayError::Stopped`]
    pub fn clear_pending(&self) -> usize {
        let count = self.pending.clear();
        if count > 0 {
            debug!(count, "Cleared pending requests");
        }
        count
    }

    // =========================================================================
    // Send path
    // =========================================================================

    fn send_message(&self, message: &WireMessage) -> Result<()> {
        let channel = self
            .channel
            .read()
            .ok()
            .and_then(|slot| slot.clone())
            .ok_or_else(|| RelayError::Transport("secure channel not open".into()))?;

        if self.config.msg_debugging {
            debug!(message = %message.to_value(), "Sending wire message");
        } else {
            trace!(
                message_type = %message.message_type,
                sub_type = %message.sub_type,
                "Sending wire message"
            );
        }

        channel.send(message.encode()?)
    }

    /// Send without expecting a reply
    pub fn post(
        &self,
        message_type: MessageType,
        sub_type: SubType,
        args: Option<Args>,
        data: Option<Value>,
    ) -> Result<()> {
        let message = WireMessage {
            message_type,
            sub_type,
            args,
            data,
        };
        self.send_message(&message)
    }

    /// Fire-and-forget `request`
    pub fn request(&self, sub_type: SubType, args: Option<Args>) -> Result<()> {
        self.post(MessageType::Request, sub_type, args, None)
    }

    /// Send a correlated message and return the future of its reply.
    ///
    /// The message is on the wire when this returns. An id supplied in
    /// `args` is used as is and refused if already pending.
    pub fn send_with_reply(
        &self,
        message_type: MessageType,
        sub_type: SubType,
        args: Option<Args>,
        data: Option<Value>,
    ) -> Result<PendingReply> {
        if message_type == MessageType::Response {
            return Err(RelayError::Protocol(
                "responses cannot wait for a reply".into(),
            ));
        }

        let mut args = args.unwrap_or_default();
        let id = match args.get(TEMPORARY_ID_KEY).and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = self.fresh_id();
                args.insert(TEMPORARY_ID_KEY.to_string(), Value::from(id.as_str()));
                id
            }
        };

        let receiver = self.pending.register(&id, sub_type.clone())?;
        let message = WireMessage {
            message_type,
            sub_type,
            args: Some(args),
            data,
        };

        if let Err(e) = self.send_message(&message) {
            self.pending.evict(&id);
            return Err(e);
        }

        Ok(PendingReply::new(
            id,
            receiver,
            self.config.request_timeout,
            self.pending.clone(),
        ))
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = random_id();
            if !self.pending.contains(&id) {
                return id;
            }
        }
    }

    // =========================================================================
    // Receive path
    // =========================================================================

    /// Decode and dispatch one frame. Bad frames are logged and dropped.
    pub fn receive(&self, bytes: &[u8]) {
        match WireMessage::decode(bytes) {
            Ok(message) => self.dispatch(message),
            Err(e) => warn!(error = %e, len = bytes.len(), "Dropping invalid wire message"),
        }
    }

    pub fn dispatch(&self, message: WireMessage) {
        if self.config.msg_debugging {
            debug!(message = %message.to_value(), "Received wire message");
        }

        let reply = match self.handler.handle(&message) {
            HandleOutcome::Unhandled => {
                warn!(
                    message_type = %message.message_type,
                    sub_type = %message.sub_type,
                    "Ignoring unhandled wire message"
                );
                return;
            }
            HandleOutcome::Reply(reply) => reply,
            HandleOutcome::Handled => reply_from_args(&message),
        };

        if let Some(id) = message.temporary_id() {
            if !self.pending.resolve(id, reply) {
                debug!(%id, "No pending request for reply, ignoring");
            }
        }
    }
}

fn reply_from_args(message: &WireMessage) -> Reply {
    if message.arg_bool("success").unwrap_or(true) {
        Ok(message.data.clone().unwrap_or(Value::Nil))
    } else {
        Err(message
            .arg_str("error")
            .unwrap_or("unknown error")
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::protocol::wire::args;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl SecureChannel for RecordingChannel {
        fn label(&self) -> &str {
            "test"
        }

        fn send(&self, payload: Vec<u8>) -> Result<()> {
            self.sent.lock().unwrap().push(payload);
            Ok(())
        }

        fn close(&self) {}
    }

    impl RecordingChannel {
        fn last(&self) -> WireMessage {
            let sent = self.sent.lock().unwrap();
            WireMessage::decode(sent.last().unwrap()).unwrap()
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<WireMessage>>,
    }

    impl WireHandler for RecordingHandler {
        fn handle(&self, message: &WireMessage) -> HandleOutcome {
            self.seen.lock().unwrap().push(message.clone());
            match message.sub_type {
                SubType::Unknown(_) => HandleOutcome::Unhandled,
                SubType::Avatar => HandleOutcome::Reply(Ok(Value::from("avatar-bytes"))),
                _ => HandleOutcome::Handled,
            }
        }
    }

    fn setup() -> (WireDispatcher, Arc<RecordingChannel>, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = WireDispatcher::new(handler.clone(), DispatcherConfig::default());
        let channel = Arc::new(RecordingChannel::default());
        dispatcher.attach_channel(channel.clone());
        (dispatcher, channel, handler)
    }

    fn reply_to(sent: &WireMessage, message_type: MessageType, extra: Args) -> WireMessage {
        let mut reply_args = extra;
        reply_args.insert(
            TEMPORARY_ID_KEY.into(),
            Value::from(sent.temporary_id().unwrap()),
        );
        WireMessage::new(message_type, sent.sub_type.clone()).with_args(reply_args)
    }

    #[test]
    fn test_random_id_is_base36() {
        let id = random_id();
        assert_eq!(id.len(), CORRELATION_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_send_without_channel_fails() {
        let dispatcher = WireDispatcher::new(
            Arc::new(RecordingHandler::default()),
            DispatcherConfig::default(),
        );
        assert!(dispatcher.request(SubType::Receivers, None).is_err());
        let result =
            dispatcher.send_with_reply(MessageType::Create, SubType::Contact, None, None);
        assert!(result.is_err());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_correlated_create_resolves() {
        let (dispatcher, channel, _) = setup();

        let reply = dispatcher
            .send_with_reply(
                MessageType::Create,
                SubType::Contact,
                Some(args([("identity", Value::from("ECHOECHO"))])),
                None,
            )
            .unwrap();
        let sent = channel.last();
        assert_eq!(sent.message_type, MessageType::Create);
        assert_eq!(sent.temporary_id(), Some(reply.id()));
        assert_eq!(dispatcher.pending_count(), 1);

        let answer = reply_to(&sent, MessageType::Create, args([("success", Value::from(true))]))
            .with_data(Value::from("created"));
        dispatcher.receive(&answer.encode().unwrap());

        assert_eq!(reply.await.unwrap(), Value::from("created"));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_reply_rejects() {
        let (dispatcher, channel, _) = setup();
        let reply = dispatcher
            .send_with_reply(MessageType::Delete, SubType::Group, None, None)
            .unwrap();

        let answer = reply_to(
            &channel.last(),
            MessageType::Delete,
            args([
                ("success", Value::from(false)),
                ("error", Value::from("notAllowed")),
            ]),
        );
        dispatcher.dispatch(answer);

        assert!(matches!(reply.await, Err(RelayError::Rejected(m)) if m == "notAllowed"));
    }

    #[tokio::test]
    async fn test_handler_reply_takes_precedence() {
        let (dispatcher, channel, _) = setup();
        let reply = dispatcher
            .send_with_reply(MessageType::Request, SubType::Avatar, None, None)
            .unwrap();

        dispatcher.dispatch(reply_to(&channel.last(), MessageType::Response, Args::new()));
        assert_eq!(reply.await.unwrap(), Value::from("avatar-bytes"));
    }

    #[test]
    fn test_supplied_duplicate_id_refused() {
        let (dispatcher, _, _) = setup();
        let fixed = || Some(args([(TEMPORARY_ID_KEY, Value::from("fixed"))]));

        let _first = dispatcher
            .send_with_reply(MessageType::Update, SubType::Contact, fixed(), None)
            .unwrap();
        let second = dispatcher.send_with_reply(MessageType::Update, SubType::Contact, fixed(), None);
        assert!(matches!(second, Err(RelayError::Protocol(_))));
        assert_eq!(dispatcher.pending_count(), 1);
    }

    #[test]
    fn test_unhandled_message_does_not_touch_pending() {
        let (dispatcher, channel, handler) = setup();
        let _reply = dispatcher
            .send_with_reply(MessageType::Update, SubType::Group, None, None)
            .unwrap();
        let sent = channel.last();

        let mut unknown = reply_to(&sent, MessageType::Update, Args::new());
        unknown.sub_type = SubType::Unknown("hologram".into());
        dispatcher.dispatch(unknown);

        assert_eq!(handler.seen.lock().unwrap().len(), 1);
        assert_eq!(dispatcher.pending_count(), 1);
    }

    #[test]
    fn test_garbage_frames_are_dropped() {
        let (dispatcher, _, handler) = setup();
        dispatcher.receive(&[0xde, 0xad]);
        dispatcher.receive(&[]);
        assert!(handler.seen.lock().unwrap().is_empty());
    }
}
