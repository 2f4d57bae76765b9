//! Scripted collaborators for session scenarios
//!
//! The mock transport never talks to a network. Tests drive it by pushing
//! [`TransportEvent`]s through the sender the session handed to the factory,
//! and inspect what the session did through the recorded calls.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rmpv::Value;

use webrelay::keystore::{KdfSettings, TrustedKeyStore};
use webrelay::protocol::{DisconnectReason, MessageType, SubType, WireMessage};
use webrelay::push::{PushNotifier, PushRequest, PushService};
use webrelay::session::{Frontend, Session, SessionConfig, WelcomeParams};
use webrelay::state::{ConnectionBuildupState, TaskConnectionState};
use webrelay::storage::{KeyValueStore, MemoryStore, StorageHandle};
use webrelay::transport::{
    ChannelEvent, ChosenTask, EventSender, InitiatorParams, PeerConnection, SecureChannel,
    SignalingTransport, TransportEvent, TransportFactory,
};
use webrelay::types::Result;

pub const PEER_KEY: [u8; 32] = [7u8; 32];

// =============================================================================
// Secure channel
// =============================================================================

#[derive(Default)]
pub struct MockChannel {
    pub sent: Mutex<Vec<Vec<u8>>>,
    pub closed: AtomicBool,
}

impl MockChannel {
    /// Decoded copies of everything sent so far
    pub fn sent_messages(&self) -> Vec<WireMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| WireMessage::decode(bytes).unwrap())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SecureChannel for MockChannel {
    fn label(&self) -> &str {
        "mock"
    }

    fn send(&self, payload: Vec<u8>) -> Result<()> {
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Peer connection
// =============================================================================

#[derive(Default)]
pub struct MockPeer {
    pub channel: Arc<MockChannel>,
    pub closed: AtomicBool,
}

#[async_trait]
impl PeerConnection for MockPeer {
    fn open_secure_channel(&self, _label: &str) -> Result<Arc<dyn SecureChannel>> {
        Ok(self.channel.clone())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Signaling transport
// =============================================================================

pub struct MockTransport {
    pub params: InitiatorParams,
    pub events: EventSender,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub handovers: AtomicUsize,
    pub applications: Mutex<Vec<Value>>,
    pub peer: Mutex<Option<Arc<MockPeer>>>,
    pub relayed: Arc<MockChannel>,
}

impl MockTransport {
    pub fn emit(&self, event: TransportEvent) {
        self.events.send(event).unwrap();
    }

    /// Feed a wire message into the session as if the device sent it
    pub fn deliver(&self, message: WireMessage) {
        self.emit(TransportEvent::Channel(ChannelEvent::Message(
            message.encode().unwrap(),
        )));
    }

    /// Channel the session talks through, whichever task was chosen
    pub fn channel(&self) -> Arc<MockChannel> {
        match self.peer.lock().unwrap().as_ref() {
            Some(peer) => peer.channel.clone(),
            None => self.relayed.clone(),
        }
    }
}

impl SignalingTransport for MockTransport {
    fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn create_peer_connection(&self) -> Result<Arc<dyn PeerConnection>> {
        let peer = Arc::new(MockPeer::default());
        *self.peer.lock().unwrap() = Some(peer.clone());
        Ok(peer)
    }

    fn handover(&self, _peer: &Arc<dyn PeerConnection>) -> Result<()> {
        self.handovers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn relayed_channel(&self) -> Result<Arc<dyn SecureChannel>> {
        Ok(self.relayed.clone())
    }

    fn send_application(&self, message: Value) -> Result<()> {
        self.applications.lock().unwrap().push(message);
        Ok(())
    }

    fn peer_permanent_key(&self) -> Option<[u8; 32]> {
        Some(PEER_KEY)
    }
}

#[derive(Default)]
pub struct MockFactory {
    pub created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<MockTransport> {
        self.created.lock().unwrap().last().cloned().unwrap()
    }

    pub fn get(&self, index: usize) -> Arc<MockTransport> {
        self.created.lock().unwrap()[index].clone()
    }
}

impl TransportFactory for MockFactory {
    fn create_initiator(
        &self,
        params: InitiatorParams,
        events: EventSender,
    ) -> Result<Arc<dyn SignalingTransport>> {
        let transport = Arc::new(MockTransport {
            params,
            events,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            handovers: AtomicUsize::new(0),
            applications: Mutex::new(Vec::new()),
            peer: Mutex::new(None),
            relayed: Arc::new(MockChannel::default()),
        });
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

// =============================================================================
// Frontend and push
// =============================================================================

#[derive(Default)]
pub struct RecordingFrontend {
    pub navigations: Mutex<Vec<Option<WelcomeParams>>>,
    pub notification_inits: AtomicUsize,
    pub disconnects: Mutex<Vec<DisconnectReason>>,
}

impl RecordingFrontend {
    pub fn navigations(&self) -> Vec<Option<WelcomeParams>> {
        self.navigations.lock().unwrap().clone()
    }

    pub fn disconnects(&self) -> Vec<DisconnectReason> {
        self.disconnects.lock().unwrap().clone()
    }
}

impl Frontend for RecordingFrontend {
    fn navigate_to_welcome(&self, params: Option<WelcomeParams>) {
        self.navigations.lock().unwrap().push(params);
    }

    fn init_notifications(&self) {
        self.notification_inits.fetch_add(1, Ordering::SeqCst);
    }

    fn peer_disconnected(&self, reason: DisconnectReason) {
        self.disconnects.lock().unwrap().push(reason);
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: AtomicUsize,
}

#[async_trait]
impl PushNotifier for RecordingNotifier {
    async fn notify(&self, _request: &PushRequest) -> Result<bool> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub session: Session,
    pub factory: Arc<MockFactory>,
    pub frontend: Arc<RecordingFrontend>,
    pub notifier: Arc<RecordingNotifier>,
    pub storage: Arc<MemoryStore>,
    pub buildups: Arc<Mutex<Vec<ConnectionBuildupState>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let factory = Arc::new(MockFactory::default());
        let frontend = Arc::new(RecordingFrontend::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let storage = Arc::new(MemoryStore::new());
        let keystore = Arc::new(TrustedKeyStore::new(
            StorageHandle::new(storage.clone()),
            // Clamps to the minimum work factor; keeps scrypt cheap in tests
            KdfSettings {
                target: Duration::from_millis(1),
            },
        ));
        let push = Arc::new(PushService::new(notifier.clone(), 2));

        let session = Session::new(
            config,
            factory.clone(),
            keystore,
            push,
            frontend.clone(),
        );

        let buildups = Arc::new(Mutex::new(Vec::new()));
        let recorded = buildups.clone();
        session.state().on_buildup_change(move |state| {
            recorded.lock().unwrap().push(*state);
        });

        Self {
            session,
            factory,
            frontend,
            notifier,
            storage,
            buildups,
        }
    }

    pub fn buildups(&self) -> Vec<ConnectionBuildupState> {
        self.buildups.lock().unwrap().clone()
    }

    /// Pretend a trusted key record exists
    pub fn store_fake_record(&self) {
        let record = format!("{}:{}", "ab".repeat(24), "cd".repeat(48));
        self.storage.set("trusted", &record).unwrap();
    }
}

/// Let spawned tasks drain their queues
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn response(sub_type: SubType, data: Value) -> WireMessage {
    WireMessage::new(MessageType::Response, sub_type).with_data(data)
}

fn map(pairs: Vec<(&str, Value)>) -> Value {
    Value::Map(pairs.into_iter().map(|(k, v)| (Value::from(k), v)).collect())
}

/// Answer the initial data requests the way a device does
pub async fn answer_initial_requests(transport: &MockTransport) {
    transport.deliver(response(
        SubType::ClientInfo,
        map(vec![("device", Value::from("Pixel"))]),
    ));
    transport.deliver(response(
        SubType::Conversations,
        Value::Array(vec![map(vec![
            ("type", Value::from("contact")),
            ("id", Value::from("ECHOECHO")),
            ("unreadCount", Value::from(3)),
        ])]),
    ));
    transport.deliver(response(
        SubType::Receivers,
        map(vec![(
            "contact",
            Value::Array(vec![map(vec![("id", Value::from("ECHOECHO"))])]),
        )]),
    ));
    settle().await;
}

/// Initialise, start and complete a WebRTC session
pub async fn connect_webrtc(harness: &Harness) -> Arc<MockTransport> {
    harness.session.init(Default::default()).unwrap();
    let startup = harness.session.start();
    let transport = harness.factory.last();
    handshake_webrtc(&transport).await;
    answer_initial_requests(&transport).await;
    startup.await.unwrap();
    transport
}

/// Walk a freshly initialised session through the WebRTC handshake
pub async fn handshake_webrtc(transport: &MockTransport) {
    for event in [
        TransportEvent::StateChange("ws-connecting".into()),
        TransportEvent::StateChange("server-handshake".into()),
        TransportEvent::StateChange("peer-handshake".into()),
        TransportEvent::NewResponder,
        TransportEvent::StateChange("task".into()),
        TransportEvent::TaskReady(ChosenTask::WebRtc),
        TransportEvent::TaskState(TaskConnectionState::Connecting),
        TransportEvent::Handover,
        TransportEvent::TaskState(TaskConnectionState::Connected),
        TransportEvent::Channel(ChannelEvent::Open),
    ] {
        transport.emit(event);
        settle().await;
    }
}

/// Same for the relayed-data task, where the signaling channel carries data
pub async fn handshake_relayed(transport: &MockTransport) {
    for event in [
        TransportEvent::StateChange("ws-connecting".into()),
        TransportEvent::StateChange("server-handshake".into()),
        TransportEvent::StateChange("peer-handshake".into()),
        TransportEvent::NewResponder,
        TransportEvent::StateChange("task".into()),
        TransportEvent::TaskReady(ChosenTask::RelayedData),
    ] {
        transport.emit(event);
        settle().await;
    }
}
