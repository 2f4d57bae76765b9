//! Session orchestrator
//!
//! Drives one connection attempt from key material to an open secure
//! channel. `init` prepares the signaling client, `start` connects it, and
//! `stop` tears everything down again. Transport events are consumed by a
//! pump task; signaling state changes within one batch of events are applied
//! after the other events of that batch.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use rmpv::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::keystore::{PushToken, TrustedKeyStore};
use crate::protocol::wire::map_get;
use crate::protocol::{
    args, DisconnectReason, DispatcherConfig, MessageType, SubType, WireDispatcher,
};
use crate::push::PushService;
use crate::state::{ConnectionBuildupState, SignalingState, StateService, TaskConnectionState};
use crate::transport::{
    ChannelEvent, ChosenTask, EventReceiver, InitiatorParams, KeyPair, PeerConnection,
    SecureChannel, SignalingTransport, TransportEvent, TransportFactory, DATA_CHANNEL_LABEL,
};
use crate::types::{RelayError, Result};

use super::data::AppData;
use super::frontend::{Frontend, WelcomeParams};
use super::handlers::MessageHandlers;
use super::init_steps::{InitializationStep, InitializationSteps};

/// Where to find the signaling server
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Fixed host; overrides the derived one
    pub host: Option<String>,
    pub host_prefix: String,
    pub host_suffix: String,
    pub port: u16,
    pub server_key: Option<[u8; 32]>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: None,
            host_prefix: "relay-".to_string(),
            host_suffix: ".webrelay.example".to_string(),
            port: 443,
            server_key: None,
        }
    }
}

impl SignalingConfig {
    /// Fixed host, or prefix + first two hex chars of the public key + suffix
    pub fn resolve_host(&self, public_key: &[u8; 32]) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None => format!(
                "{}{:02x}{}",
                self.host_prefix, public_key[0], self.host_suffix
            ),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub signaling: SignalingConfig,
    pub dispatcher: DispatcherConfig,
}

/// Arguments of [`Session::init`]
#[derive(Debug, Clone)]
pub struct InitParams {
    /// Reuse this keypair instead of generating one
    pub key_pair: Option<KeyPair>,
    /// Pin the responder's key and skip interactive pairing
    pub peer_trusted_key: Option<[u8; 32]>,
    /// Clear the data containers when the new channel opens
    pub reset_fields: bool,
}

impl Default for InitParams {
    fn default() -> Self {
        Self {
            key_pair: None,
            peer_trusted_key: None,
            reset_fields: true,
        }
    }
}

/// Arguments of [`Session::stop`]
#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    /// Stop initiated locally; the peer is told if currently connected
    pub requested_by_us: bool,
    /// Purge the trusted key as well
    pub delete_stored_data: bool,
    /// Forget the push token
    pub reset_push: bool,
    /// Return to the pairing screen afterwards
    pub redirect: bool,
    /// Reason told to, or given by, the device. Derived from
    /// `delete_stored_data` when absent.
    pub reason: Option<DisconnectReason>,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            requested_by_us: true,
            delete_stored_data: false,
            reset_push: true,
            redirect: false,
            reason: None,
        }
    }
}

impl StopOptions {
    /// Tear down the connection only, keeping data, keys and push token
    pub fn soft() -> Self {
        Self {
            reset_push: false,
            ..Self::default()
        }
    }

    /// The device ended the session
    pub fn from_peer(reason: DisconnectReason) -> Self {
        Self {
            requested_by_us: false,
            delete_stored_data: reason == DisconnectReason::SessionDeleted,
            reset_push: true,
            redirect: true,
            reason: Some(reason),
        }
    }

    fn effective_reason(&self) -> DisconnectReason {
        self.reason.unwrap_or(if self.delete_stored_data {
            DisconnectReason::SessionDeleted
        } else {
            DisconnectReason::SessionStopped
        })
    }
}

/// Resolves when the session is ready, fails if the attempt is abandoned
pub struct Startup {
    receiver: oneshot::Receiver<Result<()>>,
}

impl Startup {
    fn failed(error: RelayError) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(Err(error));
        Self { receiver }
    }
}

impl Future for Startup {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or_else(|_| Err(RelayError::Stopped)))
    }
}

/// Per-attempt connection state
#[derive(Default)]
struct Connection {
    key_pair: Option<KeyPair>,
    peer_trusted_key: Option<[u8; 32]>,
    transport: Option<Arc<dyn SignalingTransport>>,
    peer_connection: Option<Arc<dyn PeerConnection>>,
    channel: Option<Arc<dyn SecureChannel>>,
    chosen_task: Option<ChosenTask>,
    startup: Option<oneshot::Sender<Result<()>>>,
    startup_done: bool,
    reset_fields: bool,
    pump: Option<JoinHandle<()>>,
}

pub(super) struct SessionInner {
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    keystore: Arc<TrustedKeyStore>,
    state: Arc<StateService>,
    push: Arc<PushService>,
    frontend: Arc<dyn Frontend>,
    data: Arc<AppData>,
    steps: Arc<InitializationSteps>,
    pub(super) dispatcher: Arc<WireDispatcher>,
    conn: Mutex<Connection>,
}

/// Handle to one relay session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    pub(super) inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
        keystore: Arc<TrustedKeyStore>,
        push: Arc<PushService>,
        frontend: Arc<dyn Frontend>,
    ) -> Self {
        let state = Arc::new(StateService::new());
        let data = Arc::new(AppData::new());
        let steps = Arc::new(InitializationSteps::new());
        let handlers = Arc::new(MessageHandlers::new(
            data.clone(),
            steps.clone(),
            state.clone(),
        ));
        let dispatcher = Arc::new(WireDispatcher::new(
            handlers.clone(),
            config.dispatcher.clone(),
        ));

        let session = Self {
            inner: Arc::new(SessionInner {
                config,
                factory,
                keystore,
                state,
                push,
                frontend,
                data,
                steps,
                dispatcher,
                conn: Mutex::new(Connection::default()),
            }),
        };

        let weak = Arc::downgrade(&session.inner);
        handlers.on_disconnect(move |reason| {
            if let Some(inner) = weak.upgrade() {
                Session { inner }.on_peer_disconnect(reason);
            }
        });
        session
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.inner
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> &Arc<StateService> {
        &self.inner.state
    }

    pub fn data(&self) -> &Arc<AppData> {
        &self.inner.data
    }

    pub fn steps(&self) -> &Arc<InitializationSteps> {
        &self.inner.steps
    }

    pub fn dispatcher(&self) -> &Arc<WireDispatcher> {
        &self.inner.dispatcher
    }

    pub fn keystore(&self) -> &Arc<TrustedKeyStore> {
        &self.inner.keystore
    }

    pub fn push(&self) -> &Arc<PushService> {
        &self.inner.push
    }

    pub fn frontend(&self) -> &Arc<dyn Frontend> {
        &self.inner.frontend
    }

    pub fn key_pair(&self) -> Option<KeyPair> {
        self.conn().key_pair.clone()
    }

    /// Authenticated key of the peer, or the pinned one
    pub fn peer_trusted_key(&self) -> Option<[u8; 32]> {
        let conn = self.conn();
        conn.transport
            .as_ref()
            .and_then(|t| t.peer_permanent_key())
            .or(conn.peer_trusted_key)
    }

    pub fn chosen_task(&self) -> Option<ChosenTask> {
        self.conn().chosen_task
    }

    /// Key material to carry back to the pairing screen
    pub fn welcome_params(&self) -> Option<WelcomeParams> {
        let key_pair = self.key_pair()?;
        Some(WelcomeParams {
            key_pair,
            peer_trusted_key: self.peer_trusted_key(),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Prepare a connection attempt
    pub fn init(&self, params: InitParams) -> Result<()> {
        let inner = &self.inner;
        inner.state.reset(false);

        let key_pair = params.key_pair.unwrap_or_else(KeyPair::generate);
        let host = inner
            .config
            .signaling
            .resolve_host(&key_pair.public_key_bytes());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = inner.factory.create_initiator(
            InitiatorParams {
                host: host.clone(),
                port: inner.config.signaling.port,
                server_key: inner.config.signaling.server_key,
                key_pair: key_pair.clone(),
                trusted_peer_key: params.peer_trusted_key,
            },
            events_tx,
        )?;

        inner.steps.reset();
        let pump = tokio::spawn(run_event_pump(Arc::downgrade(&self.inner), events_rx));

        let previous_pump = {
            let mut conn = self.conn();
            let previous = conn.pump.replace(pump);
            conn.key_pair = Some(key_pair.clone());
            conn.peer_trusted_key = params.peer_trusted_key;
            conn.transport = Some(transport);
            conn.peer_connection = None;
            conn.channel = None;
            conn.chosen_task = None;
            conn.startup_done = false;
            conn.reset_fields = params.reset_fields;
            previous
        };
        if let Some(previous) = previous_pump {
            previous.abort();
        }

        info!(
            %host,
            public_key = %key_pair.public_key_hex(),
            trusted_peer = params.peer_trusted_key.is_some(),
            "Session initialised"
        );
        Ok(())
    }

    /// Connect. The returned future resolves once the session is ready.
    pub fn start(&self) -> Startup {
        let (sender, receiver) = oneshot::channel();
        let (transport, key_pair) = {
            let mut conn = self.conn();
            if let Some(previous) = conn.startup.replace(sender) {
                let _ = previous.send(Err(RelayError::Stopped));
            }
            conn.startup_done = false;
            (conn.transport.clone(), conn.key_pair.clone())
        };

        let (transport, key_pair) = match (transport, key_pair) {
            (Some(transport), Some(key_pair)) => (transport, key_pair),
            _ => {
                error!("start() called before init()");
                self.conn().startup = None;
                return Startup::failed(RelayError::Internal("session not initialised".into()));
            }
        };

        info!("Starting session");
        if let Err(e) = transport.connect() {
            error!(error = %e, "Could not connect signaling");
            self.conn().startup = None;
            return Startup::failed(e);
        }

        if self.inner.push.is_available() {
            let push = self.inner.push.clone();
            let state = self.inner.state.clone();
            let public_key = key_pair.public_key_bytes();
            tokio::spawn(async move {
                if let Err(e) = push.send_push(&public_key).await {
                    warn!(error = %e, "Wake-up push failed");
                }
                // Only while the peer has not shown up yet
                if matches!(
                    state.buildup_state(),
                    ConnectionBuildupState::New
                        | ConnectionBuildupState::Connecting
                        | ConnectionBuildupState::Waiting
                ) {
                    state.update_connection_buildup_state(ConnectionBuildupState::Push);
                }
            });
        } else if self.inner.keystore.has_trusted_key() {
            self.inner
                .state
                .update_connection_buildup_state(ConnectionBuildupState::ManualStart);
        }

        Startup { receiver }
    }

    /// Tear the connection down.
    ///
    /// Order: peer notification, state reset, stored data, data channel,
    /// signaling, peer connection, then the optional redirect.
    pub async fn stop(&self, options: StopOptions) {
        info!(?options, "Stopping session");
        let inner = &self.inner;
        let reason = options.effective_reason();
        let delete_stored_data =
            options.delete_stored_data || reason == DisconnectReason::SessionDeleted;
        let close = reason.closes_session();

        let (transport, channel, peer_connection, pump, startup) = {
            let mut conn = self.conn();
            let startup = if conn.startup_done { None } else { conn.startup.take() };
            conn.startup = None;
            conn.startup_done = false;
            conn.chosen_task = None;
            (
                conn.transport.take(),
                conn.channel.take(),
                conn.peer_connection.take(),
                conn.pump.take(),
                startup,
            )
        };

        if options.requested_by_us
            && inner.state.task_state() == TaskConnectionState::Connected
        {
            if let Err(e) = inner.dispatcher.post(
                MessageType::Update,
                SubType::ConnectionDisconnect,
                None,
                Some(reason.to_data()),
            ) {
                debug!(error = %e, "Disconnect reason not sent over the channel");
            }
            if let Some(transport) = &transport {
                let message = Value::Map(vec![
                    (Value::from("type"), Value::from("disconnect")),
                    (Value::from("forget"), Value::from(delete_stored_data)),
                ]);
                if let Err(e) = transport.send_application(message) {
                    warn!(error = %e, "Could not tell the peer about the disconnect");
                }
            }
        }

        if let Some(pump) = pump {
            pump.abort();
        }

        inner.state.reset(true);

        if delete_stored_data {
            inner.keystore.clear();
        }
        if delete_stored_data || close {
            inner.data.clear();
        }
        if options.reset_push || close {
            inner.push.reset();
        }

        if let Some(startup) = startup {
            let _ = startup.send(Err(RelayError::Stopped));
        }

        inner.dispatcher.detach_channel();
        inner.dispatcher.clear_pending();

        match channel {
            Some(channel) => {
                debug!("Closing secure data channel");
                channel.close();
            }
            None => debug!("No data channel to close"),
        }
        if let Some(transport) = transport {
            debug!("Closing signaling");
            transport.disconnect();
        }
        match peer_connection {
            Some(peer_connection) => {
                if let Err(e) = peer_connection.close().await {
                    warn!(error = %e, "Peer connection did not close cleanly");
                }
                debug!("Peer connection closed");
            }
            None => debug!("Peer connection was not set"),
        }

        if options.redirect {
            inner.frontend.navigate_to_welcome(None);
        }
    }

    // =========================================================================
    // Trusted keys
    // =========================================================================

    /// Persist the current keys so the next visit can skip pairing
    pub async fn trust_keys(&self, password: &str, auto_session: bool) -> Result<()> {
        let key_pair = self
            .key_pair()
            .ok_or_else(|| RelayError::Internal("no key pair to trust".into()))?;
        let peer_key = self
            .peer_trusted_key()
            .ok_or_else(|| RelayError::Internal("peer key not known yet".into()))?;
        let token = self.inner.push.token();

        self.inner
            .keystore
            .store_trusted_key(
                &key_pair.secret_key_bytes(),
                &peer_key,
                token.as_ref(),
                password,
                auto_session,
            )
            .await
    }

    /// Decrypt the trusted key and build the parameters to resume with it.
    ///
    /// `Ok(None)` when nothing is stored.
    pub async fn unlock(&self, password: &str) -> Result<Option<InitParams>> {
        let data = match self.inner.keystore.retrieve_trusted_key(password).await? {
            Some(data) => data,
            None => return Ok(None),
        };
        if let Some(token) = data.push_token {
            self.inner.push.init(token);
        }
        Ok(Some(InitParams {
            key_pair: Some(KeyPair::from_secret_bytes(*data.own_secret_key)),
            peer_trusted_key: Some(data.peer_public_key),
            reset_fields: true,
        }))
    }

    /// The device announced its push token
    pub fn set_push_token(&self, token: PushToken) {
        self.inner.push.init(token);
    }

    // =========================================================================
    // Transport events
    // =========================================================================

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::NewResponder => {
                debug!("New responder");
                if !self.conn().startup_done {
                    self.inner
                        .state
                        .update_connection_buildup_state(ConnectionBuildupState::PeerHandshake);
                }
            }
            TransportEvent::StateChange(state) => self.apply_signaling_state(state),
            TransportEvent::TaskReady(task) => self.on_task_ready(task),
            TransportEvent::Handover => {
                if self.chosen_task() == Some(ChosenTask::WebRtc) {
                    info!("Handover done");
                    self.on_handover();
                } else {
                    warn!("Handover reported without a WebRTC task");
                }
            }
            TransportEvent::TaskState(state) => self.inner.state.update_task_state(state),
            TransportEvent::PeerDisconnected => {
                if self.chosen_task() == Some(ChosenTask::RelayedData) {
                    warn!("Peer left the relay");
                    self.inner
                        .state
                        .update_task_state(TaskConnectionState::Reconnecting);
                }
            }
            TransportEvent::Application(message) => self.on_application_message(&message),
            TransportEvent::ConnectionError(reason) => {
                error!(%reason, "Connection error");
                self.fail_startup(RelayError::Handshake(reason));
            }
            TransportEvent::ConnectionClosed(code) => {
                info!(code, "Connection closed");
                if self.chosen_task() == Some(ChosenTask::RelayedData) {
                    self.inner
                        .state
                        .update_task_state(TaskConnectionState::Disconnected);
                }
            }
            TransportEvent::Channel(ChannelEvent::Open) => self.on_channel_open(),
            TransportEvent::Channel(ChannelEvent::Message(bytes)) => {
                self.inner.dispatcher.receive(&bytes)
            }
            TransportEvent::Channel(ChannelEvent::Error(reason)) => {
                warn!(%reason, "Secure data channel error")
            }
            TransportEvent::Channel(ChannelEvent::Close) => info!("Secure data channel closed"),
        }
    }

    fn apply_signaling_state(&self, signaling: SignalingState) {
        let (startup_done, chosen_task) = {
            let conn = self.conn();
            (conn.startup_done, conn.chosen_task)
        };

        if !startup_done {
            let state = &self.inner.state;
            let current = state.buildup_state();
            match &signaling {
                SignalingState::New
                | SignalingState::WsConnecting
                | SignalingState::ServerHandshake => {
                    if current == ConnectionBuildupState::New {
                        state.update_connection_buildup_state(ConnectionBuildupState::Connecting);
                    }
                }
                SignalingState::PeerHandshake => {
                    if matches!(
                        current,
                        ConnectionBuildupState::New | ConnectionBuildupState::Connecting
                    ) {
                        state.update_connection_buildup_state(ConnectionBuildupState::Waiting);
                    }
                }
                SignalingState::Closing | SignalingState::Closed if chosen_task.is_none() => {
                    state.update_connection_buildup_state(ConnectionBuildupState::Closed);
                    if signaling == SignalingState::Closed {
                        self.fail_startup(RelayError::Handshake(
                            "signaling closed before the handshake finished".into(),
                        ));
                    }
                }
                _ => {}
            }
        }

        self.inner.state.update_signaling_state(signaling);
    }

    fn on_task_ready(&self, task: ChosenTask) {
        info!(?task, "Handshake done, task chosen");
        let transport = {
            let mut conn = self.conn();
            conn.chosen_task = Some(task);
            conn.transport.clone()
        };
        let transport = match transport {
            Some(transport) => transport,
            None => return,
        };

        match task {
            ChosenTask::WebRtc => {
                let handover = transport.create_peer_connection().and_then(|peer| {
                    self.conn().peer_connection = Some(peer.clone());
                    transport.handover(&peer)
                });
                if let Err(e) = handover {
                    error!(error = %e, "Could not initiate handover");
                    self.fail_startup(e);
                }
            }
            ChosenTask::RelayedData => self.on_handover(),
        }
    }

    fn on_handover(&self) {
        self.inner.frontend.init_notifications();

        let (task, transport, peer_connection) = {
            let conn = self.conn();
            (
                conn.chosen_task,
                conn.transport.clone(),
                conn.peer_connection.clone(),
            )
        };

        let channel = match (task, transport, peer_connection) {
            (Some(ChosenTask::WebRtc), _, Some(peer)) => peer.open_secure_channel(DATA_CHANNEL_LABEL),
            (Some(ChosenTask::RelayedData), Some(transport), _) => transport.relayed_channel(),
            _ => {
                warn!("Handover without a usable transport");
                return;
            }
        };

        match channel {
            Ok(channel) => {
                self.conn().channel = Some(channel);
                // The relayed channel is usable right away
                if task == Some(ChosenTask::RelayedData) {
                    self.inner
                        .state
                        .update_task_state(TaskConnectionState::Connected);
                    self.on_channel_open();
                }
            }
            Err(e) => {
                error!(error = %e, "Could not open secure data channel");
                self.fail_startup(e);
            }
        }
    }

    fn on_channel_open(&self) {
        let (channel, reset_fields) = {
            let conn = self.conn();
            (conn.channel.clone(), conn.reset_fields)
        };
        let channel = match channel {
            Some(channel) => channel,
            None => {
                warn!("Channel open without a channel");
                return;
            }
        };

        info!(label = channel.label(), "Secure data channel open");
        self.inner.dispatcher.attach_channel(channel);
        if reset_fields {
            self.inner.data.clear();
        }

        self.inner
            .state
            .update_connection_buildup_state(ConnectionBuildupState::Loading);

        let session = Arc::downgrade(&self.inner);
        self.inner
            .steps
            .run_after(&InitializationStep::REQUIRED, move || {
                if let Some(inner) = session.upgrade() {
                    Session { inner }.on_ready();
                }
            });

        self.request_initial_data();
    }

    fn on_ready(&self) {
        self.inner
            .state
            .update_connection_buildup_state(ConnectionBuildupState::Done);
        let startup = {
            let mut conn = self.conn();
            conn.startup_done = true;
            conn.startup.take()
        };
        if let Some(startup) = startup {
            let _ = startup.send(Ok(()));
        }
        info!("Session ready");
    }

    fn request_initial_data(&self) {
        let dispatcher = &self.inner.dispatcher;
        let client_info = args([(
            "userAgent",
            Value::from(concat!("webrelay/", env!("CARGO_PKG_VERSION"))),
        )]);

        let requests = [
            (SubType::ClientInfo, Some(client_info)),
            (SubType::Profile, None),
            (SubType::Receivers, None),
            (SubType::Conversations, None),
            (SubType::BatteryStatus, None),
        ];
        for (sub_type, request_args) in requests {
            if let Err(e) = dispatcher.request(sub_type.clone(), request_args) {
                warn!(%sub_type, error = %e, "Initial data request failed");
            }
        }
    }

    fn on_application_message(&self, message: &Value) {
        match map_get(message, "type").and_then(Value::as_str) {
            Some("disconnect") => {
                let forget = map_get(message, "forget")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                info!(forget, "Peer requested disconnect");
                let reason = if forget {
                    DisconnectReason::SessionDeleted
                } else {
                    DisconnectReason::SessionStopped
                };
                let session = self.clone();
                // Stopping aborts the pump, so it must not run on it
                tokio::spawn(async move {
                    session.stop(StopOptions::from_peer(reason)).await;
                });
            }
            other => warn!(kind = ?other, "Ignoring application message"),
        }
    }

    fn on_peer_disconnect(&self, reason: DisconnectReason) {
        let session = self.clone();
        tokio::spawn(async move {
            session.stop(StopOptions::from_peer(reason)).await;
            session.inner.frontend.peer_disconnected(reason);
        });
    }

    fn fail_startup(&self, error: RelayError) {
        let startup = {
            let mut conn = self.conn();
            if conn.startup_done {
                None
            } else {
                conn.startup.take()
            }
        };
        if let Some(startup) = startup {
            warn!(%error, "Session startup failed");
            let _ = startup.send(Err(error));
        }
    }
}

async fn run_event_pump(session: Weak<SessionInner>, mut events: EventReceiver) {
    while let Some(first) = events.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = events.try_recv() {
            batch.push(next);
        }

        let inner = match session.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let session = Session { inner };

        let mut deferred = Vec::new();
        for event in batch {
            match event {
                TransportEvent::StateChange(state) => deferred.push(state),
                other => session.handle_event(other),
            }
        }
        for state in deferred {
            session.apply_signaling_state(state);
        }
    }
    debug!("Transport event stream ended");
}
