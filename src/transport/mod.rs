//! Secure transport seam
//!
//! The handshake library is external. It is driven through
//! [`TransportFactory`] and [`SignalingTransport`], and reports back by
//! posting [`TransportEvent`]s on the channel handed to it at creation.
//! After handover the application protocol runs over a [`SecureChannel`].

mod keys;

pub use keys::KeyPair;

use std::sync::Arc;

use async_trait::async_trait;
use rmpv::Value;
use tokio::sync::mpsc;

use crate::state::{SignalingState, TaskConnectionState};
use crate::types::Result;

/// Label of the application data channel
pub const DATA_CHANNEL_LABEL: &str = "webrelay";

/// Where transport events are posted
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Task negotiated during the peer handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChosenTask {
    /// Direct peer connection; signaling hands over to a new data channel
    WebRtc,
    /// Data keeps flowing through the signaling server
    RelayedData,
}

/// Lifecycle events emitted by the handshake library
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A responder joined the signaling path
    NewResponder,
    StateChange(SignalingState),
    /// Handshake done, the named task takes over
    TaskReady(ChosenTask),
    /// The signaling channel moved onto the peer connection
    Handover,
    /// Connection state of the peer transport
    TaskState(TaskConnectionState),
    /// The peer dropped off the relay, it may come back
    PeerDisconnected,
    /// Out-of-band message from the peer over the signaling channel
    Application(Value),
    ConnectionError(String),
    ConnectionClosed(u16),
    Channel(ChannelEvent),
}

/// Events of the secure data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Vec<u8>),
    Error(String),
    Close,
}

/// Parameters for the initiator role
#[derive(Debug, Clone)]
pub struct InitiatorParams {
    pub host: String,
    pub port: u16,
    /// Expected permanent key of the signaling server
    pub server_key: Option<[u8; 32]>,
    pub key_pair: KeyPair,
    /// Pinned responder key; skips the interactive pairing step
    pub trusted_peer_key: Option<[u8; 32]>,
}

/// Message-oriented encrypted channel
pub trait SecureChannel: Send + Sync {
    fn label(&self) -> &str;

    fn send(&self, payload: Vec<u8>) -> Result<()>;

    fn close(&self);
}

/// Direct peer transport created for the WebRTC task
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Open an encrypted data channel; open/message/close are posted as
    /// [`TransportEvent::Channel`]
    fn open_secure_channel(&self, label: &str) -> Result<Arc<dyn SecureChannel>>;

    /// Tear down. Resolves once the connection is fully closed.
    async fn close(&self) -> Result<()>;
}

/// The signaling client in initiator role
pub trait SignalingTransport: Send + Sync {
    fn connect(&self) -> Result<()>;

    fn disconnect(&self);

    fn create_peer_connection(&self) -> Result<Arc<dyn PeerConnection>>;

    /// Move signaling onto `peer`; completion is posted as [`TransportEvent::Handover`]
    fn handover(&self, peer: &Arc<dyn PeerConnection>) -> Result<()>;

    /// The encrypted channel of the relayed-data task
    fn relayed_channel(&self) -> Result<Arc<dyn SecureChannel>>;

    fn send_application(&self, message: Value) -> Result<()>;

    /// Permanent key of the responder, once authenticated
    fn peer_permanent_key(&self) -> Option<[u8; 32]>;
}

/// Builds signaling clients
pub trait TransportFactory: Send + Sync {
    fn create_initiator(
        &self,
        params: InitiatorParams,
        events: EventSender,
    ) -> Result<Arc<dyn SignalingTransport>>;
}
