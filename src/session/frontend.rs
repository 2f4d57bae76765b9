//! Outward hooks into the user interface

use tracing::info;

use crate::protocol::DisconnectReason;
use crate::transport::KeyPair;

/// Carried to the pairing screen so it can offer a one-click reconnect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WelcomeParams {
    pub key_pair: KeyPair,
    pub peer_trusted_key: Option<[u8; 32]>,
}

/// What the session needs from whoever renders it
pub trait Frontend: Send + Sync {
    /// Return to the pairing screen
    fn navigate_to_welcome(&self, params: Option<WelcomeParams>);

    /// Prepare desktop notifications once a channel is up
    fn init_notifications(&self) {}

    /// Tell the user why the device ended the session
    fn peer_disconnected(&self, _reason: DisconnectReason) {}
}

/// Frontend for headless use; only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessFrontend;

impl Frontend for HeadlessFrontend {
    fn navigate_to_welcome(&self, params: Option<WelcomeParams>) {
        info!(
            reconnect_offered = params.is_some(),
            "Session ended, back to pairing"
        );
    }

    fn peer_disconnected(&self, reason: DisconnectReason) {
        info!(%reason, "Device ended the session");
    }
}
