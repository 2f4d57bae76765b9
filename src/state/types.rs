//! Connection state enums

use std::fmt;

/// Low-level state reported by the signaling library
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingState {
    New,
    WsConnecting,
    ServerHandshake,
    PeerHandshake,
    Task,
    Closing,
    Closed,
    /// Anything a newer library version may report
    Unknown(String),
}

impl From<&str> for SignalingState {
    fn from(value: &str) -> Self {
        match value {
            "new" => Self::New,
            "ws-connecting" => Self::WsConnecting,
            "server-handshake" => Self::ServerHandshake,
            "peer-handshake" => Self::PeerHandshake,
            "task" => Self::Task,
            "closing" => Self::Closing,
            "closed" => Self::Closed,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::WsConnecting => "ws-connecting",
            Self::ServerHandshake => "server-handshake",
            Self::PeerHandshake => "peer-handshake",
            Self::Task => "task",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Unknown(other) => other.as_str(),
        };
        f.write_str(name)
    }
}

/// State of the post-handshake transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskConnectionState {
    New,
    Connecting,
    Reconnecting,
    Connected,
    Disconnected,
    Unknown(String),
}

impl From<&str> for TaskConnectionState {
    fn from(value: &str) -> Self {
        match value {
            "new" => Self::New,
            "connecting" => Self::Connecting,
            "reconnecting" => Self::Reconnecting,
            "connected" => Self::Connected,
            "disconnected" => Self::Disconnected,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for TaskConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Reconnecting => "reconnecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Unknown(other) => other.as_str(),
        };
        f.write_str(name)
    }
}

/// Coarse summary driving status display and reconnect decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalConnectionState {
    Ok,
    Warning,
    Error,
}

impl fmt::Display for GlobalConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Warning => f.write_str("warning"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Progress of a single connection attempt, as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionBuildupState {
    New,
    /// A wake-up push was sent to the device
    Push,
    /// No push possible, the user has to open the app
    ManualStart,
    Connecting,
    Waiting,
    PeerHandshake,
    Loading,
    Done,
    Closed,
}

impl fmt::Display for ConnectionBuildupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Push => "push",
            Self::ManualStart => "manual_start",
            Self::Connecting => "connecting",
            Self::Waiting => "waiting",
            Self::PeerHandshake => "peer_handshake",
            Self::Loading => "loading",
            Self::Done => "done",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Posted to global state observers on every actual change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalStateChange {
    pub previous: GlobalConnectionState,
    pub current: GlobalConnectionState,
    /// Whether the task track reached `connected` since the last reset
    pub was_connected: bool,
}

/// Point-in-time view of the buildup track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildupSnapshot {
    pub state: ConnectionBuildupState,
    pub progress: u8,
    pub slow_connect: bool,
}
