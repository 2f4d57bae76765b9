//! Webrelay - browser relay client core
//!
//! Pairs a desktop client with a mobile messenger and mirrors it over an
//! end-to-end encrypted channel.
//!
//! ## Components
//!
//! - **Keystore**: password-encrypted trusted key record with scrypt work
//!   factors chosen per machine and migration from the legacy format
//! - **State**: signaling/task tracks, derived global state, buildup progress
//! - **Session**: handshake lifecycle, handover and initial data loading
//! - **Protocol**: MessagePack wire envelopes with request correlation
//! - **Reconnect**: soft reconnect ladder and relayed restarts
//! - **Push**: wake-up pushes to the paired device

pub mod config;
pub mod keystore;
pub mod logging;
pub mod protocol;
pub mod push;
pub mod reconnect;
pub mod session;
pub mod state;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::Args;
pub use reconnect::{ReconnectConfig, ReconnectionController};
pub use session::{InitParams, Session, SessionConfig, StopOptions};
pub use types::{RelayError, Result};
