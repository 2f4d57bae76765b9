//! Application wire protocol
//!
//! MessagePack envelopes, the correlation table for promise-style requests,
//! and the dispatcher tying both to the secure channel.

pub mod dispatcher;
pub mod pending;
pub mod wire;

pub use dispatcher::{DispatcherConfig, HandleOutcome, WireDispatcher, WireHandler};
pub use pending::{PendingReply, PendingRequests, Reply};
pub use wire::{args, Args, DisconnectReason, MessageType, SubType, WireMessage, TEMPORARY_ID_KEY};
