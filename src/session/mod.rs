//! Session orchestration
//!
//! Owns one connection attempt end to end: transport events in, buildup
//! and task states out, the wire dispatcher on top of the secure channel,
//! and the mirrored application data.

pub mod api;
pub mod data;
pub mod frontend;
pub mod handlers;
pub mod init_steps;
pub mod orchestrator;

pub use api::{Receiver, ReceiverType};
pub use data::{AppData, Container};
pub use frontend::{Frontend, HeadlessFrontend, WelcomeParams};
pub use handlers::MessageHandlers;
pub use init_steps::{InitializationStep, InitializationSteps};
pub use orchestrator::{
    InitParams, Session, SessionConfig, SignalingConfig, Startup, StopOptions,
};
