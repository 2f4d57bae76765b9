//! Connection state machine
//!
//! Two tracks reported from below (signaling and task), the global state
//! derived from them, and the buildup progress indicator.

pub mod buildup;
pub mod observers;
pub mod service;
pub mod types;

pub use observers::{ObserverId, Observers};
pub use service::StateService;
pub use types::{
    BuildupSnapshot, ConnectionBuildupState, GlobalConnectionState, GlobalStateChange,
    SignalingState, TaskConnectionState,
};
