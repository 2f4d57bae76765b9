//! Shared types for webrelay

pub mod error;

pub use error::{RelayError, Result};
