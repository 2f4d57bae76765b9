//! Configuration for webrelay
//!
//! CLI arguments and environment variable handling using clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::keystore::KdfSettings;
use crate::protocol::DispatcherConfig;
use crate::push::PushConfig;
use crate::reconnect::ReconnectConfig;
use crate::session::{SessionConfig, SignalingConfig};
use crate::types::{RelayError, Result};

/// webrelay - drive a paired mobile messenger from the desktop
#[derive(Parser, Debug, Clone)]
#[command(name = "webrelay")]
#[command(about = "Relay client core: trusted sessions, handshake and wire protocol")]
pub struct Args {
    /// Fixed signaling host; when unset the host is derived from the public key
    #[arg(long, env = "SIGNALING_HOST")]
    pub signaling_host: Option<String>,

    /// Prefix of derived signaling hosts
    #[arg(long, env = "SIGNALING_HOST_PREFIX", default_value = "relay-")]
    pub signaling_host_prefix: String,

    /// Suffix of derived signaling hosts
    #[arg(long, env = "SIGNALING_HOST_SUFFIX", default_value = ".webrelay.example")]
    pub signaling_host_suffix: String,

    /// Signaling server port
    #[arg(long, env = "SIGNALING_PORT", default_value = "443")]
    pub signaling_port: u16,

    /// Expected permanent key of the signaling server (hex, 32 bytes)
    #[arg(long, env = "SIGNALING_SERVER_KEY")]
    pub signaling_server_key: Option<String>,

    /// Push relay endpoint
    #[arg(long, env = "PUSH_URL", default_value = "https://push.webrelay.example/push")]
    pub push_url: String,

    /// Protocol version announced in wake-up pushes
    #[arg(long, env = "PROTOCOL_VERSION", default_value = "2")]
    pub protocol_version: u32,

    /// File holding the trusted session
    #[arg(long, env = "STORAGE_PATH", default_value = "webrelay-storage.json")]
    pub storage_path: PathBuf,

    /// Timeout for correlated wire requests in milliseconds (0 disables)
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "0")]
    pub request_timeout_ms: u64,

    /// First reconnect phase in milliseconds
    #[arg(long, env = "RECONNECT_PHASE1_MS", default_value = "20000")]
    pub reconnect_phase1_ms: u64,

    /// Second reconnect phase in milliseconds
    #[arg(long, env = "RECONNECT_PHASE2_MS", default_value = "40000")]
    pub reconnect_phase2_ms: u64,

    /// Pause before restarting a relayed session in milliseconds
    #[arg(long, env = "RELAYED_RESTART_DELAY_MS", default_value = "500")]
    pub relayed_restart_delay_ms: u64,

    /// Target duration of one key derivation in milliseconds
    #[arg(long, env = "KDF_TARGET_MS", default_value = "500")]
    pub kdf_target_ms: u64,

    /// Log every wire message
    #[arg(long, env = "MSG_DEBUGGING", default_value = "false")]
    pub msg_debugging: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Trusted session management
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show whether a trusted session is stored
    Status,

    /// Decrypt the stored session with a password
    Unlock {
        #[arg(long, env = "WEBRELAY_PASSWORD")]
        password: String,
    },

    /// Delete the stored session
    Forget,

    /// Measure scrypt speed and print the work factor a new record would get
    Bench,

    /// Print the signaling host for a public key (hex)
    Host { public_key: String },
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(key) = &self.signaling_server_key {
            parse_key(key)?;
        }
        if self.push_url.is_empty() {
            return Err(RelayError::Config("PUSH_URL must not be empty".into()));
        }
        if self.reconnect_phase1_ms == 0 || self.reconnect_phase2_ms == 0 {
            return Err(RelayError::Config(
                "reconnect phase timeouts must be positive".into(),
            ));
        }
        if self.kdf_target_ms == 0 {
            return Err(RelayError::Config("KDF_TARGET_MS must be positive".into()));
        }
        Ok(())
    }

    pub fn signaling_config(&self) -> Result<SignalingConfig> {
        Ok(SignalingConfig {
            host: self.signaling_host.clone(),
            host_prefix: self.signaling_host_prefix.clone(),
            host_suffix: self.signaling_host_suffix.clone(),
            port: self.signaling_port,
            server_key: self
                .signaling_server_key
                .as_deref()
                .map(parse_key)
                .transpose()?,
        })
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig {
            signaling: self.signaling_config()?,
            dispatcher: DispatcherConfig {
                request_timeout: (self.request_timeout_ms > 0)
                    .then(|| Duration::from_millis(self.request_timeout_ms)),
                msg_debugging: self.msg_debugging,
            },
        })
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            phase1_timeout: Duration::from_millis(self.reconnect_phase1_ms),
            phase2_timeout: Duration::from_millis(self.reconnect_phase2_ms),
            relayed_restart_delay: Duration::from_millis(self.relayed_restart_delay_ms),
        }
    }

    pub fn kdf_settings(&self) -> KdfSettings {
        KdfSettings {
            target: Duration::from_millis(self.kdf_target_ms),
        }
    }

    pub fn push_config(&self) -> PushConfig {
        PushConfig {
            url: self.push_url.clone(),
            protocol_version: self.protocol_version,
            ..PushConfig::default()
        }
    }
}

/// Parse a 32-byte key from hex
pub fn parse_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| RelayError::Config(format!("Invalid hex key: {e}")))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| RelayError::Config(format!("Key must be 32 bytes, got {}", b.len())))
}
