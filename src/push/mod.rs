//! Wake-up pushes
//!
//! Before connecting, the browser asks the push relay to wake the paired
//! app so the user does not have to open it by hand.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::keystore::{PushToken, PushTokenType};
use crate::types::{RelayError, Result};

/// Pushes closer together than this are skipped
pub const MIN_PUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Push relay configuration
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub url: String,
    pub protocol_version: u32,
    pub timeout: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: "https://push.webrelay.example/push".to_string(),
            protocol_version: 2,
            timeout: Duration::from_secs(10),
        }
    }
}

/// One wake-up request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    /// Hex SHA-256 of the browser's public key
    pub session: String,
    pub token: PushToken,
    pub version: u32,
}

impl PushRequest {
    pub fn new(public_key: &[u8; 32], token: PushToken, version: u32) -> Self {
        Self {
            session: hex::encode(Sha256::digest(public_key)),
            token,
            version,
        }
    }

    /// Form fields as posted to the relay
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("type", self.token.kind.to_string()),
            ("session", self.session.clone()),
            ("version", self.version.to_string()),
        ];
        match self.token.kind {
            // APNs tokens are `<token>;<endpoint>;<bundle id>`
            PushTokenType::Apns => {
                let mut parts = self.token.token.splitn(3, ';');
                fields.push(("token", parts.next().unwrap_or_default().to_string()));
                if let Some(endpoint) = parts.next() {
                    fields.push(("endpoint", endpoint.to_string()));
                }
                if let Some(bundle_id) = parts.next() {
                    fields.push(("bundleid", bundle_id.to_string()));
                }
            }
            PushTokenType::Gcm | PushTokenType::Hms => {
                fields.push(("token", self.token.token.clone()))
            }
        }
        fields
    }
}

/// Delivers a wake-up push
#[async_trait]
pub trait PushNotifier: Send + Sync {
    /// `Ok(true)` when the relay accepted the push
    async fn notify(&self, request: &PushRequest) -> Result<bool>;
}

/// Posts pushes as a form to the HTTP relay
pub struct HttpPushNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpPushNotifier {
    pub fn new(config: &PushConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("Cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl PushNotifier for HttpPushNotifier {
    async fn notify(&self, request: &PushRequest) -> Result<bool> {
        let body = serde_urlencoded::to_string(request.form_fields())
            .map_err(|e| RelayError::Push(format!("Cannot encode push form: {e}")))?;

        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(true),
            status => {
                warn!(%status, "Push relay refused the push");
                Ok(false)
            }
        }
    }
}

#[derive(Default)]
struct PushState {
    token: Option<PushToken>,
    last_sent: Option<Instant>,
}

/// Holds the current push token and rate-limits pushes
pub struct PushService {
    notifier: Arc<dyn PushNotifier>,
    protocol_version: u32,
    state: Mutex<PushState>,
}

impl PushService {
    pub fn new(notifier: Arc<dyn PushNotifier>, protocol_version: u32) -> Self {
        Self {
            notifier,
            protocol_version,
            state: Mutex::new(PushState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PushState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remember the token announced by the device
    pub fn init(&self, token: PushToken) {
        debug!(kind = %token.kind, "Push token set");
        self.lock().token = Some(token);
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.token = None;
        state.last_sent = None;
    }

    pub fn is_available(&self) -> bool {
        self.lock().token.is_some()
    }

    pub fn token(&self) -> Option<PushToken> {
        self.lock().token.clone()
    }

    /// Send a wake-up push for the session keyed by `public_key`.
    ///
    /// `Ok(false)` when skipped (no token, rate limited) or refused.
    pub async fn send_push(&self, public_key: &[u8; 32]) -> Result<bool> {
        let token = {
            let mut state = self.lock();
            let token = match &state.token {
                Some(token) => token.clone(),
                None => return Ok(false),
            };
            let now = Instant::now();
            if let Some(last) = state.last_sent {
                if now.duration_since(last) < MIN_PUSH_INTERVAL {
                    debug!("Skipping push, the previous one was just sent");
                    return Ok(false);
                }
            }
            state.last_sent = Some(now);
            token
        };

        let request = PushRequest::new(public_key, token, self.protocol_version);
        let delivered = self.notifier.notify(&request).await?;
        if delivered {
            info!("Wake-up push sent");
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PushNotifier for CountingNotifier {
        async fn notify(&self, _request: &PushRequest) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    #[test]
    fn test_form_fields_split_apns_token() {
        let token = PushToken::new(PushTokenType::Apns, "deadbeef;s;ch.example.app");
        let request = PushRequest::new(&[0u8; 32], token, 2);
        let fields = request.form_fields();

        assert!(fields.contains(&("type", "apns".to_string())));
        assert!(fields.contains(&("token", "deadbeef".to_string())));
        assert!(fields.contains(&("endpoint", "s".to_string())));
        assert!(fields.contains(&("bundleid", "ch.example.app".to_string())));
        assert_eq!(request.session.len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushes_are_rate_limited() {
        let notifier = Arc::new(CountingNotifier::default());
        let service = PushService::new(notifier.clone(), 2);

        assert!(!service.send_push(&[1u8; 32]).await.unwrap());
        service.init(PushToken::new(PushTokenType::Gcm, "token"));

        assert!(service.send_push(&[1u8; 32]).await.unwrap());
        assert!(!service.send_push(&[1u8; 32]).await.unwrap());

        tokio::time::sleep(MIN_PUSH_INTERVAL).await;
        assert!(service.send_push(&[1u8; 32]).await.unwrap());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
    }
}
