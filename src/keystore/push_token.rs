//! Platform-tagged push tokens
//!
//! Tokens are stored as `<tag>:<token>`. Records written before tagging
//! existed hold the bare token, which is always a GCM token.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Separator between the platform tag and the token
pub const TAG_DELIMITER: char = ':';

/// Push systems a paired device may register with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushTokenType {
    Gcm,
    Apns,
    Hms,
}

impl PushTokenType {
    pub fn tag(&self) -> char {
        match self {
            Self::Gcm => 'g',
            Self::Apns => 'a',
            Self::Hms => 'h',
        }
    }

    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'g' => Some(Self::Gcm),
            'a' => Some(Self::Apns),
            'h' => Some(Self::Hms),
            _ => None,
        }
    }
}

impl fmt::Display for PushTokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gcm => write!(f, "gcm"),
            Self::Apns => write!(f, "apns"),
            Self::Hms => write!(f, "hms"),
        }
    }
}

/// A push token and the system it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushToken {
    pub kind: PushTokenType,
    pub token: String,
}

impl PushToken {
    pub fn new(kind: PushTokenType, token: impl Into<String>) -> Self {
        Self {
            kind,
            token: token.into(),
        }
    }

    /// `<tag>:<token>`
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.kind.tag(), TAG_DELIMITER, self.token)
    }

    /// Decode a stored token string. Empty input means no token.
    pub fn decode(encoded: &str) -> Option<Self> {
        if encoded.is_empty() {
            return None;
        }

        let mut chars = encoded.chars();
        let tag = chars.next();
        let delimiter = chars.next();

        match (tag, delimiter) {
            (Some(tag), Some(TAG_DELIMITER)) => {
                let token = &encoded[tag.len_utf8() + TAG_DELIMITER.len_utf8()..];
                match PushTokenType::from_tag(tag) {
                    Some(kind) => Some(Self::new(kind, token)),
                    None => {
                        warn!(%tag, "Unknown push token tag, treating token as untagged");
                        Some(Self::new(PushTokenType::Gcm, encoded))
                    }
                }
            }
            _ => Some(Self::new(PushTokenType::Gcm, encoded)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_tokens() {
        let apns = PushToken::new(PushTokenType::Apns, "abc123;p;bundle");
        assert_eq!(apns.encode(), "a:abc123;p;bundle");
        assert_eq!(PushToken::decode("a:abc123;p;bundle"), Some(apns));

        let hms = PushToken::decode("h:tok:with:colons").unwrap();
        assert_eq!(hms.kind, PushTokenType::Hms);
        assert_eq!(hms.token, "tok:with:colons");
    }

    #[test]
    fn test_untagged_token_is_gcm() {
        let legacy = PushToken::decode("APA91bHPRgkF").unwrap();
        assert_eq!(legacy.kind, PushTokenType::Gcm);
        assert_eq!(legacy.token, "APA91bHPRgkF");
    }

    #[test]
    fn test_unknown_tag_keeps_whole_string() {
        let token = PushToken::decode("x:something").unwrap();
        assert_eq!(token.kind, PushTokenType::Gcm);
        assert_eq!(token.token, "x:something");
    }

    #[test]
    fn test_empty_is_none() {
        assert_eq!(PushToken::decode(""), None);
    }
}
