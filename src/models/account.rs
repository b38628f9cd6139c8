//! Linked calendar accounts and their OAuth credentials.

use crate::time_utils::parse_utc_rfc3339;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Connection state of a linked account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// `accounts connect` started, OAuth callback not yet received.
    Pending,
    Connected,
    /// Refresh token rejected; the user has to reconnect.
    Revoked,
}

/// Stable document id for a (user, nickname) pair.
pub fn account_id(user: &str, nickname: &str) -> String {
    format!(
        "{}:{}",
        urlencoding::encode(user),
        urlencoding::encode(nickname)
    )
}

/// A chat user's Google account, stored under a nickname.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Chat username
    pub user: String,
    /// Unique per user, case-sensitive
    pub nickname: String,
    pub state: ConnectionState,
    /// Primary calendar id, known once connected
    #[serde(default)]
    pub calendar_id: Option<String>,
    /// Channel id of the active watch subscription, if any
    #[serde(default)]
    pub active_channel_id: Option<String>,
    /// Set when invites stopped flowing and the user must re-subscribe
    #[serde(default)]
    pub needs_resubscribe: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Account {
    pub fn id(&self) -> String {
        account_id(&self.user, &self.nickname)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// OAuth tokens for one account (encrypted with KMS).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    /// Encrypted access token (base64)
    pub access_token_encrypted: String,
    /// Encrypted refresh token (base64)
    pub refresh_token_encrypted: String,
    /// When the access token expires (ISO 8601)
    pub expires_at: String,
    /// Granted OAuth scopes
    pub scopes: Vec<String>,
}

/// An unfinished `accounts connect` flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRequest {
    pub link_id: String,
    pub user: String,
    pub nickname: String,
    pub created_at: String,
}

impl LinkRequest {
    /// Whether the link is older than `ttl`. Unparseable timestamps count as expired.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        parse_utc_rfc3339(&self.created_at).is_none_or(|created| created + ttl < now)
    }
}

/// Nickname supplied to `accounts connect`.
#[derive(Debug, Validate)]
pub struct NicknameInput {
    #[validate(
        length(min = 1, max = 64, message = "Nicknames must be 1 to 64 characters"),
        custom(function = "validate_nickname_chars")
    )]
    pub nickname: String,
}

fn validate_nickname_chars(nickname: &str) -> Result<(), ValidationError> {
    if nickname.chars().any(|c| c.is_whitespace() || c.is_control()) {
        let mut err = ValidationError::new("nickname_chars");
        err.message = Some("Nicknames cannot contain spaces".into());
        return Err(err);
    }
    Ok(())
}

/// Check a nickname, returning a user-facing message on failure.
pub fn validate_nickname(nickname: &str) -> Result<(), String> {
    NicknameInput {
        nickname: nickname.to_string(),
    }
    .validate().map_err(|errors| {
        errors
            .field_errors()
            .values()
            .flat_map(|errs| errs.iter())
            .find_map(|e| e.message.as_ref().map(|m| m.to_string()))
            .unwrap_or_else(|| "Invalid nickname".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_escapes_separator() {
        assert_eq!(account_id("alice", "work"), "alice:work");
        assert_ne!(account_id("a:b", "c"), account_id("a", "b:c"));
        assert!(!account_id("alice", "a/b").contains('/'));
    }

    #[test]
    fn test_link_expiry() {
        let now = Utc::now();
        let link = LinkRequest {
            link_id: "l1".to_string(),
            user: "alice".to_string(),
            nickname: "work".to_string(),
            created_at: crate::time_utils::format_utc_rfc3339(now - Duration::minutes(11)),
        };
        assert!(link.is_expired(now, Duration::minutes(10)));
        assert!(!link.is_expired(now, Duration::minutes(15)));
    }

    #[test]
    fn test_validate_nickname() {
        assert!(validate_nickname("work").is_ok());
        assert!(validate_nickname("Work").is_ok());
        assert!(validate_nickname(&"x".repeat(64)).is_ok());
        // Length counts characters, not bytes
        assert!(validate_nickname(&"é".repeat(64)).is_ok());

        assert!(validate_nickname("").is_err());
        assert!(validate_nickname(&"x".repeat(65)).is_err());
        assert_eq!(
            validate_nickname("my work").unwrap_err(),
            "Nicknames cannot contain spaces"
        );
    }
}
