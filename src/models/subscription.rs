//! Watch channel subscriptions.

use crate::time_utils::parse_utc_rfc3339;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An active Google Calendar watch channel for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Channel id (document id)
    pub channel_id: String,
    /// Opaque resource id returned by Google, needed to stop the channel
    pub resource_id: String,
    /// Owning account (see `account_id`)
    pub account_id: String,
    pub user: String,
    pub nickname: String,
    pub calendar_id: String,
    /// Random token echoed back by Google on every notification
    pub verification_token: String,
    /// When Google stops delivering to this channel (RFC 3339, UTC)
    pub expires_at: String,
    /// Consecutive failed renewal attempts
    #[serde(default)]
    pub renewal_failures: u32,
    pub created_at: String,
}

impl Subscription {
    /// Parsed expiry; unparseable values count as already expired.
    pub fn expires_at_utc(&self) -> DateTime<Utc> {
        parse_utc_rfc3339(&self.expires_at).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// A channel that has been superseded or removed locally but may still be
/// live at Google until stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredChannel {
    pub channel_id: String,
    pub resource_id: String,
    pub account_id: String,
    /// Original channel expiry; past this point there is nothing to stop
    pub expires_at: String,
    pub retired_at: String,
}

impl From<&Subscription> for RetiredChannel {
    fn from(sub: &Subscription) -> Self {
        Self {
            channel_id: sub.channel_id.clone(),
            resource_id: sub.resource_id.clone(),
            account_id: sub.account_id.clone(),
            expires_at: sub.expires_at.clone(),
            retired_at: crate::time_utils::format_utc_rfc3339(Utc::now()),
        }
    }
}
