//! Database layer (Firestore, with an in-memory backend for tests).

pub mod firestore;
pub mod memory;

pub use firestore::FirestoreDb;

use crate::models::{Account, RetiredChannel};
use serde::{Deserialize, Serialize};

/// Collection names as constants.
pub mod collections {
    pub const ACCOUNTS: &str = "accounts";
    /// Encrypted OAuth tokens, keyed by account id
    pub const CREDENTIALS: &str = "credentials";
    pub const LINK_REQUESTS: &str = "link_requests";
    /// Active watch channels, keyed by channel id
    pub const SUBSCRIPTIONS: &str = "subscriptions";
    /// Channels awaiting a stop call at Google
    pub const RETIRED_CHANNELS: &str = "retired_channels";
    /// Incremental sync tokens, keyed by account id
    pub const SYNC_STATE: &str = "sync_state";
    pub const TRACKED_EVENTS: &str = "tracked_events";
    pub const MACROS: &str = "macros";
}

/// Per-account incremental sync position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub account_id: String,
    pub sync_token: String,
    pub updated_at: String,
}

/// Document id of a tracked event.
pub fn tracked_event_doc_id(account_id: &str, event_id: &str) -> String {
    format!("{}:{}", account_id, urlencoding::encode(event_id))
}

/// Result of registering a new `accounts connect` attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingLinkOutcome {
    Created,
    DuplicateNickname,
}

/// Result of consuming a link request after the OAuth exchange.
#[derive(Debug, Clone)]
pub enum CompleteLinkOutcome {
    Linked(Account),
    /// Unknown, already used, or older than the link TTL
    Expired,
    DuplicateNickname,
}

/// Result of recording a freshly created watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivateOutcome {
    Activated,
    /// Another channel is already active for the account
    AlreadySubscribed,
    /// Account missing or not connected
    AccountUnavailable,
}

/// Result of replacing an active channel with its renewal.
#[derive(Debug, Clone)]
pub enum SwapOutcome {
    /// The old channel is now retired and must be stopped
    Swapped(RetiredChannel),
    /// The old channel was no longer the active one; nothing was written
    Superseded,
}
