//! Calendar event bookkeeping and classified changes.

use serde::{Deserialize, Serialize};

/// Last version of an invited event we have notified about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub account_id: String,
    pub event_id: String,
    /// Google's `updated` timestamp of the last processed version
    pub updated: String,
    #[serde(default)]
    pub summary: Option<String>,
}

/// The parts of an event a chat notification needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSummary {
    pub event_id: String,
    pub title: String,
    /// Human readable start ("2026-10-20 09:00 America/Los_Angeles" or a date)
    pub when: Option<String>,
    pub organizer: Option<String>,
    pub location: Option<String>,
    pub link: Option<String>,
    /// Version the delta was derived from
    pub updated: String,
}

/// A notification-worthy change to an invited event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDelta {
    NewInvite(EventSummary),
    Updated(EventSummary),
    Cancelled(EventSummary),
}

impl EventDelta {
    pub fn summary(&self) -> &EventSummary {
        match self {
            EventDelta::NewInvite(s) | EventDelta::Updated(s) | EventDelta::Cancelled(s) => s,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventDelta::NewInvite(_) => "new_invite",
            EventDelta::Updated(_) => "updated",
            EventDelta::Cancelled(_) => "cancelled",
        }
    }
}

/// Invite response a user can send from chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Accepted,
    Declined,
    Tentative,
}

impl ResponseStatus {
    pub const ALL: [ResponseStatus; 3] = [
        ResponseStatus::Accepted,
        ResponseStatus::Declined,
        ResponseStatus::Tentative,
    ];

    /// Value of the attendee `responseStatus` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Accepted => "accepted",
            ResponseStatus::Declined => "declined",
            ResponseStatus::Tentative => "tentative",
        }
    }

    /// Button label shown next to a new invite.
    pub fn label(&self) -> &'static str {
        match self {
            ResponseStatus::Accepted => "Yes",
            ResponseStatus::Declined => "No",
            ResponseStatus::Tentative => "Maybe",
        }
    }
}
