//! Chat notifications for invite changes, and invite responses.
//!
//! Messages go into an outbox channel; delivery to the chat platform is
//! handled by [`crate::services::chat::ChatBridge`].

use crate::error::AppError;
use crate::models::{Account, EventDelta, ResponseStatus};
use crate::services::google::GoogleClient;
use crate::services::tokens::TokenManager;
use serde::Serialize;
use tokio::sync::mpsc;

/// An outbound chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Recipient chat username
    pub user: String,
    pub body: String,
    /// Buttons offered with the message (new invites only)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<InviteAction>,
}

/// A one-click invite response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InviteAction {
    pub label: &'static str,
    pub nickname: String,
    pub event_id: String,
    pub status: ResponseStatus,
}

pub type Outbox = mpsc::UnboundedSender<ChatMessage>;

#[derive(Clone)]
pub struct NotificationDispatcher {
    google: GoogleClient,
    tokens: TokenManager,
    outbox: Outbox,
}

impl NotificationDispatcher {
    pub fn new(google: GoogleClient, tokens: TokenManager, outbox: Outbox) -> Self {
        Self {
            google,
            tokens,
            outbox,
        }
    }

    /// Send one message for a classified change.
    pub fn dispatch(&self, account: &Account, delta: &EventDelta) {
        let actions = match delta {
            EventDelta::NewInvite(summary) => ResponseStatus::ALL
                .iter()
                .map(|status| InviteAction {
                    label: status.label(),
                    nickname: account.nickname.clone(),
                    event_id: summary.event_id.clone(),
                    status: *status,
                })
                .collect(),
            _ => Vec::new(),
        };

        tracing::debug!(
            user = %account.user,
            event_id = %delta.summary().event_id,
            kind = delta.kind(),
            "Dispatching invite notification"
        );
        self.send(ChatMessage {
            user: account.user.clone(),
            body: format_delta(&account.nickname, delta),
            actions,
        });
    }

    /// Send a plain system notice.
    pub fn notify(&self, user: &str, body: String) {
        self.send(ChatMessage {
            user: user.to_string(),
            body,
            actions: Vec::new(),
        });
    }

    fn send(&self, message: ChatMessage) {
        if self.outbox.send(message).is_err() {
            tracing::error!("Chat outbox closed, dropping message");
        }
    }

    /// Set the user's response on an invited event.
    ///
    /// `EventNotFound` when the event was deleted or cancelled in the
    /// meantime.
    pub async fn record_response(
        &self,
        account: &Account,
        event_id: &str,
        status: ResponseStatus,
    ) -> Result<(), AppError> {
        let account_id = account.id();
        let calendar_id = account
            .calendar_id
            .as_deref()
            .ok_or_else(|| AppError::NotFound(format!("Account {}", account_id)))?;
        let access_token = self.tokens.get_valid_token(&account_id).await?;

        let event = self
            .google
            .get_event(&access_token, calendar_id, event_id)
            .await
            .map_err(|e| self.event_error(&account_id, event_id, e))?;
        if event.is_cancelled() {
            return Err(AppError::EventNotFound(event_id.to_string()));
        }

        let mut attendees = event.attendees;
        let me = attendees
            .iter_mut()
            .find(|a| a.is_self)
            .ok_or_else(|| AppError::BadRequest("You are not a guest of that event.".to_string()))?;
        me.response_status = Some(status.as_str().to_string());

        self.google
            .patch_attendees(&access_token, calendar_id, event_id, &attendees)
            .await
            .map_err(|e| self.event_error(&account_id, event_id, e))?;

        tracing::info!(account_id = %account_id, event_id, status = status.as_str(), "Recorded invite response");
        Ok(())
    }

    fn event_error(&self, account_id: &str, event_id: &str, e: AppError) -> AppError {
        match e {
            AppError::NotFound(_) | AppError::Gone(_) => {
                AppError::EventNotFound(event_id.to_string())
            }
            e => {
                if e.is_token_error() {
                    self.tokens.evict(account_id);
                }
                e
            }
        }
    }
}

/// Chat text for a delta.
pub fn format_delta(nickname: &str, delta: &EventDelta) -> String {
    let summary = delta.summary();
    let headline = match delta {
        EventDelta::NewInvite(_) => "New invite",
        EventDelta::Updated(_) => "Invite updated",
        EventDelta::Cancelled(_) => "Invite cancelled",
    };

    let mut text = format!("{} ({}): *{}*", headline, nickname, summary.title);
    if let Some(when) = &summary.when {
        text.push_str(&format!("\nWhen: {}", when));
    }
    if let Some(organizer) = &summary.organizer {
        text.push_str(&format!("\nOrganizer: {}", organizer));
    }
    if let Some(location) = &summary.location {
        text.push_str(&format!("\nWhere: {}", location));
    }
    if !matches!(delta, EventDelta::Cancelled(_)) {
        if let Some(link) = &summary.link {
            text.push_str(&format!("\n{}", link));
        }
    }
    if matches!(delta, EventDelta::NewInvite(_)) {
        text.push_str("\nAwaiting your response.");
    }
    text
}
