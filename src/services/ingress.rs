//! Push notification processing.
//!
//! Google sends a bare "something changed" ping per channel. We resolve the
//! channel to its account, check the verification token, pull the changes
//! and hand the resulting deltas to the dispatcher.

use crate::error::AppError;
use crate::services::notify::NotificationDispatcher;
use crate::services::subscriptions::SubscriptionManager;
use crate::services::sync::CalendarSync;
use subtle::ConstantTimeEq;

/// How a notification was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Channel unknown, superseded, or its account is not connected
    UnknownChannel,
    InvalidToken,
    /// Initial `sync` message sent when a channel is created
    Handshake,
    Processed { dispatched: usize, resynced: bool },
}

/// Headers of a Google push notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel_id: String,
    pub resource_state: String,
    pub channel_token: Option<String>,
}

#[derive(Clone)]
pub struct WebhookIngress {
    subscriptions: SubscriptionManager,
    sync: CalendarSync,
    dispatcher: NotificationDispatcher,
}

impl WebhookIngress {
    pub fn new(
        subscriptions: SubscriptionManager,
        sync: CalendarSync,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            subscriptions,
            sync,
            dispatcher,
        }
    }

    /// Handle one notification end to end.
    ///
    /// Domain rejections are outcomes, not errors; `Err` means storage or
    /// Google failed while pulling changes.
    pub async fn handle_notification(
        &self,
        notification: &Notification,
    ) -> Result<IngressOutcome, AppError> {
        let channel_id = notification.channel_id.as_str();

        let (sub, account) = match self.subscriptions.resolve_by_channel_id(channel_id).await {
            Ok(found) => found,
            Err(AppError::UnknownChannel(_)) => {
                tracing::info!(channel_id, "Notification for unknown channel, ignoring");
                return Ok(IngressOutcome::UnknownChannel);
            }
            Err(e) => return Err(e),
        };

        let presented = notification.channel_token.as_deref().unwrap_or("");
        let token_ok: bool = presented
            .as_bytes()
            .ct_eq(sub.verification_token.as_bytes())
            .into();
        if !token_ok {
            tracing::warn!(channel_id, "Notification with invalid channel token");
            return Ok(IngressOutcome::InvalidToken);
        }

        if notification.resource_state == "sync" {
            tracing::debug!(channel_id, "Channel sync handshake");
            return Ok(IngressOutcome::Handshake);
        }

        let outcome = self
            .sync
            .pull_changes(&sub.account_id, &sub.calendar_id)
            .await?;

        for delta in &outcome.deltas {
            self.dispatcher.dispatch(&account, delta);
        }

        tracing::info!(
            channel_id,
            account_id = %sub.account_id,
            resource_state = %notification.resource_state,
            dispatched = outcome.deltas.len(),
            "Processed calendar notification"
        );
        Ok(IngressOutcome::Processed {
            dispatched: outcome.deltas.len(),
            resynced: outcome.resynced,
        })
    }
}
